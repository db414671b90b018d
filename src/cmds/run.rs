// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use base::{bail, err, Error};
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::server::{Config, Server};
use crate::slave;

#[derive(StructOpt)]
pub struct Args {
    /// Directory holding the record store.
    #[structopt(
        long,
        default_value = "/var/lib/zangetsu/db",
        value_name = "path",
        parse(from_os_str)
    )]
    db_dir: PathBuf,

    /// Bind address for the TCP listener.
    #[structopt(long, default_value = "0.0.0.0:7877", parse(try_from_str))]
    addr: SocketAddr,

    /// Name advertised in the protocol greeting. Defaults to the hostname.
    #[structopt(long)]
    server_name: Option<String>,

    /// Run as a replica slave of the given master.
    ///
    /// The server then serves reads only; all writes arrive over the
    /// master link.
    #[structopt(long, value_name = "host:port")]
    replicate_from: Option<String>,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[structopt(long, value_name = "worker_threads")]
    worker_threads: Option<usize>,
}

fn parse_host_port(s: &str) -> Result<(String, u16), Error> {
    let Some((host, port)) = s.rsplit_once(':') else {
        bail!(InvalidArgument, msg("expected host:port, got {s:?}"));
    };
    let port = port
        .parse()
        .map_err(|e| err!(InvalidArgument, msg("bad port in {s:?}"), source(e)))?;
    Ok((host.to_owned(), port))
}

fn hostname() -> Result<String, Error> {
    let name = nix::unistd::gethostname()
        .map_err(|e| err!(Unknown, msg("gethostname failed"), source(e)))?;
    Ok(name.to_string_lossy().into_owned())
}

pub fn run(args: &Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    builder.build().unwrap().block_on(async_run(args))
}

async fn async_run(args: &Args) -> Result<i32, Error> {
    let master = args
        .replicate_from
        .as_deref()
        .map(parse_host_port)
        .transpose()?;
    let db = db::Database::open(&args.db_dir)?;
    info!("database is loaded");

    let listener = TcpListener::bind(args.addr)
        .await
        .map_err(|e| err!(e, msg("unable to bind --addr={}", args.addr)))?;
    let local_addr = listener.local_addr()?;
    let server_name = match &args.server_name {
        Some(n) => n.clone(),
        None => hostname()?,
    };
    let server = Arc::new(Server {
        db: db.clone(),
        cfg: Config {
            server_name,
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            master: master.clone(),
        },
    });

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let accept = tokio::spawn(server.accept_loop(listener, shutdown_rx.clone()));
    let link = master.map(|(host, port)| {
        info!("replicating from {host}:{port}");
        tokio::spawn(slave::run_link(db.clone(), host, port, shutdown_rx))
    });

    info!("ready to serve requests on {local_addr}");
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = int.recv() => info!("got SIGINT; shutting down"),
        _ = term.recv() => info!("got SIGTERM; shutting down"),
    }

    drop(shutdown_tx);
    if let Some(link) = link {
        link.abort();
        let _ = link.await;
    }
    let _ = accept.await;
    info!("exiting");
    Ok(0)
}
