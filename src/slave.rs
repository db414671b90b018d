// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The slave side of replication: an outbound connection to the master
//! whose inbound commands are applied against the local database.

use std::sync::Arc;

use base::{bail, err, Error};
use db::Database;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::json::{self, PeerRole};
use crate::proto::Conn;
use crate::session::{Session, SessionConfig};

enum LinkOutcome {
    /// The master hung up; reconnect and replay the TOC cycle.
    Disconnected,

    /// The peer is itself a slave; it told us where its master is.
    NotMaster { host: String, port: u16 },
}

/// Maintains the master link until shutdown, reconnecting with a 1-second
/// backoff. The protocol is idempotent under replay: every reconnect
/// re-sends our TOC and the master restarts its diff from it.
pub(crate) async fn run_link(
    db: Arc<Database>,
    master_host: String,
    master_port: u16,
    shutdown: base::shutdown::Receiver,
) {
    loop {
        if shutdown.check().is_err() {
            return;
        }
        match run_link_once(&db, &master_host, master_port).await {
            Ok(LinkOutcome::Disconnected) => warn!("master link lost; reconnecting"),
            Ok(LinkOutcome::NotMaster { host, port }) => {
                error!(
                    "{master_host}:{master_port} is itself a slave; \
                     replicate from {host}:{port} instead"
                );
                return;
            }
            Err(e) => warn!(err = %e.chain(), "master link failed; reconnecting"),
        }
        tokio::select! {
            _ = shutdown.as_future() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
        }
    }
}

async fn run_link_once(
    db: &Arc<Database>,
    master_host: &str,
    master_port: u16,
) -> Result<LinkOutcome, Error> {
    let stream = TcpStream::connect((master_host, master_port))
        .await
        .map_err(|e| err!(Unavailable, msg("unable to connect to master"), source(e)))?;
    stream.set_nodelay(true)?;
    let mut conn = Conn::from_stream(stream);

    let greeting: json::Greeting = read_or_eof(conn.r.read_obj().await)?;
    if greeting.protocol_major != json::PROTOCOL_MAJOR {
        bail!(
            Unimplemented,
            msg(
                "master {} speaks protocol {}.{}; need {}.x",
                greeting.server_name,
                greeting.protocol_major,
                greeting.protocol_minor,
                json::PROTOCOL_MAJOR
            )
        );
    }
    conn.w
        .write_obj(&json::Hello {
            role: Some(PeerRole::ReplicaSlave),
        })
        .await?;
    let status: json::PeerReply = read_or_eof(conn.r.read_obj().await)?;
    if status.status.as_deref() != Some("ok") {
        bail!(
            Unknown,
            msg(
                "master rejected the handshake: {}",
                status.message.as_deref().unwrap_or("no message")
            )
        );
    }

    // Next frame is either the master handshake or a not-master referral.
    let handshake: json::PeerReply = read_or_eof(conn.r.read_obj().await)?;
    if handshake.status.as_deref() == Some("not-master") {
        return Ok(LinkOutcome::NotMaster {
            host: handshake.master_host.unwrap_or_default(),
            port: handshake.master_port.unwrap_or_default(),
        });
    }
    if handshake.your_role.as_deref() != Some("slave") {
        bail!(InvalidArgument, msg("unexpected master handshake"));
    }
    info!(
        "replicating from {} ({master_host}:{master_port})",
        greeting.server_name
    );

    // From here on the master drives; apply its commands verbatim.
    let mut session = Session::new(
        db.clone(),
        conn,
        SessionConfig {
            raw_records: true,
            read_only: false,
        },
    );
    session.run().await?;
    Ok(LinkOutcome::Disconnected)
}

fn read_or_eof<T>(r: Result<Option<T>, Error>) -> Result<T, Error> {
    match r {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(err!(Unavailable, msg("master closed the connection")).build()),
        Err(e) => Err(e),
    }
}
