// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use structopt::StructOpt;
use tracing::error;

mod cmds;
mod json;
mod proto;
mod replica;
mod server;
mod session;
mod slave;

/// Zangetsu: a replicated append-only time-partitioned record store.
#[derive(StructOpt)]
#[structopt(name = "zangetsu")]
enum Args {
    /// Runs the server, accepting client and replica-slave connections.
    Run(cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(&a),
        }
    }
}

fn main() {
    base::tracing_setup::install();
    let args = Args::from_args();
    match args.run() {
        Ok(rv) => std::process::exit(rv),
        Err(e) => {
            error!(err = %e.chain(), "exiting due to fatal error");
            std::process::exit(1);
        }
    }
}
