// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Command dispatch for one connection, after the handshake.
//!
//! The same dispatch serves two callers: client connections accepted by the
//! server, and (in raw-records mode) the master link on a slave, whose
//! inbound commands are a superset of the client set applied against the
//! local database.

use std::collections::BTreeMap;
use std::sync::Arc;

use base::{Error, ErrorKind};
use bytes::Bytes;
use db::Database;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::json::{self, OpOutcome, Request, Status};
use crate::proto::Conn;

pub(crate) struct SessionConfig {
    /// Interpret `add` payloads as pre-framed records and apply them
    /// verbatim (the replication apply path).
    pub raw_records: bool,

    /// Reject mutations; this server is a slave and only its master link
    /// may write.
    pub read_only: bool,
}

/// What to do after handling one command.
enum Flow {
    Continue,
    /// An error reply with `disconnect: true` has been sent; close.
    Disconnect,
}

pub(crate) struct Session<R, W> {
    db: Arc<Database>,
    conn: Conn<R, W>,
    cfg: SessionConfig,

    /// Per-connection opid table, drained and cleared by `results`.
    pending: BTreeMap<u64, OpOutcome>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    pub fn new(db: Arc<Database>, conn: Conn<R, W>, cfg: SessionConfig) -> Self {
        Session {
            db,
            conn,
            cfg,
            pending: BTreeMap::new(),
        }
    }

    /// Reads and dispatches commands until EOF, a disconnecting error
    /// reply, or an I/O failure. Replies are emitted in command-arrival
    /// order; nothing else is read from the connection while a command
    /// (including a sleeping `ping`) is in progress.
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            let req = match self.conn.r.read_obj::<Request>().await {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::InvalidArgument => {
                    self.conn
                        .w
                        .write_obj(&Status::error(e.chain().to_string(), true))
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match self.dispatch(req).await? {
                Flow::Continue => {}
                Flow::Disconnect => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, req: Request) -> Result<Flow, Error> {
        match req {
            Request::Add {
                group,
                timestamp,
                size,
                opid,
                corrupted,
            } => {
                self.add(group, timestamp, size, opid, corrupted.unwrap_or(false))
                    .await
            }
            Request::Results { discard } => {
                let results = std::mem::take(&mut self.pending);
                let results = if discard.unwrap_or(false) {
                    BTreeMap::new()
                } else {
                    results
                };
                self.conn
                    .w
                    .write_obj(&json::ResultsReply {
                        status: "ok".to_owned(),
                        results,
                    })
                    .await?;
                Ok(Flow::Continue)
            }
            Request::Get {
                group,
                timestamp,
                offset,
            } => {
                match self.db.get(&group, timestamp, offset) {
                    Ok(record) => {
                        self.conn
                            .w
                            .write_obj_with_payload(
                                &json::GetReply {
                                    status: "ok".to_owned(),
                                    size: record.payload().len() as u64,
                                    corrupted: record.header.corrupted,
                                },
                                record.payload(),
                            )
                            .await?;
                    }
                    Err(e) => {
                        self.conn
                            .w
                            .write_obj(&Status::error(e.chain().to_string(), false))
                            .await?;
                    }
                }
                Ok(Flow::Continue)
            }
            Request::Remove {
                group,
                day_timestamp,
            } => {
                if self.cfg.read_only {
                    return self.reject_write().await;
                }
                let r = self.db.remove(&group, day_timestamp).await;
                self.reply_status(r).await
            }
            Request::RemoveOne {
                group,
                day_timestamp,
            } => {
                if self.cfg.read_only {
                    return self.reject_write().await;
                }
                let r = self.db.remove_one(&group, day_timestamp).await;
                self.reply_status(r).await
            }
            Request::GetToc => {
                self.conn
                    .w
                    .write_obj(&json::TocReply {
                        status: "ok".to_owned(),
                        toc: self.db.toc(),
                    })
                    .await?;
                Ok(Flow::Continue)
            }
            Request::Ping { sleep } => {
                if let Some(ms) = sleep {
                    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                }
                self.conn.w.write_obj(&Status::ok()).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// The asynchronous `add`: pre-flight failures disconnect; the write
    /// happens now, but its outcome is only reported by the next `results`.
    async fn add(
        &mut self,
        group: String,
        timestamp: u64,
        size: u64,
        opid: u64,
        corrupted: bool,
    ) -> Result<Flow, Error> {
        // Consume the declared payload even if validation fails below;
        // closing with unread bytes in the receive buffer can turn the
        // flushed error reply into a reset.
        let payload = self.conn.r.read_payload(size).await?;
        if self.cfg.read_only {
            return self.reject_write().await;
        }
        if self.pending.contains_key(&opid) {
            self.conn
                .w
                .write_obj(&Status::error(
                    format!("opid is already in use: {opid}"),
                    true,
                ))
                .await?;
            return Ok(Flow::Disconnect);
        }
        let outcome = if self.cfg.raw_records {
            self.db
                .append_record(&group, db::day_timestamp(timestamp), Bytes::from(payload))
                .await
        } else {
            self.db.add(&group, timestamp, &[&payload], corrupted).await
        };
        match outcome {
            Ok(o) => {
                self.pending.insert(opid, OpOutcome::Ok { offset: o.offset });
            }
            // Validation failures are grave: the client constructed a bad
            // command, and silently continuing would corrupt its offset
            // arithmetic.
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::InvalidArgument | ErrorKind::FailedPrecondition | ErrorKind::DataLoss
                ) =>
            {
                self.conn
                    .w
                    .write_obj(&Status::error(e.chain().to_string(), true))
                    .await?;
                return Ok(Flow::Disconnect);
            }
            Err(e) => {
                debug!(err = %e.chain(), "add failed");
                self.pending.insert(
                    opid,
                    OpOutcome::Error {
                        message: e.chain().to_string(),
                    },
                );
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply_status(&mut self, r: Result<(), Error>) -> Result<Flow, Error> {
        let status = match r {
            Ok(()) => Status::ok(),
            Err(e) => Status::error(e.chain().to_string(), false),
        };
        self.conn.w.write_obj(&status).await?;
        Ok(Flow::Continue)
    }

    async fn reject_write(&mut self) -> Result<Flow, Error> {
        self.conn
            .w
            .write_obj(&Status::error(
                "this server is a replica slave; send writes to its master".to_owned(),
                true,
            ))
            .await?;
        Ok(Flow::Disconnect)
    }
}
