// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The master-side state machine driving one replica slave to parity and
//! then forwarding live mutations.
//!
//! One task per connected slave owns the state, the FIFO work queue, and
//! the write half of the connection; a spawned reader task forwards the
//! slave's JSON replies over a channel, so a dropped channel doubles as the
//! disconnect signal. Only one work item is ever in flight.
//!
//! Phases: after the handshake the slave's TOC is diffed against the local
//! one and the queue drained, repeatedly, until a drain ends with an empty
//! re-diff (BACKGROUND_SYNCHRONIZING). The database's write barrier is then
//! taken and the diff re-run under it (LOCKED_SYNCHRONIZING; expected
//! empty). After a ping round-trip confirms the slave has applied
//! everything, the session subscribes to database events *before* releasing
//! the barrier, so no mutation can slip between phases, and forwards events
//! from then on (READY).

use std::collections::VecDeque;
use std::sync::Arc;

use base::{bail, err, Error, ErrorKind};
use bytes::Bytes;
use db::{Database, Event, EventStream, ReadOperation, TimeEntry, Toc, TocEntry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::json::{self, PeerReply, Request};
use crate::proto::{Conn, FrameReader, FrameWriter};

/// How many unacknowledged replication `add`s may accumulate before a
/// `results` round-trip verifies them.
const RESULT_CHECK_THRESHOLD: u64 = 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Uninitialized,
    BackgroundSynchronizing,
    LockedSynchronizing,
    Ready,
}

/// One step of the synchronization plan, as computed by [`plan_sync`].
#[derive(Clone, Debug, Eq, PartialEq)]
enum PlanStep {
    PruneGroup(String),
    PruneEntry(String, u64),
    Fill(String, u64),
}

/// Diffs the slave's mirrored TOC against the local one.
///
/// For surplus on the slave: a missing group is pruned whole; a missing
/// entry is pruned; an entry *longer* than the local written size is pruned
/// and refilled from scratch. For surplus locally: any entry the slave
/// lacks (and is non-empty) or trails on is filled from the slave's current
/// size.
fn plan_sync(local: &Toc, mirror: &Toc) -> Vec<PlanStep> {
    let mut plan = Vec::new();
    for (group, days) in mirror {
        let Some(local_days) = local.get(group) else {
            plan.push(PlanStep::PruneGroup(group.clone()));
            continue;
        };
        for (&dst, slave_entry) in days {
            match local_days.get(&dst) {
                None => plan.push(PlanStep::PruneEntry(group.clone(), dst)),
                Some(local_entry) if slave_entry.size > local_entry.size => {
                    plan.push(PlanStep::PruneEntry(group.clone(), dst));
                    plan.push(PlanStep::Fill(group.clone(), dst));
                }
                Some(_) => {}
            }
        }
    }
    for (group, local_days) in local {
        let mirror_days = mirror.get(group);
        for (&dst, local_entry) in local_days {
            let slave_size = mirror_days.and_then(|d| d.get(&dst)).map(|e| e.size);
            let needed = match slave_size {
                None => local_entry.size > 0,
                Some(s) => s < local_entry.size,
            };
            if needed {
                plan.push(PlanStep::Fill(group.clone(), dst));
            }
        }
    }
    plan
}

enum FillSource {
    /// Stream records from disk, starting at the slave's current size.
    /// Holds a read guard from enqueue until the item is consumed so the
    /// entry cannot be destroyed underneath the queue.
    Stream {
        entry: Arc<TimeEntry>,
        read_op: ReadOperation,
    },

    /// Forward a live write's bytes as-is; no disk read.
    Buffers { record: Bytes },
}

enum WorkCommand {
    PruneOne {
        group: String,
        day_timestamp: Option<u64>,
    },
    PruneAll {
        group: String,
        before: Option<u64>,
    },
    Fill {
        group: String,
        day_timestamp: u64,
        source: FillSource,
    },
    CheckResults,
}

/// Runs one replica-slave session to completion. `Ok(())` is a clean peer
/// disconnect; errors are logged by the caller and also end the session.
pub(crate) async fn run<R, W>(db: Arc<Database>, conn: Conn<R, W>) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let Conn { r, w } = conn;
    let mut session = ReplicaSlaveSession {
        db,
        w,
        replies: spawn_reader(r),
        mirror: Toc::new(),
        queue: VecDeque::new(),
        unchecked_adds: 0,
        next_opid: 0,
        state: State::Uninitialized,
    };
    session.run().await
}

fn spawn_reader<R>(mut r: FrameReader<R>) -> mpsc::Receiver<Result<PeerReply, Error>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            match r.read_obj::<PeerReply>().await {
                Ok(Some(reply)) => {
                    if tx.send(Ok(reply)).await.is_err() {
                        return; // session is gone.
                    }
                }
                Ok(None) => return, // EOF; the dropped tx signals it.
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });
    rx
}

struct ReplicaSlaveSession<W> {
    db: Arc<Database>,
    w: FrameWriter<W>,
    replies: mpsc::Receiver<Result<PeerReply, Error>>,

    /// The slave's TOC as of the handshake, updated as work items complete.
    mirror: Toc,

    queue: VecDeque<WorkCommand>,
    unchecked_adds: u64,
    next_opid: u64,
    state: State,
}

impl<W: AsyncWrite + Unpin> ReplicaSlaveSession<W> {
    fn set_state(&mut self, state: State) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    async fn run(&mut self) -> Result<(), Error> {
        self.w
            .write_obj(&json::MasterHandshake {
                your_role: "slave".to_owned(),
                my_role: "master".to_owned(),
            })
            .await?;
        self.w.write_obj(&Request::GetToc).await?;
        let reply = self.await_reply().await?;
        expect_ok(&reply)?;
        self.mirror = reply
            .toc
            .ok_or_else(|| err!(InvalidArgument, msg("getToc reply lacks a toc")))?;

        self.set_state(State::BackgroundSynchronizing);
        loop {
            self.schedule_sync_commands();
            if self.queue.is_empty() {
                break;
            }
            self.drain_queue().await?;
        }

        // Quiesce the database and catch anything written during the last
        // drain. The barrier guard is held through subscription so the
        // event stream starts exactly where the diff left off.
        self.set_state(State::LockedSynchronizing);
        let db = self.db.clone();
        let write_lock = db.lock_writes().await;
        self.schedule_sync_commands();
        if !self.queue.is_empty() {
            debug!("draining {} item(s) under the write lock", self.queue.len());
            self.drain_queue().await?;
        }
        self.w.write_obj(&Request::Ping { sleep: None }).await?;
        let reply = self.await_reply().await?;
        expect_ok(&reply)?;
        let events = self.db.subscribe();
        drop(write_lock);

        self.set_state(State::Ready);
        info!("slave is synchronized; forwarding live mutations");
        self.forward(events).await
    }

    /// READY: apply queued work, then wait for either a database event to
    /// enqueue more or the peer to vanish. The slave never speaks unless
    /// spoken to, so an inbound reply with nothing in flight is a protocol
    /// invariant violation and disconnects this peer only.
    async fn forward(&mut self, mut events: EventStream) -> Result<(), Error> {
        loop {
            while let Some(item) = self.queue.pop_front() {
                self.run_item(item).await?;
            }
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.enqueue_event(event),
                        None => bail!(Internal, msg("database event stream closed")),
                    }
                }
                reply = self.replies.recv() => {
                    match reply {
                        None => {
                            info!("slave disconnected");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e),
                        Some(Ok(r)) => bail!(
                            Internal,
                            msg("slave sent a reply when none was awaited: {r:?}")
                        ),
                    }
                }
            }
        }
    }

    fn enqueue_event(&mut self, event: Event) {
        match event {
            Event::Adding {
                group,
                day_timestamp,
                record,
            } => {
                self.queue.push_back(WorkCommand::Fill {
                    group,
                    day_timestamp,
                    source: FillSource::Buffers { record },
                });
            }
            Event::Remove { group, before } => {
                self.queue.push_back(WorkCommand::PruneAll { group, before });
            }
            Event::RemoveOne {
                group,
                day_timestamp,
            } => {
                self.queue.push_back(WorkCommand::PruneOne {
                    group,
                    day_timestamp: Some(day_timestamp),
                });
            }
        }
    }

    /// Diffs the local TOC against the mirror and enqueues the resulting
    /// prunes and fills.
    fn schedule_sync_commands(&mut self) {
        let local = self.db.toc();
        for step in plan_sync(&local, &self.mirror) {
            match step {
                PlanStep::PruneGroup(group) => self.queue.push_back(WorkCommand::PruneOne {
                    group,
                    day_timestamp: None,
                }),
                PlanStep::PruneEntry(group, day_timestamp) => {
                    self.queue.push_back(WorkCommand::PruneOne {
                        group,
                        day_timestamp: Some(day_timestamp),
                    })
                }
                PlanStep::Fill(group, day_timestamp) => {
                    // The entry can vanish between the TOC snapshot and now;
                    // the next re-diff will schedule the matching prune.
                    let Some(entry) = self.db.entry(&group, day_timestamp) else {
                        continue;
                    };
                    let read_op = entry.read_operation();
                    self.queue.push_back(WorkCommand::Fill {
                        group,
                        day_timestamp,
                        source: FillSource::Stream { entry, read_op },
                    });
                }
            }
        }
    }

    async fn drain_queue(&mut self) -> Result<(), Error> {
        while let Some(item) = self.queue.pop_front() {
            self.run_item(item).await?;
        }
        Ok(())
    }

    async fn run_item(&mut self, item: WorkCommand) -> Result<(), Error> {
        match item {
            WorkCommand::PruneOne {
                group,
                day_timestamp: None,
            } => {
                self.w
                    .write_obj(&Request::Remove {
                        group: group.clone(),
                        day_timestamp: None,
                    })
                    .await?;
                let reply = self.await_reply().await?;
                expect_ok(&reply)?;
                self.mirror.remove(&group);
            }
            WorkCommand::PruneOne {
                group,
                day_timestamp: Some(dst),
            } => {
                self.prune_entry(&group, dst).await?;
            }
            WorkCommand::PruneAll { group, before } => {
                self.w
                    .write_obj(&Request::Remove {
                        group: group.clone(),
                        day_timestamp: before,
                    })
                    .await?;
                let reply = self.await_reply().await?;
                expect_ok(&reply)?;
                match before {
                    None => {
                        self.mirror.remove(&group);
                    }
                    Some(before) => {
                        if let Some(days) = self.mirror.get_mut(&group) {
                            days.retain(|&dst, _| dst >= before);
                        }
                    }
                }
            }
            WorkCommand::Fill {
                group,
                day_timestamp,
                source: FillSource::Buffers { record },
            } => {
                let opid = self.next_opid;
                self.next_opid += 1;
                self.w
                    .write_obj_with_payload(
                        &Request::Add {
                            group: group.clone(),
                            timestamp: day_timestamp,
                            size: record.len() as u64,
                            opid,
                            corrupted: None,
                        },
                        &record,
                    )
                    .await?;
                self.mirror
                    .entry(group)
                    .or_default()
                    .entry(day_timestamp)
                    .or_default()
                    .size += record.len() as u64;
                self.unchecked_adds += 1;
                if self.unchecked_adds >= RESULT_CHECK_THRESHOLD {
                    self.queue.push_back(WorkCommand::CheckResults);
                    self.unchecked_adds = 0;
                }
            }
            WorkCommand::Fill {
                group,
                day_timestamp,
                source: FillSource::Stream {
                    entry,
                    read_op: _read_op,
                },
            } => {
                self.fill_streaming(group, day_timestamp, entry).await?;
            }
            WorkCommand::CheckResults => {
                self.check_results().await?;
            }
        }
        Ok(())
    }

    async fn prune_entry(&mut self, group: &str, day_timestamp: u64) -> Result<(), Error> {
        self.w
            .write_obj(&Request::RemoveOne {
                group: group.to_owned(),
                day_timestamp,
            })
            .await?;
        let reply = self.await_reply().await?;
        expect_ok(&reply)?;
        if let Some(days) = self.mirror.get_mut(group) {
            days.remove(&day_timestamp);
        }
        Ok(())
    }

    /// Streams records from disk starting at the slave's current size.
    ///
    /// If the very read at that offset yields a corruption error, the
    /// slave's prefix doesn't line up with a record boundary here (it
    /// diverged or rotted); the entry is pruned on the slave and refilled
    /// from zero. Corruption from offset zero is the master's own data and
    /// cannot converge by refilling, so it surfaces as an error.
    async fn fill_streaming(
        &mut self,
        group: String,
        day_timestamp: u64,
        entry: Arc<TimeEntry>,
    ) -> Result<(), Error> {
        let mut start = self.mirror_size(&group, day_timestamp);
        let mut cursor = entry.cursor(start);
        loop {
            match cursor.next() {
                Ok(Some(record)) => {
                    let end = record.offset + record.record_size();
                    let opid = self.next_opid;
                    self.next_opid += 1;
                    self.w
                        .write_obj_with_payload(
                            &Request::Add {
                                group: group.clone(),
                                timestamp: day_timestamp,
                                size: record.record_size(),
                                opid,
                                corrupted: None,
                            },
                            &record.data,
                        )
                        .await?;
                    self.mirror
                        .entry(group.clone())
                        .or_default()
                        .insert(day_timestamp, TocEntry { size: end });
                    self.unchecked_adds += 1;
                    if self.unchecked_adds >= RESULT_CHECK_THRESHOLD {
                        self.check_results().await?;
                    }
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::DataLoss && start > 0 => {
                    warn!(
                        err = %e.chain(),
                        "slave's prefix of {group}/{day_timestamp} is suspect; refilling from zero"
                    );
                    self.prune_entry(&group, day_timestamp).await?;
                    start = 0;
                    cursor = entry.cursor(0);
                }
                Err(e) => return Err(e),
            }
        }
        if self.unchecked_adds > 0 {
            self.check_results().await?;
        }
        Ok(())
    }

    /// Drains the slave's opid table and verifies every add applied.
    async fn check_results(&mut self) -> Result<(), Error> {
        self.w
            .write_obj(&Request::Results { discard: None })
            .await?;
        let reply = self.await_reply().await?;
        expect_ok(&reply)?;
        if let Some(results) = &reply.results {
            for (opid, outcome) in results {
                if let json::OpOutcome::Error { message } = outcome {
                    bail!(
                        Unknown,
                        msg("slave failed to apply add opid {opid}: {message}")
                    );
                }
            }
        }
        self.unchecked_adds = 0;
        self.next_opid = 0;
        Ok(())
    }

    fn mirror_size(&self, group: &str, day_timestamp: u64) -> u64 {
        self.mirror
            .get(group)
            .and_then(|days| days.get(&day_timestamp))
            .map(|e| e.size)
            .unwrap_or(0)
    }

    async fn await_reply(&mut self) -> Result<PeerReply, Error> {
        match self.replies.recv().await {
            None => Err(err!(Unavailable, msg("slave disconnected mid-exchange")).build()),
            Some(Err(e)) => Err(e),
            Some(Ok(reply)) => Ok(reply),
        }
    }
}

fn expect_ok(reply: &PeerReply) -> Result<(), Error> {
    if reply.status.as_deref() != Some("ok") {
        bail!(
            Unknown,
            msg(
                "slave replied {:?} ({})",
                reply.status,
                reply.message.as_deref().unwrap_or("no message")
            )
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toc(entries: &[(&str, &[(u64, u64)])]) -> Toc {
        entries
            .iter()
            .map(|(g, days)| {
                (
                    g.to_string(),
                    days.iter()
                        .map(|&(dst, size)| (dst, TocEntry { size }))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn plan_empty_when_equal() {
        let t = toc(&[("a", &[(0, 100), (86_400, 50)])]);
        assert_eq!(plan_sync(&t, &t), vec![]);
    }

    #[test]
    fn plan_prunes_surplus() {
        let local = toc(&[("a", &[(0, 100)])]);
        let mirror = toc(&[("a", &[(0, 100), (86_400, 50)]), ("b", &[(0, 10)])]);
        assert_eq!(
            plan_sync(&local, &mirror),
            vec![
                PlanStep::PruneEntry("a".to_owned(), 86_400),
                PlanStep::PruneGroup("b".to_owned()),
            ]
        );
    }

    #[test]
    fn plan_fills_missing_and_trailing() {
        let local = toc(&[("a", &[(0, 100), (86_400, 50), (172_800, 0)])]);
        let mirror = toc(&[("a", &[(0, 40)])]);
        // The empty local entry isn't worth filling.
        assert_eq!(
            plan_sync(&local, &mirror),
            vec![
                PlanStep::Fill("a".to_owned(), 0),
                PlanStep::Fill("a".to_owned(), 86_400),
            ]
        );
    }

    #[test]
    fn plan_rebuilds_overlong_slave_entry() {
        let local = toc(&[("a", &[(0, 100)])]);
        let mirror = toc(&[("a", &[(0, 150)])]);
        assert_eq!(
            plan_sync(&local, &mirror),
            vec![
                PlanStep::PruneEntry("a".to_owned(), 0),
                PlanStep::Fill("a".to_owned(), 0),
            ]
        );
    }

    #[test]
    fn plan_spec_scenario() {
        // Master has a/{1: 100, 2: 200}; slave has a/{1: 100, 3: 50}. The
        // slave must end with exactly {1: 100, 2: 200}.
        let local = toc(&[("a", &[(86_400, 100), (172_800, 200)])]);
        let mirror = toc(&[("a", &[(86_400, 100), (259_200, 50)])]);
        assert_eq!(
            plan_sync(&local, &mirror),
            vec![
                PlanStep::PruneEntry("a".to_owned(), 259_200),
                PlanStep::Fill("a".to_owned(), 172_800),
            ]
        );
    }
}
