// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! TCP front-end: accept loop, greeting/handshake, and routing of each
//! connection to a client session or a replica-slave session.

use std::net::SocketAddr;
use std::sync::Arc;

use base::{Error, ErrorKind};
use db::Database;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, info_span, warn, Instrument};

use crate::json::{self, PeerRole, Status};
use crate::proto::Conn;
use crate::replica;
use crate::session::{Session, SessionConfig};

pub(crate) struct Config {
    pub server_name: String,

    /// Advertised in the greeting; what peers should dial.
    pub host: String,
    pub port: u16,

    /// Set when this server runs as a slave of the given master.
    pub master: Option<(String, u16)>,
}

pub(crate) struct Server {
    pub db: Arc<Database>,
    pub cfg: Config,
}

impl Server {
    fn role(&self) -> json::Role {
        if self.cfg.master.is_some() {
            json::Role::Slave
        } else {
            json::Role::Master
        }
    }

    pub(crate) async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: base::shutdown::Receiver,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.as_future() => {
                    info!("listener shutting down");
                    return;
                }
                r = listener.accept() => {
                    let (stream, addr) = match r {
                        Ok(s) => s,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    tokio::spawn(
                        async move { this.serve_conn(stream).await }
                            .instrument(info_span!("conn", %addr)),
                    );
                }
            }
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        match self.serve_conn_inner(stream).await {
            Ok(()) => info!("closing"),
            Err(e) => error!(err = %e.chain(), "closing with error"),
        }
    }

    async fn serve_conn_inner(&self, stream: TcpStream) -> Result<(), Error> {
        stream.set_nodelay(true)?;
        let mut conn = Conn::from_stream(stream);
        conn.w
            .write_obj(&json::Greeting {
                protocol_major: json::PROTOCOL_MAJOR,
                protocol_minor: json::PROTOCOL_MINOR,
                server_name: self.cfg.server_name.clone(),
                host: self.cfg.host.clone(),
                port: self.cfg.port,
                role: self.role(),
            })
            .await?;
        let hello = match conn.r.read_obj::<json::Hello>().await {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::InvalidArgument => {
                conn.w
                    .write_obj(&Status::error(e.chain().to_string(), true))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match hello.role.unwrap_or(PeerRole::Client) {
            PeerRole::Client => {
                conn.w.write_obj(&Status::ok()).await?;
                Session::new(
                    self.db.clone(),
                    conn,
                    SessionConfig {
                        raw_records: false,
                        read_only: self.cfg.master.is_some(),
                    },
                )
                .run()
                .await
            }
            PeerRole::ReplicaSlave => {
                conn.w.write_obj(&Status::ok()).await?;
                if let Some((host, port)) = &self.cfg.master {
                    // A slave can't feed another replica; point the peer at
                    // the master and stay in the initial state.
                    conn.w
                        .write_obj(&json::NotMaster {
                            status: "not-master".to_owned(),
                            master_host: host.clone(),
                            master_port: *port,
                        })
                        .await?;
                    return Ok(());
                }
                info!("replica slave connected");
                replica::run(self.db.clone(), conn).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TcpConn;
    use crate::slave;
    use bytes::Bytes;
    use db::codec::{FOOTER_SIZE, HEADER_SIZE};
    use crate::json::{OpOutcome, Request};
    use db::testutil::{self, TestDb};
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn start_server(master: Option<(String, u16)>) -> (TestDb, SocketAddr, base::shutdown::Sender) {
        let tdb = TestDb::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server {
            db: tdb.db.clone(),
            cfg: Config {
                server_name: "test-server".to_owned(),
                host: "127.0.0.1".to_owned(),
                port: addr.port(),
                master,
            },
        });
        let (tx, rx) = base::shutdown::channel();
        tokio::spawn(server.accept_loop(listener, rx));
        (tdb, addr, tx)
    }

    /// Scenario: connect, read the greeting, send `{}`, expect ok.
    async fn connect_client(addr: SocketAddr) -> TcpConn {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Conn::from_stream(stream);
        let g: json::Greeting = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(g.protocol_major, json::PROTOCOL_MAJOR);
        assert_eq!(g.protocol_minor, json::PROTOCOL_MINOR);
        conn.w.write_obj(&json::Hello::default()).await.unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
        conn
    }

    async fn add(conn: &mut TcpConn, group: &str, timestamp: u64, opid: u64, payload: &[u8]) {
        conn.w
            .write_obj_with_payload(
                &Request::Add {
                    group: group.to_owned(),
                    timestamp,
                    size: payload.len() as u64,
                    opid,
                    corrupted: None,
                },
                payload,
            )
            .await
            .unwrap();
    }

    async fn results(conn: &mut TcpConn) -> json::ResultsReply {
        conn.w
            .write_obj(&Request::Results { discard: None })
            .await
            .unwrap();
        conn.r.read_obj().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn handshake() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;

        // And a ping for good measure.
        conn.w.write_obj(&Request::Ping { sleep: None }).await.unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
    }

    #[tokio::test]
    async fn add_then_results() {
        testutil::init();
        let (tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 172_800, 1, b"hello world").await;

        // No reply to the add itself: the next frame read must be the
        // results reply.
        let r = results(&mut conn).await;
        assert_eq!(r.status, "ok");
        let mut expected = BTreeMap::new();
        expected.insert(1, OpOutcome::Ok { offset: 0 });
        assert_eq!(r.results, expected);

        assert_eq!(
            tdb.db.get("foo", 172_800, 0).unwrap().payload(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn two_batch_offsets() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 172_800, 1, b"hello").await;
        add(&mut conn, "foo", 172_800, 2, b"world!").await;
        let r = results(&mut conn).await;
        let mut expected = BTreeMap::new();
        expected.insert(1, OpOutcome::Ok { offset: 0 });
        expected.insert(
            2,
            OpOutcome::Ok {
                offset: (HEADER_SIZE + 5 + FOOTER_SIZE) as u64,
            },
        );
        assert_eq!(r.results, expected);
    }

    #[tokio::test]
    async fn duplicate_opid() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 172_800, 1, b"hello").await;
        add(&mut conn, "foo", 172_800, 1, b"world").await;
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "error");
        assert!(s.message.unwrap().contains("opid is already"));
        assert_eq!(s.disconnect, Some(true));
        assert!(conn.r.read_obj::<Status>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_clears_the_table() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 172_800, 1, b"hello").await;
        assert_eq!(results(&mut conn).await.results.len(), 1);

        // Idempotence: a second results is empty.
        let r = results(&mut conn).await;
        assert_eq!(r.status, "ok");
        assert!(r.results.is_empty());

        // The opid is free again, and offsets keep advancing.
        add(&mut conn, "foo", 172_800, 1, b"hello").await;
        let r = results(&mut conn).await;
        let mut expected = BTreeMap::new();
        expected.insert(
            1,
            OpOutcome::Ok {
                offset: (HEADER_SIZE + 5 + FOOTER_SIZE) as u64,
            },
        );
        assert_eq!(r.results, expected);
    }

    #[tokio::test]
    async fn results_discard() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 172_800, 1, b"hello").await;
        conn.w
            .write_obj(&Request::Results {
                discard: Some(true),
            })
            .await
            .unwrap();
        let r: json::ResultsReply = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(r.status, "ok");
        assert!(r.results.is_empty());

        // Discard still cleared the table.
        add(&mut conn, "foo", 172_800, 1, b"again").await;
        assert_eq!(results(&mut conn).await.results.len(), 1);
    }

    #[tokio::test]
    async fn get_round_trip() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 172_800, 1, b"hello world").await;
        results(&mut conn).await;

        conn.w
            .write_obj(&Request::Get {
                group: "foo".to_owned(),
                timestamp: 172_800,
                offset: 0,
            })
            .await
            .unwrap();
        let r: json::GetReply = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(r.status, "ok");
        assert_eq!(r.size, 11);
        assert!(!r.corrupted);
        assert_eq!(conn.r.read_payload(r.size).await.unwrap(), b"hello world");

        // A bad offset is an error reply, not a disconnect.
        conn.w
            .write_obj(&Request::Get {
                group: "foo".to_owned(),
                timestamp: 172_800,
                offset: 3,
            })
            .await
            .unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "error");
        conn.w.write_obj(&Request::Ping { sleep: None }).await.unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
    }

    #[tokio::test]
    async fn get_toc_and_removes() {
        testutil::init();
        let (tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 5, 1, b"a").await;
        add(&mut conn, "foo", db::SECONDS_PER_DAY + 5, 2, b"bb").await;
        results(&mut conn).await;

        conn.w.write_obj(&Request::GetToc).await.unwrap();
        let r: json::TocReply = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(r.status, "ok");
        assert_eq!(r.toc, tdb.db.toc());
        assert_eq!(r.toc["foo"][&0].size, db::codec::record_size(1));

        conn.w
            .write_obj(&Request::RemoveOne {
                group: "foo".to_owned(),
                day_timestamp: 0,
            })
            .await
            .unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
        assert!(!tdb.db.toc()["foo"].contains_key(&0));

        conn.w
            .write_obj(&Request::Remove {
                group: "foo".to_owned(),
                day_timestamp: None,
            })
            .await
            .unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
        assert!(tdb.db.toc().is_empty());
    }

    #[tokio::test]
    async fn ping_sleep_defers_the_reply() {
        testutil::init();
        let (_tdb, addr, _shutdown) = start_server(None).await;
        let mut conn = connect_client(addr).await;
        let start = std::time::Instant::now();
        conn.w
            .write_obj(&Request::Ping { sleep: Some(100) })
            .await
            .unwrap();
        conn.w.write_obj(&Request::Ping { sleep: None }).await.unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
        assert!(start.elapsed() >= Duration::from_millis(100));
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
    }

    #[tokio::test]
    async fn not_master_referral() {
        testutil::init();
        let (_tdb, addr, _shutdown) =
            start_server(Some(("upstream.example".to_owned(), 7877))).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Conn::from_stream(stream);
        let g: json::Greeting = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(g.role, json::Role::Slave);
        conn.w
            .write_obj(&json::Hello {
                role: Some(PeerRole::ReplicaSlave),
            })
            .await
            .unwrap();
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "ok");
        let nm: json::NotMaster = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(nm.status, "not-master");
        assert_eq!(nm.master_host, "upstream.example");
        assert_eq!(nm.master_port, 7877);
    }

    #[tokio::test]
    async fn slave_rejects_client_writes() {
        testutil::init();
        let (_tdb, addr, _shutdown) =
            start_server(Some(("upstream.example".to_owned(), 7877))).await;
        let mut conn = connect_client(addr).await;
        add(&mut conn, "foo", 0, 1, b"nope").await;
        let s: Status = conn.r.read_obj().await.unwrap().unwrap();
        assert_eq!(s.status, "error");
        assert_eq!(s.disconnect, Some(true));
    }

    async fn wait_for_parity(master: &Arc<Database>, slave: &Arc<Database>) {
        for _ in 0..200 {
            if master.toc() == slave.toc() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "no parity: master {:?} slave {:?}",
            master.toc(),
            slave.toc()
        );
    }

    fn entry_bytes(db: &Arc<Database>, group: &str, dst: u64) -> Vec<u8> {
        let entry = db.entry(group, dst).unwrap();
        let mut cursor = entry.cursor(0);
        let mut all = Vec::new();
        while let Some(r) = cursor.next().unwrap() {
            all.extend_from_slice(&r.data);
        }
        all
    }

    /// Brings a diverged slave to parity through a full
    /// background-synchronizing → locked → ready cycle, then checks live
    /// forwarding of adds and removes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replication_convergence() {
        testutil::init();
        let (master_tdb, addr, _shutdown) = start_server(None).await;
        let m = &master_tdb.db;
        m.add("a", 5, &[b"r1"], false).await.unwrap();
        m.add("a", 10, &[b"r2"], false).await.unwrap();
        m.add("a", db::SECONDS_PER_DAY + 5, &[b"r3"], false).await.unwrap();
        m.add("b", 3, &[b"r4"], false).await.unwrap();

        let slave_tdb = TestDb::new();
        let s = &slave_tdb.db;
        // A matching prefix of a/0: the master should only send the suffix.
        let r1 = m.get("a", 0, 0).unwrap();
        s.append_record("a", 0, Bytes::from(r1.data)).await.unwrap();
        // Surplus on the slave: an extra entry and an extra group.
        s.add("a", 2 * db::SECONDS_PER_DAY + 1, &[b"junk"], false).await.unwrap();
        s.add("c", 0, &[b"junk"], false).await.unwrap();
        // Diverged and longer than the master's b/0: prune + refill.
        s.add("b", 3, &[b"divergent-and-longer"], false).await.unwrap();

        let (_link_shutdown, link_rx) = base::shutdown::channel();
        let link = tokio::spawn(slave::run_link(
            s.clone(),
            "127.0.0.1".to_owned(),
            addr.port(),
            link_rx,
        ));

        wait_for_parity(m, s).await;
        assert_eq!(entry_bytes(m, "a", 0), entry_bytes(s, "a", 0));
        assert_eq!(entry_bytes(m, "b", 0), entry_bytes(s, "b", 0));
        assert!(s.entry("c", 0).is_none());

        // Live forwarding: a new record and a removal.
        m.add("a", 20, &[b"live"], false).await.unwrap();
        m.remove_one("b", 0).await.unwrap();
        wait_for_parity(m, s).await;
        assert_eq!(entry_bytes(m, "a", 0), entry_bytes(s, "a", 0));
        assert!(s.entry("b", 0).is_none());

        link.abort();
    }
}
