// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Serde types for every message on the wire. One newline-terminated JSON
//! object per frame; `add` commands and `get` replies are followed by raw
//! payload bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;

/// The server's first frame on every connection.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Greeting {
    pub protocol_major: u32,
    pub protocol_minor: u32,
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub role: Role,
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

/// The client's reply to the greeting. An absent role means `client`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PeerRole>,
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    Client,
    ReplicaSlave,
}

/// Generic reply shape.
#[derive(Debug, Deserialize, Serialize)]
pub struct Status {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<bool>,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            status: "ok".to_owned(),
            message: None,
            disconnect: None,
        }
    }

    pub fn error(message: String, disconnect: bool) -> Self {
        Status {
            status: "error".to_owned(),
            message: Some(message),
            disconnect: disconnect.then_some(true),
        }
    }
}

/// A command, sent by clients to a server and by a master to its slaves.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Request {
    /// Followed by exactly `size` payload bytes. No immediate reply; the
    /// outcome is delivered by the next `results`.
    Add {
        group: String,
        timestamp: u64,
        size: u64,
        opid: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        corrupted: Option<bool>,
    },
    Results {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        discard: Option<bool>,
    },
    Get {
        group: String,
        timestamp: u64,
        offset: u64,
    },
    Remove {
        group: String,
        #[serde(
            default,
            rename = "dayTimestamp",
            skip_serializing_if = "Option::is_none"
        )]
        day_timestamp: Option<u64>,
    },
    RemoveOne {
        group: String,
        #[serde(rename = "dayTimestamp")]
        day_timestamp: u64,
    },
    GetToc,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep: Option<u64>,
    },
}

/// Per-opid outcome within a [`ResultsReply`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OpOutcome {
    Ok { offset: u64 },
    Error { message: String },
}

/// Reply to `results`: the complete opid table since the last drain.
#[derive(Debug, Deserialize, Serialize)]
pub struct ResultsReply {
    pub status: String,
    pub results: BTreeMap<u64, OpOutcome>,
}

/// Reply to `get`; followed by exactly `size` payload bytes.
#[derive(Debug, Deserialize, Serialize)]
pub struct GetReply {
    pub status: String,
    pub size: u64,
    pub corrupted: bool,
}

/// Reply to `getToc`.
#[derive(Debug, Deserialize, Serialize)]
pub struct TocReply {
    pub status: String,
    pub toc: db::Toc,
}

/// Sent by a master to a freshly-connected replica slave.
#[derive(Debug, Deserialize, Serialize)]
pub struct MasterHandshake {
    pub your_role: String,
    pub my_role: String,
}

/// Sent instead of [`MasterHandshake`] when this server is itself a slave.
#[derive(Debug, Deserialize, Serialize)]
pub struct NotMaster {
    pub status: String,
    pub master_host: String,
    pub master_port: u16,
}

/// Catch-all deserialization of anything a replication peer may send back;
/// which fields are set depends on the command that was issued.
#[derive(Debug, Default, Deserialize)]
pub struct PeerReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub results: Option<BTreeMap<u64, OpOutcome>>,
    #[serde(default)]
    pub toc: Option<db::Toc>,
    #[serde(default)]
    pub your_role: Option<String>,
    #[serde(default)]
    pub master_host: Option<String>,
    #[serde(default)]
    pub master_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags() {
        let r: Request = serde_json::from_str(
            r#"{"command": "add", "group": "foo", "timestamp": 172800, "size": 11, "opid": 1}"#,
        )
        .unwrap();
        match r {
            Request::Add {
                group,
                timestamp,
                size,
                opid,
                corrupted,
            } => {
                assert_eq!(group, "foo");
                assert_eq!(timestamp, 172_800);
                assert_eq!(size, 11);
                assert_eq!(opid, 1);
                assert_eq!(corrupted, None);
            }
            other => panic!("unexpected request {other:?}"),
        }

        let r: Request =
            serde_json::from_str(r#"{"command": "removeOne", "group": "g", "dayTimestamp": 0}"#)
                .unwrap();
        assert!(matches!(r, Request::RemoveOne { day_timestamp: 0, .. }));

        assert_eq!(
            serde_json::to_string(&Request::GetToc).unwrap(),
            r#"{"command":"getToc"}"#
        );
    }

    #[test]
    fn results_reply_keys_are_strings() {
        let mut results = BTreeMap::new();
        results.insert(1, OpOutcome::Ok { offset: 0 });
        let s = serde_json::to_string(&ResultsReply {
            status: "ok".to_owned(),
            results,
        })
        .unwrap();
        assert_eq!(
            s,
            r#"{"status":"ok","results":{"1":{"status":"ok","offset":0}}}"#
        );
        let parsed: ResultsReply = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed.results[&1], OpOutcome::Ok { offset: 0 });
    }
}
