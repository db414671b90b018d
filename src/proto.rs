// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The connection framer: newline-terminated JSON frames plus raw binary
//! payloads over one duplex byte stream.
//!
//! The read side is half-duplex by construction: the caller either asks for
//! the next JSON object or, when the current command declares one, for a
//! payload of exactly `size` bytes. The write side serializes an object per
//! line and flushes at frame boundaries.

use base::{bail, err, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Cap on one JSON frame. Anything larger is a protocol error, not a
/// buffering obligation.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Cap on one record payload accepted over the wire, checked before
/// allocation.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 28;

pub struct FrameReader<R> {
    r: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(r: R) -> Self {
        FrameReader {
            r: BufReader::new(r),
            line: Vec::new(),
        }
    }

    /// Reads the next JSON frame. Returns `Ok(None)` on clean EOF (at a
    /// frame boundary); EOF mid-line is an error.
    pub async fn read_obj<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Error> {
        self.line.clear();
        loop {
            let buf = self
                .r
                .fill_buf()
                .await
                .map_err(|e| err!(e, msg("unable to read frame")))?;
            if buf.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                bail!(OutOfRange, msg("connection truncated mid-frame"));
            }
            let (chunk, done) = match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (&buf[..i], true),
                None => (buf, false),
            };
            if self.line.len() + chunk.len() > MAX_FRAME_LEN {
                bail!(InvalidArgument, msg("frame exceeds {} bytes", MAX_FRAME_LEN));
            }
            self.line.extend_from_slice(chunk);
            let consumed = chunk.len() + usize::from(done);
            self.r.consume(consumed);
            if done {
                break;
            }
        }
        let obj = serde_json::from_slice(&self.line)
            .map_err(|e| err!(InvalidArgument, msg("invalid json"), source(e)))?;
        Ok(Some(obj))
    }

    /// Reads exactly `size` payload bytes following the current command.
    pub async fn read_payload(&mut self, size: u64) -> Result<Vec<u8>, Error> {
        if size > MAX_PAYLOAD_LEN {
            bail!(
                ResourceExhausted,
                msg("payload of {} bytes exceeds cap of {}", size, MAX_PAYLOAD_LEN)
            );
        }
        let mut buf = vec![0u8; size as usize];
        self.r.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                err!(OutOfRange, msg("payload truncated"), source(e))
            } else {
                err!(e, msg("unable to read payload"))
            }
        })?;
        Ok(buf)
    }
}

pub struct FrameWriter<W> {
    w: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(w: W) -> Self {
        FrameWriter {
            w: BufWriter::new(w),
        }
    }

    pub async fn write_obj<T: Serialize>(&mut self, obj: &T) -> Result<(), Error> {
        self.write_obj_inner(obj).await?;
        self.w
            .flush()
            .await
            .map_err(|e| err!(e, msg("unable to flush frame")))?;
        Ok(())
    }

    /// Writes a JSON frame followed immediately by its binary payload, with
    /// a single flush.
    pub async fn write_obj_with_payload<T: Serialize>(
        &mut self,
        obj: &T,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.write_obj_inner(obj).await?;
        self.w
            .write_all(payload)
            .await
            .map_err(|e| err!(e, msg("unable to write payload")))?;
        self.w
            .flush()
            .await
            .map_err(|e| err!(e, msg("unable to flush frame")))?;
        Ok(())
    }

    async fn write_obj_inner<T: Serialize>(&mut self, obj: &T) -> Result<(), Error> {
        let mut buf = serde_json::to_vec(obj)
            .map_err(|e| err!(Internal, msg("unable to serialize frame"), source(e)))?;
        buf.push(b'\n');
        self.w
            .write_all(&buf)
            .await
            .map_err(|e| err!(e, msg("unable to write frame")))?;
        Ok(())
    }
}

/// Both halves of one framed connection.
pub struct Conn<R, W> {
    pub r: FrameReader<R>,
    pub w: FrameWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Conn<R, W> {
    pub fn new(r: R, w: W) -> Self {
        Conn {
            r: FrameReader::new(r),
            w: FrameWriter::new(w),
        }
    }
}

pub type TcpConn = Conn<OwnedReadHalf, OwnedWriteHalf>;

impl TcpConn {
    pub fn from_stream(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Conn::new(r, w)
    }
}
