// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! On-disk record framing: `HEADER | PAYLOAD | FOOTER`.
//!
//! The header carries a magic, a flags byte, the payload length, and the
//! record timestamp. The footer carries a CRC-32C over header+payload and a
//! second magic. All integers are little-endian. The layout is a sealed
//! constant of the format; clients use [`HEADER_SIZE`] and [`FOOTER_SIZE`]
//! for offset arithmetic.

use byteorder::{ByteOrder, LittleEndian};

/// Bytes of framing before the payload: magic (4), flags (1), payload
/// length (4), timestamp (8).
pub const HEADER_SIZE: usize = 17;

/// Bytes of framing after the payload: CRC-32C (4), magic (4).
pub const FOOTER_SIZE: usize = 8;

const HEADER_MAGIC: [u8; 4] = *b"zte1";
const FOOTER_MAGIC: [u8; 4] = *b"etz1";

/// Bit 0 of the flags byte; all other bits must be zero.
const FLAG_CORRUPTED: u8 = 1;

/// Decoded record header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Payload length in bytes, excluding framing.
    pub size: u32,

    /// Producer-supplied record timestamp, in seconds.
    pub timestamp: u64,

    /// True if the producer marked this record's contents as corrupted.
    /// Distinct from framing-level corruption; such records are still
    /// well-formed and replicate normally.
    pub corrupted: bool,
}

/// Framing-level decode failure.
#[derive(Debug, Eq, PartialEq)]
pub enum CodecError {
    /// The header is not a valid record header at all. Per the format,
    /// valid records are contiguous, so this means the rest of the file
    /// is unusable.
    Malformed(&'static str),

    /// The footer CRC doesn't match header+payload.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Malformed(what) => write!(f, "malformed record header: {what}"),
            CodecError::ChecksumMismatch { expected, actual } => write!(
                f,
                "record checksum mismatch: expected {expected:#010x}, actual {actual:#010x}"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Total on-disk length of a record with the given payload length.
pub fn record_size(payload_size: u64) -> u64 {
    HEADER_SIZE as u64 + payload_size + FOOTER_SIZE as u64
}

/// Encodes one record from the given payload buffers, which are
/// concatenated.
pub fn encode(payloads: &[&[u8]], timestamp: u64, corrupted: bool) -> Vec<u8> {
    let payload_len: usize = payloads.iter().map(|p| p.len()).sum();
    let total = HEADER_SIZE + payload_len + FOOTER_SIZE;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&HEADER_MAGIC);
    buf.push(if corrupted { FLAG_CORRUPTED } else { 0 });
    let mut size = [0u8; 4];
    LittleEndian::write_u32(&mut size, u32::try_from(payload_len).expect("payload fits in u32"));
    buf.extend_from_slice(&size);
    let mut ts = [0u8; 8];
    LittleEndian::write_u64(&mut ts, timestamp);
    buf.extend_from_slice(&ts);
    for p in payloads {
        buf.extend_from_slice(p);
    }
    let crc = crc32c::crc32c(&buf);
    let mut crc_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut crc_bytes, crc);
    buf.extend_from_slice(&crc_bytes);
    buf.extend_from_slice(&FOOTER_MAGIC);
    debug_assert_eq!(buf.len(), total);
    buf
}

/// Decodes and validates a record header.
pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<Header, CodecError> {
    if buf[0..4] != HEADER_MAGIC {
        return Err(CodecError::Malformed("bad magic"));
    }
    let flags = buf[4];
    if flags & !FLAG_CORRUPTED != 0 {
        return Err(CodecError::Malformed("bad flags"));
    }
    Ok(Header {
        size: LittleEndian::read_u32(&buf[5..9]),
        timestamp: LittleEndian::read_u64(&buf[9..17]),
        corrupted: flags & FLAG_CORRUPTED != 0,
    })
}

/// Verifies a record's footer against its header and payload bytes.
pub fn verify_footer(
    header: &[u8; HEADER_SIZE],
    payload: &[u8],
    footer: &[u8; FOOTER_SIZE],
) -> Result<(), CodecError> {
    if footer[4..8] != FOOTER_MAGIC {
        return Err(CodecError::Malformed("bad footer magic"));
    }
    let expected = LittleEndian::read_u32(&footer[0..4]);
    let actual = crc32c::crc32c_append(crc32c::crc32c(header), payload);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Validates a fully-framed record in memory, as received from a
/// replication peer. Returns its header.
pub fn verify_record(record: &[u8]) -> Result<Header, CodecError> {
    if record.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(CodecError::Malformed("impossibly short record"));
    }
    let header_bytes: &[u8; HEADER_SIZE] = record[..HEADER_SIZE].try_into().expect("sliced");
    let header = decode_header(header_bytes)?;
    if record.len() as u64 != record_size(u64::from(header.size)) {
        return Err(CodecError::Malformed("length doesn't match header"));
    }
    let footer_start = record.len() - FOOTER_SIZE;
    let footer_bytes: &[u8; FOOTER_SIZE] = record[footer_start..].try_into().expect("sliced");
    verify_footer(header_bytes, &record[HEADER_SIZE..footer_start], footer_bytes)?;
    Ok(header)
}
