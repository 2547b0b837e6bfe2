// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use crate::protocol::Protocol;

/// Length (u32) + CRC32C of the body (u32) in front of every frame.
pub const FRAME_PREFIX_BYTES: usize = 4 + 4;
/// id (u64) + received_at (i64) + content kind (u8)
const FRAME_HEADER_BYTES: usize = 8 + 8 + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Raw,
    Json,
}

impl ContentKind {
    fn to_byte(self) -> u8 {
        match self {
            ContentKind::Raw => 0,
            ContentKind::Json => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ContentKind::Raw),
            1 => Some(ContentKind::Json),
            _ => None,
        }
    }
}

/// One telemetry unit as persisted in a partition.
///
/// Per-destination forwarding state is not stored on the record itself; it is derived
/// from the destination's cursor, attempt counters and dead letters (see
/// [`crate::forwarder::delivery`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: u64,
    pub protocol: Protocol,
    pub received_at_ms: i64,
    pub content_kind: ContentKind,
    pub payload: Bytes,
}

impl StoredRecord {
    /// Payload size before compression.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Encodes the record as a length-prefixed, checksummed frame:
    /// `[u32 len][u32 crc32c][u64 id][i64 received_at_ms][u8 content_kind][payload]`,
    /// little endian. `len` and the checksum cover everything after the checksum.
    pub fn encode_frame(&self) -> Bytes {
        let body_len = FRAME_HEADER_BYTES + self.payload.len();
        let mut body = BytesMut::with_capacity(body_len);
        body.put_u64_le(self.id);
        body.put_i64_le(self.received_at_ms);
        body.put_u8(self.content_kind.to_byte());
        body.put_slice(&self.payload);

        let mut buf = BytesMut::with_capacity(FRAME_PREFIX_BYTES + body_len);
        buf.put_u32_le(body_len as u32);
        buf.put_u32_le(crc32c(&body));
        buf.put_slice(&body);
        buf.freeze()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends in the middle of a frame (torn write).
    Truncated { valid_len: usize },
    /// A complete frame fails its checksum or carries an impossible header.
    Corrupt { offset: usize, reason: String },
}

/// Decodes every complete frame in `data`. Stops at the first incomplete or corrupt
/// frame and reports where it starts so callers can truncate a torn tail.
pub fn decode_frames(
    protocol: Protocol,
    data: &[u8],
) -> (Vec<StoredRecord>, Result<(), FrameError>) {
    let shared = Bytes::copy_from_slice(data);
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < shared.len() {
        if shared.len() - offset < FRAME_PREFIX_BYTES {
            return (records, Err(FrameError::Truncated { valid_len: offset }));
        }
        let mut cursor = &shared[offset..];
        let body_len = cursor.get_u32_le() as usize;
        let checksum = cursor.get_u32_le();
        if body_len < FRAME_HEADER_BYTES {
            return (
                records,
                Err(FrameError::Corrupt {
                    offset,
                    reason: format!("frame body of {body_len} bytes is shorter than its header"),
                }),
            );
        }
        if cursor.remaining() < body_len {
            return (records, Err(FrameError::Truncated { valid_len: offset }));
        }
        let actual = crc32c(&cursor[..body_len]);
        if actual != checksum {
            return (
                records,
                Err(FrameError::Corrupt {
                    offset,
                    reason: format!("checksum mismatch: expected {checksum:#010x}, got {actual:#010x}"),
                }),
            );
        }
        let id = cursor.get_u64_le();
        let received_at_ms = cursor.get_i64_le();
        let kind_byte = cursor.get_u8();
        let Some(content_kind) = ContentKind::from_byte(kind_byte) else {
            return (
                records,
                Err(FrameError::Corrupt {
                    offset,
                    reason: format!("unknown content kind byte {kind_byte}"),
                }),
            );
        };
        let payload_start = offset + FRAME_PREFIX_BYTES + FRAME_HEADER_BYTES;
        let payload_end = offset + FRAME_PREFIX_BYTES + body_len;
        records.push(StoredRecord {
            id,
            protocol,
            received_at_ms,
            content_kind,
            payload: shared.slice(payload_start..payload_end),
        });
        offset = payload_end;
    }

    (records, Ok(()))
}
