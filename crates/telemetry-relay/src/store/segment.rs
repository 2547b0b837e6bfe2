// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment files of a single partition.
//!
//! The open segment is a plain frame log (`open-<first_id>.log`) synced after every
//! append. Closing a segment compresses its frames into `seg-<first>-<last>.zst`; the file
//! is written under a temporary name and renamed so a closed segment is either fully
//! present or absent.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::protocol::Protocol;
use crate::record::{decode_frames, FrameError, StoredRecord};

const OPEN_PREFIX: &str = "open-";
const OPEN_SUFFIX: &str = ".log";
const CLOSED_PREFIX: &str = "seg-";
const CLOSED_SUFFIX: &str = ".zst";
pub const TMP_SUFFIX: &str = ".tmp";

/// Catalog descriptor of a closed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub protocol: Protocol,
    pub first_id: u64,
    pub last_id: u64,
    pub first_received_at_ms: i64,
    pub last_received_at_ms: i64,
    pub records: u64,
    /// Uncompressed payload bytes.
    pub raw_bytes: u64,
    /// Size of the compressed file on disk.
    pub stored_bytes: u64,
}

impl SegmentMeta {
    pub fn file_name(&self) -> String {
        closed_file_name(self.first_id, self.last_id)
    }
}

pub fn open_file_name(first_id: u64) -> String {
    format!("{OPEN_PREFIX}{first_id:020}{OPEN_SUFFIX}")
}

pub fn closed_file_name(first_id: u64, last_id: u64) -> String {
    format!("{CLOSED_PREFIX}{first_id:020}-{last_id:020}{CLOSED_SUFFIX}")
}

/// Files found in a partition directory.
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentFile {
    Open { first_id: u64 },
    Closed { first_id: u64, last_id: u64 },
    Temporary,
    Unknown,
}

pub fn classify(file_name: &str) -> SegmentFile {
    if file_name.ends_with(TMP_SUFFIX) {
        return SegmentFile::Temporary;
    }
    if let Some(id) = file_name
        .strip_prefix(OPEN_PREFIX)
        .and_then(|rest| rest.strip_suffix(OPEN_SUFFIX))
        .and_then(|id| id.parse().ok())
    {
        return SegmentFile::Open { first_id: id };
    }
    let range = file_name
        .strip_prefix(CLOSED_PREFIX)
        .and_then(|rest| rest.strip_suffix(CLOSED_SUFFIX))
        .and_then(|range| range.split_once('-'));
    match range {
        Some((first, last)) => match (first.parse(), last.parse()) {
            (Ok(first_id), Ok(last_id)) => SegmentFile::Closed { first_id, last_id },
            _ => SegmentFile::Unknown,
        },
        None => SegmentFile::Unknown,
    }
}

/// The append-only tail of a partition.
#[derive(Debug)]
pub struct OpenSegment {
    path: PathBuf,
    file: File,
    first_id: u64,
    first_received_at_ms: Option<i64>,
    len: u64,
}

impl OpenSegment {
    pub fn create(dir: &Path, first_id: u64) -> Result<Self, StoreError> {
        let path = dir.join(open_file_name(first_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        sync_dir(dir)?;
        Ok(Self {
            path,
            file,
            first_id,
            first_received_at_ms: None,
            len: 0,
        })
    }

    /// Reopens a recovered open segment whose valid content is `len` bytes long.
    pub fn reopen(
        path: PathBuf,
        first_id: u64,
        first_received_at_ms: Option<i64>,
        len: u64,
    ) -> Result<Self, StoreError> {
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            first_id,
            first_received_at_ms,
            len,
        })
    }

    /// Appends one frame and syncs it. A failed write is cut back off the file so a later
    /// append never lands behind a partial frame.
    pub fn append(&mut self, record: &StoredRecord) -> Result<(), StoreError> {
        let frame = record.encode_frame();
        let result = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data());
        if let Err(err) = result {
            if let Err(truncate_err) = self.file.set_len(self.len) {
                tracing::error!(
                    path = %self.path.display(),
                    "failed to truncate open segment after write error: {truncate_err}"
                );
            }
            return Err(err.into());
        }
        self.len += frame.len() as u64;
        self.first_received_at_ms.get_or_insert(record.received_at_ms);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_id(&self) -> u64 {
        self.first_id
    }

    pub fn first_received_at_ms(&self) -> Option<i64> {
        self.first_received_at_ms
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result of scanning an open segment file during recovery.
#[derive(Debug)]
pub struct RecoveredOpen {
    pub records: Vec<StoredRecord>,
    pub valid_len: u64,
    /// Bytes cut off the end of the file.
    pub discarded_bytes: u64,
}

/// Reads an open segment and truncates everything from the first torn or corrupt frame.
pub fn recover_open(path: &Path, protocol: Protocol) -> Result<RecoveredOpen, StoreError> {
    let data = fs::read(path)?;
    let (records, outcome) = decode_frames(protocol, &data);
    let valid_len = match outcome {
        Ok(()) => data.len(),
        Err(FrameError::Truncated { valid_len }) => valid_len,
        Err(FrameError::Corrupt { offset, reason }) => {
            tracing::warn!(
                path = %path.display(),
                offset,
                "open segment contains a corrupt frame, truncating: {reason}"
            );
            offset
        }
    };
    if valid_len < data.len() {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_all()?;
    }
    Ok(RecoveredOpen {
        records,
        valid_len: valid_len as u64,
        discarded_bytes: (data.len() - valid_len) as u64,
    })
}

/// Compresses `records` into a closed segment file and returns its descriptor.
/// The caller registers the descriptor before deleting the source open segment.
pub fn write_closed(
    dir: &Path,
    protocol: Protocol,
    records: &[StoredRecord],
    compression_level: i32,
) -> Result<SegmentMeta, StoreError> {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return Err(StoreError::Corrupt {
            path: dir.display().to_string(),
            reason: "cannot close an empty segment".to_string(),
        });
    };

    let mut frames = Vec::new();
    let mut raw_bytes = 0u64;
    for record in records {
        frames.extend_from_slice(&record.encode_frame());
        raw_bytes += record.size_bytes() as u64;
    }
    let compressed = zstd::stream::encode_all(frames.as_slice(), compression_level)?;

    let meta = SegmentMeta {
        protocol,
        first_id: first.id,
        last_id: last.id,
        first_received_at_ms: first.received_at_ms,
        last_received_at_ms: last.received_at_ms,
        records: records.len() as u64,
        raw_bytes,
        stored_bytes: compressed.len() as u64,
    };

    let final_path = dir.join(meta.file_name());
    let tmp_path = dir.join(format!("{}{TMP_SUFFIX}", meta.file_name()));
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&compressed)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    sync_dir(dir)?;
    Ok(meta)
}

pub fn read_closed(dir: &Path, meta: &SegmentMeta) -> Result<Vec<StoredRecord>, StoreError> {
    let path = dir.join(meta.file_name());
    let compressed = fs::read(&path)?;
    let frames = zstd::stream::decode_all(compressed.as_slice()).map_err(|e| {
        StoreError::Corrupt {
            path: path.display().to_string(),
            reason: format!("decompression failed: {e}"),
        }
    })?;
    let (records, outcome) = decode_frames(meta.protocol, &frames);
    match outcome {
        Ok(()) => Ok(records),
        Err(err) => Err(StoreError::Corrupt {
            path: path.display().to_string(),
            reason: format!("{err:?}"),
        }),
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Makes renames and deletions inside `dir` durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContentKind;
    use bytes::Bytes;

    fn record(id: u64) -> StoredRecord {
        StoredRecord {
            id,
            protocol: Protocol::Syslog,
            received_at_ms: 10 * id as i64,
            content_kind: ContentKind::Raw,
            payload: Bytes::from(format!("line {id}")),
        }
    }

    #[test]
    fn test_classify_file_names() {
        assert_eq!(
            classify(&open_file_name(42)),
            SegmentFile::Open { first_id: 42 }
        );
        assert_eq!(
            classify(&closed_file_name(1, 99)),
            SegmentFile::Closed {
                first_id: 1,
                last_id: 99
            }
        );
        assert_eq!(
            classify(&format!("{}{TMP_SUFFIX}", closed_file_name(1, 2))),
            SegmentFile::Temporary
        );
        assert_eq!(classify("notes.txt"), SegmentFile::Unknown);
        assert_eq!(classify("seg-abc-def.zst"), SegmentFile::Unknown);
    }

    #[test]
    fn test_open_segment_append_and_recover_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut open = OpenSegment::create(dir.path(), 1).unwrap();
        open.append(&record(1)).unwrap();
        open.append(&record(2)).unwrap();
        let valid = open.len();
        assert_eq!(open.first_received_at_ms(), Some(10));

        // Simulate a crash halfway through a third frame.
        let partial = record(3).encode_frame();
        let mut file = OpenOptions::new().append(true).open(open.path()).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let recovered = recover_open(open.path(), Protocol::Syslog).unwrap();
        assert_eq!(recovered.records, vec![record(1), record(2)]);
        assert_eq!(recovered.valid_len, valid);
        assert_eq!(recovered.discarded_bytes, (partial.len() / 2) as u64);
        assert_eq!(fs::metadata(open.path()).unwrap().len(), valid);
    }

    #[test]
    fn test_closed_segment_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = (5..=9).map(record).collect();
        let meta = write_closed(dir.path(), Protocol::Syslog, &records, 3).unwrap();

        assert_eq!(meta.first_id, 5);
        assert_eq!(meta.last_id, 9);
        assert_eq!(meta.records, 5);
        assert_eq!(meta.first_received_at_ms, 50);
        assert_eq!(
            fs::metadata(dir.path().join(meta.file_name())).unwrap().len(),
            meta.stored_bytes
        );
        assert!(!dir
            .path()
            .join(format!("{}{TMP_SUFFIX}", meta.file_name()))
            .exists());
        assert_eq!(read_closed(dir.path(), &meta).unwrap(), records);
    }

    #[test]
    fn test_read_closed_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let meta = write_closed(dir.path(), Protocol::Syslog, &[record(1)], 3).unwrap();
        fs::write(dir.path().join(meta.file_name()), b"garbage").unwrap();
        assert!(matches!(
            read_closed(dir.path(), &meta),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
