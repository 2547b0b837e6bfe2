// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed metadata for the durable store.
//!
//! Trees:
//! - `segments`: closed segment descriptors, keyed by protocol and first id
//! - `cursors`: last forwarded id per destination and protocol
//! - `attempts`: failed send attempts per destination, protocol and record
//! - `dead_letters`: records a destination gave up on
//! - `counters`: per-protocol eviction and data-loss counters
//!
//! Keys are NUL-separated components with ids encoded big endian so that sled's ordering
//! matches id ordering.

use serde::{Deserialize, Serialize};
use sled::{Batch, Config as SledConfig, Db, Tree};
use std::path::Path;

use crate::error::StoreError;
use crate::protocol::Protocol;
use crate::store::segment::SegmentMeta;

const TREE_SEGMENTS: &str = "segments";
const TREE_CURSORS: &str = "cursors";
const TREE_ATTEMPTS: &str = "attempts";
const TREE_DEAD_LETTERS: &str = "dead_letters";
const TREE_COUNTERS: &str = "counters";

const SEP: u8 = 0;

/// Per-protocol counters kept across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Highest id removed by eviction. Ids never go below it again.
    EvictedUpTo,
    EvictedRecords,
    EvictedBytes,
    /// Records evicted before every consumer forwarded them.
    DataLossRecords,
    /// Dead letters dropped because their record was evicted.
    DeadLettersPruned,
}

impl Counter {
    fn as_str(self) -> &'static str {
        match self {
            Counter::EvictedUpTo => "evicted_upto",
            Counter::EvictedRecords => "evicted_records",
            Counter::EvictedBytes => "evicted_bytes",
            Counter::DataLossRecords => "data_loss_records",
            Counter::DeadLettersPruned => "dead_letters_pruned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub destination: String,
    pub protocol: Protocol,
    pub id: u64,
    pub received_at_ms: i64,
    pub size_bytes: usize,
    pub attempts: u32,
    pub reason: String,
    pub dead_at_ms: i64,
}

/// Entries removed by [`Catalog::prune_records`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrunedRecords {
    pub attempts: u64,
    pub dead_letters: u64,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    db: Db,
    segments: Tree,
    cursors: Tree,
    attempts: Tree,
    dead_letters: Tree,
    counters: Tree,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new()
            .path(path)
            .cache_capacity(16 * 1024 * 1024)
            .open()?;
        Self::from_db(db)
    }

    /// In-memory catalog, lost on drop.
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        Self::from_db(SledConfig::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            segments: db.open_tree(TREE_SEGMENTS)?,
            cursors: db.open_tree(TREE_CURSORS)?,
            attempts: db.open_tree(TREE_ATTEMPTS)?,
            dead_letters: db.open_tree(TREE_DEAD_LETTERS)?,
            counters: db.open_tree(TREE_COUNTERS)?,
            db,
        })
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Flushes without blocking the runtime, for callers on async tasks.
    pub async fn flush_async(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn put_segment(&self, meta: &SegmentMeta) -> Result<(), StoreError> {
        let value = serde_json::to_vec(meta)?;
        self.segments
            .insert(segment_key(meta.protocol, meta.first_id), value)?;
        Ok(())
    }

    pub fn remove_segment(&self, protocol: Protocol, first_id: u64) -> Result<(), StoreError> {
        self.segments.remove(segment_key(protocol, first_id))?;
        Ok(())
    }

    /// Closed segments of `protocol` in id order.
    pub fn segments(&self, protocol: Protocol) -> Result<Vec<SegmentMeta>, StoreError> {
        self.segments
            .scan_prefix(prefix(&[protocol.as_str().as_bytes()]))
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    pub fn cursor(&self, destination: &str, protocol: Protocol) -> Result<u64, StoreError> {
        Ok(self
            .cursors
            .get(cursor_key(destination, protocol))?
            .map(|v| decode_u64(&v))
            .unwrap_or(0))
    }

    /// Moves the cursor forward to `to` and returns the stored value. A lower `to` leaves
    /// the cursor where it is.
    pub fn advance_cursor(
        &self,
        destination: &str,
        protocol: Protocol,
        to: u64,
    ) -> Result<u64, StoreError> {
        let updated = self
            .cursors
            .update_and_fetch(cursor_key(destination, protocol), |old| {
                let current = old.map(decode_u64).unwrap_or(0);
                Some(current.max(to).to_be_bytes().to_vec())
            })?;
        Ok(updated.map(|v| decode_u64(&v)).unwrap_or(0))
    }

    /// Every stored cursor as `(destination, protocol, cursor)`.
    pub fn cursors(&self) -> Result<Vec<(String, Protocol, u64)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.cursors.iter() {
            let (key, value) = entry?;
            let mut parts = key.split(|b| *b == SEP);
            let (Some(destination), Some(protocol)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some(protocol) = parse_protocol(protocol) else {
                continue;
            };
            out.push((
                String::from_utf8_lossy(destination).into_owned(),
                protocol,
                decode_u64(&value),
            ));
        }
        Ok(out)
    }

    pub fn attempts(&self, destination: &str, protocol: Protocol, id: u64) -> Result<u32, StoreError> {
        Ok(self
            .attempts
            .get(record_key(destination, protocol, id))?
            .map(|v| decode_u32(&v))
            .unwrap_or(0))
    }

    /// Adds one failed attempt to each of `ids` and returns the new counts in order.
    pub fn record_attempt(
        &self,
        destination: &str,
        protocol: Protocol,
        ids: &[u64],
    ) -> Result<Vec<u32>, StoreError> {
        let mut counts = Vec::with_capacity(ids.len());
        let mut batch = Batch::default();
        for &id in ids {
            let key = record_key(destination, protocol, id);
            let count = self.attempts.get(&key)?.map(|v| decode_u32(&v)).unwrap_or(0) + 1;
            batch.insert(key, count.to_be_bytes().to_vec());
            counts.push(count);
        }
        self.attempts.apply_batch(batch)?;
        Ok(counts)
    }

    /// Drops attempt counters of records up to and including `up_to_id`.
    pub fn clear_attempts(
        &self,
        destination: &str,
        protocol: Protocol,
        up_to_id: u64,
    ) -> Result<(), StoreError> {
        let start = record_key(destination, protocol, 0);
        let end = record_key(destination, protocol, up_to_id);
        let mut batch = Batch::default();
        for key in self.attempts.range(start..=end).keys() {
            batch.remove(key?);
        }
        self.attempts.apply_batch(batch)?;
        Ok(())
    }

    pub fn put_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let value = serde_json::to_vec(letter)?;
        self.dead_letters.insert(
            record_key(&letter.destination, letter.protocol, letter.id),
            value,
        )?;
        Ok(())
    }

    pub fn is_dead(&self, destination: &str, protocol: Protocol, id: u64) -> Result<bool, StoreError> {
        Ok(self
            .dead_letters
            .contains_key(record_key(destination, protocol, id))?)
    }

    /// Dead-lettered ids of a destination/protocol within `[from, to]`.
    pub fn dead_ids(
        &self,
        destination: &str,
        protocol: Protocol,
        from: u64,
        to: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let start = record_key(destination, protocol, from);
        let end = record_key(destination, protocol, to);
        self.dead_letters
            .range(start..=end)
            .keys()
            .map(|key| Ok(id_suffix(&key?)))
            .collect()
    }

    pub fn dead_letters(&self, destination: &str) -> Result<Vec<DeadLetter>, StoreError> {
        self.dead_letters
            .scan_prefix(prefix(&[destination.as_bytes()]))
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    pub fn dead_letter_count(&self, destination: &str, protocol: Protocol) -> usize {
        self.dead_letters
            .scan_prefix(prefix(&[destination.as_bytes(), protocol.as_str().as_bytes()]))
            .count()
    }

    /// Removes attempt counters and dead letters of every destination for records of
    /// `protocol` up to `up_to_id`, once those records no longer exist.
    ///
    /// Keys are grouped by destination, so each tree is walked one destination at a time
    /// with a bounded range per destination instead of a full scan.
    pub fn prune_records(&self, protocol: Protocol, up_to_id: u64) -> Result<PrunedRecords, StoreError> {
        Ok(PrunedRecords {
            attempts: prune_tree(&self.attempts, protocol, up_to_id)?,
            dead_letters: prune_tree(&self.dead_letters, protocol, up_to_id)?,
        })
    }

    pub fn counter(&self, protocol: Protocol, counter: Counter) -> Result<u64, StoreError> {
        Ok(self
            .counters
            .get(counter_key(protocol, counter))?
            .map(|v| decode_u64(&v))
            .unwrap_or(0))
    }

    pub fn add_counter(&self, protocol: Protocol, counter: Counter, delta: u64) -> Result<u64, StoreError> {
        let updated = self
            .counters
            .update_and_fetch(counter_key(protocol, counter), |old| {
                let current = old.map(decode_u64).unwrap_or(0);
                Some(current.saturating_add(delta).to_be_bytes().to_vec())
            })?;
        Ok(updated.map(|v| decode_u64(&v)).unwrap_or(0))
    }

    pub fn raise_counter(&self, protocol: Protocol, counter: Counter, value: u64) -> Result<u64, StoreError> {
        let updated = self
            .counters
            .update_and_fetch(counter_key(protocol, counter), |old| {
                let current = old.map(decode_u64).unwrap_or(0);
                Some(current.max(value).to_be_bytes().to_vec())
            })?;
        Ok(updated.map(|v| decode_u64(&v)).unwrap_or(0))
    }
}

fn prefix(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::new();
    for part in parts {
        key.extend_from_slice(part);
        key.push(SEP);
    }
    key
}

fn segment_key(protocol: Protocol, first_id: u64) -> Vec<u8> {
    let mut key = prefix(&[protocol.as_str().as_bytes()]);
    key.extend_from_slice(&first_id.to_be_bytes());
    key
}

fn cursor_key(destination: &str, protocol: Protocol) -> Vec<u8> {
    let mut key = destination.as_bytes().to_vec();
    key.push(SEP);
    key.extend_from_slice(protocol.as_str().as_bytes());
    key
}

fn record_key(destination: &str, protocol: Protocol, id: u64) -> Vec<u8> {
    record_key_raw(destination.as_bytes(), protocol, id)
}

fn record_key_raw(destination: &[u8], protocol: Protocol, id: u64) -> Vec<u8> {
    let mut key = prefix(&[destination, protocol.as_str().as_bytes()]);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn counter_key(protocol: Protocol, counter: Counter) -> Vec<u8> {
    let mut key = prefix(&[protocol.as_str().as_bytes()]);
    key.extend_from_slice(counter.as_str().as_bytes());
    key
}

fn parse_protocol(raw: &[u8]) -> Option<Protocol> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn prune_tree(tree: &Tree, protocol: Protocol, up_to_id: u64) -> Result<u64, StoreError> {
    let mut removed = 0;
    let mut next = tree.first()?.map(|(key, _)| key);
    while let Some(key) = next {
        let Some(end) = key.iter().position(|b| *b == SEP) else {
            break;
        };
        let destination = &key[..end];
        let mut batch = Batch::default();
        let start = record_key_raw(destination, protocol, 0);
        let last = record_key_raw(destination, protocol, up_to_id);
        for key in tree.range(start..=last).keys() {
            batch.remove(key?);
            removed += 1;
        }
        tree.apply_batch(batch)?;

        // Names cannot contain NUL, so `name + 0x01` sorts right after every key of
        // `name`.
        let mut skip = destination.to_vec();
        skip.push(SEP + 1);
        next = tree.range(skip..).next().transpose()?.map(|(key, _)| key);
    }
    Ok(removed)
}

fn id_suffix(key: &[u8]) -> u64 {
    key.len()
        .checked_sub(8)
        .map(|start| decode_u64(&key[start..]))
        .unwrap_or(0)
}

fn decode_u64(raw: &[u8]) -> u64 {
    <[u8; 8]>::try_from(raw).map(u64::from_be_bytes).unwrap_or(0)
}

fn decode_u32(raw: &[u8]) -> u32 {
    <[u8; 4]>::try_from(raw).map(u32::from_be_bytes).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(destination: &str, protocol: Protocol, id: u64) -> DeadLetter {
        DeadLetter {
            destination: destination.to_string(),
            protocol,
            id,
            received_at_ms: 0,
            size_bytes: 3,
            attempts: 2,
            reason: "rejected".to_string(),
            dead_at_ms: 5,
        }
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let catalog = Catalog::open_ephemeral().unwrap();
        assert_eq!(catalog.cursor("primary", Protocol::Syslog).unwrap(), 0);
        assert_eq!(catalog.advance_cursor("primary", Protocol::Syslog, 10).unwrap(), 10);
        assert_eq!(catalog.advance_cursor("primary", Protocol::Syslog, 4).unwrap(), 10);
        assert_eq!(catalog.cursor("primary", Protocol::Syslog).unwrap(), 10);
        assert_eq!(catalog.cursor("primary", Protocol::Metric).unwrap(), 0);
        assert_eq!(catalog.cursor("backup", Protocol::Syslog).unwrap(), 0);
    }

    #[test]
    fn test_cursors_listing() {
        let catalog = Catalog::open_ephemeral().unwrap();
        catalog.advance_cursor("a", Protocol::Metric, 3).unwrap();
        catalog.advance_cursor("b", Protocol::SnmpTrap, 7).unwrap();
        let mut cursors = catalog.cursors().unwrap();
        cursors.sort();
        assert_eq!(
            cursors,
            vec![
                ("a".to_string(), Protocol::Metric, 3),
                ("b".to_string(), Protocol::SnmpTrap, 7)
            ]
        );
    }

    #[test]
    fn test_attempts_accumulate_and_clear() {
        let catalog = Catalog::open_ephemeral().unwrap();
        assert_eq!(
            catalog.record_attempt("d", Protocol::Syslog, &[1, 2]).unwrap(),
            vec![1, 1]
        );
        assert_eq!(
            catalog.record_attempt("d", Protocol::Syslog, &[1, 2, 3]).unwrap(),
            vec![2, 2, 1]
        );
        catalog.clear_attempts("d", Protocol::Syslog, 2).unwrap();
        assert_eq!(catalog.attempts("d", Protocol::Syslog, 1).unwrap(), 0);
        assert_eq!(catalog.attempts("d", Protocol::Syslog, 3).unwrap(), 1);
    }

    #[test]
    fn test_dead_letters_are_scoped_per_destination() {
        let catalog = Catalog::open_ephemeral().unwrap();
        catalog.put_dead_letter(&letter("a", Protocol::Syslog, 4)).unwrap();
        catalog.put_dead_letter(&letter("a", Protocol::Syslog, 9)).unwrap();
        catalog.put_dead_letter(&letter("ab", Protocol::Syslog, 5)).unwrap();

        assert!(catalog.is_dead("a", Protocol::Syslog, 4).unwrap());
        assert!(!catalog.is_dead("ab", Protocol::Syslog, 4).unwrap());
        assert_eq!(catalog.dead_ids("a", Protocol::Syslog, 1, 8).unwrap(), vec![4]);
        assert_eq!(catalog.dead_letters("a").unwrap().len(), 2);
        assert_eq!(catalog.dead_letter_count("a", Protocol::Syslog), 2);
        assert_eq!(catalog.dead_letter_count("a", Protocol::Metric), 0);
    }

    #[test]
    fn test_prune_records_only_touches_protocol() {
        let catalog = Catalog::open_ephemeral().unwrap();
        catalog.put_dead_letter(&letter("a", Protocol::Syslog, 4)).unwrap();
        catalog.put_dead_letter(&letter("a", Protocol::Syslog, 40)).unwrap();
        catalog.put_dead_letter(&letter("a", Protocol::Metric, 4)).unwrap();
        catalog.put_dead_letter(&letter("ab", Protocol::Syslog, 5)).unwrap();
        catalog.put_dead_letter(&letter("c", Protocol::Syslog, 11)).unwrap();
        catalog.record_attempt("b", Protocol::Syslog, &[3]).unwrap();
        catalog.record_attempt("b", Protocol::SnmpTrap, &[3]).unwrap();

        let pruned = catalog.prune_records(Protocol::Syslog, 10).unwrap();

        assert_eq!(pruned, PrunedRecords { attempts: 1, dead_letters: 2 });
        assert_eq!(catalog.dead_ids("a", Protocol::Syslog, 0, u64::MAX).unwrap(), vec![40]);
        assert!(catalog.dead_letters("ab").unwrap().is_empty());
        assert_eq!(catalog.dead_ids("c", Protocol::Syslog, 0, u64::MAX).unwrap(), vec![11]);
        assert_eq!(catalog.dead_letter_count("a", Protocol::Metric), 1);
        assert_eq!(catalog.attempts("b", Protocol::Syslog, 3).unwrap(), 0);
        assert_eq!(catalog.attempts("b", Protocol::SnmpTrap, 3).unwrap(), 1);
    }

    #[test]
    fn test_segments_and_counters_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        let meta = SegmentMeta {
            protocol: Protocol::Metric,
            first_id: 1,
            last_id: 5,
            first_received_at_ms: 0,
            last_received_at_ms: 4,
            records: 5,
            raw_bytes: 50,
            stored_bytes: 30,
        };
        {
            let catalog = Catalog::open(&path).unwrap();
            catalog.put_segment(&meta).unwrap();
            catalog.raise_counter(Protocol::Metric, Counter::EvictedUpTo, 7).unwrap();
            catalog.raise_counter(Protocol::Metric, Counter::EvictedUpTo, 3).unwrap();
            catalog.add_counter(Protocol::Metric, Counter::EvictedBytes, 30).unwrap();
            catalog.flush().unwrap();
        }
        let catalog = Catalog::open(&path).unwrap();
        assert_eq!(catalog.segments(Protocol::Metric).unwrap(), vec![meta]);
        assert!(catalog.segments(Protocol::Syslog).unwrap().is_empty());
        assert_eq!(catalog.counter(Protocol::Metric, Counter::EvictedUpTo).unwrap(), 7);
        assert_eq!(catalog.counter(Protocol::Metric, Counter::EvictedBytes).unwrap(), 30);
    }
}
