// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, protocol-partitioned record log.
//!
//! Each protocol owns a partition directory under `<data_dir>/partitions/`. Appends are
//! serialized by the partition writer lock and synced before they become visible to
//! readers. Readers work from a snapshot of the partition view (closed segment descriptors
//! plus the in-memory copy of the open segment) and never block appends for longer than
//! it takes to clone that snapshot.
//!
//! Metadata (segment descriptors, cursors, attempts, dead letters, counters) lives in the
//! sled [`Catalog`].

pub mod catalog;
pub mod segment;

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub use catalog::{Catalog, Counter, DeadLetter, PrunedRecords};
pub use segment::SegmentMeta;

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::protocol::Protocol;
use crate::record::{ContentKind, StoredRecord};
use segment::{OpenSegment, SegmentFile};

const CATALOG_DIR: &str = "catalog";
const PARTITIONS_DIR: &str = "partitions";
const SEGMENT_CACHE_ENTRIES: usize = 4;
/// Reads retry when a segment disappears under them because of eviction.
const READ_ATTEMPTS: usize = 3;

/// Tunables the store reads on every append. Replaced on reload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreLimits {
    pub segment_max_bytes: u64,
    pub compression_level: i32,
    pub soft_limit_bytes: u64,
}

impl From<&StorageConfig> for StoreLimits {
    fn from(config: &StorageConfig) -> Self {
        Self {
            segment_max_bytes: config.segment_max_bytes,
            compression_level: config.compression_level,
            soft_limit_bytes: config.soft_limit_bytes(),
        }
    }
}

/// What an [`DurableStore::evict`] call removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub segments: usize,
    pub records: u64,
    pub bytes: u64,
    /// Highest id removed, 0 when nothing was evicted.
    pub up_to_id: u64,
    /// Dead letters of the removed records, dropped with them.
    pub dead_letters_pruned: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PartitionStats {
    pub protocol: Protocol,
    /// Records currently held (closed and open segments).
    pub records: u64,
    pub first_id: Option<u64>,
    pub last_id: u64,
    pub closed_segments: usize,
    pub open_segment_records: usize,
    pub disk_bytes: u64,
    pub evicted_upto: u64,
    pub evicted_records: u64,
    pub evicted_bytes: u64,
    pub data_loss_records: u64,
    pub dead_letters_pruned: u64,
}

#[derive(Debug)]
struct PartitionWriter {
    open: Option<OpenSegment>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct PartitionView {
    closed: Vec<SegmentMeta>,
    /// Durable records of the open segment, in id order.
    open: Vec<StoredRecord>,
    open_bytes: u64,
}

impl PartitionView {
    fn disk_bytes(&self) -> u64 {
        self.closed.iter().map(|m| m.stored_bytes).sum::<u64>() + self.open_bytes
    }

    fn first_id(&self) -> Option<u64> {
        self.closed
            .first()
            .map(|m| m.first_id)
            .or_else(|| self.open.first().map(|r| r.id))
    }
}

#[derive(Debug)]
struct Partition {
    protocol: Protocol,
    dir: PathBuf,
    writer: Mutex<PartitionWriter>,
    /// Serializes evictions. Appends and rotation never take it.
    evicting: Mutex<()>,
    view: RwLock<PartitionView>,
    last_id: AtomicU64,
    cache: Mutex<VecDeque<(u64, Arc<Vec<StoredRecord>>)>>,
    appended: Notify,
}

impl Partition {
    fn snapshot_disk_bytes(&self) -> u64 {
        self.view.read().map(|v| v.disk_bytes()).unwrap_or(0)
    }

    fn load_segment(&self, meta: &SegmentMeta) -> Result<Arc<Vec<StoredRecord>>, StoreError> {
        {
            let cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
            if let Some((_, records)) = cache.iter().find(|(first, _)| *first == meta.first_id) {
                return Ok(records.clone());
            }
        }
        let records = Arc::new(segment::read_closed(&self.dir, meta)?);
        let mut cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
        if cache.len() >= SEGMENT_CACHE_ENTRIES {
            cache.pop_front();
        }
        cache.push_back((meta.first_id, records.clone()));
        Ok(records)
    }

    fn try_read(&self, cursor: u64, max_batch: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let (closed, tail) = {
            let view = self.view.read().map_err(|_| StoreError::Poisoned)?;
            let mut wanted = 0u64;
            let mut closed = Vec::new();
            for meta in view.closed.iter().filter(|m| m.last_id > cursor) {
                if wanted >= max_batch as u64 {
                    break;
                }
                wanted += meta.last_id - meta.first_id.max(cursor + 1) + 1;
                closed.push(meta.clone());
            }
            let tail: Vec<StoredRecord> = if wanted < max_batch as u64 {
                view.open
                    .iter()
                    .filter(|r| r.id > cursor)
                    .take(max_batch - wanted as usize)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            (closed, tail)
        };

        let mut batch = Vec::with_capacity(max_batch);
        for meta in &closed {
            let records = self.load_segment(meta)?;
            let remaining = max_batch - batch.len();
            batch.extend(
                records
                    .iter()
                    .filter(|r| r.id > cursor)
                    .take(remaining)
                    .cloned(),
            );
            if batch.len() >= max_batch {
                return Ok(batch);
            }
        }
        let remaining = max_batch - batch.len();
        batch.extend(tail.into_iter().take(remaining));
        Ok(batch)
    }
}

/// Crash-safe record store shared by ingestion, forwarding workers and the sweeper.
#[derive(Debug)]
pub struct DurableStore {
    root: PathBuf,
    catalog: Catalog,
    partitions: HashMap<Protocol, Partition>,
    clock: Arc<dyn Clock>,
    limits: RwLock<StoreLimits>,
    pressure: Notify,
}

impl DurableStore {
    /// Opens the store under `root`, recovering every partition.
    pub fn open(
        root: impl AsRef<Path>,
        limits: StoreLimits,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(PARTITIONS_DIR))?;
        let catalog = Catalog::open(&root.join(CATALOG_DIR))?;

        let mut partitions = HashMap::new();
        let mut usage = 0;
        for protocol in Protocol::ALL {
            let partition = recover_partition(&root, &catalog, protocol, limits.compression_level)?;
            usage += partition.snapshot_disk_bytes();
            partitions.insert(protocol, partition);
        }
        catalog.flush()?;
        info!(
            root = %root.display(),
            usage_bytes = usage,
            "Durable store opened"
        );

        Ok(Self {
            root,
            catalog,
            partitions,
            clock,
            limits: RwLock::new(limits),
            pressure: Notify::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn set_limits(&self, limits: StoreLimits) {
        if let Ok(mut current) = self.limits.write() {
            *current = limits;
        }
    }

    pub fn limits(&self) -> Result<StoreLimits, StoreError> {
        self.limits
            .read()
            .map(|l| *l)
            .map_err(|_| StoreError::Poisoned)
    }

    fn partition(&self, protocol: Protocol) -> Result<&Partition, StoreError> {
        self.partitions
            .get(&protocol)
            .ok_or_else(|| StoreError::Corrupt {
                path: self.root.display().to_string(),
                reason: format!("no partition for {protocol}"),
            })
    }

    /// Appends one record and returns it once it is on stable storage.
    pub fn append(
        &self,
        protocol: Protocol,
        content_kind: ContentKind,
        payload: Bytes,
    ) -> Result<StoredRecord, StoreError> {
        let partition = self.partition(protocol)?;
        let limits = self.limits()?;
        let mut writer = partition.writer.lock().map_err(|_| StoreError::Poisoned)?;

        let record = StoredRecord {
            id: writer.next_id,
            protocol,
            received_at_ms: self.clock.now_ms(),
            content_kind,
            payload,
        };
        if writer.open.is_none() {
            writer.open = Some(OpenSegment::create(&partition.dir, record.id)?);
        }
        let open_len = match writer.open.as_mut() {
            Some(open) => {
                open.append(&record)?;
                open.len()
            }
            None => 0,
        };
        writer.next_id += 1;
        {
            let mut view = partition.view.write().map_err(|_| StoreError::Poisoned)?;
            view.open.push(record.clone());
            view.open_bytes = open_len;
        }
        partition.last_id.store(record.id, Ordering::SeqCst);
        partition.appended.notify_waiters();

        if open_len >= limits.segment_max_bytes {
            // The record is already durable; a failed rotation only delays compression.
            if let Err(err) = self.rotate_locked(partition, &mut writer, limits.compression_level) {
                error!(%protocol, "Segment rotation failed: {err}");
            }
        }
        drop(writer);

        if self.disk_usage() > limits.soft_limit_bytes {
            self.pressure.notify_one();
        }
        Ok(record)
    }

    fn rotate_locked(
        &self,
        partition: &Partition,
        writer: &mut PartitionWriter,
        compression_level: i32,
    ) -> Result<Option<SegmentMeta>, StoreError> {
        let Some(open) = writer.open.as_ref() else {
            return Ok(None);
        };
        if open.is_empty() {
            return Ok(None);
        }
        let records = partition
            .view
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .open
            .clone();
        let meta = segment::write_closed(&partition.dir, partition.protocol, &records, compression_level)?;
        self.catalog.put_segment(&meta)?;
        self.catalog.flush()?;

        let open_path = open.path().to_path_buf();
        writer.open = None;
        {
            let mut view = partition.view.write().map_err(|_| StoreError::Poisoned)?;
            view.closed.push(meta.clone());
            view.open.clear();
            view.open_bytes = 0;
        }

        if let Err(err) = segment::remove_file_if_exists(&open_path) {
            // Recovery drops open files already covered by a closed segment.
            warn!(path = %open_path.display(), "Failed to remove rotated open segment: {err}");
        }
        debug!(
            protocol = %partition.protocol,
            first_id = meta.first_id,
            last_id = meta.last_id,
            raw_bytes = meta.raw_bytes,
            stored_bytes = meta.stored_bytes,
            "Closed segment"
        );
        Ok(Some(meta))
    }

    /// Closes the open segment of `protocol` if it holds any record.
    pub fn rotate(&self, protocol: Protocol) -> Result<Option<SegmentMeta>, StoreError> {
        let partition = self.partition(protocol)?;
        let level = self.limits()?.compression_level;
        let mut writer = partition.writer.lock().map_err(|_| StoreError::Poisoned)?;
        self.rotate_locked(partition, &mut writer, level)
    }

    /// Closes every open segment whose first record is older than `max_age_ms`.
    pub fn rotate_expired(&self, now_ms: i64, max_age_ms: i64) -> Result<Vec<SegmentMeta>, StoreError> {
        let level = self.limits()?.compression_level;
        let mut closed = Vec::new();
        for protocol in Protocol::ALL {
            let partition = self.partition(protocol)?;
            let mut writer = partition.writer.lock().map_err(|_| StoreError::Poisoned)?;
            let expired = writer
                .open
                .as_ref()
                .and_then(|open| open.first_received_at_ms())
                .is_some_and(|first| now_ms.saturating_sub(first) >= max_age_ms);
            if expired {
                if let Some(meta) = self.rotate_locked(partition, &mut writer, level)? {
                    closed.push(meta);
                }
            }
        }
        Ok(closed)
    }

    /// Returns up to `max_batch` contiguous records with id greater than `cursor`.
    /// Records already evicted are skipped.
    pub fn read_from(
        &self,
        protocol: Protocol,
        cursor: u64,
        max_batch: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let partition = self.partition(protocol)?;
        let mut last_err = None;
        for _ in 0..READ_ATTEMPTS {
            match partition.try_read(cursor, max_batch) {
                Ok(records) => return Ok(records),
                Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(%protocol, cursor, "Segment evicted during read, retrying");
                    last_err = Some(StoreError::Io(err));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(StoreError::Poisoned))
    }

    /// Waits until a record is appended to `protocol`. Callers must check for new data
    /// after registering interest to avoid missing a wakeup.
    pub fn appended(&self, protocol: Protocol) -> Option<&Notify> {
        self.partitions.get(&protocol).map(|p| &p.appended)
    }

    /// Woken when an append pushes usage above the soft limit.
    pub fn pressure(&self) -> &Notify {
        &self.pressure
    }

    /// Removes every closed segment of `protocol` whose ids are all `<= up_to_id`.
    /// Segments are removed whole; a segment straddling the boundary stays.
    ///
    /// Appends keep going while this runs: rotation only pushes segments to the back of
    /// the closed list and eviction is the only thing removing from its front.
    pub fn evict(&self, protocol: Protocol, up_to_id: u64) -> Result<EvictionOutcome, StoreError> {
        let partition = self.partition(protocol)?;
        let (victims, mut outcome) = {
            let _evicting = partition.evicting.lock().map_err(|_| StoreError::Poisoned)?;

            let victims: Vec<SegmentMeta> = partition
                .view
                .read()
                .map_err(|_| StoreError::Poisoned)?
                .closed
                .iter()
                .take_while(|m| m.last_id <= up_to_id)
                .cloned()
                .collect();
            if victims.is_empty() {
                return Ok(EvictionOutcome::default());
            }

            for meta in &victims {
                self.catalog.remove_segment(protocol, meta.first_id)?;
            }
            let outcome = EvictionOutcome {
                segments: victims.len(),
                records: victims.iter().map(|m| m.records).sum(),
                bytes: victims.iter().map(|m| m.stored_bytes).sum(),
                up_to_id: victims.iter().map(|m| m.last_id).max().unwrap_or(0),
                dead_letters_pruned: 0,
            };
            self.catalog
                .raise_counter(protocol, Counter::EvictedUpTo, outcome.up_to_id)?;
            self.catalog
                .add_counter(protocol, Counter::EvictedRecords, outcome.records)?;
            self.catalog
                .add_counter(protocol, Counter::EvictedBytes, outcome.bytes)?;
            self.catalog.flush()?;

            {
                let mut view = partition.view.write().map_err(|_| StoreError::Poisoned)?;
                view.closed.drain(..victims.len());
            }
            if let Ok(mut cache) = partition.cache.lock() {
                cache.retain(|(first, _)| *first > outcome.up_to_id);
            }
            (victims, outcome)
        };

        for meta in &victims {
            if let Err(err) = segment::remove_file_if_exists(&partition.dir.join(meta.file_name())) {
                warn!(%protocol, first_id = meta.first_id, "Failed to delete evicted segment: {err}");
            }
        }
        let pruned = self.catalog.prune_records(protocol, outcome.up_to_id)?;
        outcome.dead_letters_pruned = pruned.dead_letters;
        if pruned.dead_letters > 0 {
            self.catalog
                .add_counter(protocol, Counter::DeadLettersPruned, pruned.dead_letters)?;
        }

        debug!(
            %protocol,
            segments = outcome.segments,
            records = outcome.records,
            bytes = outcome.bytes,
            up_to_id = outcome.up_to_id,
            attempts_pruned = pruned.attempts,
            dead_letters_pruned = pruned.dead_letters,
            "Evicted segments"
        );
        Ok(outcome)
    }

    /// Closed segment descriptors of `protocol`, oldest first.
    pub fn segments(&self, protocol: Protocol) -> Result<Vec<SegmentMeta>, StoreError> {
        Ok(self
            .partition(protocol)?
            .view
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .closed
            .clone())
    }

    /// `(first_id, last_id, newest received_at_ms)` of the open segment, if it holds records.
    pub fn open_segment_bounds(&self, protocol: Protocol) -> Option<(u64, u64, i64)> {
        let view = self.partitions.get(&protocol)?.view.read().ok()?;
        match (view.open.first(), view.open.last()) {
            (Some(first), Some(last)) => Some((first.id, last.id, last.received_at_ms)),
            _ => None,
        }
    }

    /// Id of the newest record ever appended to `protocol`, 0 if none.
    pub fn latest_id(&self, protocol: Protocol) -> u64 {
        self.partitions
            .get(&protocol)
            .map(|p| p.last_id.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Bytes of all segment files, open and closed.
    pub fn disk_usage(&self) -> u64 {
        self.partitions
            .values()
            .map(Partition::snapshot_disk_bytes)
            .sum()
    }

    pub fn partition_stats(&self, protocol: Protocol) -> Result<PartitionStats, StoreError> {
        let partition = self.partition(protocol)?;
        let (records, first_id, closed_segments, open_segment_records, disk_bytes) = {
            let view = partition.view.read().map_err(|_| StoreError::Poisoned)?;
            (
                view.closed.iter().map(|m| m.records).sum::<u64>() + view.open.len() as u64,
                view.first_id(),
                view.closed.len(),
                view.open.len(),
                view.disk_bytes(),
            )
        };
        Ok(PartitionStats {
            protocol,
            records,
            first_id,
            last_id: partition.last_id.load(Ordering::SeqCst),
            closed_segments,
            open_segment_records,
            disk_bytes,
            evicted_upto: self.catalog.counter(protocol, Counter::EvictedUpTo)?,
            evicted_records: self.catalog.counter(protocol, Counter::EvictedRecords)?,
            evicted_bytes: self.catalog.counter(protocol, Counter::EvictedBytes)?,
            data_loss_records: self.catalog.counter(protocol, Counter::DataLossRecords)?,
            dead_letters_pruned: self.catalog.counter(protocol, Counter::DeadLettersPruned)?,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.catalog.flush()
    }
}

fn recover_partition(
    root: &Path,
    catalog: &Catalog,
    protocol: Protocol,
    compression_level: i32,
) -> Result<Partition, StoreError> {
    let dir = root.join(PARTITIONS_DIR).join(protocol.as_str());
    fs::create_dir_all(&dir)?;

    let mut closed_files = HashMap::new();
    let mut open_files = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        match segment::classify(&name) {
            SegmentFile::Open { first_id } => open_files.push((first_id, entry.path())),
            SegmentFile::Closed { first_id, last_id } => {
                closed_files.insert(name, (first_id, last_id));
            }
            SegmentFile::Temporary => {
                debug!(%protocol, file = %name, "Removing leftover temporary segment");
                segment::remove_file_if_exists(&entry.path())?;
            }
            SegmentFile::Unknown => {}
        }
    }

    let mut closed = Vec::new();
    for meta in catalog.segments(protocol)? {
        if closed_files.remove(&meta.file_name()).is_some() {
            closed.push(meta);
        } else {
            warn!(
                %protocol,
                first_id = meta.first_id,
                last_id = meta.last_id,
                "Segment file missing, dropping descriptor"
            );
            catalog.remove_segment(protocol, meta.first_id)?;
        }
    }
    for name in closed_files.keys() {
        debug!(%protocol, file = %name, "Removing unregistered segment file");
        segment::remove_file_if_exists(&dir.join(name))?;
    }

    let evicted_upto = catalog.counter(protocol, Counter::EvictedUpTo)?;
    let mut covered_upto = closed.last().map(|m| m.last_id).unwrap_or(0).max(evicted_upto);

    open_files.sort();
    let mut tail: Option<(PathBuf, u64, Vec<StoredRecord>, u64)> = None;
    let last_index = open_files.len().saturating_sub(1);
    for (index, (first_id, path)) in open_files.into_iter().enumerate() {
        let recovered = segment::recover_open(&path, protocol)?;
        if recovered.discarded_bytes > 0 {
            warn!(
                %protocol,
                path = %path.display(),
                discarded_bytes = recovered.discarded_bytes,
                "Truncated torn tail of open segment"
            );
        }
        let fresh: Vec<StoredRecord> = recovered
            .records
            .iter()
            .filter(|r| r.id > covered_upto)
            .cloned()
            .collect();

        if fresh.is_empty() {
            segment::remove_file_if_exists(&path)?;
            continue;
        }
        let fully_fresh = fresh.len() == recovered.records.len();
        if index == last_index && fully_fresh {
            covered_upto = fresh.last().map(|r| r.id).unwrap_or(covered_upto);
            tail = Some((path, first_id, fresh, recovered.valid_len));
        } else {
            let meta = segment::write_closed(&dir, protocol, &fresh, compression_level)?;
            catalog.put_segment(&meta)?;
            catalog.flush()?;
            segment::remove_file_if_exists(&path)?;
            covered_upto = meta.last_id;
            closed.push(meta);
        }
    }

    let last_id = covered_upto;
    let (writer_open, open_records, open_bytes) = match tail {
        Some((path, first_id, records, len)) => {
            let first_received = records.first().map(|r| r.received_at_ms);
            (
                Some(OpenSegment::reopen(path, first_id, first_received, len)?),
                records,
                len,
            )
        }
        None => (None, Vec::new(), 0),
    };
    info!(
        %protocol,
        closed_segments = closed.len(),
        open_records = open_records.len(),
        next_id = last_id + 1,
        "Recovered partition"
    );

    Ok(Partition {
        protocol,
        dir,
        writer: Mutex::new(PartitionWriter {
            open: writer_open,
            next_id: last_id + 1,
        }),
        evicting: Mutex::new(()),
        view: RwLock::new(PartitionView {
            closed,
            open: open_records,
            open_bytes,
        }),
        last_id: AtomicU64::new(last_id),
        cache: Mutex::new(VecDeque::with_capacity(SEGMENT_CACHE_ENTRIES)),
        appended: Notify::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limits(segment_max_bytes: u64) -> StoreLimits {
        StoreLimits {
            segment_max_bytes,
            compression_level: 3,
            soft_limit_bytes: u64::MAX,
        }
    }

    fn open_store(dir: &Path, segment_max_bytes: u64) -> DurableStore {
        DurableStore::open(dir, limits(segment_max_bytes), Arc::new(ManualClock::new(1_000))).unwrap()
    }

    fn append(store: &DurableStore, protocol: Protocol, payload: &str) -> StoredRecord {
        store
            .append(protocol, ContentKind::Raw, Bytes::from(payload.to_string()))
            .unwrap()
    }

    fn ids(records: &[StoredRecord]) -> Vec<u64> {
        records.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_ids_are_per_partition_and_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 1 << 20);
        assert_eq!(append(&store, Protocol::Syslog, "a").id, 1);
        assert_eq!(append(&store, Protocol::Syslog, "b").id, 2);
        assert_eq!(append(&store, Protocol::Metric, "m").id, 1);
        assert_eq!(store.latest_id(Protocol::Syslog), 2);
        assert_eq!(store.latest_id(Protocol::SnmpTrap), 0);
    }

    #[test]
    fn test_read_from_spans_closed_and_open_segments() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segments: every few records rotate.
        let store = open_store(dir.path(), 60);
        for i in 0..20 {
            append(&store, Protocol::Syslog, &format!("record-{i:02}"));
        }
        assert!(!store.segments(Protocol::Syslog).unwrap().is_empty());

        assert_eq!(ids(&store.read_from(Protocol::Syslog, 0, 5).unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            ids(&store.read_from(Protocol::Syslog, 5, 100).unwrap()),
            (6..=20).collect::<Vec<_>>()
        );
        assert!(store.read_from(Protocol::Syslog, 20, 10).unwrap().is_empty());
        assert!(store.read_from(Protocol::Metric, 0, 10).unwrap().is_empty());

        let record = &store.read_from(Protocol::Syslog, 6, 1).unwrap()[0];
        assert_eq!(record.payload, Bytes::from_static(b"record-06"));
        assert_eq!(record.received_at_ms, 1_000);
    }

    #[test]
    fn test_restart_replays_everything() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path(), 80);
            for i in 0..10 {
                append(&store, Protocol::RemoteEvent, &format!("event {i}"));
            }
        }
        let store = open_store(dir.path(), 80);
        let records = store.read_from(Protocol::RemoteEvent, 0, 100).unwrap();
        assert_eq!(ids(&records), (1..=10).collect::<Vec<_>>());
        assert_eq!(records[9].payload, Bytes::from_static(b"event 9"));
        assert_eq!(append(&store, Protocol::RemoteEvent, "next").id, 11);
    }

    #[test]
    fn test_recovery_drops_open_file_already_closed() {
        let dir = tempfile::tempdir().unwrap();
        let partition_dir = dir.path().join(PARTITIONS_DIR).join("syslog");
        {
            let store = open_store(dir.path(), 1 << 20);
            append(&store, Protocol::Syslog, "one");
            append(&store, Protocol::Syslog, "two");
        }
        // Crash after the closed segment was registered but before the open file was removed.
        let open_path = partition_dir.join(segment::open_file_name(1));
        let saved = fs::read(&open_path).unwrap();
        {
            let store = open_store(dir.path(), 1 << 20);
            store.rotate(Protocol::Syslog).unwrap();
        }
        fs::write(&open_path, saved).unwrap();

        let store = open_store(dir.path(), 1 << 20);
        assert!(!open_path.exists());
        assert_eq!(ids(&store.read_from(Protocol::Syslog, 0, 10).unwrap()), vec![1, 2]);
        assert_eq!(append(&store, Protocol::Syslog, "three").id, 3);
    }

    #[test]
    fn test_recovery_removes_orphans_and_missing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let partition_dir = dir.path().join(PARTITIONS_DIR).join("metric");
        let meta = {
            let store = open_store(dir.path(), 1 << 20);
            append(&store, Protocol::Metric, "cpu 1");
            store.rotate(Protocol::Metric).unwrap().unwrap()
        };
        fs::write(partition_dir.join("seg-x.zst.tmp"), b"junk").unwrap();
        fs::write(partition_dir.join(segment::closed_file_name(50, 60)), b"junk").unwrap();
        fs::remove_file(partition_dir.join(meta.file_name())).unwrap();

        let store = open_store(dir.path(), 1 << 20);
        assert!(store.segments(Protocol::Metric).unwrap().is_empty());
        assert!(!partition_dir.join("seg-x.zst.tmp").exists());
        assert!(!partition_dir.join(segment::closed_file_name(50, 60)).exists());
        assert!(store.catalog().segments(Protocol::Metric).unwrap().is_empty());
    }

    #[test]
    fn test_evict_removes_whole_segments_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 1 << 20);
        for i in 1..=3 {
            append(&store, Protocol::Syslog, &format!("a{i}"));
        }
        store.rotate(Protocol::Syslog).unwrap();
        for i in 4..=6 {
            append(&store, Protocol::Syslog, &format!("b{i}"));
        }
        store.rotate(Protocol::Syslog).unwrap();
        append(&store, Protocol::Syslog, "open");

        // 4 is inside the second segment, so only the first one goes.
        let outcome = store.evict(Protocol::Syslog, 4).unwrap();
        assert_eq!(outcome.segments, 1);
        assert_eq!(outcome.records, 3);
        assert_eq!(outcome.up_to_id, 3);
        assert_eq!(ids(&store.read_from(Protocol::Syslog, 0, 10).unwrap()), vec![4, 5, 6, 7]);

        let stats = store.partition_stats(Protocol::Syslog).unwrap();
        assert_eq!(stats.evicted_upto, 3);
        assert_eq!(stats.evicted_records, 3);
        assert_eq!(stats.records, 4);
        assert_eq!(stats.first_id, Some(4));

        // The open segment is never evicted.
        let outcome = store.evict(Protocol::Syslog, 100).unwrap();
        assert_eq!(outcome.up_to_id, 6);
        assert_eq!(ids(&store.read_from(Protocol::Syslog, 0, 10).unwrap()), vec![7]);
    }

    #[test]
    fn test_evict_does_not_wait_for_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 1 << 20);
        for i in 1..=3 {
            append(&store, Protocol::Syslog, &format!("a{i}"));
        }
        store.rotate(Protocol::Syslog).unwrap();
        store
            .catalog()
            .put_dead_letter(&DeadLetter {
                destination: "primary".to_string(),
                protocol: Protocol::Syslog,
                id: 2,
                received_at_ms: 1_000,
                size_bytes: 2,
                attempts: 1,
                reason: "rejected".to_string(),
                dead_at_ms: 1_000,
            })
            .unwrap();

        let store = &store;
        let partition = store.partition(Protocol::Syslog).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            // An append in progress holds the writer for its whole write and sync.
            let writer = partition.writer.lock().unwrap();
            scope.spawn(move || tx.send(store.evict(Protocol::Syslog, 3)).unwrap());
            let outcome = rx.recv_timeout(std::time::Duration::from_secs(5));
            drop(writer);

            let outcome = outcome.expect("eviction blocked behind the writer").unwrap();
            assert_eq!(outcome.records, 3);
            assert_eq!(outcome.dead_letters_pruned, 1);
        });
        let stats = store.partition_stats(Protocol::Syslog).unwrap();
        assert_eq!(stats.dead_letters_pruned, 1);
        assert!(store.catalog().dead_letters("primary").unwrap().is_empty());
        assert_eq!(append(store, Protocol::Syslog, "after").id, 4);
    }

    #[test]
    fn test_ids_resume_after_everything_evicted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path(), 1 << 20);
            append(&store, Protocol::SnmpTrap, "t1");
            append(&store, Protocol::SnmpTrap, "t2");
            store.rotate(Protocol::SnmpTrap).unwrap();
            store.evict(Protocol::SnmpTrap, 2).unwrap();
        }
        let store = open_store(dir.path(), 1 << 20);
        assert_eq!(append(&store, Protocol::SnmpTrap, "t3").id, 3);
    }

    #[test]
    fn test_rotate_expired_uses_first_record_age() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = DurableStore::open(dir.path(), limits(1 << 20), clock.clone()).unwrap();
        append(&store, Protocol::Syslog, "old");
        clock.set(500);
        append(&store, Protocol::Metric, "new");

        let closed = store.rotate_expired(1_000, 1_000).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].protocol, Protocol::Syslog);
        assert!(store.segments(Protocol::Metric).unwrap().is_empty());
    }

    #[test]
    fn test_disk_usage_tracks_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 1 << 20);
        assert_eq!(store.disk_usage(), 0);
        append(&store, Protocol::Syslog, "hello");
        let open_usage = store.disk_usage();
        assert!(open_usage > 0);
        let meta = store.rotate(Protocol::Syslog).unwrap().unwrap();
        assert_eq!(store.disk_usage(), meta.stored_bytes);
        store.evict(Protocol::Syslog, meta.last_id).unwrap();
        assert_eq!(store.disk_usage(), 0);
    }
}
