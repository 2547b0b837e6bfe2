// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retention and eviction.
//!
//! Each sweep, in order:
//! 1. closes open segments older than the segment age limit,
//! 2. evicts segments entirely older than their protocol's retention window,
//! 3. above the soft watermark, evicts the oldest segments every consumer has forwarded,
//! 4. above the hard cap, evicts the oldest segments regardless of forwarding state.
//!
//! Steps 2 and 4 may drop records some destination has not forwarded yet; every such
//! eviction is logged as a data-loss event and counted per protocol.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DestinationSet, RetentionConfig, StorageConfig};
use crate::error::StoreError;
use crate::protocol::Protocol;
use crate::status::{FailureEvent, FailureLog};
use crate::store::{Counter, DurableStore, EvictionOutcome, SegmentMeta};

/// Upper bound on evictions per pressure pass.
const MAX_PRESSURE_EVICTIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    /// Active destinations per protocol. Protocols without consumers count as fully
    /// forwarded.
    pub consumers: HashMap<Protocol, Vec<String>>,
}

impl RetentionSettings {
    pub fn new(storage: StorageConfig, retention: RetentionConfig, destinations: &DestinationSet) -> Self {
        let consumers = Protocol::ALL
            .iter()
            .map(|p| {
                (
                    *p,
                    destinations
                        .consumers(*p)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                )
            })
            .collect();
        Self {
            storage,
            retention,
            consumers,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rotated: usize,
    pub evicted_segments: usize,
    pub evicted_records: u64,
    pub data_loss_records: u64,
}

impl SweepReport {
    fn add(&mut self, outcome: &EvictionOutcome, lost: u64) {
        self.evicted_segments += outcome.segments;
        self.evicted_records += outcome.records;
        self.data_loss_records += lost;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictionReason {
    RetentionExpired,
    Watermark,
    HardCap,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            EvictionReason::RetentionExpired => "retention_expired",
            EvictionReason::Watermark => "watermark",
            EvictionReason::HardCap => "hard_cap",
        }
    }
}

#[derive(Debug)]
pub struct RetentionManager {
    store: Arc<DurableStore>,
    failures: Arc<FailureLog>,
    settings: RwLock<RetentionSettings>,
}

impl RetentionManager {
    pub fn new(store: Arc<DurableStore>, failures: Arc<FailureLog>, settings: RetentionSettings) -> Self {
        Self {
            store,
            failures,
            settings: RwLock::new(settings),
        }
    }

    pub fn apply(&self, settings: RetentionSettings) {
        if let Ok(mut current) = self.settings.write() {
            *current = settings;
        }
    }

    fn settings(&self) -> Result<RetentionSettings, StoreError> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Poisoned)
    }

    fn sweep_interval(&self) -> Duration {
        self.settings
            .read()
            .map(|s| s.retention.sweep_interval())
            .unwrap_or(Duration::from_secs(30))
    }

    /// Sweeps on the configured interval, or right away when an append crosses the
    /// soft watermark.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting retention sweeper");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.sweep_interval()) => {}
                _ = self.store.pressure().notified() => {
                    debug!("Storage pressure, sweeping early");
                }
            }
            let manager = self.clone();
            match tokio::task::spawn_blocking(move || manager.sweep()).await {
                Ok(Ok(report)) if report != SweepReport::default() => {
                    debug!(?report, "Retention sweep finished");
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => error!("Retention sweep failed: {err}"),
                Err(err) => error!("Retention sweep panicked: {err}"),
            }
        }
        debug!("Retention sweeper stopped");
    }

    /// Lowest cursor among the consumers of `protocol`, `u64::MAX` without consumers.
    fn min_cursor(&self, settings: &RetentionSettings, protocol: Protocol) -> Result<u64, StoreError> {
        let mut min = u64::MAX;
        for name in settings.consumers.get(&protocol).into_iter().flatten() {
            min = min.min(self.store.catalog().cursor(name, protocol)?);
        }
        Ok(min)
    }

    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let settings = self.settings()?;
        let now_ms = self.store.clock().now_ms();
        let mut report = SweepReport::default();

        let max_age_ms = settings.storage.segment_max_age().as_millis() as i64;
        report.rotated += self.store.rotate_expired(now_ms, max_age_ms)?.len();

        for protocol in Protocol::ALL {
            let window_ms = settings.retention.window(protocol).as_millis() as i64;
            let cutoff = now_ms.saturating_sub(window_ms);

            // An open segment whose newest record is already expired is closed so it can go.
            if let Some((_, _, newest)) = self.store.open_segment_bounds(protocol) {
                if newest < cutoff && self.store.rotate(protocol)?.is_some() {
                    report.rotated += 1;
                }
            }
            let up_to = self
                .store
                .segments(protocol)?
                .iter()
                .take_while(|m| m.last_received_at_ms < cutoff)
                .last()
                .map(|m| m.last_id);
            if let Some(up_to) = up_to {
                self.evict(&settings, protocol, up_to, EvictionReason::RetentionExpired, &mut report)?;
            }
        }

        let soft_limit = settings.storage.soft_limit_bytes();
        for _ in 0..MAX_PRESSURE_EVICTIONS {
            if self.store.disk_usage() <= soft_limit {
                break;
            }
            let mut oldest: Option<SegmentMeta> = None;
            for protocol in Protocol::ALL {
                let min_cursor = self.min_cursor(&settings, protocol)?;
                if let Some(first) = self.store.segments(protocol)?.into_iter().next() {
                    if first.last_id <= min_cursor && is_older(&first, oldest.as_ref()) {
                        oldest = Some(first);
                    }
                }
            }
            let Some(victim) = oldest else {
                break;
            };
            self.evict(&settings, victim.protocol, victim.last_id, EvictionReason::Watermark, &mut report)?;
        }

        let cap = settings.storage.max_total_bytes;
        for _ in 0..MAX_PRESSURE_EVICTIONS {
            if self.store.disk_usage() <= cap {
                break;
            }
            let mut oldest: Option<SegmentMeta> = None;
            for protocol in Protocol::ALL {
                if let Some(first) = self.store.segments(protocol)?.into_iter().next() {
                    if is_older(&first, oldest.as_ref()) {
                        oldest = Some(first);
                    }
                }
            }
            match oldest {
                Some(victim) => {
                    self.evict(&settings, victim.protocol, victim.last_id, EvictionReason::HardCap, &mut report)?;
                }
                None => {
                    // Everything left sits in open segments; close them so the next round
                    // has something to evict.
                    let mut rotated = 0;
                    for protocol in Protocol::ALL {
                        if self.store.rotate(protocol)?.is_some() {
                            rotated += 1;
                        }
                    }
                    if rotated == 0 {
                        break;
                    }
                    report.rotated += rotated;
                }
            }
        }

        Ok(report)
    }

    fn evict(
        &self,
        settings: &RetentionSettings,
        protocol: Protocol,
        up_to_id: u64,
        reason: EvictionReason,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        let min_cursor = self.min_cursor(settings, protocol)?;
        let unforwarded: u64 = self
            .store
            .segments(protocol)?
            .iter()
            .take_while(|m| m.last_id <= up_to_id)
            .map(|m| unforwarded_in(m, min_cursor))
            .sum();

        let outcome = self.store.evict(protocol, up_to_id)?;
        if outcome.segments == 0 {
            return Ok(());
        }
        report.add(&outcome, unforwarded);

        if outcome.dead_letters_pruned > 0 {
            warn!(
                %protocol,
                dead_letters = outcome.dead_letters_pruned,
                up_to_id = outcome.up_to_id,
                reason = reason.as_str(),
                "Dropped dead letters of evicted records"
            );
            self.failures.push(FailureEvent::new(
                self.store.clock().now_ms(),
                "dead_letters_pruned",
                None,
                protocol,
                outcome.dead_letters_pruned,
                format!(
                    "dropped {} dead letters with records up to id {} ({})",
                    outcome.dead_letters_pruned,
                    outcome.up_to_id,
                    reason.as_str()
                ),
            ));
        }

        if unforwarded > 0 {
            self.store
                .catalog()
                .add_counter(protocol, Counter::DataLossRecords, unforwarded)?;
            let lagging: Vec<&str> = settings
                .consumers
                .get(&protocol)
                .into_iter()
                .flatten()
                .filter(|name| {
                    self.store
                        .catalog()
                        .cursor(name, protocol)
                        .is_ok_and(|cursor| cursor < outcome.up_to_id)
                })
                .map(String::as_str)
                .collect();
            warn!(
                %protocol,
                records = unforwarded,
                up_to_id = outcome.up_to_id,
                reason = reason.as_str(),
                destinations = ?lagging,
                "data loss: evicted records not yet forwarded to every destination"
            );
            self.failures.push(FailureEvent::new(
                self.store.clock().now_ms(),
                "data_loss",
                None,
                protocol,
                unforwarded,
                format!(
                    "evicted {unforwarded} unforwarded records up to id {} ({})",
                    outcome.up_to_id,
                    reason.as_str()
                ),
            ));
        } else {
            info!(
                %protocol,
                segments = outcome.segments,
                records = outcome.records,
                bytes = outcome.bytes,
                up_to_id = outcome.up_to_id,
                reason = reason.as_str(),
                "Evicted forwarded segments"
            );
        }
        Ok(())
    }
}

fn is_older(candidate: &SegmentMeta, current: Option<&SegmentMeta>) -> bool {
    current.map_or(true, |c| candidate.first_received_at_ms < c.first_received_at_ms)
}

/// Records of a segment above `min_cursor`.
fn unforwarded_in(meta: &SegmentMeta, min_cursor: u64) -> u64 {
    if meta.last_id <= min_cursor {
        0
    } else {
        meta.last_id - meta.first_id.max(min_cursor.saturating_add(1)) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DestinationConfig;
    use crate::record::ContentKind;
    use crate::store::StoreLimits;
    use bytes::Bytes;
    use tracing_test::traced_test;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        store: Arc<DurableStore>,
        failures: Arc<FailureLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(
            DurableStore::open(
                dir.path(),
                StoreLimits {
                    segment_max_bytes: 1 << 20,
                    compression_level: 3,
                    soft_limit_bytes: u64::MAX,
                },
                clock.clone(),
            )
            .unwrap(),
        );
        Fixture {
            _dir: dir,
            clock,
            store,
            failures: Arc::new(FailureLog::default()),
        }
    }

    fn destinations(names: &[&str]) -> DestinationSet {
        let configs: Vec<DestinationConfig> = names
            .iter()
            .map(|name| DestinationConfig {
                name: name.to_string(),
                protocols: vec![Protocol::Syslog],
                address: "http://localhost:1/".to_string(),
                ..Default::default()
            })
            .collect();
        DestinationSet::resolve(&configs, &[])
    }

    fn append_segment(f: &Fixture, count: usize) -> SegmentMeta {
        for _ in 0..count {
            f.store
                .append(Protocol::Syslog, ContentKind::Raw, Bytes::from(vec![b'x'; 200]))
                .unwrap();
        }
        f.store.rotate(Protocol::Syslog).unwrap().unwrap()
    }

    #[test]
    fn test_unforwarded_in() {
        let meta = SegmentMeta {
            protocol: Protocol::Syslog,
            first_id: 11,
            last_id: 20,
            first_received_at_ms: 0,
            last_received_at_ms: 0,
            records: 10,
            raw_bytes: 0,
            stored_bytes: 0,
        };
        assert_eq!(unforwarded_in(&meta, 0), 10);
        assert_eq!(unforwarded_in(&meta, 15), 5);
        assert_eq!(unforwarded_in(&meta, 20), 0);
        assert_eq!(unforwarded_in(&meta, u64::MAX), 0);
    }

    #[traced_test]
    #[test]
    fn test_retention_evicts_unforwarded_records_and_logs_data_loss() {
        let f = fixture();
        let retention = RetentionConfig {
            default_secs: 60,
            ..Default::default()
        };
        let manager = RetentionManager::new(
            f.store.clone(),
            f.failures.clone(),
            RetentionSettings::new(StorageConfig::default(), retention, &destinations(&["slow"])),
        );
        for _ in 0..5 {
            f.store
                .append(Protocol::Syslog, ContentKind::Raw, Bytes::from_static(b"old"))
                .unwrap();
        }
        f.store.catalog().advance_cursor("slow", Protocol::Syslog, 2).unwrap();

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(manager.sweep().unwrap().evicted_records, 0);

        f.clock.advance(Duration::from_secs(31));
        let report = manager.sweep().unwrap();
        assert_eq!(report.evicted_records, 5);
        assert_eq!(report.data_loss_records, 3);
        assert!(f.store.read_from(Protocol::Syslog, 0, 10).unwrap().is_empty());

        let stats = f.store.partition_stats(Protocol::Syslog).unwrap();
        assert_eq!(stats.data_loss_records, 3);
        assert_eq!(stats.evicted_upto, 5);
        assert!(logs_contain("data loss"));
        assert!(f.failures.recent().iter().any(|e| e.kind == "data_loss"));
    }

    #[test]
    fn test_watermark_prefers_forwarded_segments() {
        let f = fixture();
        let first = append_segment(&f, 4);
        let second = append_segment(&f, 4);
        let third = append_segment(&f, 4);
        // The cursor covers the first two segments; one eviction gets under the watermark.
        f.store
            .catalog()
            .advance_cursor("primary", Protocol::Syslog, second.last_id)
            .unwrap();

        let usage = f.store.disk_usage();
        let storage = StorageConfig {
            max_total_bytes: usage * 10,
            eviction_watermark: (usage - third.stored_bytes / 2) as f64 / (usage * 10) as f64,
            ..Default::default()
        };
        let manager = RetentionManager::new(
            f.store.clone(),
            f.failures.clone(),
            RetentionSettings::new(storage, RetentionConfig::default(), &destinations(&["primary"])),
        );
        let report = manager.sweep().unwrap();

        assert_eq!(report.evicted_segments, 1);
        assert_eq!(report.data_loss_records, 0);
        let remaining = f.store.segments(Protocol::Syslog).unwrap();
        assert_eq!(remaining.first().map(|m| m.first_id), Some(second.first_id));
        assert!(first.last_id < remaining[0].first_id);
    }

    #[test]
    fn test_hard_cap_falls_back_to_unforwarded_segments() {
        let f = fixture();
        append_segment(&f, 4);
        append_segment(&f, 4);
        let usage = f.store.disk_usage();
        let storage = StorageConfig {
            max_total_bytes: usage - 1,
            eviction_watermark: 1.0,
            ..Default::default()
        };
        let manager = RetentionManager::new(
            f.store.clone(),
            f.failures.clone(),
            RetentionSettings::new(storage.clone(), RetentionConfig::default(), &destinations(&["primary"])),
        );
        let report = manager.sweep().unwrap();

        assert_eq!(report.evicted_segments, 1);
        assert_eq!(report.data_loss_records, 4);
        assert!(f.store.disk_usage() <= storage.max_total_bytes);
    }

    #[test]
    fn test_evicting_dead_lettered_records_is_reported() {
        let f = fixture();
        let segment = append_segment(&f, 3);
        let catalog = f.store.catalog();
        catalog
            .advance_cursor("primary", Protocol::Syslog, segment.last_id)
            .unwrap();
        catalog
            .put_dead_letter(&crate::store::DeadLetter {
                destination: "primary".to_string(),
                protocol: Protocol::Syslog,
                id: 2,
                received_at_ms: 0,
                size_bytes: 200,
                attempts: 1,
                reason: "destination rejected payload with status 400".to_string(),
                dead_at_ms: 0,
            })
            .unwrap();
        let storage = StorageConfig {
            max_total_bytes: 1,
            eviction_watermark: 1.0,
            ..Default::default()
        };
        let manager = RetentionManager::new(
            f.store.clone(),
            f.failures.clone(),
            RetentionSettings::new(storage, RetentionConfig::default(), &destinations(&["primary"])),
        );

        let report = manager.sweep().unwrap();
        assert_eq!(report.evicted_records, 3);
        assert_eq!(report.data_loss_records, 0);
        assert!(catalog.dead_letters("primary").unwrap().is_empty());
        assert_eq!(
            f.store.partition_stats(Protocol::Syslog).unwrap().dead_letters_pruned,
            1
        );
        let event = f
            .failures
            .recent()
            .into_iter()
            .find(|e| e.kind == "dead_letters_pruned")
            .unwrap();
        assert_eq!(event.records, 1);
    }

    #[test]
    fn test_without_consumers_everything_counts_as_forwarded() {
        let f = fixture();
        append_segment(&f, 2);
        let storage = StorageConfig {
            max_total_bytes: 1,
            eviction_watermark: 1.0,
            ..Default::default()
        };
        let manager = RetentionManager::new(
            f.store.clone(),
            f.failures.clone(),
            RetentionSettings::new(storage, RetentionConfig::default(), &destinations(&[])),
        );
        let report = manager.sweep().unwrap();
        assert_eq!(report.evicted_records, 2);
        assert_eq!(report.data_loss_records, 0);
        assert_eq!(f.store.disk_usage(), 0);
    }
}
