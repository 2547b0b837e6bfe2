// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only status aggregation for the dashboard.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::clock::format_rfc3339;
use crate::config::{DestinationSet, StorageConfig, TransportKind};
use crate::error::StoreError;
use crate::forwarder::{WorkerPhase, WorkerSnapshot};
use crate::health::{HealthSnapshot, HealthState};
use crate::protocol::Protocol;
use crate::store::{DurableStore, PartitionStats};

pub const FAILURE_LOG_CAPACITY: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureEvent {
    pub at: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub protocol: Protocol,
    pub records: u64,
    pub message: String,
}

impl FailureEvent {
    pub fn new(
        at_ms: i64,
        kind: &'static str,
        destination: Option<&str>,
        protocol: Protocol,
        records: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at: format_rfc3339(at_ms),
            kind,
            destination: destination.map(str::to_string),
            protocol,
            records,
            message: message.into(),
        }
    }
}

/// Ring buffer of the most recent forwarding failures and data-loss events.
#[derive(Debug)]
pub struct FailureLog {
    events: Mutex<VecDeque<FailureEvent>>,
    capacity: usize,
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::with_capacity(FAILURE_LOG_CAPACITY)
    }
}

impl FailureLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, event: FailureEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<FailureEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Records of a partition a destination still has to deal with.
pub fn lag(latest_id: u64, cursor: u64, evicted_upto: u64) -> u64 {
    latest_id.saturating_sub(cursor.max(evicted_upto))
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub cap_bytes: u64,
    pub soft_limit_bytes: u64,
    pub utilization: f64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DestinationProtocolStatus {
    pub protocol: Protocol,
    pub cursor: u64,
    pub lag: u64,
    pub dead_letters: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkerPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub forwarded: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DestinationStatus {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub health: HealthState,
    pub protocols: Vec<DestinationProtocolStatus>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusReport {
    pub generated_at: String,
    pub disk: DiskUsage,
    pub protocols: Vec<PartitionStats>,
    pub destinations: Vec<DestinationStatus>,
    pub health: HealthSnapshot,
    pub recent_failures: Vec<FailureEvent>,
}

impl StatusReport {
    pub fn collect(
        store: &DurableStore,
        storage: &StorageConfig,
        destinations: &DestinationSet,
        health: &HealthSnapshot,
        workers: &[WorkerSnapshot],
        failures: &FailureLog,
    ) -> Result<Self, StoreError> {
        let protocols = Protocol::ALL
            .iter()
            .map(|protocol| store.partition_stats(*protocol))
            .collect::<Result<Vec<_>, _>>()?;

        let catalog = store.catalog();
        let mut destination_status = Vec::with_capacity(destinations.all().len());
        for destination in destinations.all() {
            let config = &destination.config;
            let mut per_protocol = Vec::with_capacity(config.protocols.len());
            for stats in protocols.iter().filter(|s| config.accepts(s.protocol)) {
                let cursor = catalog.cursor(&config.name, stats.protocol)?;
                let worker = workers
                    .iter()
                    .find(|w| w.destination == config.name && w.protocol == stats.protocol);
                per_protocol.push(DestinationProtocolStatus {
                    protocol: stats.protocol,
                    cursor,
                    lag: lag(stats.last_id, cursor, stats.evicted_upto),
                    dead_letters: catalog.dead_letter_count(&config.name, stats.protocol),
                    phase: worker.map(|w| w.phase),
                    last_error: worker.and_then(|w| w.last_error.clone()),
                    forwarded: worker.map(|w| w.forwarded).unwrap_or(0),
                });
            }
            destination_status.push(DestinationStatus {
                name: config.name.clone(),
                transport: config.transport,
                enabled: config.enabled,
                active: destination.is_active(),
                disabled_reason: destination.disabled_reason.clone(),
                path: config.path.clone(),
                health: health.state(config.path.as_deref()),
                protocols: per_protocol,
            });
        }

        let used_bytes = store.disk_usage();
        Ok(Self {
            generated_at: format_rfc3339(store.clock().now_ms()),
            disk: DiskUsage {
                used_bytes,
                cap_bytes: storage.max_total_bytes,
                soft_limit_bytes: storage.soft_limit_bytes(),
                utilization: if storage.max_total_bytes == 0 {
                    0.0
                } else {
                    used_bytes as f64 / storage.max_total_bytes as f64
                },
            },
            protocols,
            destinations: destination_status,
            health: health.clone(),
            recent_failures: failures.recent(),
        })
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
    use std::sync::Arc;

    #[test]
    fn test_failure_log_keeps_most_recent() {
        let log = FailureLog::with_capacity(3);
        for i in 0..5 {
            log.push(FailureEvent::new(
                i,
                "network_error",
                Some("primary"),
                Protocol::Syslog,
                1,
                format!("failure {i}"),
            ));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "failure 2");
        assert_eq!(recent[2].message, "failure 4");
    }

    #[test]
    fn test_lag_accounts_for_eviction() {
        assert_eq!(lag(10, 4, 0), 6);
        assert_eq!(lag(10, 4, 7), 3);
        assert_eq!(lag(10, 10, 0), 0);
        assert_eq!(lag(0, 0, 0), 0);
    }

    #[test]
    fn test_collect_reports_cursors_and_disabled_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(
            dir.path(),
            StoreLimits {
                segment_max_bytes: 1 << 20,
                compression_level: 3,
                soft_limit_bytes: 1 << 30,
            },
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        for _ in 0..5 {
            store
                .append(Protocol::Syslog, ContentKind::Raw, Bytes::from_static(b"x"))
                .unwrap();
        }
        store.catalog().advance_cursor("primary", Protocol::Syslog, 2).unwrap();

        let destinations = DestinationSet::resolve(
            &[
                DestinationConfig {
                    name: "primary".to_string(),
                    protocols: vec![Protocol::Syslog],
                    address: "http://localhost:1/ingest".to_string(),
                    ..Default::default()
                },
                DestinationConfig {
                    name: "broken".to_string(),
                    protocols: vec![],
                    address: "http://localhost:1/ingest".to_string(),
                    ..Default::default()
                },
            ],
            &[],
        );
        let failures = FailureLog::default();
        failures.push(FailureEvent::new(0, "timeout", Some("primary"), Protocol::Syslog, 1, "slow"));

        let report = StatusReport::collect(
            &store,
            &StorageConfig::default(),
            &destinations,
            &HealthSnapshot::default(),
            &[],
            &failures,
        )
        .unwrap();

        let syslog = report
            .protocols
            .iter()
            .find(|p| p.protocol == Protocol::Syslog)
            .unwrap();
        assert_eq!(syslog.records, 5);
        assert_eq!(report.destinations[0].protocols[0].cursor, 2);
        assert_eq!(report.destinations[0].protocols[0].lag, 3);
        assert!(report.destinations[0].active);
        assert!(!report.destinations[1].active);
        assert!(report.destinations[1].disabled_reason.is_some());
        assert_eq!(report.recent_failures.len(), 1);
        assert!(report.disk.used_bytes > 0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["destinations"][0]["health"], "UP");
    }
}
