// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connectivity monitor.
//!
//! A single prober task probes every configured path on a fixed interval, folds the
//! outcomes through a hysteresis state machine and publishes an immutable
//! [`HealthSnapshot`]. Forwarding workers hold a [`HealthHandle`] and read the latest
//! snapshot before every send without touching the network.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConnectivityConfig, PathConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Up,
    Degraded,
    Down,
}

impl HealthState {
    /// Whether workers gated by a path in this state may send.
    pub fn allows_sending(self) -> bool {
        !matches!(self, HealthState::Down)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success { latency: Duration },
    Failure { error: String },
}

/// Thresholds of the UP/DEGRADED/DOWN state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hysteresis {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub degraded_latency: Duration,
}

impl From<&ConnectivityConfig> for Hysteresis {
    fn from(config: &ConnectivityConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            degraded_latency: Duration::from_millis(config.degraded_latency_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathHealth {
    pub state: HealthState,
    /// Time of the last state transition, epoch milliseconds.
    pub since_ms: i64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl PathHealth {
    /// Paths start UP so forwarding is attempted before the first probe completes.
    pub fn new(now_ms: i64) -> Self {
        Self {
            state: HealthState::Up,
            since_ms: now_ms,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_latency_ms: None,
            last_error: None,
        }
    }

    /// Folds one probe outcome in and returns the previous state on a transition.
    pub fn observe(
        &mut self,
        outcome: &ProbeOutcome,
        hysteresis: &Hysteresis,
        now_ms: i64,
    ) -> Option<HealthState> {
        let next = match outcome {
            ProbeOutcome::Success { latency } => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                self.last_latency_ms = Some(latency.as_millis() as u64);
                self.last_error = None;
                let reachable = if *latency > hysteresis.degraded_latency {
                    HealthState::Degraded
                } else {
                    HealthState::Up
                };
                match self.state {
                    HealthState::Down
                        if self.consecutive_successes < hysteresis.success_threshold =>
                    {
                        HealthState::Down
                    }
                    _ => reachable,
                }
            }
            ProbeOutcome::Failure { error } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.last_error = Some(error.clone());
                if self.consecutive_failures >= hysteresis.failure_threshold {
                    HealthState::Down
                } else {
                    self.state
                }
            }
        };

        if next == self.state {
            return None;
        }
        let previous = self.state;
        self.state = next;
        self.since_ms = now_ms;
        Some(previous)
    }
}

/// Point-in-time health of every path. Never mutated once published.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub paths: BTreeMap<String, PathHealth>,
}

impl HealthSnapshot {
    /// State gating a destination. Destinations without a path, or with a path the
    /// monitor has not seen yet, are treated as UP.
    pub fn state(&self, path: Option<&str>) -> HealthState {
        path.and_then(|name| self.paths.get(name))
            .map(|health| health.state)
            .unwrap_or(HealthState::Up)
    }
}

/// Single-writer side of the health state.
#[derive(Debug)]
pub struct HealthBoard {
    tx: watch::Sender<Arc<HealthSnapshot>>,
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(HealthSnapshot::default()));
        Self { tx }
    }

    pub fn handle(&self) -> HealthHandle {
        HealthHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> Arc<HealthSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn publish(&self, snapshot: HealthSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Forces the state of one path, bypassing hysteresis. Used when connectivity is
    /// known out of band.
    pub fn set_state(&self, path: &str, state: HealthState, now_ms: i64) {
        let mut snapshot = (*self.current()).clone();
        let entry = snapshot
            .paths
            .entry(path.to_string())
            .or_insert_with(|| PathHealth::new(now_ms));
        if entry.state != state {
            entry.state = state;
            entry.since_ms = now_ms;
        }
        self.publish(snapshot);
    }
}

/// Cheap, cloneable read side of the health state.
#[derive(Clone, Debug)]
pub struct HealthHandle {
    rx: watch::Receiver<Arc<HealthSnapshot>>,
}

impl HealthHandle {
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.rx.borrow().clone()
    }

    pub fn state(&self, path: Option<&str>) -> HealthState {
        self.rx.borrow().state(path)
    }

    /// Resolves when a new snapshot is published. Never resolves once the board is dropped.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync + Debug {
    async fn probe(&self, path: &PathConfig, timeout: Duration) -> ProbeOutcome;
}

/// Probes a path by opening (and immediately closing) a TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectProbe;

#[async_trait]
impl Probe for TcpConnectProbe {
    async fn probe(&self, path: &PathConfig, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(&path.probe_address)).await {
            Ok(Ok(_stream)) => ProbeOutcome::Success {
                latency: start.elapsed(),
            },
            Ok(Err(err)) => ProbeOutcome::Failure {
                error: err.to_string(),
            },
            Err(_) => ProbeOutcome::Failure {
                error: format!("connect timed out after {timeout:?}"),
            },
        }
    }
}

pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    probe: Arc<dyn Probe>,
    board: Arc<HealthBoard>,
    clock: Arc<dyn Clock>,
}

impl ConnectivityMonitor {
    pub fn new(
        config: ConnectivityConfig,
        probe: Arc<dyn Probe>,
        board: Arc<HealthBoard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            probe,
            board,
            clock,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if self.config.paths.is_empty() {
            debug!("No connectivity paths configured, monitor idle");
            return;
        }
        info!(
            paths = self.config.paths.len(),
            interval_ms = self.config.interval_ms,
            "Starting connectivity monitor"
        );
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connectivity monitor stopped");
                    return;
                }
                _ = interval.tick() => self.probe_all().await,
            }
        }
    }

    /// Probes every path once and publishes the resulting snapshot.
    pub async fn probe_all(&self) {
        let timeout = self.config.probe_timeout();
        let outcomes = join_all(
            self.config
                .paths
                .iter()
                .map(|path| self.probe.probe(path, timeout)),
        )
        .await;

        let hysteresis = Hysteresis::from(&self.config);
        let now_ms = self.clock.now_ms();
        let mut snapshot = (*self.board.current()).clone();
        snapshot
            .paths
            .retain(|name, _| self.config.paths.iter().any(|p| &p.name == name));

        for (path, outcome) in self.config.paths.iter().zip(outcomes) {
            let health = snapshot
                .paths
                .entry(path.name.clone())
                .or_insert_with(|| PathHealth::new(now_ms));
            if let Some(previous) = health.observe(&outcome, &hysteresis, now_ms) {
                match health.state {
                    HealthState::Down => warn!(
                        path = %path.name,
                        from = ?previous,
                        error = health.last_error.as_deref().unwrap_or_default(),
                        "Connectivity path DOWN, pausing forwarding"
                    ),
                    state => info!(
                        path = %path.name,
                        from = ?previous,
                        to = ?state,
                        latency_ms = health.last_latency_ms,
                        "Connectivity path state changed"
                    ),
                }
            }
        }
        self.board.publish(snapshot);
    }
}
