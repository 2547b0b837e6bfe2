// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ResolvedDestination, TransportKind};
use crate::error::{SendError, StoreError};
use crate::forwarder::delivery::{DeliveryEvent, DeliveryState};
use crate::forwarder::transport::{encode_request, EncodedRecord, Sink};
use crate::health::HealthHandle;
use crate::protocol::Protocol;
use crate::record::StoredRecord;
use crate::status::{FailureEvent, FailureLog};
use crate::store::{DeadLetter, DurableStore};

/// How often an idle or circuit-broken worker re-checks without being woken.
const IDLE_POLL: Duration = Duration::from_millis(250);
const CIRCUIT_RECHECK: Duration = Duration::from_secs(1);
const STORE_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Sending,
    CircuitOpen,
    BackingOff,
    Stopped,
}

#[derive(Debug)]
struct WorkerState {
    phase: WorkerPhase,
    in_flight: Option<(u64, u64)>,
    last_error: Option<String>,
}

/// Live state of a worker shared with the status interface.
#[derive(Debug)]
pub struct WorkerStatus {
    state: Mutex<WorkerState>,
    forwarded: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: Mutex::new(WorkerState {
                phase: WorkerPhase::Idle,
                in_flight: None,
                last_error: None,
            }),
            forwarded: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }
}

impl WorkerStatus {
    fn set_phase(&self, phase: WorkerPhase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
    }

    fn set_in_flight(&self, range: Option<(u64, u64)>) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight = range;
            if range.is_some() {
                state.phase = WorkerPhase::Sending;
            }
        }
    }

    fn set_error(&self, error: Option<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.last_error = error;
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.state
            .lock()
            .map(|s| s.phase)
            .unwrap_or(WorkerPhase::Stopped)
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.in_flight)
            .is_some_and(|(first, last)| (first..=last).contains(&id))
    }

    pub fn snapshot(&self, destination: &str, protocol: Protocol) -> WorkerSnapshot {
        let (phase, in_flight, last_error) = self
            .state
            .lock()
            .map(|s| (s.phase, s.in_flight, s.last_error.clone()))
            .unwrap_or((WorkerPhase::Stopped, None, None));
        WorkerSnapshot {
            destination: destination.to_string(),
            protocol,
            phase,
            in_flight,
            last_error,
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub destination: String,
    pub protocol: Protocol,
    pub phase: WorkerPhase,
    pub in_flight: Option<(u64, u64)>,
    pub last_error: Option<String>,
    pub forwarded: u64,
    pub dead_lettered: u64,
}

enum Resolution {
    /// Every record of the batch is forwarded or dead.
    Done,
    /// Some records remain; retry after the given delay.
    Retry(Duration),
    Cancelled,
}

/// Drains one protocol partition into one destination.
pub struct ForwardWorker {
    destination: Arc<ResolvedDestination>,
    protocol: Protocol,
    store: Arc<DurableStore>,
    health: HealthHandle,
    sink: Arc<dyn Sink>,
    status: Arc<WorkerStatus>,
    failures: Arc<FailureLog>,
}

impl ForwardWorker {
    pub fn new(
        destination: Arc<ResolvedDestination>,
        protocol: Protocol,
        store: Arc<DurableStore>,
        health: HealthHandle,
        sink: Arc<dyn Sink>,
        status: Arc<WorkerStatus>,
        failures: Arc<FailureLog>,
    ) -> Self {
        Self {
            destination,
            protocol,
            store,
            health,
            sink,
            status,
            failures,
        }
    }

    fn name(&self) -> &str {
        self.destination.name()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let config = self.destination.config.clone();
        let store = self.store.clone();
        let Some(appended) = store.appended(self.protocol) else {
            error!(destination = %config.name, protocol = %self.protocol, "No partition for protocol");
            return;
        };
        info!(
            destination = %config.name,
            protocol = %self.protocol,
            transport = ?config.transport,
            "Forwarding worker started"
        );

        let mut circuit_open = false;
        // Head record of a partial request/response batch and when it was first seen.
        let mut partial_since: Option<(u64, Instant)> = None;

        while !cancel.is_cancelled() {
            let health = self.health.state(config.path.as_deref());
            if !health.allows_sending() {
                if !circuit_open {
                    info!(
                        destination = %config.name,
                        protocol = %self.protocol,
                        "Path down, forwarding paused"
                    );
                    circuit_open = true;
                }
                self.status.set_phase(WorkerPhase::CircuitOpen);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.health.changed() => {}
                    _ = tokio::time::sleep(CIRCUIT_RECHECK) => {}
                }
                continue;
            }
            if circuit_open {
                info!(
                    destination = %config.name,
                    protocol = %self.protocol,
                    "Path back up, resuming from cursor"
                );
                circuit_open = false;
            }

            let notified = appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = match self.next_batch(config.batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(
                        destination = %config.name,
                        protocol = %self.protocol,
                        "Failed to read batch: {err}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(STORE_RETRY) => {}
                    }
                    continue;
                }
            };

            let Some(head) = batch.first().map(|r| r.id) else {
                partial_since = None;
                self.status.set_phase(WorkerPhase::Idle);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            };

            if config.transport == TransportKind::RequestResponse && batch.len() < config.batch_size {
                let since = match partial_since {
                    Some((id, since)) if id == head => since,
                    _ => {
                        let now = Instant::now();
                        partial_since = Some((head, now));
                        now
                    }
                };
                let deadline = since + config.batch_timeout();
                if Instant::now() < deadline {
                    self.status.set_phase(WorkerPhase::Idle);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    continue;
                }
            }
            partial_since = None;

            match self.deliver(batch, &cancel).await {
                Ok(Resolution::Done) => {}
                Ok(Resolution::Retry(delay)) => {
                    self.status.set_phase(WorkerPhase::BackingOff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(Resolution::Cancelled) => break,
                Err(err) => {
                    error!(
                        destination = %config.name,
                        protocol = %self.protocol,
                        "Failed to record delivery progress: {err}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(STORE_RETRY) => {}
                    }
                }
            }
        }

        self.status.set_in_flight(None);
        self.status.set_phase(WorkerPhase::Stopped);
        debug!(destination = %config.name, protocol = %self.protocol, "Forwarding worker stopped");
    }

    async fn next_batch(&self, batch_size: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let cursor = self.store.catalog().cursor(self.name(), self.protocol)?;
        let store = self.store.clone();
        let protocol = self.protocol;
        tokio::task::spawn_blocking(move || store.read_from(protocol, cursor, batch_size))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// Sends one batch and records the outcome. The cursor only moves over the leading
    /// run of records that are forwarded or dead.
    async fn deliver(
        &self,
        batch: Vec<StoredRecord>,
        cancel: &CancellationToken,
    ) -> Result<Resolution, StoreError> {
        let (Some(first), Some(last)) = (batch.first().map(|r| r.id), batch.last().map(|r| r.id))
        else {
            return Ok(Resolution::Done);
        };
        let config = self.destination.config.clone();
        let catalog = self.store.catalog();

        let mut resolved: HashSet<u64> = catalog
            .dead_ids(&config.name, self.protocol, first, last)?
            .into_iter()
            .collect();

        let mut sendable: Vec<(StoredRecord, EncodedRecord)> = Vec::with_capacity(batch.len());
        for record in batch.iter() {
            if resolved.contains(&record.id) {
                continue;
            }
            match config.transport.encode(record) {
                Ok(encoded) => sendable.push((record.clone(), encoded)),
                Err(err) => {
                    self.dead_letter(record, 0, &format!("encoding failed: {err}"))?;
                    self.failures.push(FailureEvent::new(
                        self.store.clock().now_ms(),
                        "encode_error",
                        Some(&config.name),
                        self.protocol,
                        1,
                        err.to_string(),
                    ));
                    resolved.insert(record.id);
                }
            }
        }

        let outcome = match config.transport {
            TransportKind::Datagram => self.send_datagrams(sendable, &mut resolved, cancel).await,
            TransportKind::RequestResponse => self.send_request(sendable, &mut resolved, cancel).await,
        };

        let resolved_upto = batch
            .iter()
            .take_while(|r| resolved.contains(&r.id))
            .last()
            .map(|r| r.id);
        if let Some(up_to) = resolved_upto {
            self.advance(up_to).await?;
        }
        self.status.set_in_flight(None);
        outcome
    }

    async fn send_datagrams(
        &self,
        sendable: Vec<(StoredRecord, EncodedRecord)>,
        resolved: &mut HashSet<u64>,
        cancel: &CancellationToken,
    ) -> Result<Resolution, StoreError> {
        for (record, encoded) in sendable {
            let EncodedRecord::Datagram(datagram) = encoded else {
                continue;
            };
            match self.attempt(record.id, record.id, datagram, None, cancel).await {
                None => return Ok(Resolution::Cancelled),
                Some(Ok(())) => {
                    self.status.forwarded.fetch_add(1, Ordering::Relaxed);
                    resolved.insert(record.id);
                }
                Some(Err(err)) => {
                    return self.handle_failure(std::slice::from_ref(&record), err, resolved);
                }
            }
        }
        self.status.set_error(None);
        Ok(Resolution::Done)
    }

    async fn send_request(
        &self,
        sendable: Vec<(StoredRecord, EncodedRecord)>,
        resolved: &mut HashSet<u64>,
        cancel: &CancellationToken,
    ) -> Result<Resolution, StoreError> {
        let (Some(first), Some(last)) = (
            sendable.first().map(|(r, _)| r.id),
            sendable.last().map(|(r, _)| r.id),
        ) else {
            return Ok(Resolution::Done);
        };
        let config = &self.destination.config;
        let (records, entries): (Vec<StoredRecord>, Vec<Value>) = sendable
            .into_iter()
            .filter_map(|(record, encoded)| match encoded {
                EncodedRecord::Entry(entry) => Some((record, entry)),
                EncodedRecord::Datagram(_) => None,
            })
            .unzip();

        let request = match encode_request(self.protocol, &entries, config.compression_level) {
            Ok(request) => request,
            Err(err) => {
                for record in &records {
                    self.dead_letter(record, 0, &format!("encoding failed: {err}"))?;
                    resolved.insert(record.id);
                }
                return Ok(Resolution::Done);
            }
        };

        match self
            .attempt(first, last, request.body, request.content_encoding, cancel)
            .await
        {
            None => Ok(Resolution::Cancelled),
            Some(Ok(())) => {
                self.status
                    .forwarded
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                resolved.extend(records.iter().map(|r| r.id));
                self.status.set_error(None);
                Ok(Resolution::Done)
            }
            Some(Err(err)) => self.handle_failure(&records, err, resolved),
        }
    }

    /// One send with the destination's timeout. `None` means shutdown interrupted it.
    async fn attempt(
        &self,
        first: u64,
        last: u64,
        message: Bytes,
        content_encoding: Option<&'static str>,
        cancel: &CancellationToken,
    ) -> Option<Result<(), SendError>> {
        let timeout = self.destination.config.send_timeout();
        self.status.set_in_flight(Some((first, last)));
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(
                    destination = %self.name(),
                    protocol = %self.protocol,
                    first,
                    last,
                    "Send aborted by shutdown"
                );
                None
            }
            result = tokio::time::timeout(timeout, self.sink.send(message, content_encoding)) => {
                Some(result.unwrap_or(Err(SendError::Timeout(timeout))))
            }
        };
        self.status.set_in_flight(None);
        result
    }

    fn handle_failure(
        &self,
        records: &[StoredRecord],
        err: SendError,
        resolved: &mut HashSet<u64>,
    ) -> Result<Resolution, StoreError> {
        let config = &self.destination.config;
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        let counts = self
            .store
            .catalog()
            .record_attempt(&config.name, self.protocol, &ids)?;

        let mut dead = 0u64;
        for (record, &attempts) in records.iter().zip(&counts) {
            let event = if err.is_permanent() {
                DeliveryEvent::Rejected
            } else {
                DeliveryEvent::SendFailed {
                    attempts,
                    max: config.retry.max_attempts,
                }
            };
            if DeliveryState::InFlight.apply(event) == Ok(DeliveryState::Dead) {
                self.dead_letter(record, attempts, &err.to_string())?;
                resolved.insert(record.id);
                dead += 1;
            }
        }

        let head_attempts = counts.first().copied().unwrap_or(1);
        self.status.set_error(Some(err.to_string()));
        self.failures.push(FailureEvent::new(
            self.store.clock().now_ms(),
            err.kind(),
            Some(&config.name),
            self.protocol,
            records.len() as u64,
            err.to_string(),
        ));
        if dead > 0 {
            warn!(
                destination = %config.name,
                protocol = %self.protocol,
                records = dead,
                attempts = head_attempts,
                "Dead-lettered records: {err}"
            );
        } else {
            debug!(
                destination = %config.name,
                protocol = %self.protocol,
                records = records.len(),
                attempts = head_attempts,
                "Send failed, will retry: {err}"
            );
        }

        if records.iter().all(|r| resolved.contains(&r.id)) {
            Ok(Resolution::Done)
        } else {
            Ok(Resolution::Retry(config.retry.backoff(head_attempts)))
        }
    }

    fn dead_letter(&self, record: &StoredRecord, attempts: u32, reason: &str) -> Result<(), StoreError> {
        self.store.catalog().put_dead_letter(&DeadLetter {
            destination: self.name().to_string(),
            protocol: self.protocol,
            id: record.id,
            received_at_ms: record.received_at_ms,
            size_bytes: record.size_bytes(),
            attempts,
            reason: reason.to_string(),
            dead_at_ms: self.store.clock().now_ms(),
        })?;
        self.status.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn advance(&self, up_to: u64) -> Result<(), StoreError> {
        let catalog = self.store.catalog();
        let cursor = catalog.advance_cursor(self.name(), self.protocol, up_to)?;
        catalog.clear_attempts(self.name(), self.protocol, up_to)?;
        catalog.flush_async().await?;
        debug!(
            destination = %self.name(),
            protocol = %self.protocol,
            cursor,
            "Cursor advanced"
        );
        Ok(())
    }
}
