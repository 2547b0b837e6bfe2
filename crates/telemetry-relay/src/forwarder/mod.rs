// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarding engine.
//!
//! One [`ForwardWorker`] task per (active destination, bound protocol). Each worker reads
//! from the store after its own durable cursor, so a destination that recovers from an
//! outage replays simply by resuming its loop. Workers share nothing but the store and the
//! health handle.

pub mod delivery;
pub mod transport;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use delivery::{DeliveryEvent, DeliveryState};
pub use transport::{DatagramSink, HttpSink, Sink};
pub use worker::{ForwardWorker, WorkerPhase, WorkerSnapshot, WorkerStatus};

use crate::config::{DestinationSet, ResolvedDestination, TransportKind};
use crate::error::{SendError, StoreError};
use crate::health::HealthHandle;
use crate::http_utils::build_client;
use crate::protocol::Protocol;
use crate::status::{FailureEvent, FailureLog};
use crate::store::DurableStore;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

struct RunningWorker {
    destination: String,
    protocol: Protocol,
    status: Arc<WorkerStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ForwardingEngine {
    store: Arc<DurableStore>,
    health: HealthHandle,
    failures: Arc<FailureLog>,
    client: reqwest::Client,
    cancel: CancellationToken,
    workers: Mutex<Vec<RunningWorker>>,
}

impl ForwardingEngine {
    pub fn new(
        store: Arc<DurableStore>,
        health: HealthHandle,
        failures: Arc<FailureLog>,
        cancel: CancellationToken,
    ) -> Self {
        let client = build_client(CLIENT_TIMEOUT).unwrap_or_else(|e| {
            error!("Unable to build HTTP client: {e}, falling back to defaults");
            reqwest::Client::new()
        });
        Self {
            store,
            health,
            failures,
            client,
            cancel,
            workers: Mutex::new(Vec::new()),
        }
    }

    async fn build_sink(&self, destination: &ResolvedDestination) -> Result<Arc<dyn Sink>, SendError> {
        match destination.config.transport {
            TransportKind::Datagram => Ok(Arc::new(
                DatagramSink::bind(&destination.config.address).await?,
            )),
            TransportKind::RequestResponse => Ok(Arc::new(HttpSink::new(
                self.client.clone(),
                &destination.config,
            ))),
        }
    }

    /// Replaces the running workers with one per active destination and bound protocol.
    /// Cursors are durable and keyed by destination name, so restarted workers resume
    /// where the previous ones stopped.
    pub async fn apply(&self, destinations: &DestinationSet) {
        let mut workers = self.workers.lock().await;
        stop_workers(&mut workers).await;

        for destination in destinations.active() {
            for &protocol in &destination.config.protocols {
                let sink = match self.build_sink(destination).await {
                    Ok(sink) => sink,
                    Err(err) => {
                        error!(
                            destination = %destination.name(),
                            %protocol,
                            "Unable to create sink: {err}"
                        );
                        self.failures.push(FailureEvent::new(
                            self.store.clock().now_ms(),
                            err.kind(),
                            Some(destination.name()),
                            protocol,
                            0,
                            err.to_string(),
                        ));
                        continue;
                    }
                };
                workers.push(self.spawn(destination.clone(), protocol, sink));
            }
        }
        info!(workers = workers.len(), "Forwarding workers started");
    }

    /// Starts a worker with an explicit sink, bypassing sink construction.
    pub async fn start_worker(
        &self,
        destination: Arc<ResolvedDestination>,
        protocol: Protocol,
        sink: Arc<dyn Sink>,
    ) {
        let worker = self.spawn(destination, protocol, sink);
        self.workers.lock().await.push(worker);
    }

    fn spawn(
        &self,
        destination: Arc<ResolvedDestination>,
        protocol: Protocol,
        sink: Arc<dyn Sink>,
    ) -> RunningWorker {
        let status = Arc::new(WorkerStatus::default());
        let cancel = self.cancel.child_token();
        let name = destination.name().to_string();
        let worker = ForwardWorker::new(
            destination,
            protocol,
            self.store.clone(),
            self.health.clone(),
            sink,
            status.clone(),
            self.failures.clone(),
        );
        let task = tokio::spawn(worker.run(cancel.clone()));
        RunningWorker {
            destination: name,
            protocol,
            status,
            cancel,
            task,
        }
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|w| w.status.snapshot(&w.destination, w.protocol))
            .collect()
    }

    /// Delivery state of record `id` for `destination`, or None if the record is not
    /// stored (never appended or already evicted).
    pub async fn forward_state(
        &self,
        destination: &str,
        protocol: Protocol,
        id: u64,
    ) -> Result<Option<DeliveryState>, StoreError> {
        let catalog = self.store.catalog();
        let evicted_upto = catalog.counter(protocol, crate::store::Counter::EvictedUpTo)?;
        if id == 0 || id <= evicted_upto || id > self.store.latest_id(protocol) {
            return Ok(None);
        }
        let in_flight = self
            .workers
            .lock()
            .await
            .iter()
            .filter(|w| w.destination == destination && w.protocol == protocol)
            .any(|w| w.status.is_in_flight(id));
        Ok(Some(DeliveryState::derive(
            id,
            catalog.cursor(destination, protocol)?,
            catalog.is_dead(destination, protocol, id)?,
            catalog.attempts(destination, protocol, id)?,
            in_flight,
        )))
    }

    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        stop_workers(&mut workers).await;
    }
}

async fn stop_workers(workers: &mut Vec<RunningWorker>) {
    for worker in workers.iter() {
        worker.cancel.cancel();
    }
    for worker in workers.drain(..) {
        if let Err(err) = worker.task.await {
            error!(
                destination = %worker.destination,
                protocol = %worker.protocol,
                "Forwarding worker panicked: {err}"
            );
        }
    }
}
