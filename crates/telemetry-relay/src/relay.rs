// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the store, connectivity monitor, forwarding engine and retention sweeper
//! together and owns their lifecycle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{Config, DestinationSet};
use crate::error::{RelayError, StoreError};
use crate::forwarder::ForwardingEngine;
use crate::health::{ConnectivityMonitor, HealthBoard, Probe};
use crate::ingest::Ingestor;
use crate::retention::{RetentionManager, RetentionSettings};
use crate::status::{FailureLog, StatusReport};
use crate::store::{DeadLetter, DurableStore, StoreLimits};

struct RunningTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningTask {
    async fn stop(self, name: &str) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!("{name} task panicked: {err}");
        }
    }
}

#[derive(Clone)]
struct Active {
    config: Arc<Config>,
    destinations: Arc<DestinationSet>,
}

pub struct Relay {
    config_path: Option<PathBuf>,
    active: RwLock<Active>,
    store: Arc<DurableStore>,
    ingestor: Arc<Ingestor>,
    board: Arc<HealthBoard>,
    engine: ForwardingEngine,
    retention: Arc<RetentionManager>,
    failures: Arc<FailureLog>,
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    monitor: Mutex<Option<RunningTask>>,
    sweeper: Mutex<Option<RunningTask>>,
    reload_lock: Mutex<()>,
}

impl Relay {
    /// Opens the store and starts every background component. `config_path` is the
    /// file re-read by [`Relay::reload`].
    pub async fn start(
        config: Config,
        config_path: Option<PathBuf>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn Probe>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RelayError> {
        let data_dir = config.data_dir.clone();
        let limits = StoreLimits::from(&config.storage);
        let store_clock = clock.clone();
        let store = tokio::task::spawn_blocking(move || DurableStore::open(data_dir, limits, store_clock))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))??;
        let store = Arc::new(store);

        let destinations = Arc::new(DestinationSet::resolve(
            &config.destinations,
            &config.connectivity.paths,
        ));
        let failures = Arc::new(FailureLog::default());
        let board = Arc::new(HealthBoard::new());
        let engine = ForwardingEngine::new(
            store.clone(),
            board.handle(),
            failures.clone(),
            cancel.child_token(),
        );
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            failures.clone(),
            RetentionSettings::new(
                config.storage.clone(),
                config.retention.clone(),
                &destinations,
            ),
        ));
        let ingestor = Arc::new(Ingestor::new(store.clone(), config.max_payload_bytes));

        let relay = Arc::new(Self {
            config_path,
            active: RwLock::new(Active {
                config: Arc::new(config),
                destinations: destinations.clone(),
            }),
            store,
            ingestor,
            board,
            engine,
            retention,
            failures,
            probe,
            clock,
            cancel,
            monitor: Mutex::new(None),
            sweeper: Mutex::new(None),
            reload_lock: Mutex::new(()),
        });

        relay.restart_monitor().await;
        relay.engine.apply(&destinations).await;
        {
            let cancel = relay.cancel.child_token();
            let task = tokio::spawn(relay.retention.clone().run(cancel.clone()));
            *relay.sweeper.lock().await = Some(RunningTask { cancel, task });
        }

        info!(
            destinations = destinations.all().len(),
            active = destinations.active().count(),
            "Relay started"
        );
        Ok(relay)
    }

    fn active(&self) -> Active {
        match self.active.read() {
            Ok(active) => active.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.active().config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn destinations(&self) -> Arc<DestinationSet> {
        self.active().destinations
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn health_board(&self) -> &Arc<HealthBoard> {
        &self.board
    }

    pub fn engine(&self) -> &ForwardingEngine {
        &self.engine
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn failures(&self) -> &Arc<FailureLog> {
        &self.failures
    }

    async fn restart_monitor(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some(running) = monitor.take() {
            running.stop("Connectivity monitor").await;
        }
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(
            ConnectivityMonitor::new(
                self.config().connectivity.clone(),
                self.probe.clone(),
                self.board.clone(),
                self.clock.clone(),
            )
            .run(cancel.clone()),
        );
        *monitor = Some(RunningTask { cancel, task });
    }

    /// Re-reads the configuration sources the relay was started from.
    pub async fn reload(&self) -> Result<(), RelayError> {
        let config = Config::load(self.config_path.as_deref())?;
        self.apply_config(config).await
    }

    /// Swaps in a new configuration. Cursors are keyed by destination name, so a
    /// destination that survives the reload resumes where it stopped.
    pub async fn apply_config(&self, mut config: Config) -> Result<(), RelayError> {
        config.validate()?;
        let _guard = self.reload_lock.lock().await;
        let previous = self.config();
        if config.data_dir != previous.data_dir {
            warn!(
                current = %previous.data_dir.display(),
                requested = %config.data_dir.display(),
                "data_dir cannot change without a restart, keeping the current one"
            );
            config.data_dir = previous.data_dir.clone();
        }
        if config.listen_address != previous.listen_address {
            warn!(
                current = %previous.listen_address,
                requested = %config.listen_address,
                "listen_address cannot change without a restart, keeping the current one"
            );
            config.listen_address = previous.listen_address.clone();
        }

        let destinations = Arc::new(DestinationSet::resolve(
            &config.destinations,
            &config.connectivity.paths,
        ));
        self.store.set_limits(StoreLimits::from(&config.storage));
        self.ingestor.set_max_payload_bytes(config.max_payload_bytes);
        self.retention.apply(RetentionSettings::new(
            config.storage.clone(),
            config.retention.clone(),
            &destinations,
        ));
        let connectivity_changed = config.connectivity != previous.connectivity;
        if let Ok(mut active) = self.active.write() {
            *active = Active {
                config: Arc::new(config),
                destinations: destinations.clone(),
            };
        }
        if connectivity_changed {
            debug!("Connectivity settings changed, restarting the monitor");
            self.restart_monitor().await;
        }
        self.engine.apply(&destinations).await;
        // New limits may already be exceeded.
        self.store.pressure().notify_one();

        info!(
            destinations = destinations.all().len(),
            active = destinations.active().count(),
            "Configuration reloaded"
        );
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusReport, StoreError> {
        let active = self.active();
        let workers = self.engine.workers().await;
        StatusReport::collect(
            &self.store,
            &active.config.storage,
            &active.destinations,
            &self.board.current(),
            &workers,
            &self.failures,
        )
    }

    /// Dead letters of `destination`, None when no such destination is configured.
    pub fn dead_letters(&self, destination: &str) -> Result<Option<Vec<DeadLetter>>, StoreError> {
        if self.destinations().get(destination).is_none() {
            return Ok(None);
        }
        self.store.catalog().dead_letters(destination).map(Some)
    }

    /// Stops workers (aborting in-flight sends without advancing cursors), the monitor
    /// and the sweeper, then flushes the catalog.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.cancel.cancel();
        self.engine.shutdown().await;
        if let Some(running) = self.monitor.lock().await.take() {
            running.stop("Connectivity monitor").await;
        }
        if let Some(running) = self.sweeper.lock().await.take() {
            running.stop("Retention sweeper").await;
        }
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => debug!("Store flushed"),
            Ok(Err(err)) => error!("Failed to flush store: {err}"),
            Err(err) => error!("Store flush task failed: {err}"),
        }
    }
}
