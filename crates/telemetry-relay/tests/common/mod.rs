// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use telemetry_relay::clock::Clock;
use telemetry_relay::config::{Config, ConnectivityConfig, DestinationConfig, PathConfig, RetryPolicy, TransportKind};
use telemetry_relay::health::{Probe, ProbeOutcome};
use telemetry_relay::store::{DurableStore, StoreLimits};
use telemetry_relay::{Protocol, Relay};

pub const TUNNEL: &str = "tunnel";

/// Probe whose answer per path is set by the test.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    down: Mutex<HashMap<String, bool>>,
}

impl ScriptedProbe {
    pub fn set_down(&self, path: &str, down: bool) {
        self.down.lock().unwrap().insert(path.to_string(), down);
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, path: &PathConfig, _timeout: Duration) -> ProbeOutcome {
        let down = self
            .down
            .lock()
            .unwrap()
            .get(&path.name)
            .copied()
            .unwrap_or(false);
        if down {
            ProbeOutcome::Failure {
                error: "connection refused".to_string(),
            }
        } else {
            ProbeOutcome::Success {
                latency: Duration::from_millis(1),
            }
        }
    }
}

pub fn limits() -> StoreLimits {
    StoreLimits {
        segment_max_bytes: 1 << 20,
        compression_level: 3,
        soft_limit_bytes: u64::MAX,
    }
}

pub fn open_store(dir: &Path, clock: Arc<dyn Clock>) -> DurableStore {
    DurableStore::open(dir, limits(), clock).unwrap()
}

/// Config with a fast-reacting tunnel path and no destinations.
pub fn base_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        connectivity: ConnectivityConfig {
            interval_ms: 20,
            probe_timeout_ms: 100,
            failure_threshold: 1,
            success_threshold: 1,
            degraded_latency_ms: 1_000,
            paths: vec![PathConfig {
                name: TUNNEL.to_string(),
                probe_address: "127.0.0.1:1".to_string(),
            }],
        },
        ..Default::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base_ms: 5,
        backoff_cap_ms: 20,
    }
}

pub fn datagram_destination(name: &str, address: &str, protocols: &[Protocol]) -> DestinationConfig {
    DestinationConfig {
        name: name.to_string(),
        protocols: protocols.to_vec(),
        transport: TransportKind::Datagram,
        address: address.to_string(),
        path: Some(TUNNEL.to_string()),
        retry: fast_retry(),
        ..Default::default()
    }
}

pub fn http_destination(name: &str, url: &str, protocols: &[Protocol]) -> DestinationConfig {
    DestinationConfig {
        name: name.to_string(),
        protocols: protocols.to_vec(),
        transport: TransportKind::RequestResponse,
        address: url.to_string(),
        path: Some(TUNNEL.to_string()),
        batch_size: 50,
        batch_timeout_ms: 0,
        send_timeout_ms: 1_000,
        retry: fast_retry(),
        ..Default::default()
    }
}

pub async fn start_relay(
    config: Config,
    clock: Arc<dyn Clock>,
    probe: Arc<ScriptedProbe>,
) -> Arc<Relay> {
    Relay::start(config, None, clock, probe, CancellationToken::new())
        .await
        .unwrap()
}

/// Polls `condition` every 10ms for up to 5s.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn udp_receiver() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();
    (socket, address)
}

pub async fn recv_datagrams(socket: &UdpSocket, count: usize) -> Vec<Vec<u8>> {
    let mut received = Vec::with_capacity(count);
    let mut buf = vec![0u8; 65_536];
    while received.len() < count {
        let len = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .expect("datagram did not arrive in time")
            .unwrap();
        received.push(buf[..len].to_vec());
    }
    received
}
