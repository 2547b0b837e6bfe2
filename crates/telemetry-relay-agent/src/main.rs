// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use telemetry_relay::clock::SystemClock;
use telemetry_relay::config::Config;
use telemetry_relay::health::TcpConnectProbe;
use telemetry_relay::{server, Relay};

const DEFAULT_CONFIG_DIR: &str = "/etc/telemetry-relay";

#[tokio::main]
pub async fn main() {
    let config_path = Config::path_from_env(Path::new(DEFAULT_CONFIG_DIR));
    let loaded = Config::load(Some(&config_path));
    logger::install(
        loaded
            .as_ref()
            .map(|config| config.log_level.as_str())
            .unwrap_or("info"),
    );
    debug!("Logging subsystem enabled");

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), "Unable to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let relay = match Relay::start(
        config.clone(),
        Some(config_path),
        Arc::new(SystemClock),
        Arc::new(TcpConnectProbe),
        cancel.child_token(),
    )
    .await
    {
        Ok(relay) => relay,
        Err(e) => {
            error!("Unable to start relay: {e}");
            std::process::exit(1);
        }
    };

    let listener = match server::bind(&config.listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            relay.shutdown().await;
            std::process::exit(1);
        }
    };
    let server_task = tokio::spawn(server::serve(
        relay.clone(),
        listener,
        cancel.child_token(),
        config.shutdown_grace(),
    ));

    wait_for_shutdown(&relay).await;

    // The listener goes first so no request is accepted after workers stop.
    cancel.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP surface failed: {e}"),
        Err(e) => error!("HTTP surface task failed: {e}"),
    }
    relay.shutdown().await;
    info!("Relay stopped");
}

/// Reloads on SIGHUP and returns on Ctrl+C or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown(relay: &Relay) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(hangup), Ok(terminate)) => (hangup, terminate),
        (Err(e), _) | (_, Err(e)) => {
            error!("Unable to install signal handlers: {e}, falling back to Ctrl+C only");
            wait_for_ctrl_c().await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                if let Err(e) = relay.reload().await {
                    error!("Reload failed, keeping the running configuration: {e}");
                }
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                return;
            }
            _ = wait_for_ctrl_c() => return,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_relay: &Relay) {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
    }
}
