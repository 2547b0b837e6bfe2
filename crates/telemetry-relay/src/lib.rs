// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffer and forwarding engine for telemetry crossing an unreliable tunnel.
//!
//! Collectors hand records to the [`ingest::Ingestor`], which appends them to the
//! protocol-partitioned [`store::DurableStore`] and acknowledges only once the write
//! is on stable storage. One forwarding worker per (destination, protocol) pair drains
//! the store from its own durable cursor, gated by the [`health`] monitor, while the
//! [`retention::RetentionManager`] keeps the buffer inside its size and age limits.
//!
//! ```text
//!  collector ──> Ingestor ──> DurableStore ──┬──> worker(dest A, syslog) ──> remote
//!                                            ├──> worker(dest A, metric) ──> remote
//!                                            └──> worker(dest B, syslog) ──> remote
//!                     HealthSnapshot (watch) ─┘        RetentionManager (sweeps)
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod clock;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod http_utils;
pub mod ingest;
pub mod protocol;
pub mod record;
pub mod relay;
pub mod retention;
pub mod server;
pub mod status;
pub mod store;

pub use protocol::Protocol;
pub use relay::Relay;
