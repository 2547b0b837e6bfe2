// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors raised by the durable store and its catalog.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt segment {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

/// Input rejected before it reaches the store. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The append could not be made durable. Producers should retry with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(ValidationError::PayloadTooLarge { .. }) => "payload_too_large",
            IngestError::Validation(ValidationError::UnknownProtocol(_)) => "unknown_protocol",
            IngestError::Validation(_) => "validation_error",
            IngestError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::StorageUnavailable(err.to_string())
    }
}

/// Failure of a single send attempt to a destination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("destination rejected payload with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl SendError {
    /// Rejections cannot succeed on retry; everything else is worth another attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Rejected { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SendError::Network(_) => "network_error",
            SendError::Timeout(_) => "timeout",
            SendError::Rejected { .. } => "rejected",
        }
    }
}

/// A record that cannot be expressed in a destination's wire format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("datagram of {size} bytes exceeds the transport limit of {max} bytes")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("raw payload is not valid UTF-8 and cannot be embedded in a request body")]
    NotUtf8,

    #[error("json payload cannot be parsed: {0}")]
    InvalidJson(String),

    #[error("request body serialization failed: {0}")]
    Serialization(String),

    #[error("request body compression failed: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("destination '{name}' misconfigured: {reason}")]
    Destination { name: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config_error",
            RelayError::Store(_) => "storage_unavailable",
            RelayError::Bind { .. } => "bind_error",
        }
    }
}
