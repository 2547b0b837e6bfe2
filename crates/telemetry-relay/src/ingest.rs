// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion front door: validate, normalize, append, acknowledge.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::clock::format_rfc3339;
use crate::error::{IngestError, ValidationError};
use crate::protocol::Protocol;
use crate::record::ContentKind;
use crate::store::DurableStore;

/// Returned only once the record is on stable storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub id: u64,
    pub accepted_at: String,
}

#[derive(Debug)]
pub struct Ingestor {
    store: Arc<DurableStore>,
    max_payload_bytes: AtomicUsize,
}

impl Ingestor {
    pub fn new(store: Arc<DurableStore>, max_payload_bytes: usize) -> Self {
        Self {
            store,
            max_payload_bytes: AtomicUsize::new(max_payload_bytes),
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes.load(Ordering::Relaxed)
    }

    pub fn set_max_payload_bytes(&self, max: usize) {
        self.max_payload_bytes.store(max, Ordering::Relaxed);
    }

    /// Checks the input and returns the protocol and the payload as it will be stored.
    /// Raw payloads lose their trailing line terminator; JSON payloads are compacted.
    pub fn normalize(
        &self,
        protocol_tag: &str,
        content_kind: ContentKind,
        payload: Bytes,
    ) -> Result<(Protocol, Bytes), ValidationError> {
        let protocol: Protocol = protocol_tag
            .parse()
            .map_err(|_| ValidationError::UnknownProtocol(protocol_tag.to_string()))?;
        let max = self.max_payload_bytes();
        if payload.len() > max {
            return Err(ValidationError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let normalized = match content_kind {
            ContentKind::Raw => {
                let trimmed = payload
                    .strip_suffix(b"\n")
                    .map(|rest| rest.strip_suffix(b"\r").unwrap_or(rest))
                    .map(|rest| rest.len())
                    .unwrap_or(payload.len());
                payload.slice(..trimmed)
            }
            ContentKind::Json => {
                let value: serde_json::Value = serde_json::from_slice(&payload)
                    .map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
                Bytes::from(
                    serde_json::to_vec(&value)
                        .map_err(|e| ValidationError::InvalidJson(e.to_string()))?,
                )
            }
        };
        if normalized.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        Ok((protocol, normalized))
    }

    /// Validates and durably appends one record.
    ///
    /// The append runs on the blocking pool and completes even if the caller goes away,
    /// so an interrupted request never leaves a half-written record behind.
    pub async fn ingest(
        &self,
        protocol_tag: &str,
        content_kind: ContentKind,
        payload: Bytes,
    ) -> Result<Ack, IngestError> {
        let (protocol, payload) = self.normalize(protocol_tag, content_kind, payload)?;
        let store = self.store.clone();
        let record = tokio::task::spawn_blocking(move || store.append(protocol, content_kind, payload))
            .await
            .map_err(|e| IngestError::StorageUnavailable(e.to_string()))?
            .map_err(|e| {
                error!(%protocol, "Append failed: {e}");
                IngestError::from(e)
            })?;
        debug!(%protocol, id = record.id, size = record.size_bytes(), "Record accepted");
        Ok(Ack {
            id: record.id,
            accepted_at: format_rfc3339(record.received_at_ms),
        })
    }
}
