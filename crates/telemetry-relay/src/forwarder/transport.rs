// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire encodings and sinks for the two transport kinds.
//!
//! Datagram destinations receive one UDP datagram per record carrying the original
//! payload bytes. Request/response destinations receive batches as a JSON document:
//!
//! ```json
//! {
//!   "protocol": "syslog",
//!   "records": [
//!     {"id": 1, "received_at": "2024-05-01T10:00:00Z", "content_kind": "raw", "payload": "<34>..."}
//!   ]
//! }
//! ```
//!
//! optionally zstd-compressed with `Content-Encoding: zstd`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::clock::format_rfc3339;
use crate::config::{DestinationConfig, TransportKind};
use crate::error::{EncodeError, SendError};
use crate::protocol::Protocol;
use crate::record::{ContentKind, StoredRecord};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;
/// Response bodies kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// One record encoded for a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedRecord {
    Datagram(Bytes),
    Entry(Value),
}

impl TransportKind {
    pub fn encode(self, record: &StoredRecord) -> Result<EncodedRecord, EncodeError> {
        match self {
            TransportKind::Datagram => {
                if record.payload.len() > MAX_DATAGRAM_BYTES {
                    return Err(EncodeError::DatagramTooLarge {
                        size: record.payload.len(),
                        max: MAX_DATAGRAM_BYTES,
                    });
                }
                Ok(EncodedRecord::Datagram(record.payload.clone()))
            }
            TransportKind::RequestResponse => {
                let payload = match record.content_kind {
                    ContentKind::Json => serde_json::from_slice::<Value>(&record.payload)
                        .map_err(|e| EncodeError::InvalidJson(e.to_string()))?,
                    ContentKind::Raw => Value::String(
                        std::str::from_utf8(&record.payload)
                            .map_err(|_| EncodeError::NotUtf8)?
                            .to_string(),
                    ),
                };
                Ok(EncodedRecord::Entry(serde_json::json!({
                    "id": record.id,
                    "received_at": format_rfc3339(record.received_at_ms),
                    "content_kind": record.content_kind,
                    "payload": payload,
                })))
            }
        }
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    protocol: Protocol,
    records: &'a [Value],
}

/// A request body ready to post.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    pub body: Bytes,
    pub content_encoding: Option<&'static str>,
}

pub fn encode_request(
    protocol: Protocol,
    entries: &[Value],
    compression_level: i32,
) -> Result<EncodedRequest, EncodeError> {
    let json = serde_json::to_vec(&RequestBody {
        protocol,
        records: entries,
    })
    .map_err(|e| EncodeError::Serialization(e.to_string()))?;
    if compression_level <= 0 {
        return Ok(EncodedRequest {
            body: Bytes::from(json),
            content_encoding: None,
        });
    }
    let compressed = zstd::stream::encode_all(json.as_slice(), compression_level)
        .map_err(|e| EncodeError::Compression(e.to_string()))?;
    Ok(EncodedRequest {
        body: Bytes::from(compressed),
        content_encoding: Some("zstd"),
    })
}

/// Network side of a destination. Implementations perform a single attempt; retries,
/// timeouts and cursor bookkeeping belong to the worker.
#[async_trait]
pub trait Sink: Send + Sync + Debug {
    async fn send(
        &self,
        message: Bytes,
        content_encoding: Option<&'static str>,
    ) -> Result<(), SendError>;
}

#[derive(Debug)]
pub struct DatagramSink {
    socket: UdpSocket,
    address: String,
}

impl DatagramSink {
    pub async fn bind(address: &str) -> Result<Self, SendError> {
        let local = match address.parse::<SocketAddr>() {
            Ok(SocketAddr::V6(_)) => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| SendError::Network(format!("failed to bind UDP socket: {e}")))?;
        Ok(Self {
            socket,
            address: address.to_string(),
        })
    }
}

#[async_trait]
impl Sink for DatagramSink {
    async fn send(
        &self,
        message: Bytes,
        _content_encoding: Option<&'static str>,
    ) -> Result<(), SendError> {
        let sent = self
            .socket
            .send_to(&message, self.address.as_str())
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;
        if sent != message.len() {
            return Err(SendError::Network(format!(
                "short datagram write: {sent} of {} bytes",
                message.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, config: &DestinationConfig) -> Self {
        Self {
            client,
            url: config.address.clone(),
            auth_token: config.auth_token.clone(),
            timeout: config.send_timeout(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(
        &self,
        message: Bytes,
        content_encoding: Option<&'static str>,
    ) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(message);
        if let Some(encoding) = content_encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout(self.timeout)
            } else {
                SendError::Network(e.to_string())
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect();
        Err(classify_status(status.as_u16(), body))
    }
}

/// 4xx answers are final except timeouts and throttling.
pub fn classify_status(status: u16, body: String) -> SendError {
    match status {
        408 | 429 => SendError::Network(format!("status {status}: {body}")),
        400..=499 => SendError::Rejected { status, body },
        _ => SendError::Network(format!("status {status}: {body}")),
    }
}
