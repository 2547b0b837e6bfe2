// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface: ingestion for collectors, status and reload for the dashboard.

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{header, http, HeaderMap, Method, Request, StatusCode};
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, RelayError};
use crate::http_utils::{
    create_json_response, log_and_create_error_response, verify_request_content_length,
    HttpResponse,
};
use crate::protocol::Protocol;
use crate::record::ContentKind;
use crate::relay::Relay;

pub const INGEST_PATH_PREFIX: &str = "/v1/ingest/";
pub const STATUS_PATH: &str = "/v1/status";
pub const RELOAD_PATH: &str = "/v1/reload";
pub const DEAD_LETTERS_PATH_PREFIX: &str = "/v1/dead_letters/";
pub const INFO_PATH: &str = "/info";

pub async fn bind(address: &str) -> Result<TcpListener, RelayError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| RelayError::Bind {
            address: address.to_string(),
            source,
        })
}

/// Accepts connections until `cancel` fires, then gives open connections up to `grace`
/// to finish their requests.
pub async fn serve(
    relay: Arc<Relay>,
    listener: TcpListener,
    cancel: CancellationToken,
    grace: Duration,
) -> io::Result<()> {
    let service = service_fn(move |req| {
        let relay = relay.clone();
        async move { handle_request(relay, req).await }
    });
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();
    if let Ok(address) = listener.local_addr() {
        info!(%address, "HTTP surface listening");
    }

    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        let cancel = cancel.clone();
        joinset.spawn(async move {
            let connection = server.serve_connection(conn, service);
            tokio::pin!(connection);
            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = cancel.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };
            if let Err(e) = result {
                debug!("Connection error: {e}");
            }
        });
    }

    drop(listener);
    let open = joinset.len();
    if open > 0 {
        debug!(connections = open, "Waiting for open connections to finish");
    }
    let drained = tokio::time::timeout(grace, async {
        while joinset.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            connections = joinset.len(),
            "Shutdown grace period elapsed, aborting open connections"
        );
        joinset.abort_all();
    }
    info!("HTTP surface stopped");
    Ok(())
}

pub async fn handle_request<B>(relay: Arc<Relay>, req: Request<B>) -> http::Result<HttpResponse>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    match (req.method(), path.as_str()) {
        (&Method::POST, p) if p.starts_with(INGEST_PATH_PREFIX) => {
            ingest_handler(relay, &p[INGEST_PATH_PREFIX.len()..], req).await
        }
        (&Method::GET, STATUS_PATH) => status_handler(relay).await,
        (&Method::POST, RELOAD_PATH) => reload_handler(relay).await,
        (&Method::GET, p) if p.starts_with(DEAD_LETTERS_PATH_PREFIX) => {
            dead_letters_handler(relay, &p[DEAD_LETTERS_PATH_PREFIX.len()..])
        }
        (_, INFO_PATH) => info_handler(&relay),
        (method, p) => log_and_create_error_response(
            "not_found",
            &format!("No route for {method} {p}"),
            StatusCode::NOT_FOUND,
        ),
    }
}

fn content_kind(headers: &HeaderMap) -> ContentKind {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().starts_with("application/json"));
    if is_json {
        ContentKind::Json
    } else {
        ContentKind::Raw
    }
}

async fn ingest_handler<B>(
    relay: Arc<Relay>,
    protocol_tag: &str,
    req: Request<B>,
) -> http::Result<HttpResponse>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if protocol_tag.parse::<Protocol>().is_err() {
        return log_and_create_error_response(
            "unknown_protocol",
            &format!("unknown protocol '{protocol_tag}'"),
            StatusCode::BAD_REQUEST,
        );
    }

    let (parts, body) = req.into_parts();
    let ingestor = relay.ingestor();
    let max = ingestor.max_payload_bytes();
    if let Some(response) =
        verify_request_content_length(&parts.headers, max, "Error processing ingest request")
    {
        return response;
    }

    let payload = match Limited::new(body, max).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return log_and_create_error_response(
                "payload_too_large",
                &format!("Error processing ingest request: body exceeds the maximum of {max} bytes"),
                StatusCode::PAYLOAD_TOO_LARGE,
            );
        }
        Err(e) => {
            return log_and_create_error_response(
                "validation_error",
                &format!("Error reading ingest request body: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    match ingestor
        .ingest(protocol_tag, content_kind(&parts.headers), payload)
        .await
    {
        Ok(ack) => create_json_response(StatusCode::OK, &ack),
        Err(err) => {
            let status = match &err {
                IngestError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ if err.kind() == "payload_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            log_and_create_error_response(err.kind(), &err.to_string(), status)
        }
    }
}

async fn status_handler(relay: Arc<Relay>) -> http::Result<HttpResponse> {
    match relay.status().await {
        Ok(report) => create_json_response(StatusCode::OK, &report),
        Err(err) => log_and_create_error_response(
            "storage_unavailable",
            &format!("Unable to collect status: {err}"),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    }
}

async fn reload_handler(relay: Arc<Relay>) -> http::Result<HttpResponse> {
    match relay.reload().await {
        Ok(()) => create_json_response(StatusCode::OK, &json!({ "status": "reloaded" })),
        Err(err) => {
            let status = match err {
                RelayError::Config(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            log_and_create_error_response(err.kind(), &format!("Reload failed: {err}"), status)
        }
    }
}

fn dead_letters_handler(relay: Arc<Relay>, destination: &str) -> http::Result<HttpResponse> {
    match relay.dead_letters(destination) {
        Ok(Some(letters)) => create_json_response(
            StatusCode::OK,
            &json!({ "destination": destination, "dead_letters": letters }),
        ),
        Ok(None) => log_and_create_error_response(
            "unknown_destination",
            &format!("No destination named '{destination}'"),
            StatusCode::NOT_FOUND,
        ),
        Err(err) => log_and_create_error_response(
            "storage_unavailable",
            &format!("Unable to read dead letters: {err}"),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    }
}

fn info_handler(relay: &Relay) -> http::Result<HttpResponse> {
    let config = relay.config();
    create_json_response(
        StatusCode::OK,
        &json!({
            "endpoints": [
                format!("{INGEST_PATH_PREFIX}{{protocol}}"),
                STATUS_PATH,
                RELOAD_PATH,
                format!("{DEAD_LETTERS_PATH_PREFIX}{{destination}}"),
                INFO_PATH,
            ],
            "protocols": Protocol::ALL,
            "config": {
                "listen_address": config.listen_address,
                "max_payload_bytes": relay.ingestor().max_payload_bytes(),
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::health::TcpConnectProbe;
    use http_body_util::Full;

    async fn relay(dir: &std::path::Path) -> Arc<Relay> {
        let config = Config {
            data_dir: dir.to_path_buf(),
            max_payload_bytes: 64,
            ..Default::default()
        };
        Relay::start(
            config,
            None,
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Arc::new(TcpConnectProbe),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    fn post(path: &str, content_type: Option<&str>, body: &'static [u8]) -> Request<Full<Bytes>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_LENGTH, body.len());
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder.body(Full::new(Bytes::from_static(body))).unwrap()
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay(dir.path()).await;

        let response = handle_request(relay.clone(), post("/v1/ingest/syslog", None, b"<13>up\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "id": 1, "accepted_at": "2023-11-14T22:13:20Z" })
        );

        let response = handle_request(
            relay.clone(),
            post(
                "/v1/ingest/remote_event",
                Some("application/json; charset=utf-8"),
                b"{\"event\": 1}",
            ),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored = relay.store().read_from(Protocol::RemoteEvent, 0, 1).unwrap();
        assert_eq!(stored[0].content_kind, ContentKind::Json);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingest_errors() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay(dir.path()).await;

        let response = handle_request(relay.clone(), post("/v1/ingest/fax", None, b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "unknown_protocol");

        let big: &'static [u8] = &[b'a'; 65];
        let response = handle_request(relay.clone(), post("/v1/ingest/metric", None, big))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["kind"], "payload_too_large");

        let response = handle_request(
            relay.clone(),
            post("/v1/ingest/metric", Some("application/json"), b"{nope"),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation_error");

        let missing_length = Request::builder()
            .method(Method::POST)
            .uri("/v1/ingest/metric")
            .body(Full::new(Bytes::from_static(b"x")))
            .unwrap();
        let response = handle_request(relay.clone(), missing_length).await.unwrap();
        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);

        assert_eq!(relay.store().latest_id(Protocol::Metric), 0);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_only_routes() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay(dir.path()).await;

        let response = handle_request(relay.clone(), get(STATUS_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert_eq!(status["protocols"].as_array().unwrap().len(), 5);
        assert_eq!(status["disk"]["used_bytes"], 0);

        let response = handle_request(relay.clone(), get("/v1/dead_letters/nobody"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_request(relay.clone(), get(INFO_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["endpoints"][1], STATUS_PATH);

        let response = handle_request(relay.clone(), get("/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        relay.shutdown().await;
    }
}
