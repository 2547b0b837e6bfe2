// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use core::time::Duration;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use std::error::Error;
use tracing::{debug, error, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. Client errors are logged at warn, server errors at error.
/// 2. Returns the error in the body of a JSON response with the given status code.
///
/// Response body format:
/// {
///     "kind": kind,
///     "message": message
/// }
pub fn log_and_create_error_response(
    kind: &str,
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!(kind, "{message}");
    } else {
        warn!(kind, "{message}");
    }
    let body = json!({ "kind": kind, "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// Serializes `value` as the JSON body of a response with the given status code.
pub fn create_json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> http::Result<HttpResponse> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            debug!(status = status.as_u16(), "Responding");
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)))
        }
        Err(e) => log_and_create_error_response(
            "internal_error",
            &format!("Failed to serialize response: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Takes a request's header map, and verifies that the "content-length" and/or "Transfer-Encoding" header
/// is present, valid, and less than the given max_content_length.
///
/// Will return None if no issues are found. Otherwise logs an error (with the given prefix) and
/// returns and HTTP Response with the appropriate error status code.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let content_length_header = match header_map.get(header::CONTENT_LENGTH) {
        Some(res) => res,
        None => {
            if let Some(transfer_encoding_header) = header_map.get(header::TRANSFER_ENCODING) {
                debug!(
                    "Transfer-Encoding header is present: {:?}",
                    transfer_encoding_header
                );
                return None;
            }
            return Some(log_and_create_error_response(
                "length_required",
                &format!(
                    "{error_message_prefix}: Missing Content-Length and Transfer-Encoding header"
                ),
                StatusCode::LENGTH_REQUIRED,
            ));
        }
    };
    let content_length = match content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        Some(res) => res,
        None => {
            return Some(log_and_create_error_response(
                "validation_error",
                &format!("{error_message_prefix}: Invalid Content-Length header"),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some(log_and_create_error_response(
            "payload_too_large",
            &format!(
                "{error_message_prefix}: payload of {content_length} bytes exceeds the maximum of {max_content_length} bytes"
            ),
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}

/// Builds the reqwest client shared by request/response destinations.
/// Uses rustls TLS.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, Box<dyn Error>> {
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .build()?)
}
