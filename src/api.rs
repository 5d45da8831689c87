//! Admin dashboard order API client.
//!
//! Authenticated HTTP communication with the admin dashboard: order
//! snapshot fetches, acknowledgement and status mutations, and the
//! lightweight health probe the connectivity gate feeds on.
//!
//! The remote seam is the [`OrderApi`] trait so the executor and the
//! background loops can be driven by a scripted server in tests.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::orders::{Order, OrderSnapshot, OrderStatus};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the order server URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Pairing code decoding
// ---------------------------------------------------------------------------

/// Pairing codes are either a raw JSON object or a url-safe base64 blob of
/// one, carrying `key`, `url` and `sid` fields.
fn decode_pairing_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_pairing_code(raw: &str) -> Option<String> {
    decode_pairing_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_server_url_from_pairing_code(raw: &str) -> Option<String> {
    decode_pairing_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_server_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_station_id_from_pairing_code(raw: &str) -> Option<String> {
    decode_pairing_payload(raw)
        .and_then(|v| {
            v.get("sid")
                .or_else(|| v.get("stationId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures from the order server, typed so callers can branch on kind
/// instead of sniffing message text.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Cannot reach order server at {0}")]
    Unreachable(String),
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("Network error communicating with {0}: {1}")]
    Network(String, String),
    /// 401/403: the station's key or registration was rejected. Triggers
    /// de-authentication, never a retry.
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Order server is shedding load (HTTP 429)")]
    Backpressure,
    /// The server understood the request and refused it.
    #[error("{0}")]
    Rejected(String),
    #[error("Order server error (HTTP {0})")]
    Server(u16),
    #[error("Invalid response from order server: {0}")]
    InvalidResponse(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }

    /// Worth retrying later: the request may succeed once the link or the
    /// server recovers. Rejections and auth failures never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Unreachable(_)
                | ApiError::Timeout(_)
                | ApiError::Network(_, _)
                | ApiError::Backpressure
                | ApiError::Server(_)
        )
    }
}

fn transport_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_connect() {
        return ApiError::Unreachable(url.to_string());
    }
    if err.is_timeout() {
        return ApiError::Timeout(url.to_string());
    }
    ApiError::Network(url.to_string(), err.to_string())
}

fn status_fallback_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Station not authorized".to_string(),
        404 => "Order server endpoint not found".to_string(),
        s => format!("Unexpected response from order server (HTTP {s})"),
    }
}

fn error_for_status(status: StatusCode, detail: Option<String>) -> ApiError {
    match status.as_u16() {
        401 | 403 => ApiError::Auth(detail.unwrap_or_else(|| status_fallback_message(status))),
        404 => ApiError::NotFound(detail.unwrap_or_else(|| status_fallback_message(status))),
        429 => ApiError::Backpressure,
        s if s >= 500 => ApiError::Server(s),
        _ => ApiError::Rejected(detail.unwrap_or_else(|| status_fallback_message(status))),
    }
}

/// Pull the `error`/`message` detail out of a failed response body, keeping
/// validation specifics visible in the queue's last_error column.
async fn error_from_response(resp: Response) -> ApiError {
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body_text).ok().and_then(|json| {
        json.get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    });
    error_for_status(status, detail)
}

// ---------------------------------------------------------------------------
// Remote seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OrderApi: Send + Sync {
    /// Fetch the full current order list.
    async fn fetch_snapshot(&self) -> ApiResult<OrderSnapshot>;

    /// Tell the server the kitchen saw the order. Returns the server's
    /// updated copy. Safe to call more than once for the same order.
    async fn acknowledge(
        &self,
        order_id: &str,
        acknowledged_at: Option<DateTime<Utc>>,
    ) -> ApiResult<Order>;

    /// Move a kitchen ticket to a new status. Addressed by the legacy
    /// numeric reference, not the opaque id.
    async fn update_status(&self, numeric_id: i64, status: OrderStatus) -> ApiResult<()>;

    /// Lightweight health check. True means the server answered.
    async fn probe(&self) -> bool;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpOrderApi {
    client: Client,
    probe_client: Client,
    base_url: String,
    api_key: String,
    station_id: String,
}

impl HttpOrderApi {
    pub fn new(server_url: &str, api_key: &str, station_id: &str) -> Result<Self, String> {
        let base_url = normalize_server_url(server_url);
        // Operators sometimes paste the whole pairing code into the key field
        let api_key = extract_api_key_from_pairing_code(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        let probe_client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create probe client: {e}"))?;

        Ok(HttpOrderApi {
            client,
            probe_client,
            base_url,
            api_key,
            station_id: station_id.trim().to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-KDS-API-Key", &self.api_key)
            .header("x-station-id", &self.station_id)
            .header("Content-Type", "application/json")
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn fetch_snapshot(&self) -> ApiResult<OrderSnapshot> {
        let resp = self
            .request(Method::GET, "/api/kds/orders")
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        // Some server builds return the bare array instead of the envelope
        let snapshot = if body.is_array() {
            serde_json::json!({ "orders": body })
        } else {
            body
        };
        serde_json::from_value(snapshot).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn acknowledge(
        &self,
        order_id: &str,
        acknowledged_at: Option<DateTime<Utc>>,
    ) -> ApiResult<Order> {
        let mut body = serde_json::Map::new();
        if let Some(at) = acknowledged_at {
            body.insert(
                "acknowledgedAt".to_string(),
                Value::String(at.to_rfc3339()),
            );
        }

        let resp = self
            .request(
                Method::POST,
                &format!("/api/kds/orders/{order_id}/acknowledge"),
            )
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        // Envelope or bare order, depending on server build
        let order_json = body.get("order").cloned().unwrap_or(body);
        serde_json::from_value(order_json).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn update_status(&self, numeric_id: i64, status: OrderStatus) -> ApiResult<()> {
        let resp = self
            .request(
                Method::PATCH,
                &format!("/api/kds/tickets/{numeric_id}/status"),
            )
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        // 200 with a {success, error?} envelope, or 204 with no body
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.trim().is_empty() {
            return Ok(());
        }
        let body: Value = serde_json::from_str(&body_text)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        match body.get("success").and_then(Value::as_bool) {
            Some(true) | None => Ok(()),
            Some(false) => {
                let detail = body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Status update refused")
                    .to_string();
                Err(ApiError::Rejected(detail))
            }
        }
    }

    async fn probe(&self) -> bool {
        let health_url = format!("{}/api/health", self.base_url);
        match self
            .probe_client
            .head(&health_url)
            .header("X-KDS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => {
                let ok = resp.status().is_success();
                debug!(online = ok, "health probe answered");
                ok
            }
            Err(_) => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
