//! HTTP/SSE transport.
//!
//! Serves the subscriber surface described by the original daemon:
//!
//! - `GET /` (or `/ops`) with `Accept: text/event-stream` opens a live
//!   stream. `types`/`parents` query parameters compile into a
//!   [`Filter`]; the `Last-Event-ID` header parses into a [`LastId`]
//!   cursor, with an evicted operation id transparently converted to a
//!   fallback replication cursor.
//! - `GET /status` reports all counters plus `"status":"OK"`.
//!
//! Each connection spawns one [`Tailer`](crate::tailer::Tailer) feeding
//! a bounded channel; dropping the response body cancels the session
//! and releases its store session. A keep-alive comment goes out every
//! ~25 s of idle so proxies keep the connection open.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, TimeZone, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Oplog;
use crate::filter::Filter;
use crate::ident::LastId;
use crate::operation::{OperationData, StreamEvent};
use crate::stats::Stats;

pub struct SseServer {
    oplog: Arc<Oplog>,
    addr: String,
}

#[derive(Clone)]
struct AppState {
    oplog: Arc<Oplog>,
    password: Option<String>,
    keepalive: Duration,
    cancel: CancellationToken,
}

impl SseServer {
    /// Build from the agent's config (listen address, password,
    /// keep-alive interval).
    #[must_use]
    pub fn new(oplog: Arc<Oplog>) -> Self {
        let addr = oplog.config().listen_addr.clone();
        Self { oplog, addr }
    }

    /// Serve until the token fires.
    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        let config = self.oplog.config();
        let state = AppState {
            password: config.password.clone(),
            keepalive: Duration::from_secs(config.keepalive_secs),
            oplog: Arc::clone(&self.oplog),
            cancel: cancel.clone(),
        };
        let app = Router::new()
            .route("/", get(ops))
            .route("/ops", get(ops))
            .route("/status", get(status))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "SSE server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::to_value(state.oplog.stats().snapshot())
        .unwrap_or_else(|_| json!({}));
    if let Some(counters) = body.as_object_mut() {
        counters.insert("status".to_string(), json!("OK"));
    }
    Json(body)
}

#[derive(Debug, Deserialize)]
struct OpsQuery {
    types: Option<String>,
    parents: Option<String>,
}

async fn ops(
    State(state): State<AppState>,
    Query(query): Query<OpsQuery>,
    headers: HeaderMap,
) -> Response {
    let accepts = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));
    if !accepts {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    if !authorized(state.password.as_deref(), &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let filter = Filter::from_lists(split_csv(query.types), split_csv(query.parents));

    // No header means "resume from the current tail end".
    let cursor = match headers.get("last-event-id") {
        None => None,
        Some(value) => {
            let raw = match value.to_str() {
                Ok(raw) => raw,
                Err(_) => return StatusCode::BAD_REQUEST.into_response(),
            };
            let id = match LastId::parse(raw) {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "rejecting invalid Last-Event-ID");
                    return StatusCode::BAD_REQUEST.into_response();
                }
            };
            match resolve_cursor(&state, id).await {
                Ok(id) => Some(id),
                Err(response) => return response,
            }
        }
    };

    info!(?cursor, "SSE connection started");
    let stats = Arc::clone(state.oplog.stats());
    stats.client_connected();

    let (tx, rx) = mpsc::channel(state.oplog.config().subscriber_buffer);
    let session = state.cancel.child_token();
    tokio::spawn(state.oplog.tailer(filter).run(cursor, tx, session.clone()));

    let stream = ClientStream {
        inner: ReceiverStream::new(rx),
        stats,
        cancel: session,
    };
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keepalive))
        .into_response();
    // Browser EventSource clients subscribe cross-origin.
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// An operation id that has aged out of the capped log becomes a
/// replication cursor carrying tombstones; this is never an error.
async fn resolve_cursor(state: &AppState, id: LastId) -> Result<LastId, Response> {
    let LastId::Operation(op) = id else {
        return Ok(id);
    };
    match state.oplog.store().has_op(op).await {
        Ok(true) => Ok(id),
        Ok(false) => {
            debug!(id = %op, "operation id evicted, falling back to replication");
            Ok(id.fallback())
        }
        Err(e) => {
            warn!(error = %e, "cannot check Last-Event-ID against the op-log");
            Err(StatusCode::SERVICE_UNAVAILABLE.into_response())
        }
    }
}

fn authorized(password: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = password else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((_user, pass)) => pass == expected,
        None => false,
    }
}

fn split_csv(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Serialize one stream event into SSE framing. Control events carry
/// no data line.
fn to_sse_event(event: &StreamEvent) -> Event {
    let sse = Event::default().id(event.event_id()).event(event.kind());
    match event.data() {
        Some(data) => sse.data(payload_json(data)),
        None => sse,
    }
}

fn payload_json(data: &OperationData) -> String {
    let timestamp = Utc
        .timestamp_millis_opt(data.timestamp)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();
    let mut body = serde_json::Map::new();
    body.insert("timestamp".to_string(), json!(timestamp));
    body.insert("parents".to_string(), json!(data.parents));
    body.insert("type".to_string(), json!(data.object_type));
    body.insert("id".to_string(), json!(data.object_id));
    if let Some(ref url) = data.ref_url {
        body.insert("ref".to_string(), json!(url));
    }
    serde_json::Value::Object(body).to_string()
}

/// Subscriber event stream with connection accounting: counts each
/// delivered event and, on drop (client gone or server shutdown),
/// decrements the client gauge and cancels the tail session so its
/// store session is released.
struct ClientStream {
    inner: ReceiverStream<StreamEvent>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
}

impl Stream for ClientStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                self.stats.event_sent();
                Poll::Ready(Some(Ok(to_sse_event(&event))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        info!("SSE connection closed");
        self.stats.client_disconnected();
        self.cancel.cancel();
    }
}
