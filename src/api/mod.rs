//! HTTP adapter over the ingest filter and the query engine.
//!
//! - `POST /events` delivers one event.
//! - `PUT /policies/:id` and `DELETE /policies/:id` install or remove a
//!   metric's logging policy.
//! - `GET /history` runs a history query, `id=*` covering every metric.
//! - `POST /demo` writes a synthetic series into the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::demo::{DemoError, DemoGenerator, DemoRequest, DemoSummary};
use crate::export::health::bind_address;
use crate::ingest::{IngestFilter, RawEvent};
use crate::policy::PolicySettings;
use crate::query::{
    downsample, Aggregate, HistoryQuery, HistoryRow, HistorySource, MetricSelector, QueryEngine,
    DEFAULT_COUNT,
};
use crate::store::{Store, StoreError};
use crate::value::{MAX_EPOCH_SECS, MIN_EPOCH_SECS};

/// Shared handler state.
pub struct ApiState<S> {
    pub ingest: IngestFilter,
    pub query: Arc<QueryEngine<S>>,
    pub demo: Arc<DemoGenerator<S>>,
    /// Debounce applied to policies that do not set one.
    pub default_debounce: Duration,
}

impl<S> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            ingest: self.ingest.clone(),
            query: Arc::clone(&self.query),
            demo: Arc::clone(&self.demo),
            default_debounce: self.default_debounce,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub id: String,
    /// Absent or null means the source reported no value.
    #[serde(default)]
    pub event: Option<RawEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventResponse {
    pub disposition: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub id: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub count: Option<usize>,
    pub step: Option<i64>,
    pub aggregate: Option<Aggregate>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub q: bool,
    #[serde(default)]
    pub ms: bool,
}

impl HistoryParams {
    fn into_query(self) -> HistoryQuery {
        let clamp = |ts: i64| ts.clamp(MIN_EPOCH_SECS, MAX_EPOCH_SECS);
        HistoryQuery {
            start: self.start.map(clamp),
            end: self.end.map(clamp),
            count: self.count.unwrap_or(DEFAULT_COUNT),
            step: self.step,
            aggregate: self.aggregate.unwrap_or_default(),
            limit: self.limit,
            ack: self.ack,
            q: self.q,
            ms: self.ms,
            ..HistoryQuery::new(MetricSelector::parse(&self.id))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryBody {
    pub source: HistorySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    pub end: i64,
    pub elapsed_ms: u64,
    pub rows: Vec<HistoryRow>,
}

type ApiError = (StatusCode, String);

/// Builds the API router.
pub fn router<S: Store>(state: ApiState<S>) -> Router {
    Router::new()
        .route("/events", post(post_event::<S>))
        .route(
            "/policies/:id",
            put(put_policy::<S>).delete(delete_policy::<S>),
        )
        .route("/history", get(get_history::<S>))
        .route("/demo", post(post_demo::<S>))
        .with_state(state)
}

/// POST /events
async fn post_event<S: Store>(
    State(state): State<ApiState<S>>,
    Json(req): Json<EventRequest>,
) -> Result<Json<EventResponse>, ApiError> {
    if req.id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "id is required".to_string()));
    }
    let disposition = state.ingest.on_event(&req.id, req.event);
    Ok(Json(EventResponse {
        disposition: disposition.as_str().to_string(),
    }))
}

/// PUT /policies/:id
async fn put_policy<S: Store>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
    Json(settings): Json<PolicySettings>,
) -> StatusCode {
    let policy = settings.resolve(state.default_debounce);
    state.ingest.on_policy_change(&id, Some(policy));
    StatusCode::NO_CONTENT
}

/// DELETE /policies/:id
async fn delete_policy<S: Store>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
) -> StatusCode {
    if !state.ingest.policies().contains(&id) {
        return StatusCode::NOT_FOUND;
    }
    state.ingest.on_policy_change(&id, None);
    StatusCode::NO_CONTENT
}

/// GET /history
async fn get_history<S: Store>(
    State(state): State<ApiState<S>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryBody>, ApiError> {
    if params.id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "id is required".to_string()));
    }
    let query = params.into_query();
    let response = state.query.get_history(&query).await;

    let mut rows = downsample(response.rows, &query, response.start, response.end);
    if query.ms {
        for row in &mut rows {
            row.ts *= 1000;
        }
    }

    Ok(Json(HistoryBody {
        source: response.source,
        start: response.start,
        end: response.end,
        elapsed_ms: response.elapsed.as_millis() as u64,
        rows,
    }))
}

/// POST /demo
async fn post_demo<S: Store>(
    State(state): State<ApiState<S>>,
    Json(req): Json<DemoRequest>,
) -> Result<Json<DemoSummary>, ApiError> {
    match state.demo.generate(&req).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e @ DemoError::Store(StoreError::Unavailable(_))) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(e @ DemoError::Store(_)) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

/// Serves the API router until stopped.
pub struct ApiServer {
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address.
    pub async fn start<S: Store>(&self, state: ApiState<S>) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":8089");
        let app = router(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "api server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        });

        Ok(local_addr)
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}
