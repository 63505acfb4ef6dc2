// 🌐 HTTP Surface - push channel, sync control and ledger routes
//
// Thin wrappers over SyncEngine and LedgerEngine. Every successful ledger
// mutation signals the watcher for the resource it wrote; the watcher then
// decides whether clients need to hear about it.

use crate::broadcaster::{Broadcaster, DeliverFn};
use crate::engine::SyncEngine;
use crate::error::LedgerError;
use crate::events::ChangeEvent;
use crate::ledger::{EntryPatch, FixedExpenseProfile, LedgerEngine};
use crate::resources::{FIXED_EXPENSES, LEDGER};
use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{Local, Utc};
use futures_util::stream::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub ledger: Arc<LedgerEngine>,
    /// Idle push connections are closed after this long
    pub connection_timeout: Duration,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => ApiError::NotFound("Ledger entry not found".to_string()),
            LedgerError::BalanceOverflow(id) => {
                ApiError::BadRequest(format!("Running balance out of range at entry {}", id))
            }
            other => {
                error!(error = %other, "Ledger operation failed");
                ApiError::Internal("Server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// PUSH CHANNEL
// ============================================================================

fn new_client_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("client_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Unsubscribes when the connection's stream is dropped (client gone,
/// ceiling reached or server shutting down)
struct SubscriptionGuard {
    client_id: String,
    broadcaster: Broadcaster,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let client_id = std::mem::take(&mut self.client_id);
        let broadcaster = self.broadcaster.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if broadcaster.unsubscribe(&client_id).await {
                    info!(client_id = %client_id, "Push connection closed");
                }
            });
        }
    }
}

/// GET /api/sync/events - long-lived event stream
async fn sync_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client_id = new_client_id();
    let (tx, rx) = mpsc::unbounded_channel::<ChangeEvent>();
    info!(client_id = %client_id, "Push connection opened");

    // `connected` goes out first, ahead of the catch-up snapshot
    let _ = tx.send(ChangeEvent::connected(&client_id));

    let deliver: DeliverFn = Arc::new(move |event: &ChangeEvent| {
        tx.send(event.clone())
            .map_err(|_| anyhow!("push connection closed"))
    });
    let broadcaster = state.engine.broadcaster().clone();
    let subscribed = broadcaster.subscribe(&client_id, deliver).await;
    if !subscribed {
        warn!(client_id = %client_id, "Catch-up failed, closing push connection");
    }

    let guard = SubscriptionGuard {
        client_id,
        broadcaster,
    };
    Sse::new(event_stream(rx, guard, subscribed, state.connection_timeout))
}

/// Wire stream of one push connection, force-closed after `ceiling`. Without
/// a subscription behind it the stream ends immediately.
fn event_stream(
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    guard: SubscriptionGuard,
    subscribed: bool,
    ceiling: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let limit = if subscribed { usize::MAX } else { 0 };
    UnboundedReceiverStream::new(rx)
        .take(limit)
        .map(move |event| {
            let _guard = &guard;
            Ok(Event::default().event(event.kind.as_str()).data(event.data()))
        })
        .take_until(tokio::time::sleep(ceiling))
}

/// POST /api/sync/force-sync
async fn force_sync(State(state): State<AppState>) -> impl IntoResponse {
    let clients = state.engine.force_sync().await;
    Json(json!({
        "success": true,
        "message": "Forced synchronisation sent",
        "clients": clients,
    }))
}

/// GET /api/sync/status
async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.status().await;
    Json(json!({
        "clients": status.clients,
        "lastSync": status.last_sync.unwrap_or_else(Utc::now),
        "watchers": status.watchers,
        "resources": status.resources,
        "isRunning": status.is_running,
        "subscribers": state.engine.broadcaster().subscribers().await,
    }))
}

/// GET /api/sync/test
async fn sync_test(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "message": "Sync server running",
        "timestamp": Utc::now(),
        "clients": state.engine.broadcaster().subscriber_count().await,
    }))
}

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    Json(json!({ "success": true, "data": "OK" }))
}

// ============================================================================
// LEDGER ROUTES
// ============================================================================

async fn list_entries(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.entries().await?))
}

async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match state.ledger.get(&id).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(ApiError::NotFound("Ledger entry not found".to_string())),
    }
}

async fn create_entry(
    State(state): State<AppState>,
    Json(draft): Json<EntryPatch>,
) -> ApiResult<impl IntoResponse> {
    let entry = state.ledger.append(draft).await?;
    state.engine.notify_change(LEDGER).await;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<EntryPatch>,
) -> ApiResult<impl IntoResponse> {
    let entry = state.ledger.update(&id, patch).await?;
    state.engine.notify_change(LEDGER).await;
    Ok(Json(entry))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.ledger.delete(&id).await?;
    state.engine.notify_change(LEDGER).await;
    Ok(Json(json!({ "message": "Ledger entry deleted" })))
}

async fn get_fixed(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.fixed_expenses().await?))
}

async fn update_fixed(
    State(state): State<AppState>,
    Json(profile): Json<FixedExpenseProfile>,
) -> ApiResult<impl IntoResponse> {
    let profile = state.ledger.update_fixed_expenses(profile).await?;
    state.engine.notify_change(FIXED_EXPENSES).await;
    Ok(Json(profile))
}

async fn reset_ledger(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.ledger.reset_all().await?;
    state.engine.notify_change(LEDGER).await;
    Ok(Json(json!({ "message": "All ledger entries have been reset" })))
}

async fn check_month_end(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let reset = state
        .ledger
        .reset_if_month_end(Local::now().date_naive())
        .await?;
    if reset {
        state.engine.notify_change(LEDGER).await;
    }
    let message = if reset {
        "Month end detected, ledger reset"
    } else {
        "Not the end of the month, nothing reset"
    };
    Ok(Json(json!({ "reset": reset, "message": message })))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/events", get(sync_events))
        .route("/force-sync", post(force_sync))
        .route("/status", get(sync_status))
        .route("/test", get(sync_test));

    let ledger_routes = Router::new()
        .route("/mouvements", get(list_entries).post(create_entry))
        .route(
            "/mouvements/:id",
            get(get_entry).put(update_entry).delete(delete_entry),
        )
        .route("/fixe", get(get_fixed).put(update_fixed))
        .route("/reset", post(reset_ledger))
        .route("/check-month-end", get(check_month_end));

    Router::new()
        .route("/api/health", get(health_check))
        .nest("/api/sync", sync_routes)
        .nest("/api/depenses", ledger_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// TESTS
// ============================================================================
