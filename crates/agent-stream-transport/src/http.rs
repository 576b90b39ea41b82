//! HTTP routes: session control plus the SSE event feed.

use std::{convert::Infallible, sync::Arc};

use agent_stream_core::TurnRequest;
use agent_stream_session::{ReattachItem, SessionBroker};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};

use crate::protocol::{
    ApiError, EventsQuery, InjectRequest, InjectResponse, ServerMessage, SessionList,
    StartResponse,
};

/// Create the session router.
///
/// # Example
/// ```ignore
/// let app = create_router(broker).layer(CorsLayer::permissive());
/// ```
#[must_use]
pub fn create_router(broker: Arc<SessionBroker>) -> Router {
    let router = Router::new()
        .route("/sessions", get(list_sessions).post(start_session))
        .route("/sessions/{id}/inject", post(inject))
        .route("/sessions/{id}/abort", post(abort))
        .route("/sessions/{id}/events", get(events));

    #[cfg(feature = "websocket")]
    let router = router.route("/sessions/{id}/ws", get(crate::websocket::ws_handler));

    router.with_state(broker)
}

async fn start_session(
    State(broker): State<Arc<SessionBroker>>,
    Json(request): Json<TurnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = broker.start_session(request)?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            session_id: started.session_id,
        }),
    ))
}

async fn list_sessions(State(broker): State<Arc<SessionBroker>>) -> Json<SessionList> {
    Json(SessionList {
        sessions: broker.list_sessions(),
    })
}

async fn inject(
    State(broker): State<Arc<SessionBroker>>,
    Path(id): Path<String>,
    Json(body): Json<InjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    broker.inject(&id, body.message)?;
    Ok((StatusCode::ACCEPTED, Json(InjectResponse { queued: true })))
}

async fn abort(
    State(broker): State<Arc<SessionBroker>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    broker.abort(&id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn events(
    State(broker): State<Arc<SessionBroker>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let last_seen = match last_event_id(&headers)? {
        Some(seq) => Some(seq),
        None => query.after,
    };
    tracing::debug!(session_id = %id, ?last_seen, "event feed opened");

    let stream = broker
        .attach(&id, last_seen)
        .into_stream()
        .filter_map(|item| async move { to_sse(item).map(Ok) });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// A reconnecting `EventSource` resumes from the header, not the query.
fn last_event_id(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get("last-event-id") else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest("Last-Event-ID must be a sequence number".into()))
}

fn to_sse(item: ReattachItem) -> Option<Event> {
    let result = match item {
        ReattachItem::Event(event) => event.to_sse_event(),
        ReattachItem::Unavailable { session_id, polls } => Event::default()
            .event("unavailable")
            .json_data(ServerMessage::Unavailable { session_id, polls }),
    };
    match result {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!("Failed to serialize event: {e}");
            None
        }
    }
}
