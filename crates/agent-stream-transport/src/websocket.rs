//! WebSocket transport: pushes session events, takes inject/abort/ping.

use std::sync::Arc;

use agent_stream_core::StreamEvent;
use agent_stream_session::{ReattachItem, SessionBroker};
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::protocol::{ClientMessage, EventsQuery, ServerMessage};

/// Replies waiting for the socket before the reader stops taking requests.
const CONTROL_BUFFER: usize = 32;

/// Anything written to the socket.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound {
    Event(StreamEvent),
    Control(ServerMessage),
}

impl From<ReattachItem> for Outbound {
    fn from(item: ReattachItem) -> Self {
        match item {
            ReattachItem::Event(event) => Self::Event(event),
            ReattachItem::Unavailable { session_id, polls } => {
                Self::Control(ServerMessage::Unavailable { session_id, polls })
            }
        }
    }
}

/// Interleave session events with control replies.
///
/// Events are pulled only as fast as the socket takes them, so a slow
/// client falls back on the subscription's own lag handling.
fn outbound(
    events: impl Stream<Item = ReattachItem> + Send + 'static,
    control: mpsc::Receiver<ServerMessage>,
) -> impl Stream<Item = Outbound> + Send + 'static {
    futures::stream::select(
        events.map(Outbound::from),
        ReceiverStream::new(control).map(Outbound::Control),
    )
}

/// WebSocket upgrade handler for `GET /sessions/{id}/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<SessionBroker>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker, session_id, query.after))
}

async fn handle_socket(
    socket: WebSocket,
    broker: Arc<SessionBroker>,
    session_id: String,
    after: Option<u64>,
) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<ServerMessage>(CONTROL_BUFFER);
    let events = broker.attach(&session_id, after).into_stream();
    let mut messages = Box::pin(outbound(events, rx));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = messages.next().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(%session_id, "WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%session_id, "Invalid client message: {e}");
                let error = ServerMessage::Error {
                    code: "bad_request".into(),
                    message: format!("Invalid message: {e}"),
                    resend_as_new_turn: false,
                };
                if tx.send(error).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let reply = match client_msg {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Inject { message } => match broker.inject(&session_id, message) {
                Ok(()) => ServerMessage::Queued,
                Err(e) => ServerMessage::from(&e),
            },
            ClientMessage::Abort => match broker.abort(&session_id) {
                Ok(()) => continue,
                Err(e) => ServerMessage::from(&e),
            },
        };
        if tx.send(reply).await.is_err() {
            break;
        }
    }

    tracing::debug!(%session_id, "WebSocket closed");
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use agent_stream_core::EventPayload;

    use super::*;

    fn event(sequence: u64) -> StreamEvent {
        StreamEvent {
            session_id: "s1".into(),
            sequence,
            payload: EventPayload::text("x"),
        }
    }

    #[tokio::test]
    async fn test_outbound_merges_events_and_replies() {
        let events = futures::stream::iter([
            ReattachItem::Event(event(1)),
            ReattachItem::Event(event(2)),
            ReattachItem::Unavailable {
                session_id: "s1".into(),
                polls: 3,
            },
        ]);
        let (tx, rx) = mpsc::channel(CONTROL_BUFFER);
        tx.send(ServerMessage::Pong).await.unwrap();
        drop(tx);

        let all: Vec<_> = outbound(events, rx).collect().await;
        assert_eq!(all.len(), 4);
        let sequences: Vec<_> = all
            .iter()
            .filter_map(|out| match out {
                Outbound::Event(event) => Some(event.sequence),
                Outbound::Control(_) => None,
            })
            .collect();
        assert_eq!(sequences, [1, 2]);
        assert!(all.iter().any(|out| matches!(
            out,
            Outbound::Control(ServerMessage::Unavailable { polls: 3, .. })
        )));
        assert!(
            all.iter()
                .any(|out| matches!(out, Outbound::Control(ServerMessage::Pong)))
        );
    }

    #[tokio::test]
    async fn test_outbound_pulls_events_on_demand() {
        let pulled = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&pulled);
        let events = futures::stream::iter(1..).map(move |sequence| {
            counter.fetch_add(1, Ordering::SeqCst);
            ReattachItem::Event(event(sequence))
        });
        let (_tx, rx) = mpsc::channel(CONTROL_BUFFER);

        let mut merged = Box::pin(outbound(events, rx));
        merged.next().await.unwrap();
        merged.next().await.unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_outbound_is_flat() {
        let event = Outbound::Event(StreamEvent {
            session_id: "s1".into(),
            sequence: 1,
            payload: EventPayload::text("hi"),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "text-delta", "sessionId": "s1", "sequence": 1, "text": "hi"})
        );

        let pong = Outbound::Control(ServerMessage::Pong);
        assert_eq!(serde_json::to_string(&pong).unwrap(), r#"{"type":"pong"}"#);
    }
}
