//! Stream endpoints. SSE and WebSocket carry the same JSON messages; the
//! session decides what is sent, these handlers only frame it.

use super::AppState;
use crate::stream::{encode, Frame, GatewaySession};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderName},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use std::convert::Infallible;
use tracing::{debug, info};

pub async fn sse_stream(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> impl IntoResponse {
    let session = GatewaySession::open(&state.hub, &game_id, state.config.heartbeat);
    info!(
        game_id = %game_id,
        subscriber_id = session.subscriber_id(),
        "SSE client subscribed"
    );

    let events = futures_util::stream::unfold(session, |mut session| async move {
        let event = match session.next_frame().await? {
            Frame::Event(message) => {
                let event = Event::default().data(encode(&message));
                match message.sequence() {
                    Some(sequence) => event.id(sequence.to_string()),
                    None => event,
                }
            }
            Frame::Heartbeat => Event::default().comment("heartbeat"),
        };
        Some((Ok::<_, Infallible>(event), session))
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events),
    )
}

pub async fn ws_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, game_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, game_id: String) {
    let mut session = GatewaySession::open(&state.hub, &game_id, state.config.heartbeat);
    info!(
        game_id = %game_id,
        subscriber_id = session.subscriber_id(),
        "WebSocket client subscribed"
    );

    loop {
        tokio::select! {
            frame = session.next_frame() => {
                let message = match frame {
                    Some(Frame::Event(event)) => Message::Text(encode(&event)),
                    Some(Frame::Heartbeat) => Message::Ping(Vec::new()),
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(game_id = %game_id, "WebSocket client disconnected");
}
