use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::RoomId,
    error::{ApiError, ChatError},
    protocol::{room_topic, ClientCommand, RoomEvent, TopicEvent},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::AppState;

const OUTBOUND_BUFFER: usize = 64;

/// One task per connection. Inbound frames are decoded here; each command then
/// runs on its own task, so a slow command never blocks the socket. Rejections
/// go back on this connection only, never on the room channel.
pub async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut forwards: HashMap<RoomId, JoinHandle<()>> = HashMap::new();
    let mut email: Option<String> = None;

    while let Some(Ok(frame)) = stream.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let command = match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => command,
            Err(error) => {
                debug!(%error, "dropping unparseable command frame");
                let rejection = ChatError::InvalidCommandPayload(error.to_string());
                send_error(&outbound, None, &rejection).await;
                continue;
            }
        };

        let room_id = command.room_id();
        email = Some(command.email().to_string());

        match &command {
            ClientCommand::Join { .. } => {
                // Subscribe before handling so this connection also sees the
                // events its own join produces.
                forwards
                    .entry(room_id)
                    .or_insert_with(|| spawn_forward(state.rooms.subscribe(room_id), outbound.clone()));
            }
            ClientCommand::Leave { .. } => {
                if let Some(task) = forwards.remove(&room_id) {
                    task.abort();
                }
            }
            _ => {}
        }

        let state = Arc::clone(&state);
        let outbound = outbound.clone();
        tokio::spawn(async move {
            dispatch(&state, command, &outbound).await;
        });
    }

    // A dropped connection implicitly leaves every room it was watching.
    // Presence-only: membership and read watermarks stay put.
    for (room_id, task) in forwards {
        task.abort();
        let Some(email) = email.clone() else { continue };
        match chat_core::commands::handle(&state.chat, ClientCommand::Leave { room_id, email }).await
        {
            Ok(events) => publish_all(&state, room_id, events),
            Err(error) => warn!(room_id = room_id.0, %error, "implicit leave failed"),
        }
    }
    writer.abort();
}

async fn dispatch(state: &AppState, command: ClientCommand, outbound: &mpsc::Sender<Message>) {
    let room_id = command.room_id();
    let is_send = matches!(command, ClientCommand::Send { .. });

    match chat_core::commands::handle(&state.chat, command).await {
        Ok(events) => {
            if is_send {
                if let (Some(notifier), Some(TopicEvent { event: RoomEvent::Message(message), .. })) =
                    (state.notifier.as_ref(), events.first())
                {
                    notifier.message_stored(room_id, message);
                }
            }
            publish_all(state, room_id, events);
        }
        Err(error) => send_error(outbound, Some(room_id), &error).await,
    }
}

fn publish_all(state: &AppState, room_id: RoomId, events: Vec<TopicEvent>) {
    for event in events {
        state.rooms.publish(room_id, event);
    }
}

async fn send_error(outbound: &mpsc::Sender<Message>, room_id: Option<RoomId>, error: &ChatError) {
    if matches!(error, ChatError::Internal(_)) {
        warn!(%error, "command failed");
    }

    let topic = room_id.map(room_topic).unwrap_or_default();
    let frame = TopicEvent {
        topic,
        event: RoomEvent::Error(ApiError::from(error)),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = outbound.send(Message::Text(text)).await;
    }
}

fn spawn_forward(
    rx: broadcast::Receiver<TopicEvent>,
    outbound: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    let mut events = BroadcastStream::new(rx);
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let Ok(event) = event else {
                // Lagged behind the channel buffer; resume from live traffic.
                continue;
            };
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if outbound.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    })
}
