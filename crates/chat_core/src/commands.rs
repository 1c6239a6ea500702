//! Command handlers for the room channel.
//!
//! One handler per command tag; all of them end with the same pure recompute
//! over the room's recent window, so concurrent commands for one room may
//! interleave freely and still converge on the same cached unread counts.

use chrono::Utc;
use shared::{
    domain::{MessageId, MessageKind, RoomId, RoomRole},
    error::ChatError,
    protocol::{
        room_read_topic, room_topic, ClientCommand, MessageBroadcast, Metadata, RoomEvent,
        TopicEvent,
    },
};
use storage::StoredUser;
use tracing::warn;

use crate::{
    ensure_room,
    metadata::merge_patch,
    unread::{recompute_room, UnreadDelta},
    ChatContext,
};

/// Dispatches one client command and returns the events to publish on the
/// room's channel, primary payload first, unread deltas after.
pub async fn handle(
    ctx: &ChatContext,
    command: ClientCommand,
) -> Result<Vec<TopicEvent>, ChatError> {
    match command {
        ClientCommand::Send {
            room_id,
            email,
            content,
            kind,
            metadata,
        } => send(ctx, room_id, &email, &content, kind, metadata).await,
        ClientCommand::Join { room_id, email } => join(ctx, room_id, &email).await,
        ClientCommand::Read { room_id, email } => read(ctx, room_id, &email).await,
        ClientCommand::Leave { room_id, email } => leave(ctx, room_id, &email).await,
        ClientCommand::UpdatePayload {
            room_id,
            target_message_id,
            email,
            patch,
            selected_option_ids,
        } => {
            update_payload(
                ctx,
                room_id,
                target_message_id,
                &email,
                patch,
                selected_option_ids,
            )
            .await
        }
    }
}

async fn send(
    ctx: &ChatContext,
    room_id: RoomId,
    email: &str,
    content: &str,
    kind: MessageKind,
    metadata: Option<Metadata>,
) -> Result<Vec<TopicEvent>, ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::InvalidCommandPayload(
            "content must not be empty".into(),
        ));
    }

    let sender = resolve_participant(ctx, room_id, email).await?;

    // Sending implies the sender has seen everything up to now.
    ctx.storage
        .touch_read(room_id, sender.user_id, Utc::now())
        .await?;

    let message = ctx
        .storage
        .append_message(room_id, sender.user_id, kind, content, metadata.as_ref())
        .await?;

    let mut deltas = recompute_or_warn(ctx, room_id).await;

    // The fresh count for the new message rides on the broadcast itself; no
    // separate delta for it.
    let unread_count = match deltas
        .iter()
        .position(|d| d.message_id == message.message_id)
    {
        Some(idx) => deltas.remove(idx).unread_count,
        None => message.unread_count,
    };

    let mut events = vec![TopicEvent {
        topic: room_topic(room_id),
        event: RoomEvent::Message(MessageBroadcast {
            message_id: message.message_id,
            sender_id: sender.user_id,
            sender_nickname: sender.display_name().to_string(),
            content: message.content,
            kind: message.kind,
            sent_at: message.created_at,
            unread_count,
            metadata: message.metadata,
        }),
    }];
    events.extend(delta_events(room_id, deltas));
    Ok(events)
}

async fn join(ctx: &ChatContext, room_id: RoomId, email: &str) -> Result<Vec<TopicEvent>, ChatError> {
    ensure_room(ctx, room_id).await?;
    let user = resolve_user(ctx, room_id, email).await?;

    ctx.storage
        .ensure_participant(room_id, user.user_id, RoomRole::Member)
        .await?;
    ctx.storage
        .touch_read(room_id, user.user_id, Utc::now())
        .await?;
    ctx.presence.join(room_id, user.user_id);

    let deltas = recompute_or_warn(ctx, room_id).await;
    Ok(delta_events(room_id, deltas))
}

async fn read(ctx: &ChatContext, room_id: RoomId, email: &str) -> Result<Vec<TopicEvent>, ChatError> {
    let user = resolve_participant(ctx, room_id, email).await?;

    ctx.storage
        .touch_read(room_id, user.user_id, Utc::now())
        .await?;

    let deltas = recompute_or_warn(ctx, room_id).await;
    let mut events = vec![TopicEvent {
        topic: room_read_topic(room_id),
        event: RoomEvent::ReadReceipt {
            email: email.to_string(),
        },
    }];
    events.extend(delta_events(room_id, deltas));
    Ok(events)
}

/// Explicit leave, also issued for every joined room when a connection drops.
/// Presence-only: membership rows and watermarks are untouched, and unknown
/// rooms or users are quiet no-ops.
async fn leave(ctx: &ChatContext, room_id: RoomId, email: &str) -> Result<Vec<TopicEvent>, ChatError> {
    if let Some(user) = ctx.storage.user_by_email(email).await? {
        ctx.presence.leave(room_id, user.user_id);
    }

    let deltas = recompute_or_warn(ctx, room_id).await;
    Ok(delta_events(room_id, deltas))
}

async fn update_payload(
    ctx: &ChatContext,
    room_id: RoomId,
    target_message_id: MessageId,
    email: &str,
    patch: Option<Metadata>,
    selected_option_ids: Option<Vec<i64>>,
) -> Result<Vec<TopicEvent>, ChatError> {
    resolve_participant(ctx, room_id, email).await?;

    let mut patch = patch.unwrap_or_default();
    if let Some(option_ids) = selected_option_ids {
        // Poll votes ride the same merge path: one array of option ids per
        // voter, so re-sending the same vote stays idempotent.
        let mut votes = Metadata::new();
        votes.insert(email.to_string(), serde_json::json!(option_ids));
        patch.insert("votes".into(), serde_json::Value::Object(votes));
    }
    if patch.is_empty() {
        return Err(ChatError::InvalidCommandPayload(
            "updatePayload requires a patch or selectedOptionIds".into(),
        ));
    }

    let message = ctx
        .storage
        .message_by_id(target_message_id)
        .await?
        .ok_or(ChatError::MessageNotFound(target_message_id.0))?;
    if message.room_id != room_id {
        return Err(ChatError::InvalidCommandPayload(
            "message does not belong to this room".into(),
        ));
    }
    if !message.kind.has_mutable_metadata() {
        return Err(ChatError::UnsupportedKind(message.kind.as_str()));
    }

    let merged = ctx
        .storage
        .update_message_metadata(target_message_id, |current| merge_patch(current, &patch))
        .await?;

    // Always the full merged metadata, never a diff, so clients cannot
    // mis-merge.
    let event = match message.kind {
        MessageKind::Poll => RoomEvent::PollUpdate {
            target_message_id,
            metadata: merged,
        },
        _ => RoomEvent::BillUpdate {
            target_message_id,
            metadata: merged,
        },
    };
    Ok(vec![TopicEvent {
        topic: room_topic(room_id),
        event,
    }])
}

async fn resolve_user(
    ctx: &ChatContext,
    room_id: RoomId,
    email: &str,
) -> Result<StoredUser, ChatError> {
    ctx.storage
        .user_by_email(email)
        .await?
        .ok_or_else(|| ChatError::SenderNotMember(email.to_string(), room_id.0))
}

async fn resolve_participant(
    ctx: &ChatContext,
    room_id: RoomId,
    email: &str,
) -> Result<StoredUser, ChatError> {
    ensure_room(ctx, room_id).await?;
    let user = resolve_user(ctx, room_id, email).await?;
    if !ctx.storage.is_participant(room_id, user.user_id).await? {
        return Err(ChatError::SenderNotMember(email.to_string(), room_id.0));
    }
    Ok(user)
}

/// A failed recompute must never undo the durable mutation that triggered it;
/// the stale cache self-heals on the next trigger.
async fn recompute_or_warn(ctx: &ChatContext, room_id: RoomId) -> Vec<UnreadDelta> {
    match recompute_room(ctx, room_id).await {
        Ok(deltas) => deltas,
        Err(error) => {
            warn!(room_id = room_id.0, %error, "unread recompute failed");
            Vec::new()
        }
    }
}

fn delta_events(room_id: RoomId, deltas: Vec<UnreadDelta>) -> Vec<TopicEvent> {
    deltas
        .into_iter()
        .map(|delta| TopicEvent {
            topic: room_topic(room_id),
            event: RoomEvent::UnreadUpdate {
                message_id: delta.message_id,
                unread_count: delta.unread_count,
            },
        })
        .collect()
}
