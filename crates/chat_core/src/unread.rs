//! Unread accounting.
//!
//! `unread(M)` = non-sender participants whose read watermark is NULL or
//! earlier than `M.created_at`, minus those of them who are actively viewing
//! the room right now. The count cached on each message row is a materialized
//! view, never authoritative: every send/join/read/leave trigger re-derives it
//! from fresh durable + presence state, so racing triggers converge instead of
//! compounding drift.

use std::collections::HashSet;

use shared::{
    domain::{MessageId, RoomId, UserId},
    error::ChatError,
};
use storage::{StoredMessage, StoredParticipant};
use tracing::warn;

use crate::ChatContext;

/// Messages older than this are assumed fully read; recomputing only the
/// recent window keeps the per-trigger cost independent of room history.
pub const RECOMPUTE_WINDOW: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadDelta {
    pub message_id: MessageId,
    pub unread_count: i64,
}

/// Recomputes the cached unread count for the room's recent window and
/// returns a delta per changed message. A failure on one message is logged
/// and skipped; the next trigger self-heals it.
pub async fn recompute_room(
    ctx: &ChatContext,
    room_id: RoomId,
) -> Result<Vec<UnreadDelta>, ChatError> {
    let window = ctx.storage.recent_messages(room_id, RECOMPUTE_WINDOW).await?;
    if window.is_empty() {
        return Ok(Vec::new());
    }

    let participants = ctx.storage.list_participants(room_id).await?;
    let active = ctx.presence.active_users(room_id);

    let mut deltas = Vec::new();
    for message in &window {
        match recompute_message(ctx, message, &participants, &active).await {
            Ok(Some(delta)) => deltas.push(delta),
            Ok(None) => {}
            Err(error) => {
                warn!(
                    message_id = message.message_id.0,
                    room_id = room_id.0,
                    %error,
                    "unread recompute failed for message; skipping"
                );
            }
        }
    }
    Ok(deltas)
}

async fn recompute_message(
    ctx: &ChatContext,
    message: &StoredMessage,
    participants: &[StoredParticipant],
    active: &HashSet<UserId>,
) -> anyhow::Result<Option<UnreadDelta>> {
    let db_unread = ctx
        .storage
        .count_others_unread(message.room_id, message.sender_id, message.created_at)
        .await?;

    // Presence only forgives participants the durable count still includes;
    // an active user whose watermark already covers the message must not be
    // subtracted twice.
    let forgiven = participants
        .iter()
        .filter(|p| {
            p.user_id != message.sender_id
                && active.contains(&p.user_id)
                && p.last_read_at.map_or(true, |at| at < message.created_at)
        })
        .count() as i64;

    let final_unread = (db_unread - forgiven).max(0);
    if final_unread == message.unread_count {
        return Ok(None);
    }

    ctx.storage
        .set_unread_count(message.message_id, final_unread)
        .await?;
    Ok(Some(UnreadDelta {
        message_id: message.message_id,
        unread_count: final_unread,
    }))
}
