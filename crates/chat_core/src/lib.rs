use std::collections::HashMap;
use std::sync::Arc;

use presence::PresenceTracker;
use shared::{
    domain::{RoomId, UserId},
    error::ChatError,
    protocol::{MemberSummary, MessageBroadcast},
};
use storage::Storage;

pub mod commands;
pub mod metadata;
pub mod unread;

#[derive(Clone)]
pub struct ChatContext {
    pub storage: Storage,
    pub presence: Arc<PresenceTracker>,
}

impl ChatContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            presence: Arc::new(PresenceTracker::new()),
        }
    }
}

/// One history page, oldest to newest. Page 0 holds the newest messages.
pub async fn message_history(
    ctx: &ChatContext,
    room_id: RoomId,
    page: u32,
    size: u32,
) -> Result<Vec<MessageBroadcast>, ChatError> {
    ensure_room(ctx, room_id).await?;

    let messages = ctx.storage.list_messages_page(room_id, page, size).await?;

    let mut name_cache: HashMap<UserId, String> = HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let sender_nickname = match name_cache.get(&message.sender_id) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = ctx
                    .storage
                    .user_by_id(message.sender_id)
                    .await?
                    .map(|user| user.display_name().to_string())
                    .unwrap_or_default();
                name_cache.insert(message.sender_id, resolved.clone());
                resolved
            }
        };

        payloads.push(MessageBroadcast {
            message_id: message.message_id,
            sender_id: message.sender_id,
            sender_nickname,
            content: message.content,
            kind: message.kind,
            sent_at: message.created_at,
            unread_count: message.unread_count,
            metadata: message.metadata,
        });
    }

    Ok(payloads)
}

/// Member list with the live presence flag joined in.
pub async fn room_members(
    ctx: &ChatContext,
    room_id: RoomId,
) -> Result<Vec<MemberSummary>, ChatError> {
    ensure_room(ctx, room_id).await?;

    let participants = ctx.storage.list_participants(room_id).await?;
    let active = ctx.presence.active_users(room_id);

    Ok(participants
        .into_iter()
        .map(|p| MemberSummary {
            user_id: p.user_id,
            online: active.contains(&p.user_id),
            nickname: p.display_name().to_string(),
            email: p.email,
            role: p.role,
            last_read_at: p.last_read_at,
        })
        .collect())
}

pub(crate) async fn ensure_room(ctx: &ChatContext, room_id: RoomId) -> Result<(), ChatError> {
    if !ctx.storage.room_exists(room_id).await? {
        return Err(ChatError::RoomNotFound(room_id.0));
    }
    Ok(())
}
