use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{MessageId, MessageKind, RoomId, RoomRole, UserId},
    error::ApiError,
};

/// Structured message metadata, stored and merged as a JSON object.
pub type Metadata = Map<String, Value>;

/// Commands a client publishes on the room channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    Send {
        room_id: RoomId,
        email: String,
        content: String,
        #[serde(default, rename = "kind", alias = "type")]
        kind: MessageKind,
        #[serde(default)]
        metadata: Option<Metadata>,
    },
    #[serde(rename_all = "camelCase")]
    Join { room_id: RoomId, email: String },
    #[serde(rename_all = "camelCase")]
    Read { room_id: RoomId, email: String },
    #[serde(rename_all = "camelCase")]
    Leave { room_id: RoomId, email: String },
    #[serde(rename_all = "camelCase")]
    UpdatePayload {
        room_id: RoomId,
        target_message_id: MessageId,
        email: String,
        #[serde(default)]
        patch: Option<Metadata>,
        #[serde(default)]
        selected_option_ids: Option<Vec<i64>>,
    },
}

impl ClientCommand {
    pub fn room_id(&self) -> RoomId {
        match self {
            ClientCommand::Send { room_id, .. }
            | ClientCommand::Join { room_id, .. }
            | ClientCommand::Read { room_id, .. }
            | ClientCommand::Leave { room_id, .. }
            | ClientCommand::UpdatePayload { room_id, .. } => *room_id,
        }
    }

    pub fn email(&self) -> &str {
        match self {
            ClientCommand::Send { email, .. }
            | ClientCommand::Join { email, .. }
            | ClientCommand::Read { email, .. }
            | ClientCommand::Leave { email, .. }
            | ClientCommand::UpdatePayload { email, .. } => email,
        }
    }
}

/// A chat message as broadcast to subscribers and returned from the history
/// query. The `type` field carries the message kind, which is what lets
/// clients tell it apart from the control events below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBroadcast {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub sender_nickname: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    pub unread_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Events fanned out on a room's channel. Control events are tagged through
/// `type`; a plain message broadcast uses that same field for its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomEvent {
    #[serde(rename = "UNREAD_UPDATE", rename_all = "camelCase")]
    UnreadUpdate {
        message_id: MessageId,
        unread_count: i64,
    },
    #[serde(rename = "BILL_UPDATE", rename_all = "camelCase")]
    BillUpdate {
        target_message_id: MessageId,
        metadata: Metadata,
    },
    #[serde(rename = "POLL_UPDATE", rename_all = "camelCase")]
    PollUpdate {
        target_message_id: MessageId,
        metadata: Metadata,
    },
    #[serde(rename = "READ", rename_all = "camelCase")]
    ReadReceipt { email: String },
    #[serde(rename = "ERROR")]
    Error(ApiError),
    #[serde(untagged)]
    Message(MessageBroadcast),
}

/// A room event plus the sub-topic it belongs on. Read receipts go out on
/// `/topic/room/{id}/read`, everything else on `/topic/room/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicEvent {
    pub topic: String,
    #[serde(flatten)]
    pub event: RoomEvent,
}

pub fn room_topic(room_id: RoomId) -> String {
    format!("/topic/room/{}", room_id.0)
}

pub fn room_read_topic(room_id: RoomId) -> String {
    format!("/topic/room/{}/read", room_id.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
    pub user_id: UserId,
    pub email: String,
    pub nickname: String,
    pub role: RoomRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    pub online: bool,
}
