use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomNotFound,
    SenderNotMember,
    MessageNotFound,
    UnsupportedKind,
    InvalidCommandPayload,
    Internal,
}

/// Typed handler error. Every variant is recoverable at the handler boundary:
/// the rejection goes back to the originating connection only.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("room {0} not found")]
    RoomNotFound(i64),
    #[error("{0} is not a participant of room {1}")]
    SenderNotMember(String, i64),
    #[error("message {0} not found")]
    MessageNotFound(i64),
    #[error("message kind {0} has no mutable metadata")]
    UnsupportedKind(&'static str),
    #[error("invalid command payload: {0}")]
    InvalidCommandPayload(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            ChatError::SenderNotMember(..) => ErrorCode::SenderNotMember,
            ChatError::MessageNotFound(_) => ErrorCode::MessageNotFound,
            ChatError::UnsupportedKind(_) => ErrorCode::UnsupportedKind,
            ChatError::InvalidCommandPayload(_) => ErrorCode::InvalidCommandPayload,
            ChatError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Wire form of a rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ChatError> for ApiError {
    fn from(value: &ChatError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(value: ChatError) -> Self {
        Self::from(&value)
    }
}
