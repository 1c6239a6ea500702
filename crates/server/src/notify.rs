use shared::{domain::RoomId, protocol::MessageBroadcast};
use tracing::{debug, warn};

/// Fire-and-forget webhook for push-style notifications. Delivery never sits
/// on the message path: a failed or slow POST only produces a warning.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    url: String,
}

impl Notifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn message_stored(&self, room_id: RoomId, message: &MessageBroadcast) {
        let payload = serde_json::json!({
            "roomId": room_id.0,
            "messageId": message.message_id.0,
            "senderNickname": message.sender_nickname,
            "type": message.kind,
            "content": message.content,
        });
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%url, "notification delivered");
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "notification rejected");
                }
                Err(error) => {
                    warn!(%url, %error, "notification delivery failed");
                }
            }
        });
    }
}
