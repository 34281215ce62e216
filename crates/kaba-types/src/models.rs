use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric identifier of a peer (and of the service identity itself).
pub type PeerId = i64;

/// One row of the sidebar: the latest state of our exchange with a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub peer_id: PeerId,
    pub display_name: String,
    pub color_tag: String,
    pub last_message_text: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u32,
    pub label: Option<String>,
}

impl Conversation {
    /// Image messages are sent as a bare upload URL.
    pub fn is_image(&self) -> bool {
        is_image_url(&self.last_message_text)
    }
}

/// A chat message as delivered by the event stream, already validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Backend row id. History replies and live echoes share it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Only some backends attach the sender's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

impl IncomingMessage {
    pub fn is_image(&self) -> bool {
        is_image_url(&self.text)
    }
}

fn is_image_url(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with("http://") || text.starts_with("https://")
}

/// Message emitted by the service identity towards a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub text: String,
}

/// Raw snapshot row from either `/users` (`id`, `senderName`) or the dashboard
/// `/conversations/{id}` feed (`userId`, `lastMessage`, `updatedAt`).
///
/// Alternative keys are separate fields since rows may carry both (`id` next
/// to `userId`, `createdAt` next to `updatedAt`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub id: Option<PeerId>,
    #[serde(default)]
    pub user_id: Option<PeerId>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    /// Kept as raw strings; see `UserRecord::timestamp`.
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

impl UserRecord {
    /// The peer this row describes. `userId` wins over a row-level `id`.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.user_id.or(self.id)
    }

    pub fn display_name(&self) -> Option<&str> {
        [&self.sender_name, &self.name]
            .into_iter()
            .flatten()
            .map(|n| n.trim())
            .find(|n| !n.is_empty())
    }

    /// `updatedAt` wins over `createdAt`.
    pub fn timestamp(&self) -> Option<&str> {
        [&self.updated_at, &self.created_at]
            .into_iter()
            .flatten()
            .map(|t| t.trim())
            .find(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardStats {
    pub total_conversations: u64,
    pub total_messages: u64,
    pub today_messages: u64,
    pub active_users: u64,
}
