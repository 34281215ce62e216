use serde::{Deserialize, Serialize};

use crate::models::{IncomingMessage, PeerId};

// -- Conversations --

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetLabelRequest {
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub peer_id: PeerId,
    pub removed: bool,
}

/// Message history for one peer, oldest first, without duplicate ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadResponse {
    pub peer_id: PeerId,
    pub messages: Vec<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    /// File name passed on to the upload endpoint.
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSentResponse {
    pub peer_id: PeerId,
    pub url: String,
}

// -- Labels --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateLabelRequest {
    pub name: String,
}

// -- Status --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub service_id: PeerId,
    pub socket_online: bool,
    pub snapshot_loaded: bool,
    pub banner: Option<String>,
    pub conversations: usize,
    pub total_unread: u64,
}
