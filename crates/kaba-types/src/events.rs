use serde::{Deserialize, Serialize};

use crate::models::{Conversation, IncomingMessage, PeerId};

/// Events pushed to the rendering layer over the `/events` WebSocket.
/// Field names are camelCase, like every other body of the local API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum DeskEvent {
    /// Sent once after the socket is accepted
    Ready { service_id: PeerId },

    /// The full sidebar, already sorted by recency
    Conversations {
        conversations: Vec<Conversation>,
        active: Option<PeerId>,
    },

    /// Non-fatal problem to show above the sidebar (`None` clears it)
    Banner { message: Option<String> },

    /// The backend event stream went up or down
    Connection { online: bool },

    /// A live chat message, for whichever thread is on screen
    Message {
        peer_id: PeerId,
        message: IncomingMessage,
    },
}

/// Commands sent FROM the rendering layer over `/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum DeskCommand {
    /// The user opened a conversation; clears its unread count
    Open { peer_id: PeerId },

    /// The user navigated away from the open conversation
    Close,

    /// Send a chat message to a peer
    Send { peer_id: PeerId, text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_type_and_data_tags() {
        let cmd: DeskCommand =
            serde_json::from_str(r#"{"type":"Open","data":{"peerId":42}}"#).unwrap();
        assert!(matches!(cmd, DeskCommand::Open { peer_id: 42 }));

        let cmd: DeskCommand = serde_json::from_str(r#"{"type":"Close"}"#).unwrap();
        assert!(matches!(cmd, DeskCommand::Close));
    }

    #[test]
    fn banner_serializes_with_tag() {
        let json = serde_json::to_value(DeskEvent::Banner {
            message: Some("snapshot failed".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "Banner");
        assert_eq!(json["data"]["message"], "snapshot failed");
    }

    #[test]
    fn envelopes_use_camel_case_like_conversations() {
        let json = serde_json::to_value(DeskEvent::Ready { service_id: 7 }).unwrap();
        assert_eq!(json["data"]["serviceId"], 7);

        let cmd: DeskCommand =
            serde_json::from_str(r#"{"type":"Send","data":{"peerId":3,"text":"hi"}}"#).unwrap();
        assert!(matches!(cmd, DeskCommand::Send { peer_id: 3, .. }));
        assert!(serde_json::from_str::<DeskCommand>(r#"{"type":"Open","data":{"peer_id":3}}"#).is_err());
    }
}
