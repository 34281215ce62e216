//! Engine.IO v4 / Socket.IO v5 framing over a WebSocket transport.
//!
//! Every WebSocket text frame carries one Engine.IO packet: a single type
//! digit followed by its payload. Engine.IO `message` packets (`4`) in turn
//! carry a Socket.IO packet: type digit, optional `/namespace,`, optional
//! ack id, then JSON. A chat event on the default namespace therefore looks
//! like `42["message",{...}]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown engine.io packet type '{0}'")]
    UnknownEnginePacket(char),

    #[error("unknown socket.io packet type '{0}'")]
    UnknownSocketPacket(char),

    #[error("binary packets are not supported")]
    BinaryUnsupported,

    #[error("invalid json payload: {0}")]
    BadJson(String),

    #[error("event payload must be a non-empty array starting with the event name")]
    BadEvent,
}

/// Parameters the server sends in its `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, WireError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(WireError::Empty)?;
        let body = chars.as_str();

        Ok(match kind {
            '0' => Self::Open(
                serde_json::from_str(body).map_err(|e| WireError::BadJson(e.to_string()))?,
            ),
            '1' => Self::Close,
            '2' => Self::Ping(body.to_string()),
            '3' => Self::Pong(body.to_string()),
            '4' => Self::Message(body.to_string()),
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            other => return Err(WireError::UnknownEnginePacket(other)),
        })
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => {
                // OpenHandshake only holds strings and integers.
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{}", data),
            Self::Pong(data) => format!("3{}", data),
            Self::Message(data) => format!("4{}", data),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Value,
    },
}

impl SocketPacket {
    /// Event on the default namespace, without an ack.
    pub fn event(name: &str, args: Vec<Value>) -> Self {
        Self::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            name: name.to_string(),
            args,
        }
    }

    pub fn connect() -> Self {
        Self::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    pub fn decode(payload: &str) -> Result<Self, WireError> {
        let mut chars = payload.chars();
        let kind = chars.next().ok_or(WireError::Empty)?;
        let rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(WireError::BinaryUnsupported);
        }
        if !matches!(kind, '0'..='4') {
            return Err(WireError::UnknownSocketPacket(kind));
        }

        let (namespace, rest) = split_namespace(rest);
        let (ack_id, rest) = split_ack_id(rest);
        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(rest).map_err(|e| WireError::BadJson(e.to_string()))?)
        };

        Ok(match kind {
            '0' => Self::Connect { namespace, data },
            '1' => Self::Disconnect { namespace },
            '2' => {
                let Some(Value::Array(mut items)) = data else {
                    return Err(WireError::BadEvent);
                };
                if items.is_empty() {
                    return Err(WireError::BadEvent);
                }
                let Value::String(name) = items.remove(0) else {
                    return Err(WireError::BadEvent);
                };
                Self::Event {
                    namespace,
                    ack_id,
                    name,
                    args: items,
                }
            }
            '3' => {
                let ack_id = ack_id.ok_or(WireError::BadEvent)?;
                let args = match data {
                    Some(Value::Array(items)) => items,
                    _ => return Err(WireError::BadEvent),
                };
                Self::Ack {
                    namespace,
                    ack_id,
                    args,
                }
            }
            _ => Self::ConnectError {
                namespace,
                data: data.unwrap_or(Value::Null),
            },
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Connect { namespace, data } => {
                out.push('0');
                push_namespace(&mut out, namespace, data.is_some());
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            Self::Disconnect { namespace } => {
                out.push('1');
                push_namespace(&mut out, namespace, false);
            }
            Self::Event {
                namespace,
                ack_id,
                name,
                args,
            } => {
                out.push('2');
                push_namespace(&mut out, namespace, true);
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
            }
            Self::Ack {
                namespace,
                ack_id,
                args,
            } => {
                out.push('3');
                push_namespace(&mut out, namespace, true);
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
            Self::ConnectError { namespace, data } => {
                out.push('4');
                push_namespace(&mut out, namespace, true);
                out.push_str(&data.to_string());
            }
        }
        out
    }

    /// Wrap into an Engine.IO message frame ready for the socket.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn split_namespace(rest: &str) -> (String, &str) {
    if !rest.starts_with('/') {
        return (DEFAULT_NAMESPACE.to_string(), rest);
    }
    match rest.find(',') {
        Some(idx) => (rest[..idx].to_string(), &rest[idx + 1..]),
        None => (rest.to_string(), ""),
    }
}

fn split_ack_id(rest: &str) -> (Option<u64>, &str) {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, rest);
    }
    (rest[..digits].parse().ok(), &rest[digits..])
}

fn push_namespace(out: &mut String, namespace: &str, has_more: bool) {
    if namespace != DEFAULT_NAMESPACE {
        out.push_str(namespace);
        if has_more {
            out.push(',');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_open_handshake() {
        let frame = r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        let EnginePacket::Open(open) = EnginePacket::decode(frame).unwrap() else {
            panic!("expected open packet");
        };
        assert_eq!(open.sid, "lv_VI97HAXpY6yYWAAAC");
        assert_eq!(open.ping_interval, 25000);
        assert_eq!(open.max_payload, Some(1_000_000));
    }

    #[test]
    fn engine_ping_and_errors() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(String::new()));
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert_eq!(EnginePacket::decode(""), Err(WireError::Empty));
        assert_eq!(EnginePacket::decode("9"), Err(WireError::UnknownEnginePacket('9')));
    }

    #[test]
    fn decodes_chat_event_with_slash_in_name() {
        let packet = SocketPacket::decode(r#"2["/register",92109474]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/".into(),
                ack_id: None,
                name: "/register".into(),
                args: vec![json!(92109474)],
            }
        );
    }

    #[test]
    fn decodes_namespace_and_ack_id() {
        let packet = SocketPacket::decode(r#"2/admin,13["message",{"text":"hi"}]"#).unwrap();
        let SocketPacket::Event { namespace, ack_id, name, args } = packet else {
            panic!("expected event");
        };
        assert_eq!(namespace, "/admin");
        assert_eq!(ack_id, Some(13));
        assert_eq!(name, "message");
        assert_eq!(args[0]["text"], "hi");

        assert_eq!(
            SocketPacket::decode("0/admin").unwrap(),
            SocketPacket::Connect { namespace: "/admin".into(), data: None }
        );
    }

    #[test]
    fn connect_reply_and_connect_error() {
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"abc"}"#).unwrap(),
            SocketPacket::Connect { namespace: "/".into(), data: Some(json!({"sid": "abc"})) }
        );

        let SocketPacket::ConnectError { data, .. } =
            SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap()
        else {
            panic!("expected connect error");
        };
        assert_eq!(data["message"], "Not authorized");
    }

    #[test]
    fn rejects_malformed_events() {
        assert_eq!(SocketPacket::decode("2[]"), Err(WireError::BadEvent));
        assert_eq!(SocketPacket::decode("2[42]"), Err(WireError::BadEvent));
        assert_eq!(SocketPacket::decode(r#"2{"a":1}"#), Err(WireError::BadEvent));
        assert_eq!(SocketPacket::decode(r#"51-["upload",{}]"#), Err(WireError::BinaryUnsupported));
        assert!(matches!(SocketPacket::decode("2[oops"), Err(WireError::BadJson(_))));
    }

    #[test]
    fn encodes_frames_for_the_wire() {
        assert_eq!(SocketPacket::connect().to_frame(), "40");
        assert_eq!(
            SocketPacket::event("/register", vec![json!(92109474)]).to_frame(),
            r#"42["/register",92109474]"#
        );
        assert_eq!(
            SocketPacket::Disconnect { namespace: "/".into() }.to_frame(),
            "41"
        );
        assert_eq!(
            SocketPacket::Ack { namespace: "/chat".into(), ack_id: 7, args: vec![json!(true)] }.encode(),
            "3/chat,7[true]"
        );
    }
}
