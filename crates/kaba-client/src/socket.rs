use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use kaba_types::models::OutgoingMessage;
use kaba_types::{IncomingMessage, PeerId, parse_timestamp};

use crate::error::ClientError;
use crate::session::Session;
use crate::wire::{DEFAULT_NAMESPACE, EnginePacket, SocketPacket};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Emitted once per connection with the service identity as argument.
pub const REGISTER_EVENT: &str = "/register";
/// Emitted to send a chat message.
pub const SEND_EVENT: &str = "/message";
/// Pushed by the server for every chat message touching the service identity.
pub const MESSAGE_EVENT: &str = "message";
/// Asks for the history between the service identity and one peer.
pub const HISTORY_EVENT: &str = "/getMessages";
/// The server's answer to `HISTORY_EVENT`: an array of messages.
pub const HISTORY_REPLY_EVENT: &str = "messages";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What the socket reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected { sid: String },
    Message(IncomingMessage),
    Disconnected { reason: String },
}

/// Socket.IO client bound to one session. Nothing is opened until `spawn`.
#[derive(Clone)]
pub struct SocketClient {
    session: Arc<Session>,
}

/// Work queued by `MessageSender` for whichever connection is live.
enum Outbound {
    Chat(OutgoingMessage),
    History {
        peer_id: PeerId,
        reply: oneshot::Sender<Vec<IncomingMessage>>,
    },
}

/// History requests awaiting their `messages` reply.
type PendingHistory = VecDeque<(PeerId, oneshot::Sender<Vec<IncomingMessage>>)>;

/// A handshaken connection, registered and ready to stream events.
struct Connection {
    ws: WsStream,
    conn_id: Uuid,
    service_id: PeerId,
    sid: String,
    /// Silence longer than pingInterval + pingTimeout means the server is gone.
    liveness: Duration,
}

impl SocketClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Start the connection supervisor. It connects, registers, forwards
    /// events to `events`, and reconnects with capped exponential backoff
    /// until `shutdown` is cancelled or the handle is disconnected.
    pub fn spawn(self, events: mpsc::Sender<SocketEvent>, shutdown: CancellationToken) -> SocketHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(false));

        let sender = MessageSender {
            outbound: outbound_tx,
            online: online.clone(),
            service_id: self.session.service_id,
            request_timeout: self.session.request_timeout,
        };

        let task = tokio::spawn(supervise(self, events, outbound_rx, online, shutdown.clone()));

        SocketHandle {
            sender,
            shutdown,
            task,
        }
    }

    async fn connect(&self) -> Result<Connection, ClientError> {
        let url = self.session.socket_endpoint()?;
        let timeout = self.session.request_timeout;
        debug!("Connecting to event stream at {}", url);

        let (mut ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout("connecting to the event stream"))??;

        let (sid, liveness) = tokio::time::timeout(timeout, handshake(&mut ws, self.session.service_id))
            .await
            .map_err(|_| ClientError::Timeout("waiting for the socket.io handshake"))??;

        Ok(Connection {
            ws,
            conn_id: Uuid::new_v4(),
            service_id: self.session.service_id,
            sid,
            liveness,
        })
    }
}

/// Cheap, clonable way to emit chat messages on whatever connection is live.
#[derive(Clone)]
pub struct MessageSender {
    outbound: mpsc::UnboundedSender<Outbound>,
    online: Arc<AtomicBool>,
    service_id: PeerId,
    request_timeout: Duration,
}

impl MessageSender {
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn send(&self, peer_id: PeerId, text: impl Into<String>) -> Result<(), ClientError> {
        if !self.is_online() {
            return Err(ClientError::Offline);
        }
        self.outbound
            .send(Outbound::Chat(OutgoingMessage {
                sender_id: self.service_id,
                receiver_id: peer_id,
                text: text.into(),
            }))
            .map_err(|_| ClientError::Offline)
    }

    /// Ask the server for the message history with `peer_id` and wait for the
    /// reply, bounded by the session's request timeout.
    pub async fn fetch_history(&self, peer_id: PeerId) -> Result<Vec<IncomingMessage>, ClientError> {
        if !self.is_online() {
            return Err(ClientError::Offline);
        }
        let (reply, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::History { peer_id, reply })
            .map_err(|_| ClientError::Offline)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(messages)) => Ok(messages),
            // The connection dropped before the reply came in.
            Ok(Err(_)) => Err(ClientError::Offline),
            Err(_) => Err(ClientError::Timeout("waiting for message history")),
        }
    }
}

/// Owner of the running socket supervisor.
pub struct SocketHandle {
    sender: MessageSender,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SocketHandle {
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    pub fn is_online(&self) -> bool {
        self.sender.is_online()
    }

    /// Close the live connection (if any) and stop reconnecting.
    pub async fn disconnect(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("Socket supervisor ended abnormally: {}", e);
        }
    }
}

async fn supervise(
    client: SocketClient,
    events: mpsc::Sender<SocketEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    online: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = client.connect() => result,
        };

        match result {
            Ok(conn) => {
                backoff = INITIAL_BACKOFF;
                info!("Event stream connected (sid {}, conn {})", conn.sid, conn.conn_id);
                online.store(true, Ordering::Release);

                if events
                    .send(SocketEvent::Connected { sid: conn.sid.clone() })
                    .await
                    .is_err()
                {
                    online.store(false, Ordering::Release);
                    break;
                }

                let reason = conn.run(&events, &mut outbound, &shutdown).await;
                online.store(false, Ordering::Release);
                info!("Event stream disconnected: {}", reason);
                let _ = events.send(SocketEvent::Disconnected { reason }).await;
            }
            Err(e) => {
                warn!("Event stream connect failed: {} (retrying in {:?})", e, backoff);
            }
        }

        if shutdown.is_cancelled() || events.is_closed() {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    online.store(false, Ordering::Release);
    debug!("Socket supervisor stopped");
}

impl Connection {
    /// Pump frames until the connection ends. Returns the reason.
    async fn run(
        self,
        events: &mpsc::Sender<SocketEvent>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        shutdown: &CancellationToken,
    ) -> String {
        let (mut sink, mut stream) = self.ws.split();
        let mut pending_history = PendingHistory::new();
        let mut last_seen = Instant::now();
        let mut liveness = tokio::time::interval(self.liveness);
        liveness.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let bye = SocketPacket::Disconnect { namespace: DEFAULT_NAMESPACE.to_string() };
                    let _ = sink.send(Message::Text(bye.to_frame().into())).await;
                    let _ = sink.send(Message::Close(None)).await;
                    return "client disconnect".to_string();
                }

                Some(work) = outbound.recv() => {
                    let frame = match work {
                        Outbound::Chat(msg) => match serde_json::to_value(&msg) {
                            Ok(payload) => SocketPacket::event(SEND_EVENT, vec![payload]).to_frame(),
                            Err(e) => {
                                warn!("Could not encode outgoing message: {}", e);
                                continue;
                            }
                        },
                        Outbound::History { peer_id, reply } => {
                            let request = serde_json::json!({
                                "userId": self.service_id,
                                "otherId": peer_id,
                            });
                            pending_history.push_back((peer_id, reply));
                            SocketPacket::event(HISTORY_EVENT, vec![request]).to_frame()
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        return format!("send failed: {}", e);
                    }
                }

                frame = stream.next() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match handle_frame(text.as_str(), events, self.conn_id).await {
                                FrameAction::Continue => {}
                                FrameAction::Reply(reply) => {
                                    if let Err(e) = sink.send(Message::Text(reply.into())).await {
                                        return format!("send failed: {}", e);
                                    }
                                }
                                FrameAction::History(messages) => {
                                    deliver_history(&mut pending_history, messages, self.conn_id);
                                }
                                FrameAction::Close(reason) => return reason,
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return "server closed the connection".to_string();
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return format!("read error: {}", e),
                    }
                }

                _ = liveness.tick() => {
                    if last_seen.elapsed() > self.liveness {
                        warn!("No traffic for {:?} on conn {}, dropping connection", self.liveness, self.conn_id);
                        return "ping timeout".to_string();
                    }
                }
            }
        }
    }
}

enum FrameAction {
    Continue,
    Reply(String),
    History(Vec<IncomingMessage>),
    Close(String),
}

/// Hand a history reply to the request it answers. The reply carries no
/// request id: the oldest request whose peer appears in the messages wins,
/// otherwise the oldest request overall.
fn deliver_history(pending: &mut PendingHistory, messages: Vec<IncomingMessage>, conn_id: Uuid) {
    pending.retain(|(_, reply)| !reply.is_closed());

    let idx = messages
        .first()
        .and_then(|first| {
            pending
                .iter()
                .position(|(peer, _)| first.sender_id == *peer || first.receiver_id == *peer)
        })
        .unwrap_or(0);

    match pending.remove(idx) {
        Some((peer_id, reply)) => {
            debug!("conn {} history for peer {}: {} messages", conn_id, peer_id, messages.len());
            let _ = reply.send(messages);
        }
        None => debug!("conn {} unsolicited history reply dropped", conn_id),
    }
}

async fn handle_frame(text: &str, events: &mpsc::Sender<SocketEvent>, conn_id: Uuid) -> FrameAction {
    let packet = match EnginePacket::decode(text) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("conn {} bad frame: {} -- raw: {}", conn_id, e, preview(text));
            return FrameAction::Continue;
        }
    };

    let payload = match packet {
        EnginePacket::Ping(data) => return FrameAction::Reply(EnginePacket::Pong(data).encode()),
        EnginePacket::Close => return FrameAction::Close("server sent close".to_string()),
        EnginePacket::Message(payload) => payload,
        _ => return FrameAction::Continue,
    };

    match SocketPacket::decode(&payload) {
        Ok(SocketPacket::Event { name, args, .. }) if name == MESSAGE_EVENT => {
            match parse_message(args.into_iter().next()) {
                Ok(message) => {
                    if events.send(SocketEvent::Message(message)).await.is_err() {
                        return FrameAction::Close("event receiver dropped".to_string());
                    }
                }
                Err(e) => warn!("conn {} dropping message event: {}", conn_id, e),
            }
            FrameAction::Continue
        }
        Ok(SocketPacket::Event { name, args, .. }) if name == HISTORY_REPLY_EVENT => {
            FrameAction::History(parse_history(args.into_iter().next(), conn_id))
        }
        Ok(SocketPacket::Event { name, .. }) => {
            trace!("conn {} ignoring event '{}'", conn_id, name);
            FrameAction::Continue
        }
        Ok(SocketPacket::Disconnect { .. }) => {
            FrameAction::Close("server disconnected the namespace".to_string())
        }
        Ok(other) => {
            debug!("conn {} ignoring packet {:?}", conn_id, other);
            FrameAction::Continue
        }
        Err(e) => {
            warn!("conn {} bad socket.io packet: {} -- raw: {}", conn_id, e, preview(&payload));
            FrameAction::Continue
        }
    }
}

/// Engine.IO open, Socket.IO connect on the default namespace, then register
/// the service identity. Returns the Socket.IO sid and the liveness window.
async fn handshake(ws: &mut WsStream, service_id: PeerId) -> Result<(String, Duration), ClientError> {
    let open = loop {
        match next_packet(ws).await? {
            EnginePacket::Open(open) => break open,
            other => debug!("Ignoring {:?} before open", other),
        }
    };

    ws.send(Message::Text(SocketPacket::connect().to_frame().into()))
        .await?;

    let sid = loop {
        match next_packet(ws).await? {
            EnginePacket::Message(payload) => match SocketPacket::decode(&payload)? {
                SocketPacket::Connect { data, .. } => {
                    break data
                        .as_ref()
                        .and_then(|d| d.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| open.sid.clone());
                }
                SocketPacket::ConnectError { data, .. } => {
                    return Err(ClientError::Handshake(data.to_string()));
                }
                other => debug!("Ignoring {:?} before connect", other),
            },
            EnginePacket::Ping(data) => {
                ws.send(Message::Text(EnginePacket::Pong(data).encode().into()))
                    .await?;
            }
            EnginePacket::Close => {
                return Err(ClientError::Handshake("server closed during handshake".into()));
            }
            _ => {}
        }
    };

    let register = SocketPacket::event(REGISTER_EVENT, vec![Value::from(service_id)]);
    ws.send(Message::Text(register.to_frame().into())).await?;

    let liveness = Duration::from_millis(open.ping_interval + open.ping_timeout);
    Ok((sid, liveness))
}

async fn next_packet(ws: &mut WsStream) -> Result<EnginePacket, ClientError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(EnginePacket::decode(text.as_str())?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Handshake("connection closed".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Chat payload as it comes off the wire; ids may be numbers or strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    id: Option<Value>,
    sender_id: Option<Value>,
    receiver_id: Option<Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
}

fn parse_message(arg: Option<Value>) -> Result<IncomingMessage, ClientError> {
    let arg = arg.ok_or_else(|| ClientError::MalformedEvent("missing payload".into()))?;
    let payload: MessagePayload =
        serde_json::from_value(arg).map_err(|e| ClientError::MalformedEvent(e.to_string()))?;

    let sender_id = payload
        .sender_id
        .as_ref()
        .and_then(peer_id)
        .ok_or_else(|| ClientError::MalformedEvent("missing senderId".into()))?;
    let receiver_id = payload
        .receiver_id
        .as_ref()
        .and_then(peer_id)
        .ok_or_else(|| ClientError::MalformedEvent("missing receiverId".into()))?;

    let created_at = payload.created_at.as_deref().and_then(|raw| {
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            debug!("Unparseable createdAt '{}', using arrival time", raw);
        }
        parsed
    });

    Ok(IncomingMessage {
        id: payload.id.as_ref().and_then(peer_id),
        sender_id,
        receiver_id,
        text: payload.text.unwrap_or_default(),
        created_at,
        sender_name: payload.sender_name,
    })
}

/// Decode a history reply, skipping entries that are not valid messages.
fn parse_history(arg: Option<Value>, conn_id: Uuid) -> Vec<IncomingMessage> {
    let Some(Value::Array(items)) = arg else {
        warn!("conn {} history reply is not an array", conn_id);
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            parse_message(Some(item))
                .map_err(|e| warn!("conn {} dropping history entry: {}", conn_id, e))
                .ok()
        })
        .collect()
}

fn preview(raw: &str) -> String {
    raw.chars().take(200).collect()
}

fn peer_id(value: &Value) -> Option<PeerId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
