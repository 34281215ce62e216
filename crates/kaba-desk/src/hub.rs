use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kaba_client::{RestClient, SocketEvent};
use kaba_registry::{ConversationRegistry, Thread};
use kaba_types::api::StatusResponse;
use kaba_types::events::DeskEvent;
use kaba_types::models::UserRecord;
use kaba_types::{Conversation, IncomingMessage, PeerId};

#[derive(Debug, Error)]
#[error("conversation hub has shut down")]
pub struct HubClosed;

/// Where a snapshot batch came from. Only the `/users` fetch drives the banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Users,
    RecentConversations,
}

/// Everything the rendering layer needs at once.
#[derive(Debug, Clone)]
pub struct HubView {
    pub service_id: PeerId,
    pub conversations: Vec<Conversation>,
    pub active: Option<PeerId>,
    pub banner: Option<String>,
    pub socket_online: bool,
    pub snapshot_loaded: bool,
}

impl HubView {
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            service_id: self.service_id,
            socket_online: self.socket_online,
            snapshot_loaded: self.snapshot_loaded,
            banner: self.banner.clone(),
            conversations: self.conversations.len(),
            total_unread: self
                .conversations
                .iter()
                .map(|c| u64::from(c.unread_count))
                .sum(),
        }
    }

    /// Events that bring a fresh subscriber up to date.
    pub fn initial_events(&self) -> Vec<DeskEvent> {
        let mut events = vec![DeskEvent::Ready {
            service_id: self.service_id,
        }];
        events.extend(self.resync_events());
        events
    }

    /// The current state without the greeting, for a subscriber that fell behind.
    pub fn resync_events(&self) -> Vec<DeskEvent> {
        vec![
            DeskEvent::Conversations {
                conversations: self.conversations.clone(),
                active: self.active,
            },
            DeskEvent::Banner {
                message: self.banner.clone(),
            },
            DeskEvent::Connection {
                online: self.socket_online,
            },
        ]
    }
}

enum HubCommand {
    Snapshot {
        source: SnapshotSource,
        result: Result<Vec<UserRecord>, String>,
    },
    Socket(SocketEvent),
    View {
        reply: oneshot::Sender<HubView>,
    },
    Search {
        query: String,
        reply: oneshot::Sender<Vec<Conversation>>,
    },
    Open {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Close,
    Delete {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    DeleteSettled {
        token: Uuid,
        peer_id: PeerId,
        result: Result<(), String>,
    },
    SetLabel {
        peer_id: PeerId,
        label: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    LoadThread {
        peer_id: PeerId,
        history: Vec<IncomingMessage>,
        reply: oneshot::Sender<Vec<IncomingMessage>>,
    },
}

/// Handle to the task that owns the conversation registry.
///
/// Every mutation (snapshot results, socket events, user actions, delete
/// outcomes) is queued and applied by that single task, one at a time, so the
/// registry itself needs no locking. Changes are fanned out on a broadcast
/// channel as `DeskEvent`s.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
    updates: broadcast::Sender<DeskEvent>,
    rest: RestClient,
}

impl Hub {
    pub fn spawn(registry: ConversationRegistry, rest: RestClient, rollback_failed_deletes: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(256);

        let state = HubState {
            registry,
            rest: rest.clone(),
            self_tx: tx.downgrade(),
            updates: updates.clone(),
            banner: None,
            socket_online: false,
            snapshot_loaded: false,
            rollback_failed_deletes,
            threads: HashMap::new(),
        };
        tokio::spawn(state.run(rx));

        Self { tx, updates, rest }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeskEvent> {
        self.updates.subscribe()
    }

    /// Fetch the bulk snapshot in the background. Results are merged into
    /// whatever live state already exists when they land.
    pub fn refresh(&self) {
        let rest = self.rest.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let (users, recent) =
                tokio::join!(rest.fetch_users(), rest.fetch_recent_conversations());
            let _ = tx.send(HubCommand::Snapshot {
                source: SnapshotSource::Users,
                result: users.map_err(|e| e.to_string()),
            });
            let _ = tx.send(HubCommand::Snapshot {
                source: SnapshotSource::RecentConversations,
                result: recent.map_err(|e| e.to_string()),
            });
        });
    }

    pub fn socket_event(&self, event: SocketEvent) -> Result<(), HubClosed> {
        self.tx.send(HubCommand::Socket(event)).map_err(|_| HubClosed)
    }

    pub async fn view(&self) -> Result<HubView, HubClosed> {
        self.ask(|reply| HubCommand::View { reply }).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, HubClosed> {
        Ok(self.view().await?.conversations)
    }

    pub async fn search(&self, query: String) -> Result<Vec<Conversation>, HubClosed> {
        self.ask(|reply| HubCommand::Search { query, reply }).await
    }

    pub async fn open(&self, peer_id: PeerId) -> Result<bool, HubClosed> {
        self.ask(|reply| HubCommand::Open { peer_id, reply }).await
    }

    pub fn close(&self) -> Result<(), HubClosed> {
        self.tx.send(HubCommand::Close).map_err(|_| HubClosed)
    }

    /// Remove locally right away; the backend delete runs in the background.
    /// Returns false for unknown peers.
    pub async fn delete(&self, peer_id: PeerId) -> Result<bool, HubClosed> {
        self.ask(|reply| HubCommand::Delete { peer_id, reply }).await
    }

    pub async fn set_label(&self, peer_id: PeerId, label: Option<String>) -> Result<bool, HubClosed> {
        self.ask(|reply| HubCommand::SetLabel { peer_id, label, reply })
            .await
    }

    /// Merge a freshly fetched history into the peer's thread and return the
    /// thread as it now stands. Live messages already held are not duplicated.
    pub async fn load_thread(
        &self,
        peer_id: PeerId,
        history: Vec<IncomingMessage>,
    ) -> Result<Vec<IncomingMessage>, HubClosed> {
        self.ask(|reply| HubCommand::LoadThread { peer_id, history, reply })
            .await
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }
}

/// Feed socket events into the hub until the socket side hangs up.
pub async fn pump_socket_events(hub: Hub, mut events: mpsc::Receiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        if hub.socket_event(event).is_err() {
            break;
        }
    }
    debug!("Socket event pump stopped");
}

struct HubState {
    registry: ConversationRegistry,
    rest: RestClient,
    self_tx: mpsc::WeakUnboundedSender<HubCommand>,
    updates: broadcast::Sender<DeskEvent>,
    banner: Option<String>,
    socket_online: bool,
    snapshot_loaded: bool,
    rollback_failed_deletes: bool,
    /// Threads loaded so far; live messages are appended to these.
    threads: HashMap<PeerId, Thread>,
}

impl HubState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        debug!("Conversation hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Snapshot { source, result } => self.on_snapshot(source, result),

            HubCommand::Socket(event) => self.on_socket_event(event),

            HubCommand::View { reply } => {
                let _ = reply.send(self.view());
            }

            HubCommand::Search { query, reply } => {
                let _ = reply.send(self.registry.search(&query));
            }

            HubCommand::Open { peer_id, reply } => {
                let known = self.registry.open_conversation(peer_id);
                debug!("Opened conversation with {} (known: {})", peer_id, known);
                let _ = reply.send(known);
                self.publish();
            }

            HubCommand::Close => {
                self.registry.close_conversation();
                self.publish();
            }

            HubCommand::Delete { peer_id, reply } => {
                let Some(token) = self.registry.begin_delete(peer_id) else {
                    let _ = reply.send(false);
                    return;
                };
                let _ = reply.send(true);
                self.threads.remove(&peer_id);
                self.publish();
                self.spawn_backend_delete(token, peer_id);
            }

            HubCommand::DeleteSettled {
                token,
                peer_id,
                result,
            } => self.on_delete_settled(token, peer_id, result),

            HubCommand::SetLabel {
                peer_id,
                label,
                reply,
            } => {
                let known = self.registry.set_label(peer_id, label);
                let _ = reply.send(known);
                if known {
                    self.publish();
                }
            }

            HubCommand::LoadThread {
                peer_id,
                history,
                reply,
            } => {
                let thread = match self.threads.remove(&peer_id) {
                    Some(mut thread) => {
                        thread.reload(history);
                        thread
                    }
                    None => Thread::from_history(peer_id, history),
                };
                debug!("Thread with {} holds {} messages", peer_id, thread.len());
                let _ = reply.send(thread.messages().to_vec());
                self.threads.insert(peer_id, thread);
            }
        }
    }

    fn on_snapshot(&mut self, source: SnapshotSource, result: Result<Vec<UserRecord>, String>) {
        match result {
            Ok(records) => {
                info!("Loaded {} rows from {:?}", records.len(), source);
                self.registry.load_snapshot(records);
                if source == SnapshotSource::Users {
                    self.snapshot_loaded = true;
                    self.set_banner(None);
                }
                self.publish();
            }
            Err(e) if source == SnapshotSource::Users => {
                warn!("Snapshot fetch failed: {}", e);
                self.set_banner(Some(format!("Could not load conversations: {}", e)));
            }
            Err(e) => {
                warn!("Recent conversations fetch failed: {}", e);
            }
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected { sid } => {
                debug!("Event stream up (sid {})", sid);
                self.set_socket_online(true);
            }
            SocketEvent::Disconnected { reason } => {
                debug!("Event stream down: {}", reason);
                self.set_socket_online(false);
            }
            SocketEvent::Message(message) => match self.registry.apply_incoming_message(&message) {
                Ok(peer_id) => {
                    debug!("Message for peer {} applied", peer_id);
                    let fresh = self
                        .threads
                        .get_mut(&peer_id)
                        .is_none_or(|thread| thread.push(message.clone()));
                    self.publish();
                    if fresh {
                        let _ = self.updates.send(DeskEvent::Message { peer_id, message });
                    }
                }
                Err(e) => warn!("Ignoring message: {}", e),
            },
        }
    }

    fn spawn_backend_delete(&self, token: Uuid, peer_id: PeerId) {
        let rest = self.rest.clone();
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = rest
                .delete_conversation(peer_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(HubCommand::DeleteSettled {
                token,
                peer_id,
                result,
            });
        });
    }

    fn on_delete_settled(&mut self, token: Uuid, peer_id: PeerId, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.registry.commit_delete(token);
                info!("Conversation with {} deleted", peer_id);
            }
            Err(e) if self.rollback_failed_deletes => {
                warn!("Backend delete for {} failed ({}), rolling back", peer_id, e);
                if self.registry.rollback_delete(token) {
                    self.publish();
                }
            }
            Err(e) => {
                warn!("Backend delete for {} failed ({}), keeping local removal", peer_id, e);
                self.registry.commit_delete(token);
            }
        }
    }

    fn set_banner(&mut self, banner: Option<String>) {
        if self.banner != banner {
            self.banner = banner.clone();
            let _ = self.updates.send(DeskEvent::Banner { message: banner });
        }
    }

    fn set_socket_online(&mut self, online: bool) {
        if self.socket_online != online {
            self.socket_online = online;
            let _ = self.updates.send(DeskEvent::Connection { online });
        }
    }

    fn view(&self) -> HubView {
        HubView {
            service_id: self.registry.service_id(),
            conversations: self.registry.conversations().to_vec(),
            active: self.registry.active(),
            banner: self.banner.clone(),
            socket_online: self.socket_online,
            snapshot_loaded: self.snapshot_loaded,
        }
    }

    fn publish(&self) {
        // No subscribers is fine.
        let _ = self.updates.send(DeskEvent::Conversations {
            conversations: self.registry.conversations().to_vec(),
            active: self.registry.active(),
        });
    }
}
