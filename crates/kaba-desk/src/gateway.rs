use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, trace, warn};
use uuid::Uuid;

use kaba_client::MessageSender;
use kaba_types::events::{DeskCommand, DeskEvent};

use crate::hub::Hub;

/// Server pings every 15 seconds; two missed pongs drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one rendering client on `/events`: push the current state, then
/// stream every hub update and accept `DeskCommand`s until either side goes.
pub async fn handle_connection(socket: WebSocket, hub: Hub, outbound: MessageSender) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the view so nothing falls between the two.
    let mut updates = hub.subscribe();
    let view = match hub.view().await {
        Ok(view) => view,
        Err(e) => {
            warn!("[{}] {}", conn_id, e);
            return;
        }
    };
    for event in view.initial_events() {
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
    }

    info!("[{}] Desk client connected", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let hub_send = hub.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                events = next_events(&mut updates, &hub_send, conn_id) => {
                    let Some(events) = events else { break };
                    for event in &events {
                        if send_event(&mut sender, event).await.is_err() {
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("[{}] Heartbeat timeout, dropping connection", conn_id);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let hub_recv = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<DeskCommand>(text.as_str()) {
                    Ok(cmd) => handle_command(&hub_recv, &outbound, cmd, conn_id).await,
                    Err(e) => {
                        let raw: String = text.as_str().chars().take(200).collect();
                        warn!("[{}] Bad command: {} -- raw: {}", conn_id, e, raw);
                    }
                },
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("[{}] Desk client disconnected", conn_id);
}

/// Wait for the next hub update. A subscriber that lagged skips its stale
/// backlog and gets the current state instead. `None` once the hub is gone.
async fn next_events(
    updates: &mut broadcast::Receiver<DeskEvent>,
    hub: &Hub,
    conn_id: Uuid,
) -> Option<Vec<DeskEvent>> {
    match updates.recv().await {
        Ok(event) => Some(vec![event]),
        Err(RecvError::Lagged(n)) => {
            warn!("[{}] Update receiver lagged by {} events, resending state", conn_id, n);
            // Move to the tail before reading the view so nothing falls between.
            *updates = updates.resubscribe();
            match hub.view().await {
                Ok(view) => Some(view.resync_events()),
                Err(e) => {
                    warn!("[{}] {}", conn_id, e);
                    None
                }
            }
        }
        Err(RecvError::Closed) => None,
    }
}

async fn handle_command(hub: &Hub, outbound: &MessageSender, cmd: DeskCommand, conn_id: Uuid) {
    match cmd {
        DeskCommand::Open { peer_id } => {
            if let Err(e) = hub.open(peer_id).await {
                warn!("[{}] {}", conn_id, e);
            }
        }
        DeskCommand::Close => {
            if let Err(e) = hub.close() {
                warn!("[{}] {}", conn_id, e);
            }
        }
        DeskCommand::Send { peer_id, text } => {
            if text.trim().is_empty() {
                return;
            }
            if let Err(e) = outbound.send(peer_id, text) {
                warn!("[{}] Message to {} not sent: {}", conn_id, peer_id, e);
            } else {
                trace!("[{}] Queued message to {}", conn_id, peer_id);
            }
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &DeskEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode desk event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kaba_client::{RestClient, Session, SocketEvent};
    use kaba_registry::ConversationRegistry;
    use kaba_types::IncomingMessage;

    use super::*;

    const ME: i64 = 92109474;

    fn offline_hub() -> Hub {
        let session = Arc::new(
            Session::new("http://127.0.0.1:1", "http://127.0.0.1:1", ME)
                .unwrap()
                .with_timeout(Duration::from_millis(200)),
        );
        Hub::spawn(ConversationRegistry::new(ME), RestClient::new(session).unwrap(), false)
    }

    #[tokio::test]
    async fn lagged_subscriber_gets_the_current_state() {
        let hub = offline_hub();
        let mut updates = hub.subscribe();
        let conn_id = Uuid::new_v4();

        for peer in 1..=300 {
            hub.socket_event(SocketEvent::Message(IncomingMessage {
                id: None,
                sender_id: peer,
                receiver_id: ME,
                text: format!("from {}", peer),
                created_at: None,
                sender_name: None,
            }))
            .unwrap();
        }
        // Commands are applied in order: once the view answers, every update is out.
        let view = hub.view().await.unwrap();
        assert_eq!(view.conversations.len(), 300);

        let events = next_events(&mut updates, &hub, conn_id).await.unwrap();
        let DeskEvent::Conversations { conversations, active } = &events[0] else {
            panic!("expected a listing first, got {:?}", events[0]);
        };
        let peers: Vec<_> = conversations.iter().map(|c| c.peer_id).collect();
        let expected: Vec<_> = view.conversations.iter().map(|c| c.peer_id).collect();
        assert_eq!(peers, expected);
        assert_eq!(*active, None);
        assert!(matches!(events[1], DeskEvent::Banner { message: None }));
        assert!(matches!(events[2], DeskEvent::Connection { online: false }));

        // The stale backlog is skipped: the next event is the one sent now.
        hub.close().unwrap();
        let events = next_events(&mut updates, &hub, conn_id).await.unwrap();
        assert_eq!(events.len(), 1);
        let DeskEvent::Conversations { conversations, .. } = &events[0] else {
            panic!("expected a listing, got {:?}", events[0]);
        };
        assert_eq!(conversations.len(), 300);
    }
}
