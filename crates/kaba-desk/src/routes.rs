use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use tracing::{error, warn};

use kaba_client::{ClientError, MessageSender, RestClient};
use kaba_types::PeerId;
use kaba_types::api::{
    CreateLabelRequest, DeleteResponse, ImageQuery, ImageSentResponse, SearchQuery,
    SendMessageRequest, SetLabelRequest, ThreadResponse,
};

use crate::gateway;
use crate::hub::{Hub, HubClosed};

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub rest: RestClient,
    pub sender: MessageSender,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/conversations", get(list_conversations))
        .route("/conversations/search", get(search_conversations))
        .route("/conversations/close", post(close_conversation))
        .route("/conversations/{peer_id}", delete(delete_conversation))
        .route("/conversations/{peer_id}/open", post(open_conversation))
        .route("/conversations/{peer_id}/label", put(set_label))
        .route("/conversations/{peer_id}/messages", get(thread).post(send_message))
        .route("/conversations/{peer_id}/images", post(send_image))
        .route("/labels", get(list_labels).post(create_label))
        .route("/stats", get(stats))
        .route("/refresh", post(refresh))
        .route("/events", get(events_upgrade))
        .with_state(state)
}

fn hub_down(e: HubClosed) -> StatusCode {
    error!("{}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn backend_failed(e: ClientError) -> StatusCode {
    warn!("Backend call failed: {}", e);
    if e.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let view = state.hub.view().await.map_err(hub_down)?;
    Ok(Json(view.status()))
}

async fn list_conversations(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let conversations = state.hub.conversations().await.map_err(hub_down)?;
    Ok(Json(conversations))
}

async fn search_conversations(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let hits = state.hub.search(query.q).await.map_err(hub_down)?;
    Ok(Json(hits))
}

/// Unknown peers are still opened so their first message arrives read.
async fn open_conversation(
    State(state): State<AppState>,
    Path(peer_id): Path<PeerId>,
) -> Result<impl IntoResponse, StatusCode> {
    state.hub.open(peer_id).await.map_err(hub_down)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_conversation(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    state.hub.close().map_err(hub_down)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(peer_id): Path<PeerId>,
) -> Result<impl IntoResponse, StatusCode> {
    if !state.hub.delete(peer_id).await.map_err(hub_down)? {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(DeleteResponse {
            peer_id,
            removed: true,
        }),
    ))
}

async fn set_label(
    State(state): State<AppState>,
    Path(peer_id): Path<PeerId>,
    Json(req): Json<SetLabelRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let label = req.label.filter(|l| !l.trim().is_empty());
    if !state.hub.set_label(peer_id, label).await.map_err(hub_down)? {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// The registry is updated when the server echoes the message back.
async fn send_message(
    State(state): State<AppState>,
    Path(peer_id): Path<PeerId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.text.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.sender.send(peer_id, req.text).map_err(|e| {
        warn!("Message to {} not sent: {}", peer_id, e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(StatusCode::ACCEPTED)
}

/// Message history with one peer, fetched over the socket and merged with
/// whatever arrived live since the thread was last loaded.
async fn thread(
    State(state): State<AppState>,
    Path(peer_id): Path<PeerId>,
) -> Result<impl IntoResponse, StatusCode> {
    let history = state.sender.fetch_history(peer_id).await.map_err(|e| match e {
        ClientError::Offline => {
            warn!("History for {} unavailable: {}", peer_id, e);
            StatusCode::SERVICE_UNAVAILABLE
        }
        other => backend_failed(other),
    })?;
    let messages = state
        .hub
        .load_thread(peer_id, history)
        .await
        .map_err(hub_down)?;
    Ok(Json(ThreadResponse { peer_id, messages }))
}

/// Upload the raw request body, then send its URL as a chat message.
async fn send_image(
    State(state): State<AppState>,
    Path(peer_id): Path<PeerId>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    if body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    // Don't leave an orphaned upload behind when the message can't go out.
    if !state.sender.is_online() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let file_name = query.name.as_deref().unwrap_or("image");

    let url = state
        .rest
        .upload_image(file_name, content_type, body.to_vec())
        .await
        .map_err(backend_failed)?;
    state.sender.send(peer_id, url.clone()).map_err(|e| {
        warn!("Image for {} uploaded but not sent: {}", peer_id, e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok((StatusCode::ACCEPTED, Json(ImageSentResponse { peer_id, url })))
}

async fn list_labels(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let labels = state.rest.fetch_labels().await.map_err(backend_failed)?;
    Ok(Json(labels))
}

async fn create_label(
    State(state): State<AppState>,
    Json(req): Json<CreateLabelRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let label = state.rest.create_label(name).await.map_err(backend_failed)?;
    Ok((StatusCode::CREATED, Json(label)))
}

async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let stats = state.rest.fetch_stats().await.map_err(backend_failed)?;
    Ok(Json(stats))
}

async fn refresh(State(state): State<AppState>) -> StatusCode {
    state.hub.refresh();
    StatusCode::ACCEPTED
}

async fn events_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway::handle_connection(socket, state.hub, state.sender))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use kaba_client::{Session, SocketClient, SocketEvent, SocketHandle};
    use kaba_registry::ConversationRegistry;
    use kaba_types::IncomingMessage;

    use super::*;

    const ME: PeerId = 92109474;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn backend() -> Router {
        Router::new()
            .route(
                "/users",
                get(|| async {
                    Json(json!([
                        { "id": 1, "senderName": "Awa", "lastMessage": "hello there", "updatedAt": "2025-03-01T10:00:00Z" },
                        { "id": 2, "senderName": "Moussa", "lastMessage": "goodbye", "updatedAt": "2025-03-01T11:00:00Z" }
                    ]))
                }),
            )
            .route(
                "/conversations/{id}",
                get(|Path(_id): Path<i64>| async { Json(json!([])) })
                    .delete(|Path(_id): Path<i64>| async { StatusCode::NO_CONTENT }),
            )
            .route(
                "/labels",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            )
            .route(
                "/stats/{id}",
                get(|Path(_id): Path<i64>| async {
                    Json(json!({ "totalConversations": 2, "totalMessages": 9, "todayMessages": 1, "activeUsers": 2 }))
                }),
            )
    }

    /// Desk wired to a fake backend. The socket points at the same fake,
    /// which has no socket.io endpoint, so the sender stays offline.
    async fn desk() -> (Router, Hub, SocketHandle) {
        let addr = serve(backend()).await;
        let base = format!("http://{}", addr);
        let session = Arc::new(
            Session::new(&base, &base, ME)
                .unwrap()
                .with_timeout(Duration::from_secs(5)),
        );
        let rest = RestClient::new(session.clone()).unwrap();
        let hub = Hub::spawn(ConversationRegistry::new(ME), rest.clone(), false);

        let (events_tx, _events_rx) = tokio::sync::mpsc::channel(16);
        let socket = SocketClient::new(session).spawn(events_tx, CancellationToken::new());

        let state = AppState {
            hub: hub.clone(),
            rest,
            sender: socket.sender(),
        };
        (router(state), hub, socket)
    }

    async fn loaded_desk() -> (Router, Hub, SocketHandle) {
        let (app, hub, socket) = desk().await;
        hub.refresh();
        for _ in 0..100 {
            if hub.view().await.unwrap().snapshot_loaded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        (app, hub, socket)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn lists_conversations_by_recency() {
        let (app, _hub, socket) = loaded_desk().await;

        let (status, body) = call(&app, Method::GET, "/conversations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["peerId"], 2);
        assert_eq!(body[1]["peerId"], 1);
        assert_eq!(body[0]["displayName"], "Moussa");

        let (status, body) = call(&app, Method::GET, "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshotLoaded"], true);
        assert_eq!(body["conversations"], 2);
        assert_eq!(body["socketOnline"], false);
        assert!(body.get("snapshot_loaded").is_none());

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn search_matches_name_and_last_message() {
        let (app, _hub, socket) = loaded_desk().await;

        let (_, body) = call(&app, Method::GET, "/conversations/search?q=HELLO", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["peerId"], 1);

        let (_, body) = call(&app, Method::GET, "/conversations/search?q=mous", None).await;
        assert_eq!(body[0]["peerId"], 2);

        let (_, body) = call(&app, Method::GET, "/conversations/search", None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn open_and_delete_flow() {
        let (app, hub, socket) = loaded_desk().await;

        let (status, _) = call(&app, Method::POST, "/conversations/1/open", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(hub.view().await.unwrap().active, Some(1));

        let (status, _) = call(&app, Method::POST, "/conversations/close", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, Method::DELETE, "/conversations/2", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["removed"], true);
        assert_eq!(body["peerId"], 2);

        let (status, _) = call(&app, Method::DELETE, "/conversations/2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, Method::GET, "/conversations", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn label_updates_require_known_peer() {
        let (app, _hub, socket) = loaded_desk().await;

        let (status, _) = call(&app, Method::PUT, "/conversations/1/label", Some(json!({ "label": "VIP" }))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&app, Method::PUT, "/conversations/404/label", Some(json!({ "label": "VIP" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, Method::GET, "/conversations", None).await;
        assert_eq!(body[1]["label"], "VIP");

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn sending_validates_text_and_needs_socket() {
        let (app, _hub, socket) = desk().await;

        let (status, _) = call(&app, Method::POST, "/conversations/1/messages", Some(json!({ "text": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::POST, "/conversations/1/messages", Some(json!({ "text": "hi" }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn history_needs_socket() {
        let (app, _hub, socket) = desk().await;

        let (status, _) = call(&app, Method::GET, "/conversations/1/messages", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn image_send_validates_body_and_needs_socket() {
        let (app, _hub, socket) = desk().await;

        let empty = Request::builder()
            .method(Method::POST)
            .uri("/conversations/1/images?name=photo.png")
            .header("content-type", "image/png")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(empty).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let png = Request::builder()
            .method(Method::POST)
            .uri("/conversations/1/images?name=photo.png")
            .header("content-type", "image/png")
            .body(Body::from("PNGDATA"))
            .unwrap();
        let resp = app.clone().oneshot(png).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn backend_failures_map_to_bad_gateway() {
        let (app, _hub, socket) = desk().await;

        let (status, _) = call(&app, Method::GET, "/labels", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, body) = call(&app, Method::GET, "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalMessages"], 9);

        let (status, _) = call(&app, Method::POST, "/labels", Some(json!({ "name": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        socket.disconnect().await;
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn events_socket_sends_state_then_updates() {
        let (app, hub, socket) = desk().await;
        let addr = serve(app).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/events", addr))
            .await
            .unwrap();

        let ready = next_json(&mut ws).await;
        assert_eq!(ready["type"], "Ready");
        assert_eq!(ready["data"]["serviceId"], ME);
        assert_eq!(next_json(&mut ws).await["type"], "Conversations");
        assert_eq!(next_json(&mut ws).await["type"], "Banner");
        assert_eq!(next_json(&mut ws).await["type"], "Connection");

        hub.socket_event(SocketEvent::Message(IncomingMessage {
            id: None,
            sender_id: 7,
            receiver_id: ME,
            text: "salut".into(),
            created_at: None,
            sender_name: None,
        }))
        .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(5), next_json(&mut ws))
            .await
            .unwrap();
        assert_eq!(update["type"], "Conversations");
        assert_eq!(update["data"]["conversations"][0]["peerId"], 7);
        assert_eq!(update["data"]["conversations"][0]["unreadCount"], 1);

        let pushed = tokio::time::timeout(Duration::from_secs(5), next_json(&mut ws))
            .await
            .unwrap();
        assert_eq!(pushed["type"], "Message");
        assert_eq!(pushed["data"]["peerId"], 7);
        assert_eq!(pushed["data"]["message"]["text"], "salut");

        socket.disconnect().await;
    }

    #[tokio::test]
    async fn events_socket_accepts_open_command() {
        let (app, hub, socket) = desk().await;
        let addr = serve(app).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/events", addr))
            .await
            .unwrap();
        for _ in 0..4 {
            next_json(&mut ws).await;
        }

        ws.send(Message::Text(r#"{"type":"Open","data":{"peerId":7}}"#.into()))
            .await
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(5), next_json(&mut ws))
            .await
            .unwrap();
        assert_eq!(update["type"], "Conversations");
        assert_eq!(update["data"]["active"], 7);
        assert_eq!(hub.view().await.unwrap().active, Some(7));

        socket.disconnect().await;
    }
}
