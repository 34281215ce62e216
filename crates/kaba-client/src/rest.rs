use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use kaba_types::PeerId;
use kaba_types::models::{DashboardStats, Label, UserRecord};

use crate::error::ClientError;
use crate::session::Session;

/// Thin REST client over the backend. Every request is bounded by the
/// session's request timeout and there is no retry: callers decide what a
/// failure means.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    session: Arc<Session>,
}

impl RestClient {
    pub fn new(session: Arc<Session>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(session.request_timeout)
            .connect_timeout(session.request_timeout)
            .build()?;
        Ok(Self { http, session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// `GET /users`: the bulk snapshot of everyone who has written to us.
    pub async fn fetch_users(&self) -> Result<Vec<UserRecord>, ClientError> {
        self.get_json("users").await
    }

    /// `GET /conversations/{serviceId}`: dashboard view with last messages.
    pub async fn fetch_recent_conversations(&self) -> Result<Vec<UserRecord>, ClientError> {
        self.get_json(&format!("conversations/{}", self.session.service_id))
            .await
    }

    /// `DELETE /conversations/{peerId}`. Best effort on the backend's side.
    pub async fn delete_conversation(&self, peer_id: PeerId) -> Result<(), ClientError> {
        let url = self.session.endpoint(&format!("conversations/{}", peer_id))?;
        debug!("DELETE {}", url);
        let resp = self.authorize(self.http.delete(url)).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn fetch_labels(&self) -> Result<Vec<Label>, ClientError> {
        self.get_json("labels").await
    }

    pub async fn create_label(&self, name: &str) -> Result<Label, ClientError> {
        let url = self.session.endpoint("labels")?;
        let resp = self
            .authorize(self.http.post(url))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    /// `POST /upload-image` as multipart field `file`. Returns the public URL,
    /// which is then sent as an ordinary chat message.
    pub async fn upload_image(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, ClientError> {
        let url = self.session.endpoint("upload-image")?;
        let part = Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(content_type)?;
        debug!("POST {} ({})", url, file_name);
        let resp = self
            .authorize(self.http.post(url))
            .multipart(Form::new().part("file", part))
            .send()
            .await?;
        let uploaded: UploadResponse = check_status(resp).await?.json().await?;
        Ok(uploaded.url)
    }

    /// `GET /stats/{serviceId}`
    pub async fn fetch_stats(&self) -> Result<DashboardStats, ClientError> {
        self.get_json(&format!("stats/{}", self.session.service_id))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.session.endpoint(path)?;
        debug!("GET {}", url);
        let resp = self.authorize(self.http.get(url)).send().await?;
        Ok(check_status(resp).await?.json().await?)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.session.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

async fn check_status(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let body = body.chars().take(200).collect::<String>();
    warn!("Backend returned {}: {}", status, body);
    Err(ClientError::Status { status, body })
}
