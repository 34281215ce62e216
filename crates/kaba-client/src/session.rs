use std::time::Duration;

use url::Url;

use kaba_types::PeerId;

use crate::error::ClientError;

/// Engine.IO protocol revision spoken by the socket client.
pub const ENGINE_IO_VERSION: u8 = 4;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to talk to the backend on behalf of one service identity.
/// Built once at start-up and shared by the REST and socket clients.
#[derive(Debug, Clone)]
pub struct Session {
    pub api_url: Url,
    pub socket_url: Url,
    pub service_id: PeerId,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl Session {
    pub fn new(api_url: &str, socket_url: &str, service_id: PeerId) -> Result<Self, ClientError> {
        let api_url = Url::parse(api_url)?;
        let socket_url = Url::parse(socket_url)?;

        for url in [&api_url, &socket_url] {
            if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
                return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
            }
        }

        Ok(Self {
            api_url,
            socket_url,
            service_id,
            token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// REST endpoint under the API base, e.g. `endpoint("users")`.
    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let base = self.api_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}/{}", base, path.trim_start_matches('/')))?)
    }

    /// WebSocket URL for the Socket.IO endpoint, with the transport forced to
    /// websocket (no long-polling upgrade dance).
    pub fn socket_endpoint(&self) -> Result<Url, ClientError> {
        let mut url = self.socket_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ClientError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::UnsupportedScheme(scheme.to_string()))?;

        let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(Some(&format!("EIO={}&transport=websocket", ENGINE_IO_VERSION)));
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let session = Session::new("http://localhost:7000/", "http://localhost:5000", 1).unwrap();
        assert_eq!(
            session.endpoint("/conversations/12").unwrap().as_str(),
            "http://localhost:7000/conversations/12"
        );

        let prefixed = Session::new("https://api.example.com/v1", "https://x", 1).unwrap();
        assert_eq!(
            prefixed.endpoint("users").unwrap().as_str(),
            "https://api.example.com/v1/users"
        );
    }

    #[test]
    fn socket_endpoint_maps_scheme_and_adds_query() {
        let session = Session::new("http://a", "https://chat.example.com/", 1).unwrap();
        assert_eq!(
            session.socket_endpoint().unwrap().as_str(),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );

        let plain = Session::new("http://a", "http://127.0.0.1:5000", 1).unwrap();
        assert_eq!(
            plain.socket_endpoint().unwrap().as_str(),
            "ws://127.0.0.1:5000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn rejects_unknown_schemes_and_blank_tokens() {
        assert!(matches!(
            Session::new("ftp://a", "http://b", 1),
            Err(ClientError::UnsupportedScheme(_))
        ));

        let session = Session::new("http://a", "http://b", 1)
            .unwrap()
            .with_token(Some("  ".into()));
        assert!(session.token.is_none());
    }
}
