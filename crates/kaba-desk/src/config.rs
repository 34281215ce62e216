use std::time::Duration;

use anyhow::Context;

use kaba_client::Session;
use kaba_types::PeerId;

/// Customer-service account used in message routing.
pub const DEFAULT_SERVICE_ID: PeerId = 92109474;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub socket_url: String,
    pub service_id: PeerId,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    /// Restore a tentatively deleted conversation when the backend refuses
    /// the delete. Off by default: the local removal stands.
    pub rollback_failed_deletes: bool,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let service_id: PeerId = get("KABA_SERVICE_ID", &DEFAULT_SERVICE_ID.to_string())
            .parse()
            .context("KABA_SERVICE_ID must be an integer")?;
        let timeout_secs: u64 = get("KABA_REQUEST_TIMEOUT_SECS", "10")
            .parse()
            .context("KABA_REQUEST_TIMEOUT_SECS must be a number of seconds")?;
        if timeout_secs == 0 {
            anyhow::bail!("KABA_REQUEST_TIMEOUT_SECS must be at least 1");
        }
        let port: u16 = get("KABA_PORT", "3000")
            .parse()
            .context("KABA_PORT must be a port number")?;

        Ok(Self {
            api_url: get("KABA_API_URL", "http://localhost:7000"),
            socket_url: get("KABA_SOCKET_URL", "http://localhost:5000"),
            service_id,
            api_token: lookup("KABA_API_TOKEN"),
            request_timeout: Duration::from_secs(timeout_secs),
            rollback_failed_deletes: matches!(
                get("KABA_ROLLBACK_FAILED_DELETES", "false").to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            ),
            host: get("KABA_HOST", "127.0.0.1"),
            port,
        })
    }

    pub fn session(&self) -> anyhow::Result<Session> {
        let session = Session::new(&self.api_url, &self.socket_url, self.service_id)
            .context("invalid backend url")?
            .with_token(self.api_token.clone())
            .with_timeout(self.request_timeout);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.service_id, DEFAULT_SERVICE_ID);
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert_eq!(cfg.port, 3000);
        assert!(!cfg.rollback_failed_deletes);
        assert!(cfg.api_token.is_none());
        assert!(cfg.session().is_ok());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("KABA_SERVICE_ID", "42"),
            ("KABA_REQUEST_TIMEOUT_SECS", "3"),
            ("KABA_ROLLBACK_FAILED_DELETES", "TRUE"),
            ("KABA_API_TOKEN", "abc"),
            ("KABA_SOCKET_URL", "https://chat.example.com"),
        ])
        .unwrap();
        assert_eq!(cfg.service_id, 42);
        assert_eq!(cfg.request_timeout, Duration::from_secs(3));
        assert!(cfg.rollback_failed_deletes);

        let session = cfg.session().unwrap();
        assert_eq!(session.token.as_deref(), Some("abc"));
        assert_eq!(session.socket_endpoint().unwrap().scheme(), "wss");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(config(&[("KABA_SERVICE_ID", "cs-desk")]).is_err());
        assert!(config(&[("KABA_REQUEST_TIMEOUT_SECS", "0")]).is_err());
        assert!(config(&[("KABA_PORT", "99999")]).is_err());
        assert!(config(&[("KABA_API_URL", "not a url")]).unwrap().session().is_err());
    }
}
