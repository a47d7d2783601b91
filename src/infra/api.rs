use reqwest::header::AUTHORIZATION;
use reqwest::{Method, Response, StatusCode};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::AppConfig;
use crate::infra::auth::Session;

/// Failures crossing the backend boundary. Validation failures never reach
/// this layer; they are rejected before a request is issued.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not authenticated")]
    Unauthorized,
    #[error("{0}")]
    Request(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Shared HTTP plumbing for every backend capability: base URL, anon key,
/// bearer injection and error decoding. Cheap to clone; all clones share
/// the session slot.
#[derive(Clone)]
pub struct Api {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
}

impl Api {
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            base_url: config.backend_url.clone(),
            anon_key: config.anon_key.clone(),
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/{}", base, path))
            .map_err(|err| BackendError::Request(format!("invalid endpoint {}: {}", path, err)))
    }

    /// Realtime socket endpoint, derived from the HTTP base URL.
    pub(crate) fn websocket_url(&self) -> Result<Url, BackendError> {
        let mut url = self.endpoint("realtime/v1/websocket")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| BackendError::Request("invalid realtime endpoint".to_string()))?;
        url.query_pairs_mut().append_pair("apikey", &self.anon_key);
        Ok(url)
    }

    /// Start a request with the anon key attached and the session's access
    /// token as bearer (falling back to the anon key when signed out).
    pub(crate) fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let bearer = self
            .session()
            .map(|session| session.access_token)
            .unwrap_or_else(|| self.anon_key.clone());

        self.http
            .request(method, url)
            .header("apikey", self.anon_key.clone())
            .header(AUTHORIZATION, format!("Bearer {}", bearer))
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().expect("session lock poisoned").clone()
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        *self.session.write().expect("session lock poisoned") = session;
    }

    /// Map a non-success response to the backend's own message.
    pub(crate) async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                ["error", "message", "msg"]
                    .iter()
                    .find_map(|key| value.get(*key).and_then(|m| m.as_str()).map(str::to_string))
            })
            .unwrap_or_else(|| format!("backend returned {}", status));

        Err(BackendError::Request(message))
    }
}
