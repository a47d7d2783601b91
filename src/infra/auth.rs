use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::infra::api::{Api, BackendError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user_id: Uuid,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

/// Local auth-state notifications, emitted after the matching backend call
/// settles. Listeners re-resolve the viewer profile on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: Uuid,
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: SignUpData<'a>,
}

#[derive(Serialize)]
struct SignUpData<'a> {
    display_name: &'a str,
}

/// Auth capability. The profile row matching a signed-up account is
/// provisioned by the backend; this client only manages tokens and the
/// in-process session slot.
#[derive(Clone)]
pub struct AuthClient {
    api: Api,
    events: broadcast::Sender<AuthEvent>,
    session_file: Option<PathBuf>,
}

impl AuthClient {
    pub fn new(api: Api, session_file: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            api,
            events,
            session_file,
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Session, BackendError> {
        let url = self.api.endpoint("auth/v1/signup")?;
        let response = self
            .api
            .request(Method::POST, url)
            .json(&SignUpRequest {
                email,
                password,
                data: SignUpData { display_name },
            })
            .send()
            .await?;
        let response = Api::check(response).await?;
        let tokens: TokenResponse = response.json().await?;
        Ok(self.install(tokens, AuthEvent::SignedIn))
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let mut url = self.api.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let response = self
            .api
            .request(Method::POST, url)
            .json(&PasswordGrant { email, password })
            .send()
            .await?;
        let response = Api::check(response).await?;
        let tokens: TokenResponse = response.json().await?;
        Ok(self.install(tokens, AuthEvent::SignedIn))
    }

    /// Revoke the current session. The local session slot is cleared only
    /// after the backend confirms; on failure the caller still holds a
    /// signed-in session and surfaces the error.
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        if self.api.session().is_none() {
            return Ok(());
        }
        let url = self.api.endpoint("auth/v1/logout")?;
        let response = self.api.request(Method::POST, url).send().await?;
        Api::check(response).await?;

        self.api.set_session(None);
        self.persist(None);
        let _ = self.events.send(AuthEvent::SignedOut);
        Ok(())
    }

    pub async fn refresh_session(&self) -> Result<Session, BackendError> {
        let refresh_token = self
            .api
            .session()
            .map(|session| session.refresh_token)
            .ok_or(BackendError::Unauthorized)?;

        let mut url = self.api.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let response = self
            .api
            .request(Method::POST, url)
            .json(&RefreshGrant {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;
        let response = Api::check(response).await?;
        let tokens: TokenResponse = response.json().await?;
        Ok(self.install(tokens, AuthEvent::TokenRefreshed))
    }

    /// Load a persisted session, refreshing it when expired. Returns None
    /// when no usable session exists; never fails the caller for a bad or
    /// stale file.
    pub async fn restore_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(path) = self.session_file.as_ref() else {
            return Ok(None);
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let stored: Session = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = ?err, "ignoring unreadable session file");
                return Ok(None);
            }
        };

        self.api.set_session(Some(stored.clone()));
        if !stored.is_expired() {
            return Ok(Some(stored));
        }

        match self.refresh_session().await {
            Ok(fresh) => Ok(Some(fresh)),
            Err(err) => {
                warn!(error = ?err, "stored session could not be refreshed");
                self.api.set_session(None);
                self.persist(None);
                Ok(None)
            }
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.api.session()
    }

    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn install(&self, tokens: TokenResponse, event: AuthEvent) -> Session {
        let session = Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: OffsetDateTime::now_utc() + Duration::seconds(tokens.expires_in as i64),
            user_id: tokens.user.id,
        };
        self.api.set_session(Some(session.clone()));
        self.persist(Some(&session));
        let _ = self.events.send(event);
        session
    }

    fn persist(&self, session: Option<&Session>) {
        let Some(path) = self.session_file.as_ref() else {
            return;
        };
        let result = match session {
            Some(session) => serde_json::to_string_pretty(session)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
                .and_then(|payload| std::fs::write(path, payload)),
            None => match std::fs::remove_file(path) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(err) = result {
            warn!(error = ?err, "failed to persist session state");
        }
    }
}
