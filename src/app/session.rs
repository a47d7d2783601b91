use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::domain::user::User;
use crate::infra::api::BackendError;
use crate::infra::auth::{AuthClient, AuthEvent};
use crate::infra::query::QueryClient;

/// Current auth state as screens read it. `user == None && !loading` means
/// definitely logged out; `loading` means the first auth check has not
/// resolved yet.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub user: Option<User>,
    pub loading: bool,
}

/// Single source of truth for "who is logged in". Constructed once and
/// passed explicitly to every consumer; screens gate navigation on it.
#[derive(Clone)]
pub struct SessionStore {
    state: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionSnapshot {
            user: None,
            loading: true,
        });
        Self {
            state: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    /// Replace the current user and clear the initial-load gate.
    pub fn set_user(&self, user: Option<User>) {
        self.state.send_modify(|snapshot| {
            snapshot.user = user;
            snapshot.loading = false;
        });
    }

    pub fn set_loading(&self, loading: bool) {
        self.state.send_modify(|snapshot| snapshot.loading = loading);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Sign out through the backend, clearing the store only on success.
    /// Callers are responsible for redirecting afterwards.
    pub async fn logout(&self, auth: &AuthClient) -> Result<()> {
        auth.sign_out().await?;
        self.set_user(None);
        Ok(())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for the auth-event listener registered at process start. The
/// listener runs for the life of the process and is released on teardown.
pub struct SessionBootstrap {
    listener: JoinHandle<()>,
}

impl SessionBootstrap {
    pub fn shutdown(self) {
        self.listener.abort();
    }
}

impl Drop for SessionBootstrap {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Resolve any persisted session into a viewer profile, then keep the
/// store in sync with every subsequent sign-in/sign-out event.
pub async fn bootstrap(
    auth: &AuthClient,
    query: &QueryClient,
    store: &SessionStore,
) -> Result<SessionBootstrap> {
    // Register before restoring so no event can slip between the two.
    let mut events = auth.on_auth_state_change();

    match auth.restore_session().await {
        Ok(Some(session)) => match resolve_profile(query, session.user_id).await {
            Ok(Some(user)) => store.set_user(Some(user)),
            Ok(None) => {
                warn!(user_id = %session.user_id, "no profile row for restored session");
                store.set_loading(false);
            }
            Err(err) => {
                warn!(error = ?err, "failed to resolve viewer profile");
                store.set_loading(false);
            }
        },
        Ok(None) => store.set_loading(false),
        Err(err) => {
            warn!(error = ?err, "session restore failed");
            store.set_loading(false);
        }
    }

    let auth = auth.clone();
    let query = query.clone();
    let store = store.clone();
    let listener = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                AuthEvent::SignedOut => store.set_user(None),
                AuthEvent::SignedIn | AuthEvent::TokenRefreshed => {
                    let Some(session) = auth.session() else {
                        store.set_user(None);
                        continue;
                    };
                    match resolve_profile(&query, session.user_id).await {
                        Ok(Some(user)) => store.set_user(Some(user)),
                        Ok(None) => {
                            warn!(user_id = %session.user_id, "no profile row for signed-in user");
                            store.set_user(None);
                        }
                        Err(err) => {
                            error!(error = ?err, "failed to resolve viewer profile");
                        }
                    }
                }
            }
        }
    });

    Ok(SessionBootstrap { listener })
}

async fn resolve_profile(
    query: &QueryClient,
    user_id: Uuid,
) -> Result<Option<User>, BackendError> {
    query
        .from("users")
        .select("*")
        .eq("id", user_id)
        .fetch_one()
        .await
}
