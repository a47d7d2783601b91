pub mod app;
pub mod config;
pub mod domain;
pub mod infra;
pub mod ui;

use anyhow::Result;
use std::time::Duration;

use crate::app::session::SessionStore;
use crate::config::AppConfig;
use crate::infra::api::Api;
use crate::infra::auth::AuthClient;
use crate::infra::query::QueryClient;
use crate::infra::realtime::RealtimeClient;
use crate::infra::storage::ObjectStorage;

/// Backend capability handles plus the session store, shared by every
/// screen.
#[derive(Clone)]
pub struct AppState {
    pub query: QueryClient,
    pub storage: ObjectStorage,
    pub auth: AuthClient,
    pub realtime: RealtimeClient,
    pub session: SessionStore,
}

impl AppState {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let api = Api::new(config)?;
        let realtime = RealtimeClient::connect(
            &api,
            Duration::from_secs(config.realtime_heartbeat_seconds),
        )
        .await?;

        Ok(Self {
            query: QueryClient::new(api.clone()),
            storage: ObjectStorage::new(api.clone(), config.storage_bucket.clone()),
            auth: AuthClient::new(api, config.session_file.clone()),
            realtime,
            session: SessionStore::new(),
        })
    }
}
