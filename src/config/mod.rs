use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend_url: Url,
    pub anon_key: String,
    pub storage_bucket: String,
    pub session_file: Option<PathBuf>,
    pub http_timeout_seconds: u64,
    pub realtime_heartbeat_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let backend_url = env_or_err("BACKEND_URL")?;
        let backend_url = Url::parse(&backend_url)
            .map_err(|err| anyhow!("invalid BACKEND_URL: {}", err))?;

        Ok(Self {
            backend_url,
            anon_key: env_or_err("BACKEND_ANON_KEY")?,
            storage_bucket: env_or("STORAGE_BUCKET", "posts"),
            session_file: std::env::var("SESSION_FILE").ok().map(PathBuf::from),
            http_timeout_seconds: env_or_parse("HTTP_TIMEOUT_SECONDS", "30")?,
            realtime_heartbeat_seconds: env_or_parse("REALTIME_HEARTBEAT_SECONDS", "25")?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_err(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {}", key))
}

fn env_or_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
    value
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {}: {}", key, err))
}
