//! Client configuration from the environment and the hosts file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ReplicateError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com/v1/";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

const USER_AGENT: &str = concat!("replicate-cli/", env!("CARGO_PKG_VERSION"));

/// One entry of the hosts file.
#[derive(Debug, Clone, Default, Deserialize)]
struct HostEntry {
    #[serde(default)]
    token: Option<String>,
}

/// Connection settings for the API client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub token: Option<String>,
    pub user_agent: String,
    pub poll_interval: Duration,
}

impl ClientConfig {
    /// Config for `base_url` with no token and default timings.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            token: None,
            user_agent: USER_AGENT.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Load from `REPLICATE_*` variables, falling back to the hosts file for
    /// the token.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`ClientConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = lookup("REPLICATE_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(&base)?;

        if let Some(ms) = lookup("REPLICATE_POLL_INTERVAL_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                ReplicateError::Config(format!("REPLICATE_POLL_INTERVAL_MS is not a number: {ms}"))
            })?;
            config.poll_interval = Duration::from_millis(ms);
        }

        config.token = match lookup("REPLICATE_API_TOKEN").filter(|t| !t.is_empty()) {
            Some(token) => Some(token),
            None => match hosts_path(&lookup) {
                Some(path) => read_hosts_token(&path, config.host())?,
                None => None,
            },
        };

        if config.token.is_none() && config.is_default_host() {
            let hint = hosts_path(&lookup)
                .map(|p| format!(" or add a token for api.replicate.com to {}", p.display()))
                .unwrap_or_default();
            return Err(ReplicateError::Config(format!(
                "no API token found; set REPLICATE_API_TOKEN{hint}"
            )));
        }

        debug!(base_url = %config.base_url, "loaded client config");
        Ok(config)
    }

    pub fn host(&self) -> &str {
        self.base_url.host_str().unwrap_or_default()
    }

    pub fn is_default_host(&self) -> bool {
        Url::parse(DEFAULT_BASE_URL)
            .map(|default| default.host_str() == self.base_url.host_str())
            .unwrap_or(false)
    }
}

fn parse_base_url(base: &str) -> Result<Url> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| ReplicateError::Config(format!("invalid base URL {base}: {e}")))
}

/// `$XDG_CONFIG_HOME/replicate/hosts`, else `$HOME/.config/replicate/hosts`.
fn hosts_path<F>(lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return Some(Path::new(&dir).join("replicate").join("hosts"));
    }
    lookup("HOME")
        .filter(|d| !d.is_empty())
        .map(|home| Path::new(&home).join(".config").join("replicate").join("hosts"))
}

/// Token for `host` from a YAML hosts file. A missing file or host is `None`.
pub fn read_hosts_token(path: &Path, host: &str) -> Result<Option<String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }

    let hosts: BTreeMap<String, HostEntry> = serde_yaml::from_str(&text).map_err(|e| {
        ReplicateError::Config(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(hosts
        .get(host)
        .and_then(|entry| entry.token.clone())
        .filter(|token| !token.is_empty()))
}
