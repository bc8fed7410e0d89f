//! Configuration loading and validation. Repository configuration is loaded
//! at startup and on `reload_from`; secrets may be indirected through the
//! process environment (`token = "env:VARNAME"`).

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{Provider, Repository};

const ENV_PREFIX: &str = "env:";

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    repositories: Vec<RawRepository>,
    #[serde(default)]
    polling: RawPolling,
    #[serde(default)]
    dispatcher: RawDispatcher,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    admin: RawAdmin,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRepository {
    name: String,
    url: String,
    provider: Option<String>,
    token: Option<String>,
    branch_regex: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    poll_interval_secs: Option<u64>,
    #[serde(default)]
    deletion_tracking: bool,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct RawPolling {
    #[serde(default = "default_interval")]
    interval_secs: u64,
    #[serde(default = "default_worker_count")]
    worker_count: usize,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_poll_timeout")]
    per_poll_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    retry_backoff_secs: u64,
}

impl Default for RawPolling {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            per_poll_timeout_secs: default_poll_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

fn default_interval() -> u64 {
    60
}
fn default_worker_count() -> usize {
    4
}
fn default_batch_size() -> usize {
    16
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct RawDispatcher {
    event_listener_url: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    auth_token: Option<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_max_delay")]
    max_delay_secs: u64,
    #[serde(default = "default_parallelism")]
    parallelism: usize,
    #[serde(default = "default_dispatch_timeout")]
    timeout_secs: u64,
    #[serde(default)]
    insecure_skip_verify: bool,
}

impl Default for RawDispatcher {
    fn default() -> Self {
        Self {
            event_listener_url: None,
            namespace: None,
            headers: BTreeMap::new(),
            auth_token: None,
            max_attempts: default_max_attempts(),
            max_delay_secs: default_max_delay(),
            parallelism: default_parallelism(),
            timeout_secs: default_dispatch_timeout(),
            insecure_skip_verify: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_max_delay() -> u64 {
    60
}
fn default_parallelism() -> usize {
    5
}
fn default_dispatch_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
struct RawStorage {
    #[serde(default = "default_storage_path")]
    path: String,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
    #[serde(default = "default_connection_timeout")]
    connection_timeout_secs: u64,
}

impl Default for RawStorage {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

/// Falls back to the OS-conventional data directory
/// (`~/.local/share/reposentry/reposentry.db` on Linux, etc.) so a config
/// file that omits `storage.path` doesn't litter the current directory.
/// If the platform has no resolvable home directory, falls back to a
/// relative path in the current directory.
fn default_storage_path() -> String {
    directories::ProjectDirs::from("", "", "reposentry")
        .map(|dirs| dirs.data_dir().join("reposentry.db").to_string_lossy().into_owned())
        .unwrap_or_else(|| "reposentry.db".to_string())
}
fn default_max_connections() -> u32 {
    5
}
fn default_connection_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
struct RawAdmin {
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
}

impl Default for RawAdmin {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Fully validated, ready-to-use configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub repositories: Vec<Repository>,
    pub polling: PollingConfig,
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    pub worker_count: usize,
    pub batch_size: usize,
    pub per_poll_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub event_listener_url: url::Url,
    pub namespace: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub auth_token: Option<SecretString>,
    pub max_attempts: u32,
    pub max_delay: Duration,
    pub parallelism: usize,
    pub timeout: Duration,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub listen_addr: String,
}

impl AppConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Re-parse and re-validate, used by the config-reload watch channel.
    pub fn reload_from(&self, path: impl AsRef<Path>) -> Result<Self> {
        Self::load_from(path)
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("parsing config: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        let mut repositories = Vec::with_capacity(raw.repositories.len());
        for r in raw.repositories {
            if !seen.insert(r.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate repository name: {}",
                    r.name
                )));
            }
            repositories.push(resolve_repository(r)?);
        }

        let polling = RawPolling::default();
        let polling = RawPolling { ..raw_polling_or(polling, raw.polling) };
        if polling.interval_secs == 0 {
            return Err(Error::Config("polling.interval_secs must be positive".into()));
        }
        if polling.per_poll_timeout_secs == 0 {
            return Err(Error::Config(
                "polling.per_poll_timeout_secs must be positive".into(),
            ));
        }
        if polling.worker_count == 0 {
            return Err(Error::Config("polling.worker_count must be positive".into()));
        }
        if polling.batch_size == 0 {
            return Err(Error::Config("polling.batch_size must be positive".into()));
        }

        let dispatcher = raw.dispatcher;
        let url_str = dispatcher.event_listener_url.clone().ok_or_else(|| {
            Error::Config("dispatcher.event_listener_url is required".into())
        })?;
        let event_listener_url = url::Url::parse(&url_str)
            .map_err(|e| Error::Config(format!("dispatcher.event_listener_url: {e}")))?;
        if event_listener_url.host_str().is_none() {
            return Err(Error::Config(
                "dispatcher.event_listener_url must have a host".into(),
            ));
        }
        match event_listener_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "dispatcher.event_listener_url scheme must be http or https, got {other}"
                )))
            }
        }
        if dispatcher.timeout_secs == 0 {
            return Err(Error::Config("dispatcher.timeout_secs must be positive".into()));
        }

        let storage = raw.storage;
        if storage.max_connections == 0 {
            return Err(Error::Config("storage.max_connections must be positive".into()));
        }

        Ok(AppConfig {
            repositories,
            polling: PollingConfig {
                interval: Duration::from_secs(polling.interval_secs),
                worker_count: polling.worker_count,
                batch_size: polling.batch_size,
                per_poll_timeout: Duration::from_secs(polling.per_poll_timeout_secs),
                retry_attempts: polling.retry_attempts,
                retry_backoff: Duration::from_secs(polling.retry_backoff_secs),
            },
            dispatcher: DispatcherConfig {
                event_listener_url,
                namespace: dispatcher.namespace,
                headers: dispatcher.headers,
                auth_token: dispatcher.auth_token.map(SecretString::from),
                max_attempts: dispatcher.max_attempts,
                max_delay: Duration::from_secs(dispatcher.max_delay_secs),
                parallelism: dispatcher.parallelism.max(1),
                timeout: Duration::from_secs(dispatcher.timeout_secs),
                insecure_skip_verify: dispatcher.insecure_skip_verify,
            },
            storage: StorageConfig {
                path: storage.path,
                max_connections: storage.max_connections,
                connection_timeout: Duration::from_secs(storage.connection_timeout_secs),
            },
            admin: AdminConfig {
                listen_addr: raw.admin.listen_addr,
            },
        })
    }
}

fn raw_polling_or(default: RawPolling, given: RawPolling) -> RawPolling {
    // `given` always carries concrete values (serde defaults fill gaps), so
    // it simply wins; `default` only matters when no [polling] table at all
    // was present, which serde already handles via `#[serde(default)]`.
    let _ = default;
    given
}

fn resolve_repository(r: RawRepository) -> Result<Repository> {
    let provider = match r.provider {
        Some(ref p) => Provider::from_str(p)?,
        None => infer_provider(&r.url),
    };

    let token = match r.token {
        Some(ref t) if t.starts_with(ENV_PREFIX) => {
            let var = &t[ENV_PREFIX.len()..];
            let value = std::env::var(var).map_err(|_| {
                Error::Config(format!(
                    "repository {}: env var {var} is not set",
                    r.name
                ))
            })?;
            Some(SecretString::from(value))
        }
        Some(t) => {
            warn!(repository = %r.name, "token configured inline without env: prefix");
            Some(SecretString::from(t))
        }
        None => None,
    };

    let branch_regex_str = r.branch_regex.unwrap_or_else(|| "^.*$".to_string());
    let branch_regex = regex::Regex::new(&branch_regex_str).map_err(|e| {
        Error::Config(format!(
            "repository {}: invalid branch_regex {branch_regex_str:?}: {e}",
            r.name
        ))
    })?;

    Ok(Repository {
        name: r.name,
        url: r.url,
        provider,
        token,
        branch_regex,
        enabled: r.enabled,
        poll_interval: r.poll_interval_secs.map(Duration::from_secs),
        deletion_tracking: r.deletion_tracking,
        labels: r.labels,
    })
}

fn infer_provider(url: &str) -> Provider {
    if url.contains("github.com") {
        Provider::Github
    } else {
        Provider::Gitlab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[polling]
interval_secs = 30
worker_count = 2

[dispatcher]
event_listener_url = "https://el.example.com"

[[repositories]]
name = "demo"
url = "https://github.com/example/demo"
provider = "github"
branch_regex = "^main$"
"#;

    #[test]
    fn parses_minimal_config() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.repositories.len(), 1);
        assert_eq!(cfg.repositories[0].name, "demo");
        assert_eq!(cfg.polling.worker_count, 2);
        assert_eq!(cfg.dispatcher.event_listener_url.host_str(), Some("el.example.com"));
    }

    #[test]
    fn rejects_duplicate_repository_names() {
        let text = format!(
            "{SAMPLE}\n[[repositories]]\nname = \"demo\"\nurl = \"https://github.com/example/demo2\"\n"
        );
        let err = AppConfig::parse(&text).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_bad_branch_regex() {
        let text = SAMPLE.replace("^main$", "(unterminated");
        let err = AppConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("invalid branch_regex"));
    }

    #[test]
    fn rejects_missing_event_listener_url() {
        let text = SAMPLE.replace("event_listener_url = \"https://el.example.com\"", "");
        let err = AppConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("event_listener_url"));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let text = SAMPLE.replace("https://el.example.com", "ftp://el.example.com");
        let err = AppConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let text = SAMPLE.replace("worker_count = 2", "worker_count = 2\nbatch_size = 0");
        let err = AppConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn resolves_env_indirected_token() {
        std::env::set_var("REPOSENTRY_TEST_TOKEN", "abc123");
        let text = SAMPLE.replace(
            "branch_regex = \"^main$\"",
            "branch_regex = \"^main$\"\ntoken = \"env:REPOSENTRY_TEST_TOKEN\"",
        );
        let cfg = AppConfig::parse(&text).unwrap();
        assert!(cfg.repositories[0].token.is_some());
    }
}
