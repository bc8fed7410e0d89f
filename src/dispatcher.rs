//! Transforms an [`Event`] into a CloudEvents 1.0 payload and delivers it to
//! the Tekton EventListener over HTTPS POST, binary mode (`ce-*` headers,
//! `data` JSON as the body). Retries 5xx/connection/timeout errors with
//! exponential backoff capped at `max_delay`; 4xx (except 408/429) is
//! terminal. Batch sends fan out concurrently behind a semaphore.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::types::Event;
use crate::url_parser::parse_repository_url;

/// The CloudEvents `data` payload (the HTTP body in binary mode).
#[derive(Debug, Serialize)]
pub struct CloudEventData {
    pub repository: RepositoryData,
    pub branch: BranchData,
    pub commit: CommitData,
    pub event: EventMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_commit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RepositoryData {
    pub provider: String,
    pub organization: String,
    pub name: String,
    pub full_name: String,
    pub url: String,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct BranchData {
    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Serialize)]
pub struct CommitData {
    pub sha: String,
    pub short_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventMeta {
    #[serde(rename = "type")]
    pub event_type: String,
    pub trigger_source: String,
    pub trigger_id: String,
    pub detection_time: String,
}

/// Envelope attributes that ride in `ce-*` headers in binary mode.
pub struct CloudEventEnvelope {
    pub specversion: &'static str,
    pub event_type: String,
    pub source: String,
    pub id: String,
    pub time: String,
    pub datacontenttype: &'static str,
    pub data: CloudEventData,
}

/// Builds the CloudEvent envelope + data payload for `event`.
pub fn to_cloud_event(event: &Event) -> CloudEventEnvelope {
    let short_sha: String = event.commit_sha.chars().take(8).collect();
    let id = format!("event_{short_sha}_{}", event.timestamp.format("%Y%m%d_%H%M%S"));

    // repository_url carries the canonical origin; fall back to the bare
    // repository name if metadata is somehow missing it.
    let repository_url = event
        .metadata
        .get("repository_url")
        .cloned()
        .unwrap_or_else(|| event.repository.clone());
    let parsed = parse_repository_url(&repository_url).ok();

    let (organization, name, full_name) = match &parsed {
        Some(p) => (p.namespace.clone(), p.project_name.clone(), p.full_name.clone()),
        None => (String::new(), event.repository.clone(), event.repository.clone()),
    };

    let data = CloudEventData {
        repository: RepositoryData {
            provider: event.provider.as_str().to_string(),
            organization,
            name,
            full_name,
            url: repository_url,
            id: event.repository.clone(),
        },
        branch: BranchData {
            name: event.branch.clone(),
            git_ref: format!("refs/heads/{}", event.branch),
        },
        commit: CommitData {
            sha: event.commit_sha.clone(),
            short_sha,
            message: event.metadata.get("commit_message").cloned(),
        },
        event: EventMeta {
            event_type: event.event_type.as_str().to_string(),
            trigger_source: "reposentry".to_string(),
            trigger_id: event.id.clone(),
            detection_time: event.timestamp.to_rfc3339(),
        },
        previous_commit: event.prev_commit.clone(),
    };

    CloudEventEnvelope {
        specversion: "1.0",
        event_type: format!("dev.reposentry.repository.{}", event.event_type.as_str()),
        source: format!("reposentry/{}", event.provider.as_str()),
        id,
        time: event.timestamp.to_rfc3339(),
        datacontenttype: "application/json",
        data,
    }
}

/// EMA latency, success/failure counters, consecutive-failure count, and
/// last success/failure timestamps.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    ema_latency_ms: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_success_unix: AtomicU64,
    last_failure_unix: AtomicU64,
}

const EMA_ALPHA_PERCENT: u64 = 20; // smoothing factor, weight on the latest sample

impl DispatchMetrics {
    fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_unix
            .store(chrono::Utc::now().timestamp() as u64, Ordering::Relaxed);
        self.update_ema(latency);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_unix
            .store(chrono::Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    fn update_ema(&self, latency: Duration) {
        let sample = latency.as_millis() as u64;
        let prev = self.ema_latency_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            (sample * EMA_ALPHA_PERCENT + prev * (100 - EMA_ALPHA_PERCENT)) / 100
        };
        self.ema_latency_ms.store(next, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            ema_latency_ms: self.ema_latency_ms.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_success_unix: self.last_success_unix.load(Ordering::Relaxed),
            last_failure_unix: self.last_failure_unix.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchMetricsSnapshot {
    pub ema_latency_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_success_unix: u64,
    pub last_failure_unix: u64,
}

/// Sends CloudEvents to the configured Tekton EventListener.
pub struct Dispatcher {
    client: Client,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Validation(format!("building dispatcher HTTP client: {e}")))?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.parallelism.max(1))),
            metrics: Arc::new(DispatchMetrics::default()),
            config,
        })
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.metrics.clone()
    }

    /// Sends a single event, retrying retryable failures with exponential
    /// backoff capped at `max_delay` up to `max_attempts`. Returns `Ok(())`
    /// on terminal success and `Err` on terminal failure (4xx, or retries
    /// exhausted).
    pub async fn send(&self, event: &Event) -> Result<()> {
        let envelope = to_cloud_event(event);
        let body = serde_json::to_vec(&envelope.data)
            .map_err(|e| Error::DispatcherClient { status: 0, body: format!("serializing event: {e}") })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = std::time::Instant::now();
            match self.send_once(&envelope, &body).await {
                Ok(()) => {
                    self.metrics.record_success(start.elapsed());
                    return Ok(());
                }
                Err(e) if is_dispatcher_retryable(&e) && attempt < self.config.max_attempts => {
                    self.metrics.record_failure();
                    let backoff = exponential_backoff(attempt, self.config.max_delay);
                    warn!(attempt, ?backoff, error = %e, event_id = %event.id, "dispatch failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.metrics.record_failure();
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(&self, envelope: &CloudEventEnvelope, body: &[u8]) -> Result<()> {
        let mut request = self
            .client
            .post(self.config.event_listener_url.clone())
            .header("ce-specversion", envelope.specversion)
            .header("ce-type", &envelope.event_type)
            .header("ce-source", &envelope.source)
            .header("ce-id", &envelope.id)
            .header("ce-time", &envelope.time)
            .header("ce-datacontenttype", envelope.datacontenttype)
            .header("Content-Type", "application/json")
            .header("User-Agent", "RepoSentry/1.0")
            .header("X-GitHub-Event", "push")
            .body(body.to_vec());

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(status = %status, "event delivered");
            return Ok(());
        }

        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::DispatcherServer(format!(
                "EventListener returned {status}"
            )));
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(Error::DispatcherClient {
            status: status.as_u16(),
            body: body_text,
        })
    }

    /// Sends `events` concurrently, bounded by `parallelism`. Returns one
    /// result per input event, in input order.
    pub async fn send_batch(&self, events: &[Event]) -> Vec<Result<()>> {
        let results = AsyncMutex::new(Vec::with_capacity(events.len()));
        let tasks = events.iter().enumerate().map(|(i, event)| {
            let results = &results;
            async move {
                let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
                let outcome = self.send(event).await;
                let mut results = results.lock().await;
                if results.len() <= i {
                    results.resize_with(i + 1, || Err(Error::Canceled));
                }
                results[i] = outcome;
            }
        });
        futures::future::join_all(tasks).await;
        results.into_inner()
    }
}

fn is_dispatcher_retryable(e: &Error) -> bool {
    matches!(e, Error::DispatcherServer(_) | Error::Network(_))
}

fn exponential_backoff(attempt: u32, max_delay: Duration) -> Duration {
    let millis = 500u64.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(millis).min(max_delay)
}

/// Free-form map used by [`crate::admin`] to render `/status`-adjacent
/// payloads without re-exposing internal atomics directly.
pub fn metrics_as_map(snapshot: DispatchMetricsSnapshot) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("ema_latency_ms".to_string(), snapshot.ema_latency_ms.to_string());
    map.insert("successes".to_string(), snapshot.successes.to_string());
    map.insert("failures".to_string(), snapshot.failures.to_string());
    map.insert(
        "consecutive_failures".to_string(),
        snapshot.consecutive_failures.to_string(),
    );
    map.insert("last_success_unix".to_string(), snapshot.last_success_unix.to_string());
    map.insert("last_failure_unix".to_string(), snapshot.last_failure_unix.to_string());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventStatus, EventType, Provider};
    use std::collections::BTreeMap;

    fn sample_event() -> Event {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "repository_url".to_string(),
            "https://github.com/example/demo".to_string(),
        );
        Event {
            id: "event_abc12345_20260101_120000".to_string(),
            event_type: EventType::BranchCreated,
            repository: "demo".to_string(),
            branch: "main".to_string(),
            commit_sha: "abc12345def".to_string(),
            prev_commit: None,
            provider: Provider::Github,
            timestamp: chrono::Utc::now(),
            metadata,
            status: EventStatus::Pending,
            error_message: None,
            processed_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn test_config(url: &str) -> DispatcherConfig {
        DispatcherConfig {
            event_listener_url: url::Url::parse(url).unwrap(),
            namespace: None,
            headers: BTreeMap::new(),
            auth_token: None,
            max_attempts: 4,
            max_delay: Duration::from_millis(5),
            parallelism: 5,
            timeout: Duration::from_secs(5),
            insecure_skip_verify: false,
        }
    }

    #[test]
    fn cloud_event_shape_for_branch_created() {
        let event = sample_event();
        let envelope = to_cloud_event(&event);
        assert_eq!(envelope.specversion, "1.0");
        assert_eq!(envelope.event_type, "dev.reposentry.repository.branch_created");
        assert_eq!(envelope.source, "reposentry/github");
        assert_eq!(envelope.data.branch.git_ref, "refs/heads/main");
        assert_eq!(envelope.data.commit.short_sha, "abc12345");
        assert!(envelope.data.previous_commit.is_none());
    }

    #[tokio::test]
    async fn send_succeeds_on_200() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("POST", "/").with_status(200).create_async().await;
        let dispatcher = Dispatcher::new(test_config(&server.url())).unwrap();
        dispatcher.send(&sample_event()).await.unwrap();
        assert_eq!(dispatcher.metrics().snapshot().successes, 1);
    }

    #[tokio::test]
    async fn send_terminal_fails_on_4xx_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;
        let dispatcher = Dispatcher::new(test_config(&server.url())).unwrap();
        let err = dispatcher.send(&sample_event()).await.unwrap_err();
        assert!(matches!(err, Error::DispatcherClient { status: 400, .. }));
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds_and_resets_consecutive_failures() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("POST", "/")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;
        let _m2 = server
            .mock("POST", "/")
            .with_status(200)
            .expect_at_most(1)
            .create_async()
            .await;

        let dispatcher = Dispatcher::new(test_config(&server.url())).unwrap();
        dispatcher.send(&sample_event()).await.unwrap();
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.successes, 1);
    }

    #[tokio::test]
    async fn send_batch_runs_concurrently_and_preserves_order() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("POST", "/").with_status(200).create_async().await;
        let dispatcher = Dispatcher::new(test_config(&server.url())).unwrap();

        let mut events = Vec::new();
        for i in 0..5 {
            let mut e = sample_event();
            e.id = format!("event_{i}");
            events.push(e);
        }
        let results = dispatcher.send_batch(&events).await;
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
