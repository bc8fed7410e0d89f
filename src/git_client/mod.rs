//! Provider-polymorphic Git client: `{GetBranches, GetLatestCommit,
//! CheckPermissions, GetRateLimit}` with `GitHub`, `GitLab`, and a
//! `Fallback` decorator that shells out to `git ls-remote` when the inner
//! client's retries are exhausted.

mod fallback;
mod github;
mod gitlab;

pub use fallback::FallbackClient;
pub use github::GitHubClient;
pub use gitlab::GitLabClient;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::rate_limiter::RateLimiterRegistry;
use crate::types::{Branch, Provider, RateLimitInfo, Repository};
use crate::url_parser::RepoUrl;

/// Capability set every provider variant implements. A factory chooses a
/// variant per [`Repository`], and `Fallback` composes as a decorator rather
/// than a fourth peer variant.
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn get_branches(&self, cancel: &CancellationToken) -> Result<Vec<Branch>>;
    async fn get_latest_commit(&self, branch: &str, cancel: &CancellationToken) -> Result<String>;
    async fn check_permissions(&self, cancel: &CancellationToken) -> Result<()>;
    async fn get_rate_limit(&self, cancel: &CancellationToken) -> Result<RateLimitInfo>;
    fn provider(&self) -> Provider;

    /// Head commit message/author for `branch`, when the variant can supply
    /// it cheaply. The shell fallback cannot and returns `(None, None)`; see
    /// DESIGN.md for why that is the one behavioral gap between paths.
    async fn get_commit_detail(
        &self,
        _branch: &str,
        _cancel: &CancellationToken,
    ) -> Result<(Option<String>, Option<String>)> {
        Ok((None, None))
    }
}

/// Retry policy shared by the `GitHub`/`GitLab` variants: network/5xx errors
/// retry up to `attempts` times with backoff `retry_backoff * attempt`;
/// 401/403/404/429 are non-retryable and returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: std::time::Duration,
}

impl RetryPolicy {
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let delay = self.backoff * attempt;
                    tracing::debug!(attempt, ?delay, error = %e, "retrying git provider call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builds the `GitClient` for a repository: the primary provider variant,
/// wrapped in [`FallbackClient`] when fallback is enabled.
pub fn build_client(
    repo: &Repository,
    repo_url: &RepoUrl,
    rate_limiters: &RateLimiterRegistry,
    retry: RetryPolicy,
    fallback_enabled: bool,
) -> Result<Box<dyn GitClient>> {
    let limiter = rate_limiters.get(repo.provider.as_str(), &repo_url.instance);

    let primary: Box<dyn GitClient> = match repo.provider {
        Provider::Github => Box::new(GitHubClient::new(repo, repo_url, limiter, retry)?),
        Provider::Gitlab => Box::new(GitLabClient::new(repo, repo_url, limiter, retry)?),
    };

    if fallback_enabled {
        Ok(Box::new(FallbackClient::new(primary, repo_url.clone_url.clone())))
    } else {
        Ok(primary)
    }
}
