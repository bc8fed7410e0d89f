//! GitLab REST v4 variant: `GET /projects/{urlencoded full path}`,
//! `GET /projects/{id}/repository/branches[/{branch}]`, rate limits from
//! `RateLimit-Limit`/`RateLimit-Remaining`/`RateLimit-ResetTime` headers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{GitClient, RetryPolicy};
use crate::error::{Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::types::{Branch, Provider, RateLimitInfo, Repository};
use crate::url_parser::RepoUrl;

pub struct GitLabClient {
    client: Client,
    api_base_url: String,
    full_name: String,
    token: Option<secrecy::SecretString>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GlBranch {
    name: String,
    commit: GlCommit,
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct GlCommit {
    id: String,
    message: Option<String>,
    author_name: Option<String>,
}

impl GitLabClient {
    pub fn new(
        repo: &Repository,
        repo_url: &RepoUrl,
        rate_limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent("RepoSentry/1.0")
            .build()
            .map_err(|e| Error::Validation(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base_url: repo_url.api_base_url.clone(),
            full_name: repo_url.full_name.clone(),
            token: repo.token.clone(),
            rate_limiter,
            retry,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_base_url, path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        self.record_rate_limit(&response);
        classify_status(response).await
    }

    fn record_rate_limit(&self, response: &reqwest::Response) {
        let headers = response.headers();
        let parse_u32 = |name: &str| -> Option<u32> { headers.get(name)?.to_str().ok()?.parse().ok() };
        let reset = headers
            .get("ratelimit-resettime")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));

        if let (Some(limit), Some(remaining), Some(reset_time)) =
            (parse_u32("ratelimit-limit"), parse_u32("ratelimit-remaining"), reset)
        {
            self.rate_limiter.update_limit(limit, remaining, reset_time);
        }
    }

    async fn project_id(&self) -> Result<u64> {
        let encoded = encode_path_segment(&self.full_name);
        let path = format!("/projects/{encoded}");
        let project: GlProject = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<GlProject>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitLab project response: {e}")))
            })
            .await?;
        Ok(project.id)
    }
}

/// Percent-encodes a path segment for GitLab's "urlencoded full path"
/// endpoints (`/projects/{encoded}`), where `/` must become `%2F`.
fn encode_path_segment(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

async fn classify_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        StatusCode::OK => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Authentication(format!("GitLab API: {}", response.status())))
        }
        StatusCode::NOT_FOUND => Err(Error::RepositoryNotFound("GitLab API: 404".to_string())),
        StatusCode::TOO_MANY_REQUESTS => {
            let reset_time = response
                .headers()
                .get("ratelimit-resettime")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
            Err(Error::RateLimitExceeded { reset_time })
        }
        status if status.is_server_error() => {
            Err(Error::Network(format!("GitLab API server error: {status}")))
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Validation(format!("GitLab API returned {status}: {body}")))
        }
    }
}

#[async_trait]
impl GitClient for GitLabClient {
    async fn get_branches(&self, cancel: &CancellationToken) -> Result<Vec<Branch>> {
        self.rate_limiter.wait(cancel).await?;
        let id = self.project_id().await?;
        let path = format!("/projects/{id}/repository/branches?per_page=100");

        let branches: Vec<GlBranch> = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<Vec<GlBranch>>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitLab branches response: {e}")))
            })
            .await?;

        debug!(count = branches.len(), repo = %self.full_name, "fetched branches from GitLab");

        Ok(branches
            .into_iter()
            .map(|b| Branch {
                name: b.name,
                commit_sha: b.commit.id,
                protected: b.protected,
                commit_message: b.commit.message,
                author: b.commit.author_name,
            })
            .collect())
    }

    async fn get_latest_commit(&self, branch: &str, cancel: &CancellationToken) -> Result<String> {
        self.rate_limiter.wait(cancel).await?;
        let id = self.project_id().await?;
        let encoded_branch = encode_path_segment(branch);
        let path = format!("/projects/{id}/repository/branches/{encoded_branch}");

        let detail: GlBranch = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<GlBranch>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitLab branch detail: {e}")))
            })
            .await?;

        Ok(detail.commit.id)
    }

    async fn check_permissions(&self, cancel: &CancellationToken) -> Result<()> {
        self.rate_limiter.wait(cancel).await?;
        self.project_id().await?;
        Ok(())
    }

    async fn get_rate_limit(&self, _cancel: &CancellationToken) -> Result<RateLimitInfo> {
        Ok(self.rate_limiter.snapshot())
    }

    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    async fn get_commit_detail(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Option<String>)> {
        self.rate_limiter.wait(cancel).await?;
        let id = self.project_id().await?;
        let encoded_branch = encode_path_segment(branch);
        let path = format!("/projects/{id}/repository/branches/{encoded_branch}");
        let detail: GlBranch = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<GlBranch>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitLab branch detail: {e}")))
            })
            .await?;
        Ok((detail.commit.message, detail.commit.author_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimiter;

    fn test_client(base_url: &str) -> GitLabClient {
        GitLabClient {
            client: Client::new(),
            api_base_url: base_url.to_string(),
            full_name: "chat-labs/OpenSource/rag".to_string(),
            token: None,
            rate_limiter: Arc::new(RateLimiter::new()),
            retry: RetryPolicy {
                attempts: 3,
                backoff: std::time::Duration::from_millis(1),
            },
        }
    }

    #[tokio::test]
    async fn get_branches_resolves_project_id_then_lists_branches() {
        let mut server = mockito::Server::new_async().await;
        let encoded = encode_path_segment("chat-labs/OpenSource/rag");
        let _project = server
            .mock("GET", format!("/projects/{encoded}").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 42}"#)
            .create_async()
            .await;
        let _branches = server
            .mock("GET", "/projects/42/repository/branches?per_page=100")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"name":"main","commit":{"id":"def67890","message":"fix","author_name":"a"},"protected":true}]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let cancel = CancellationToken::new();
        let branches = client.get_branches(&cancel).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].commit_sha, "def67890");
        assert_eq!(branches[0].commit_message.as_deref(), Some("fix"));
    }

    #[tokio::test]
    async fn maps_403_to_authentication_error() {
        let mut server = mockito::Server::new_async().await;
        let encoded = encode_path_segment("chat-labs/OpenSource/rag");
        let _m = server
            .mock("GET", format!("/projects/{encoded}").as_str())
            .with_status(403)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let cancel = CancellationToken::new();
        let err = client.get_branches(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
