//! GitHub REST v3 variant: `GET /repos/{owner}/{name}/branches[/{branch}]`,
//! rate limits from `X-RateLimit-*` response headers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
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

pub struct GitHubClient {
    client: Client,
    api_base_url: String,
    full_name: String,
    token: Option<secrecy::SecretString>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    name: String,
    commit: GhBranchCommit,
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct GhBranchCommit {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhBranchDetail {
    commit: GhCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    sha: String,
    commit: GhCommitInner,
    author: Option<GhAuthor>,
}

#[derive(Debug, Deserialize)]
struct GhCommitInner {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GhAuthor {
    login: String,
}

impl GitHubClient {
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
        let parse = |name: &str| -> Option<u32> {
            headers.get(name)?.to_str().ok()?.parse().ok()
        };
        if let (Some(limit), Some(remaining), Some(reset)) = (
            parse("x-ratelimit-limit"),
            parse("x-ratelimit-remaining"),
            parse("x-ratelimit-reset"),
        ) {
            let reset_time = Utc.timestamp_opt(reset as i64, 0).single().unwrap_or_else(Utc::now);
            self.rate_limiter.update_limit(limit, remaining, reset_time);
        }
    }
}

async fn classify_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        StatusCode::OK => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Authentication(format!("GitHub API: {}", response.status())))
        }
        StatusCode::NOT_FOUND => Err(Error::RepositoryNotFound("GitHub API: 404".to_string())),
        StatusCode::TOO_MANY_REQUESTS => {
            let reset_time = response
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
            Err(Error::RateLimitExceeded { reset_time })
        }
        status if status.is_server_error() => {
            Err(Error::Network(format!("GitHub API server error: {status}")))
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Validation(format!("GitHub API returned {status}: {body}")))
        }
    }
}

#[async_trait]
impl GitClient for GitHubClient {
    async fn get_branches(&self, cancel: &CancellationToken) -> Result<Vec<Branch>> {
        self.rate_limiter.wait(cancel).await?;
        let path = format!("/repos/{}/branches?per_page=100", self.full_name);

        let branches: Vec<GhBranch> = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<Vec<GhBranch>>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitHub branches response: {e}")))
            })
            .await?;

        debug!(count = branches.len(), repo = %self.full_name, "fetched branches from GitHub");

        Ok(branches
            .into_iter()
            .map(|b| Branch {
                name: b.name,
                commit_sha: b.commit.sha,
                protected: b.protected,
                commit_message: None,
                author: None,
            })
            .collect())
    }

    async fn get_latest_commit(&self, branch: &str, cancel: &CancellationToken) -> Result<String> {
        self.rate_limiter.wait(cancel).await?;
        let path = format!("/repos/{}/branches/{}", self.full_name, branch);

        let detail: GhBranchDetail = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<GhBranchDetail>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitHub branch detail: {e}")))
            })
            .await?;

        Ok(detail.commit.sha)
    }

    async fn check_permissions(&self, cancel: &CancellationToken) -> Result<()> {
        self.rate_limiter.wait(cancel).await?;
        let path = format!("/repos/{}", self.full_name);
        self.send(self.request(reqwest::Method::GET, &path)).await?;
        Ok(())
    }

    async fn get_rate_limit(&self, _cancel: &CancellationToken) -> Result<RateLimitInfo> {
        Ok(self.rate_limiter.snapshot())
    }

    fn provider(&self) -> Provider {
        Provider::Github
    }

    async fn get_commit_detail(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Option<String>)> {
        self.rate_limiter.wait(cancel).await?;
        let path = format!("/repos/{}/branches/{}", self.full_name, branch);
        let detail: GhBranchDetail = self
            .retry
            .run(|| async {
                let resp = self.send(self.request(reqwest::Method::GET, &path)).await?;
                resp.json::<GhBranchDetail>()
                    .await
                    .map_err(|e| Error::Network(format!("decoding GitHub branch detail: {e}")))
            })
            .await?;
        Ok((
            Some(detail.commit.commit.message),
            detail.commit.author.map(|a| a.login),
        ))
    }
}
