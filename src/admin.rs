//! Minimal `axum` HTTP surface: `/healthz`, `/status`, `/metrics`. Read-only:
//! never mutates the Store or Scheduler, and cannot affect polling.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::dispatcher::metrics_as_map;
use crate::error::{Error, Result};
use crate::poller::{PollerCore, PollerState};

#[derive(Clone)]
struct AdminState {
    poller: PollerCore,
}

#[derive(Serialize)]
struct RepoStatus {
    repository: String,
    next_poll_time: chrono::DateTime<chrono::Utc>,
    last_poll_time: Option<chrono::DateTime<chrono::Utc>>,
    poll_count: u64,
    enabled: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    repositories: Vec<RepoStatus>,
    events_by_status: BTreeMap<String, i64>,
}

/// Builds the admin router. Bound to `listen_addr` by [`serve`].
pub fn router(poller: PollerCore) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/repos", get(repos))
        .with_state(AdminState { poller })
}

/// Binds and serves the admin router until the process is asked to stop.
pub async fn serve(poller: PollerCore, listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid admin.listen_addr {listen_addr:?}: {e}")))?;

    let router = router(poller);
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::Config(format!("admin server error: {e}")))?;
    Ok(())
}

async fn healthz(State(state): State<AdminState>) -> impl IntoResponse {
    if state.poller.state() == PollerState::Running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not running")
    }
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let repositories = state
        .poller
        .scheduler_snapshot()
        .into_iter()
        .map(|e| RepoStatus {
            repository: e.repository,
            next_poll_time: e.next_poll_time,
            last_poll_time: e.last_poll_time,
            poll_count: e.poll_count,
            enabled: e.enabled,
        })
        .collect();

    let events_by_status = state
        .poller
        .store()
        .count_events_by_status()
        .await
        .unwrap_or_default();

    Json(StatusResponse {
        state: format!("{:?}", state.poller.state()),
        repositories,
        events_by_status,
    })
}

#[derive(Serialize)]
struct RepoBranchesResponse {
    repository: String,
    enabled: bool,
    branches: Vec<RepoBranchStatus>,
}

#[derive(Serialize)]
struct RepoBranchStatus {
    branch: String,
    commit_sha: String,
    last_checked_at: chrono::DateTime<chrono::Utc>,
}

/// Per-repository tracked-branch baselines, read straight from the Store.
async fn repos(State(state): State<AdminState>) -> impl IntoResponse {
    let mut out = Vec::new();
    for entry in state.poller.scheduler_snapshot() {
        let branches = state
            .poller
            .store()
            .get_repo_states(&entry.repository)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|s| RepoBranchStatus {
                branch: s.branch,
                commit_sha: s.commit_sha,
                last_checked_at: s.last_checked_at,
            })
            .collect();
        out.push(RepoBranchesResponse {
            repository: entry.repository,
            enabled: entry.enabled,
            branches,
        });
    }
    Json(out)
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let mut text = state.poller.metrics().render_text();
    let dispatch = metrics_as_map(state.poller.dispatcher_metrics().snapshot());
    for (key, value) in dispatch {
        text.push_str(&format!("dispatch_{key} {value}\n"));
    }
    text
}
