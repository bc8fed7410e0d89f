//! Core data model shared across the polling core: repository configuration,
//! persisted baselines, the event journal, and the transient change records
//! produced by a single poll cycle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which hosting provider a repository belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Provider::Github),
            "gitlab" => Ok(Provider::Gitlab),
            other => Err(crate::error::Error::Validation(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

/// Repository configuration, immutable at runtime (reloaded wholesale on
/// config reload, never mutated in place).
#[derive(Debug, Clone)]
pub struct Repository {
    pub name: String,
    pub url: String,
    pub provider: Provider,
    pub token: Option<secrecy::SecretString>,
    pub branch_regex: regex::Regex,
    pub enabled: bool,
    pub poll_interval: Option<std::time::Duration>,
    pub deletion_tracking: bool,
    pub labels: BTreeMap<String, String>,
}

impl PartialEq for Repository {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.url == other.url
            && self.provider == other.provider
            && self.branch_regex.as_str() == other.branch_regex.as_str()
            && self.enabled == other.enabled
            && self.poll_interval == other.poll_interval
            && self.deletion_tracking == other.deletion_tracking
            && self.labels == other.labels
    }
}

/// Baseline row: the last-known tip of one (repository, branch) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoState {
    pub id: i64,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BranchCreated,
    BranchUpdated,
    BranchDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BranchCreated => "branch_created",
            EventType::BranchUpdated => "branch_updated",
            EventType::BranchDeleted => "branch_deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch_created" => Ok(EventType::BranchCreated),
            "branch_updated" => Ok(EventType::BranchUpdated),
            "branch_deleted" => Ok(EventType::BranchDeleted),
            other => Err(crate::error::Error::Storage(format!(
                "unknown event type in store: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Retrying,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Retrying => "retrying",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Processed | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "retrying" => Ok(EventStatus::Retrying),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(crate::error::Error::Storage(format!(
                "unknown event status in store: {other}"
            ))),
        }
    }
}

/// Immutable-once-terminal event record: ids never collide, `branch_updated`
/// always carries a distinct `prev_commit`, and a repository's baseline
/// always converges on the most recent non-pending event for that branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub prev_commit: Option<String>,
    pub provider: Provider,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub status: EventStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The kind of change a `BranchMonitor` observed between the live branch
/// list and the stored baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn event_type(&self) -> EventType {
        match self {
            ChangeType::Created => EventType::BranchCreated,
            ChangeType::Updated => EventType::BranchUpdated,
            ChangeType::Deleted => EventType::BranchDeleted,
        }
    }
}

/// Transient, in-memory record of a single branch's change; never
/// persisted and never outlives the poll cycle that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchChange {
    pub repository: String,
    pub branch: String,
    pub old_sha: Option<String>,
    pub new_sha: Option<String>,
    pub change_type: ChangeType,
    pub protected: bool,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A branch as reported live by a `GitClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
    pub protected: bool,
    pub commit_message: Option<String>,
    pub author: Option<String>,
}

/// Rate-limit accounting for one provider/instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}
