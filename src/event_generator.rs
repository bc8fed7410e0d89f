//! Converts `[BranchChange]` into `[Event]`: assigns event type, fills
//! `prev_commit`, stamps provider/timestamp, attaches metadata, and
//! re-applies the branch-regex filter as a safety net. Skips no-op changes
//! (there are none by construction — [`crate::branch_monitor`] never emits
//! them — but the filter stays here too as a defense-in-depth check).

use std::collections::BTreeMap;

use chrono::Utc;

use crate::types::{BranchChange, ChangeType, Event, EventStatus, Repository};

/// Generates events for `repository` from a single poll's change set.
/// Persistence is the caller's (`PollerCore`'s) responsibility.
pub fn generate_events(repository: &Repository, changes: &[BranchChange]) -> Vec<Event> {
    changes
        .iter()
        .filter(|c| repository.branch_regex.is_match(&c.branch))
        .map(|change| to_event(repository, change))
        .collect()
}

fn to_event(repository: &Repository, change: &BranchChange) -> Event {
    let now = Utc::now();
    let commit_sha = change
        .new_sha
        .clone()
        .or_else(|| change.old_sha.clone())
        .unwrap_or_default();

    let mut metadata = BTreeMap::new();
    metadata.insert(
        "repository_url".to_string(),
        repository.url.clone(),
    );
    if let Some(message) = &change.commit_message {
        metadata.insert("commit_message".to_string(), message.clone());
    }
    if let Some(author) = &change.author {
        metadata.insert("author".to_string(), author.clone());
    }
    metadata.insert("protected".to_string(), change.protected.to_string());
    for (key, value) in &repository.labels {
        metadata.insert(format!("labels.{key}"), value.clone());
    }

    Event {
        id: deterministic_event_id(&commit_sha, now),
        event_type: change.change_type.event_type(),
        repository: repository.name.clone(),
        branch: change.branch.clone(),
        commit_sha,
        prev_commit: match change.change_type {
            ChangeType::Updated => change.old_sha.clone(),
            _ => None,
        },
        provider: repository.provider,
        timestamp: now,
        metadata,
        status: EventStatus::Pending,
        error_message: None,
        processed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Deterministic event id: `event_<shortSHA>_<YYYYMMDD_HHMMSS>`, where
/// `shortSHA` is the first 8 hex chars of `commit_sha`. Two polls observing
/// the same `(commit_sha, timestamp-truncated-to-second)` produce the same
/// id — the basis for the Store's duplicate-suppression idempotency
/// safeguard.
pub fn deterministic_event_id(commit_sha: &str, timestamp: chrono::DateTime<Utc>) -> String {
    let short_sha: String = commit_sha.chars().take(8).collect();
    format!("event_{short_sha}_{}", timestamp.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;
    use chrono::TimeZone;

    fn test_repository(regex: &str) -> Repository {
        Repository {
            name: "demo".to_string(),
            url: "https://github.com/example/demo".to_string(),
            provider: Provider::Github,
            token: None,
            branch_regex: regex::Regex::new(regex).unwrap(),
            enabled: true,
            poll_interval: None,
            deletion_tracking: false,
            labels: Default::default(),
        }
    }

    fn change(change_type: ChangeType, branch: &str, old: Option<&str>, new: Option<&str>) -> BranchChange {
        BranchChange {
            repository: "demo".to_string(),
            branch: branch.to_string(),
            old_sha: old.map(String::from),
            new_sha: new.map(String::from),
            change_type,
            protected: false,
            commit_message: None,
            author: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn created_event_has_no_prev_commit() {
        let repo = test_repository("^.*$");
        let changes = vec![change(ChangeType::Created, "main", None, Some("abc12345"))];
        let events = generate_events(&repo, &changes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].prev_commit, None);
        assert_eq!(events[0].commit_sha, "abc12345");
        assert_eq!(events[0].metadata.get("repository_url").unwrap(), &repo.url);
    }

    #[test]
    fn updated_event_carries_distinct_prev_commit() {
        let repo = test_repository("^.*$");
        let changes = vec![change(ChangeType::Updated, "main", Some("abc12345"), Some("def67890"))];
        let events = generate_events(&repo, &changes);
        assert_eq!(events[0].prev_commit.as_deref(), Some("abc12345"));
        assert_eq!(events[0].commit_sha, "def67890");
        assert_ne!(events[0].prev_commit.as_deref().unwrap(), events[0].commit_sha);
    }

    #[test]
    fn safety_net_filters_branches_failing_regex() {
        let repo = test_repository("^main$");
        let changes = vec![
            change(ChangeType::Created, "main", None, Some("abc12345")),
            change(ChangeType::Created, "wip", None, Some("ffffffff")),
        ];
        let events = generate_events(&repo, &changes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].branch, "main");
    }

    #[test]
    fn event_id_is_deterministic_on_commit_and_truncated_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            deterministic_event_id("abc1234567890", t1),
            deterministic_event_id("abc1234567890", t2)
        );
        assert_eq!(deterministic_event_id("abc1234567890", t1), "event_abc12345_20260101_120000");
    }

    #[test]
    fn labels_are_echoed_into_metadata_with_prefix() {
        let mut repo = test_repository("^.*$");
        repo.labels.insert("team".to_string(), "platform".to_string());
        let changes = vec![change(ChangeType::Created, "main", None, Some("abc12345"))];
        let events = generate_events(&repo, &changes);
        assert_eq!(events[0].metadata.get("labels.team").map(String::as_str), Some("platform"));
    }
}
