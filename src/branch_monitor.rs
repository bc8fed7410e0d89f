//! Compares live branches (via [`crate::git_client::GitClient`]) against the
//! stored baseline and produces a deterministically ordered change set.
//! Branch-regex filtering is applied before comparison; filtered branches
//! never populate the store.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::git_client::GitClient;
use crate::store::Store;
use crate::types::{Branch, BranchChange, ChangeType, Repository};

/// Diffs live branches for `repository` against its stored baseline.
///
/// Ordering: the returned changes are sorted by `(change_type, branch_name)`
/// so a single repository's changes are always produced in the same
/// relative order, regardless of the live API's listing order.
pub async fn poll_repository(
    repository: &Repository,
    client: &dyn GitClient,
    store: &Store,
    cancel: &CancellationToken,
) -> Result<Vec<BranchChange>> {
    let live_branches = client.get_branches(cancel).await?;
    let filtered: Vec<Branch> = live_branches
        .into_iter()
        .filter(|b| repository.branch_regex.is_match(&b.name))
        .collect();

    let baseline = store.get_repo_states(&repository.name).await?;
    let now = chrono::Utc::now();

    let mut changes = Vec::new();

    for live in &filtered {
        match baseline.iter().find(|s| s.branch == live.name) {
            None => {
                let (commit_message, author) = enrich_commit_detail(client, live, cancel).await;
                changes.push(BranchChange {
                    repository: repository.name.clone(),
                    branch: live.name.clone(),
                    old_sha: None,
                    new_sha: Some(live.commit_sha.clone()),
                    change_type: ChangeType::Created,
                    protected: live.protected,
                    commit_message,
                    author,
                    timestamp: now,
                })
            }
            Some(state) if state.commit_sha != live.commit_sha => {
                let (commit_message, author) = enrich_commit_detail(client, live, cancel).await;
                changes.push(BranchChange {
                    repository: repository.name.clone(),
                    branch: live.name.clone(),
                    old_sha: Some(state.commit_sha.clone()),
                    new_sha: Some(live.commit_sha.clone()),
                    change_type: ChangeType::Updated,
                    protected: live.protected,
                    commit_message,
                    author,
                    timestamp: now,
                })
            }
            Some(state) => {
                // No-op: no event, but the baseline's last_checked_at still
                // advances so operators can see the repo is alive.
                store
                    .upsert_repo_state(&repository.name, &state.branch, &state.commit_sha, now)
                    .await?;
            }
        }
    }

    if repository.deletion_tracking {
        for state in &baseline {
            if !filtered.iter().any(|b| b.name == state.branch) {
                changes.push(BranchChange {
                    repository: repository.name.clone(),
                    branch: state.branch.clone(),
                    old_sha: Some(state.commit_sha.clone()),
                    new_sha: None,
                    change_type: ChangeType::Deleted,
                    protected: false,
                    commit_message: None,
                    author: None,
                    timestamp: now,
                });
            }
        }
    }

    changes.sort_by(|a, b| a.change_type.cmp(&b.change_type).then_with(|| a.branch.cmp(&b.branch)));

    Ok(changes)
}

/// Fills in commit message/author for a changed branch when the live branch
/// listing didn't already carry them (GitHub's branches endpoint omits both;
/// GitLab's includes them directly). Best-effort: a failure here must not
/// fail the poll, so errors fall back to whatever the listing already had.
async fn enrich_commit_detail(
    client: &dyn GitClient,
    live: &Branch,
    cancel: &CancellationToken,
) -> (Option<String>, Option<String>) {
    if live.commit_message.is_some() || live.author.is_some() {
        return (live.commit_message.clone(), live.author.clone());
    }
    client
        .get_commit_detail(&live.name, cancel)
        .await
        .unwrap_or((None, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{Provider, RateLimitInfo};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeClient {
        branches: Vec<Branch>,
    }

    #[async_trait]
    impl GitClient for FakeClient {
        async fn get_branches(&self, _cancel: &CancellationToken) -> Result<Vec<Branch>> {
            Ok(self.branches.clone())
        }
        async fn get_latest_commit(&self, _branch: &str, _cancel: &CancellationToken) -> Result<String> {
            unreachable!()
        }
        async fn check_permissions(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn get_rate_limit(&self, _cancel: &CancellationToken) -> Result<RateLimitInfo> {
            unreachable!()
        }
        fn provider(&self) -> Provider {
            Provider::Github
        }
        async fn get_commit_detail(
            &self,
            _branch: &str,
            _cancel: &CancellationToken,
        ) -> Result<(Option<String>, Option<String>)> {
            Ok((Some("fetched message".to_string()), Some("fetched author".to_string())))
        }
    }

    fn test_repository(deletion_tracking: bool) -> Repository {
        test_repository_with_regex(deletion_tracking, "^.*$")
    }

    fn test_repository_with_regex(deletion_tracking: bool, regex: &str) -> Repository {
        Repository {
            name: "demo".to_string(),
            url: "https://github.com/example/demo".to_string(),
            provider: Provider::Github,
            token: None,
            branch_regex: regex::Regex::new(regex).unwrap(),
            enabled: true,
            poll_interval: None,
            deletion_tracking,
            labels: Default::default(),
        }
    }

    fn branch(name: &str, sha: &str) -> Branch {
        Branch {
            name: name.to_string(),
            commit_sha: sha.to_string(),
            protected: false,
            commit_message: None,
            author: None,
        }
    }

    async fn test_store() -> Store {
        Store::connect(":memory:", 1, Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn first_sight_produces_created_event() {
        let store = test_store().await;
        let repo = test_repository(false);
        let client = FakeClient {
            branches: vec![branch("main", "abc12345")],
        };
        let cancel = CancellationToken::new();

        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Created);
        assert_eq!(changes[0].new_sha.as_deref(), Some("abc12345"));
    }

    #[tokio::test]
    async fn listing_without_commit_detail_is_enriched_from_get_commit_detail() {
        let store = test_store().await;
        let repo = test_repository(false);
        let client = FakeClient {
            branches: vec![branch("main", "abc12345")],
        };
        let cancel = CancellationToken::new();

        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();
        assert_eq!(changes[0].commit_message.as_deref(), Some("fetched message"));
        assert_eq!(changes[0].author.as_deref(), Some("fetched author"));
    }

    #[tokio::test]
    async fn unchanged_tip_produces_no_changes_but_advances_last_checked() {
        let store = test_store().await;
        let repo = test_repository(false);
        store
            .upsert_repo_state("demo", "main", "abc12345", chrono::Utc::now())
            .await
            .unwrap();
        let before = store.get_repo_states("demo").await.unwrap()[0].last_checked_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let client = FakeClient {
            branches: vec![branch("main", "abc12345")],
        };
        let cancel = CancellationToken::new();
        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();

        assert!(changes.is_empty());
        let after = store.get_repo_states("demo").await.unwrap()[0].last_checked_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn changed_tip_produces_updated_event() {
        let store = test_store().await;
        let repo = test_repository(false);
        store
            .upsert_repo_state("demo", "main", "abc12345", chrono::Utc::now())
            .await
            .unwrap();

        let client = FakeClient {
            branches: vec![branch("main", "def67890")],
        };
        let cancel = CancellationToken::new();
        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Updated);
        assert_eq!(changes[0].old_sha.as_deref(), Some("abc12345"));
        assert_eq!(changes[0].new_sha.as_deref(), Some("def67890"));
    }

    #[tokio::test]
    async fn branches_failing_regex_are_never_compared_or_stored() {
        let store = test_store().await;
        let repo = test_repository_with_regex(false, "^(main|release/.*)$");
        let client = FakeClient {
            branches: vec![branch("main", "abc12345"), branch("wip/scratch", "ffffffff")],
        };
        let cancel = CancellationToken::new();
        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].branch, "main");
        assert!(store.get_repo_states("demo").await.unwrap().is_empty(), "no baseline written yet (event not persisted)");
    }

    #[tokio::test]
    async fn deletion_tracking_disabled_by_default_emits_nothing_for_missing_branch() {
        let store = test_store().await;
        let repo = test_repository(false);
        store
            .upsert_repo_state("demo", "main", "abc12345", chrono::Utc::now())
            .await
            .unwrap();

        let client = FakeClient { branches: vec![] };
        let cancel = CancellationToken::new();
        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn deletion_tracking_enabled_emits_deleted_event() {
        let store = test_store().await;
        let repo = test_repository(true);
        store
            .upsert_repo_state("demo", "gone", "abc12345", chrono::Utc::now())
            .await
            .unwrap();

        let client = FakeClient { branches: vec![] };
        let cancel = CancellationToken::new();
        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Deleted);
        assert_eq!(changes[0].branch, "gone");
    }

    #[tokio::test]
    async fn new_branch_added_does_not_affect_existing_branch() {
        let store = test_store().await;
        let repo = test_repository(false);
        store
            .upsert_repo_state("demo", "main", "abc12345", chrono::Utc::now())
            .await
            .unwrap();

        let client = FakeClient {
            branches: vec![branch("main", "abc12345"), branch("feature/x", "ff00ff00")],
        };
        let cancel = CancellationToken::new();
        let changes = poll_repository(&repo, &client, &store, &cancel).await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].branch, "feature/x");
        assert_eq!(changes[0].change_type, ChangeType::Created);
    }

    #[test]
    fn error_is_retryable_classification_unused_here_but_exported() {
        // sanity: Error::Network participates in is_retryable for upstream callers
        assert!(Error::Network("x".into()).is_retryable());
    }
}
