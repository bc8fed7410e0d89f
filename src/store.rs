//! Durable store: repository baselines (`repository_states`) and the event
//! journal (`events`). Single-writer (`PollerCore`); reads are safe under
//! reader-writer concurrency (AdminApi, `status` CLI subcommand).

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::types::{Event, EventStatus, EventType, Provider, RepoState};

/// Embedded migrations, applied in a single transaction per version. The
/// applied version is recorded by `sqlx`'s own `_sqlx_migrations` ledger,
/// functionally equivalent to the `schema_migrations` table named in the
/// reference schema.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Handle to the embedded store. Cheap to clone: wraps an `Arc<SqlitePool>`
/// internally, safe to share between the admin HTTP server and `PollerCore`.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the sqlite database at `path` and
    /// applies pending migrations.
    pub async fn connect(
        path: &str,
        max_connections: u32,
        connection_timeout: std::time::Duration,
    ) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| Error::Storage(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connection_timeout)
            .connect_with(options)
            .await?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Applies any pending migrations. Idempotent: already-applied versions
    /// are skipped by `sqlx`'s migration ledger.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Insert or update a baseline by `(repository, branch)`. Sets
    /// `updated_at` to now; `created_at` is preserved on update.
    pub async fn upsert_repo_state(
        &self,
        repository: &str,
        branch: &str,
        commit_sha: &str,
        last_checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO repository_states
                (repository, branch, commit_sha, last_checked_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(repository, branch) DO UPDATE SET
                commit_sha = excluded.commit_sha,
                last_checked_at = excluded.last_checked_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(repository)
        .bind(branch)
        .bind(commit_sha)
        .bind(last_checked_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns every baseline row for `repository`; empty on first sight.
    pub async fn get_repo_states(&self, repository: &str) -> Result<Vec<RepoState>> {
        let rows = sqlx::query(
            r#"
            SELECT id, repository, branch, commit_sha, last_checked_at, created_at, updated_at
            FROM repository_states
            WHERE repository = ?1
            "#,
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_repo_state).collect()
    }

    /// Deletes a baseline row, used once a `branch_deleted` event for it has
    /// been persisted (deletion-tracking repositories only).
    pub async fn delete_repo_state(&self, repository: &str, branch: &str) -> Result<()> {
        sqlx::query("DELETE FROM repository_states WHERE repository = ?1 AND branch = ?2")
            .bind(repository)
            .bind(branch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists a new event as `pending`. Fails with [`Error::DuplicateEvent`]
    /// if the id already exists; callers treat that as benign (idempotency
    /// safeguard against at-least-once re-delivery of the same poll cycle).
    pub async fn save_event(&self, event: &Event) -> Result<()> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM events WHERE id = ?1")
            .bind(&event.id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(Error::DuplicateEvent(event.id.clone()));
        }

        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| Error::Storage(format!("serializing event metadata: {e}")))?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO events
                (id, type, repository, branch, commit_sha, prev_commit, provider, timestamp,
                 metadata, status, error_message, processed_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            "#,
        )
        .bind(&event.id)
        .bind(event.event_type.as_str())
        .bind(&event.repository)
        .bind(&event.branch)
        .bind(&event.commit_sha)
        .bind(&event.prev_commit)
        .bind(event.provider.as_str())
        .bind(event.timestamp.to_rfc3339())
        .bind(metadata)
        .bind(event.status.as_str())
        .bind(&event.error_message)
        .bind(event.processed_at.map(|t| t.to_rfc3339()))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Moves an event to a new status. Sets `processed_at` when the new
    /// status is terminal (`processed`/`failed`).
    pub async fn update_event_status(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let processed_at = status.is_terminal().then_some(now.to_rfc3339());

        sqlx::query(
            r#"
            UPDATE events
            SET status = ?1, error_message = ?2, processed_at = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(processed_at)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Oldest-first pending/retrying events, for the periodic drain path.
    pub async fn get_pending_events(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, type, repository, branch, commit_sha, prev_commit, provider, timestamp,
                   metadata, status, error_message, processed_at, created_at, updated_at
            FROM events
            WHERE status IN ('pending', 'retrying')
            ORDER BY created_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    /// Deletes terminal events created before `before`. Housekeeping only;
    /// never removes `pending`/`retrying` rows.
    pub async fn delete_old_events(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM events
            WHERE status IN ('processed', 'failed') AND created_at < ?1
            "#,
        )
        .bind(before.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Backs the `/status` and `/metrics` admin surfaces.
    pub async fn count_events_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM events GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| Error::Storage(e.to_string()))?;
            let n: i64 = row.try_get("n").map_err(|e| Error::Storage(e.to_string()))?;
            counts.insert(status, n);
        }
        Ok(counts)
    }
}

fn row_to_repo_state(row: sqlx::sqlite::SqliteRow) -> Result<RepoState> {
    let parse_time = |s: String| -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Storage(format!("parsing timestamp {s:?}: {e}")))
    };

    Ok(RepoState {
        id: row.try_get("id").map_err(|e| Error::Storage(e.to_string()))?,
        repository: row
            .try_get("repository")
            .map_err(|e| Error::Storage(e.to_string()))?,
        branch: row.try_get("branch").map_err(|e| Error::Storage(e.to_string()))?,
        commit_sha: row
            .try_get("commit_sha")
            .map_err(|e| Error::Storage(e.to_string()))?,
        last_checked_at: parse_time(
            row.try_get("last_checked_at")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
        created_at: parse_time(
            row.try_get("created_at")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
        updated_at: parse_time(
            row.try_get("updated_at")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
    })
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<Event> {
    let parse_time = |s: String| -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Storage(format!("parsing timestamp {s:?}: {e}")))
    };
    let parse_opt_time = |s: Option<String>| -> Result<Option<DateTime<Utc>>> {
        s.map(parse_time).transpose()
    };

    let metadata_text: String = row
        .try_get("metadata")
        .map_err(|e| Error::Storage(e.to_string()))?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_text)
        .map_err(|e| Error::Storage(format!("parsing event metadata: {e}")))?;

    let event_type: String = row.try_get("type").map_err(|e| Error::Storage(e.to_string()))?;
    let provider: String = row
        .try_get("provider")
        .map_err(|e| Error::Storage(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| Error::Storage(e.to_string()))?;

    Ok(Event {
        id: row.try_get("id").map_err(|e| Error::Storage(e.to_string()))?,
        event_type: EventType::from_str(&event_type)?,
        repository: row
            .try_get("repository")
            .map_err(|e| Error::Storage(e.to_string()))?,
        branch: row.try_get("branch").map_err(|e| Error::Storage(e.to_string()))?,
        commit_sha: row
            .try_get("commit_sha")
            .map_err(|e| Error::Storage(e.to_string()))?,
        prev_commit: row
            .try_get("prev_commit")
            .map_err(|e| Error::Storage(e.to_string()))?,
        provider: Provider::from_str(&provider)?,
        timestamp: parse_time(
            row.try_get("timestamp")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
        metadata,
        status: EventStatus::from_str(&status)?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| Error::Storage(e.to_string()))?,
        processed_at: parse_opt_time(
            row.try_get("processed_at")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
        created_at: parse_time(
            row.try_get("created_at")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
        updated_at: parse_time(
            row.try_get("updated_at")
                .map_err(|e| Error::Storage(e.to_string()))?,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn test_store() -> Store {
        Store::connect(":memory:", 1, Duration::from_secs(5))
            .await
            .unwrap()
    }

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            event_type: EventType::BranchCreated,
            repository: "demo".to_string(),
            branch: "main".to_string(),
            commit_sha: "abc12345".to_string(),
            prev_commit: None,
            provider: Provider::Github,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            status: EventStatus::Pending,
            error_message: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_repo_state() {
        let store = test_store().await;
        assert!(store.get_repo_states("demo").await.unwrap().is_empty());

        store
            .upsert_repo_state("demo", "main", "abc123", Utc::now())
            .await
            .unwrap();
        let states = store.get_repo_states("demo").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].commit_sha, "abc123");

        store
            .upsert_repo_state("demo", "main", "def456", Utc::now())
            .await
            .unwrap();
        let states = store.get_repo_states("demo").await.unwrap();
        assert_eq!(states.len(), 1, "unique on (repository, branch)");
        assert_eq!(states[0].commit_sha, "def456");
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected_and_preserves_original() {
        let store = test_store().await;
        let event = sample_event("event_abc12345_20260101_000000");
        store.save_event(&event).await.unwrap();

        let mut dup = event.clone();
        dup.commit_sha = "different".to_string();
        let err = store.save_event(&dup).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateEvent(_)));

        let pending = store.get_pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].commit_sha, "abc12345");
    }

    #[tokio::test]
    async fn update_event_status_sets_processed_at_on_terminal() {
        let store = test_store().await;
        let event = sample_event("event_abc12345_20260101_000000");
        store.save_event(&event).await.unwrap();

        store
            .update_event_status(&event.id, EventStatus::Processed, None)
            .await
            .unwrap();

        let pending = store.get_pending_events(10).await.unwrap();
        assert!(pending.is_empty());

        let counts = store.count_events_by_status().await.unwrap();
        assert_eq!(counts.get("processed"), Some(&1));
    }

    #[tokio::test]
    async fn get_pending_events_oldest_first() {
        let store = test_store().await;
        for i in 0..3 {
            let mut e = sample_event(&format!("event_{i}_20260101_000000"));
            e.timestamp = Utc::now();
            store.save_event(&e).await.unwrap();
        }
        let pending = store.get_pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].id, "event_0_20260101_000000");
        assert_eq!(pending[2].id, "event_2_20260101_000000");
    }

    #[tokio::test]
    async fn connect_creates_missing_parent_directories() {
        let dir = tempdir::TempDir::new("reposentry-store-test").unwrap();
        let db_path = dir.path().join("nested").join("sub").join("reposentry.db");
        let store = Store::connect(db_path.to_str().unwrap(), 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(db_path.exists());
        let states = store.get_repo_states("demo").await.unwrap();
        assert!(states.is_empty());
    }
}
