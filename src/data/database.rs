//! SQLite database operations
//!
//! All database access goes through this module. The store owns four tables:
//! cached accounts, relation edges, the durable job queue, and rate-limit
//! records. Every write is an idempotent upsert or a keyed delete, so any
//! sync invocation is safe to repeat.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Raw `sync_jobs` row; converted to [`SyncJob`] after enum/JSON parsing.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    kind: String,
    account_id: i64,
    relation: String,
    direction: String,
    pagination_token: Option<String>,
    priority: i64,
    paused: bool,
    finished: bool,
    state: String,
    run_at: DateTime<Utc>,
    attempts: i64,
    updated_count: i64,
    last_error: Option<String>,
    add_edges: bool,
    target_ids: String,
    done_ids: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, AppError> {
        let kind = JobKind::parse(&row.kind).ok_or_else(|| {
            AppError::InvariantViolation(format!("unknown job kind: {}", row.kind))
        })?;
        let relation = Relation::parse(&row.relation).ok_or_else(|| {
            AppError::InvariantViolation(format!("unknown relation: {}", row.relation))
        })?;
        let direction = Direction::parse(&row.direction).ok_or_else(|| {
            AppError::InvariantViolation(format!("unknown direction: {}", row.direction))
        })?;
        let state = JobState::parse(&row.state).ok_or_else(|| {
            AppError::InvariantViolation(format!("unknown job state: {}", row.state))
        })?;

        Ok(SyncJob {
            id: JobId::from_string(row.id),
            kind,
            account_id: row.account_id,
            relation,
            direction,
            pagination_token: row.pagination_token,
            priority: row.priority,
            paused: row.paused,
            finished: row.finished,
            state,
            run_at: row.run_at,
            attempts: row.attempts,
            updated_count: row.updated_count,
            last_error: row.last_error,
            add_edges: row.add_edges,
            target_ids: serde_json::from_str(&row.target_ids)?,
            done_ids: serde_json::from_str(&row.done_ids)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Column storing the freshness timestamp for one edge set.
fn freshness_column(relation: Relation, direction: Direction) -> &'static str {
    match (relation, direction) {
        (Relation::Follow, Direction::Followers) => "followers_updated_at",
        (Relation::Follow, Direction::Following) => "following_updated_at",
        (Relation::Block, _) => "blocking_updated_at",
        (Relation::Mute, _) => "muting_updated_at",
    }
}

/// Which edge column identifies the owning account for an edge set.
///
/// Followers of X are edges pointing *at* X; everything else fans out
/// *from* X.
fn owner_column(direction: Direction) -> &'static str {
    match direction {
        Direction::Followers => "target_id",
        Direction::Following => "source_id",
    }
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Upsert a batch of observed profiles.
    ///
    /// Refreshes display and counter fields; never touches freshness
    /// timestamps, and `created_at` is only written on first insert.
    pub async fn upsert_profiles(&self, profiles: &[AccountProfile]) -> Result<(), AppError> {
        if profiles.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for profile in profiles {
            sqlx::query(
                r#"
                INSERT INTO accounts (
                    id, username, name, description, location, profile_image_url, url,
                    followers_count, following_count, tweet_count, listed_count,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    name = excluded.name,
                    description = excluded.description,
                    location = excluded.location,
                    profile_image_url = excluded.profile_image_url,
                    url = excluded.url,
                    followers_count = excluded.followers_count,
                    following_count = excluded.following_count,
                    tweet_count = excluded.tweet_count,
                    listed_count = excluded.listed_count,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(profile.id)
            .bind(&profile.username)
            .bind(&profile.name)
            .bind(&profile.description)
            .bind(&profile.location)
            .bind(&profile.profile_image_url)
            .bind(&profile.url)
            .bind(profile.followers_count)
            .bind(profile.following_count)
            .bind(profile.tweet_count)
            .bind(profile.listed_count)
            .bind(profile.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get a cached account by id
    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Get a cached account by username (case-insensitive)
    ///
    /// If stale snapshots collide on a renamed username, the most recently
    /// observed one wins.
    pub async fn get_account_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT * FROM accounts
            WHERE username = ? COLLATE NOCASE
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Get cached accounts for a set of ids (missing ids are skipped)
    pub async fn get_accounts_by_ids(&self, ids: &[i64]) -> Result<Vec<Account>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM accounts WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        builder.push(")");

        let accounts = builder
            .build_query_as::<Account>()
            .fetch_all(&self.pool)
            .await?;

        Ok(accounts)
    }

    /// Set the freshness timestamp for one edge set of an account.
    ///
    /// Only the sync worker's finalize step may call this.
    pub async fn update_freshness(
        &self,
        account_id: i64,
        relation: Relation,
        direction: Direction,
        timestamp: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let column = freshness_column(relation, direction);
        let sql = format!("UPDATE accounts SET {column} = ? WHERE id = ?");

        let result = sqlx::query(&sql)
            .bind(timestamp)
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvariantViolation(format!(
                "freshness update for uncached account {account_id}"
            )));
        }

        Ok(())
    }

    // =========================================================================
    // Edges
    // =========================================================================

    /// Flag every existing edge of an account's edge set as a delete
    /// candidate.
    ///
    /// First step of a fresh sync pass; upserts during the pass clear the
    /// flag for every edge the remote still reports.
    pub async fn mark_edges_for_delete(
        &self,
        relation: Relation,
        account_id: i64,
        direction: Direction,
    ) -> Result<u64, AppError> {
        let owner = owner_column(direction);
        let sql = format!("UPDATE edges SET to_delete = 1 WHERE relation = ? AND {owner} = ?");

        let result = sqlx::query(&sql)
            .bind(relation.as_str())
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Upsert a batch of edges, clearing their delete flags.
    pub async fn upsert_edges(
        &self,
        relation: Relation,
        pairs: &[(i64, i64)],
    ) -> Result<u64, AppError> {
        if pairs.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for (source_id, target_id) in pairs {
            sqlx::query(
                r#"
                INSERT INTO edges (relation, source_id, target_id, updated_at, to_delete)
                VALUES (?, ?, ?, ?, 0)
                ON CONFLICT(relation, source_id, target_id) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    to_delete = 0
                "#,
            )
            .bind(relation.as_str())
            .bind(source_id)
            .bind(target_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(pairs.len() as u64)
    }

    /// Delete all edges of an edge set still flagged for deletion.
    ///
    /// Finalize step of a completed sync pass.
    pub async fn delete_flagged_edges(
        &self,
        relation: Relation,
        account_id: i64,
        direction: Direction,
    ) -> Result<u64, AppError> {
        let owner = owner_column(direction);
        let sql =
            format!("DELETE FROM edges WHERE relation = ? AND {owner} = ? AND to_delete = 1");

        let result = sqlx::query(&sql)
            .bind(relation.as_str())
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Delete one edge (used by mutation jobs mirroring a remote removal)
    pub async fn delete_edge(
        &self,
        relation: Relation,
        source_id: i64,
        target_id: i64,
    ) -> Result<(), AppError> {
        sqlx::query("DELETE FROM edges WHERE relation = ? AND source_id = ? AND target_id = ?")
            .bind(relation.as_str())
            .bind(source_id)
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Ids an account's edges point at (accounts it follows/blocks/mutes)
    pub async fn get_target_ids(
        &self,
        relation: Relation,
        source_id: i64,
    ) -> Result<Vec<i64>, AppError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT target_id FROM edges WHERE relation = ? AND source_id = ?",
        )
        .bind(relation.as_str())
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Ids whose edges point at an account (its followers)
    pub async fn get_source_ids(
        &self,
        relation: Relation,
        target_id: i64,
    ) -> Result<Vec<i64>, AppError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT source_id FROM edges WHERE relation = ? AND target_id = ?",
        )
        .bind(relation.as_str())
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Whether a specific edge exists
    pub async fn edge_exists(
        &self,
        relation: Relation,
        source_id: i64,
        target_id: i64,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM edges WHERE relation = ? AND source_id = ? AND target_id = ?",
        )
        .bind(relation.as_str())
        .bind(source_id)
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    // =========================================================================
    // Job queue
    // =========================================================================

    /// Insert a job unless a live job with the same dedup key exists.
    ///
    /// Single-flight is reject-if-exists: the partial unique index on
    /// `(kind, account_id, relation, direction)` over live states makes the
    /// check-and-insert atomic.
    ///
    /// # Returns
    /// `true` if inserted, `false` if a live duplicate exists.
    pub async fn enqueue_job(&self, job: &SyncJob) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, kind, account_id, relation, direction, pagination_token,
                priority, paused, finished, state, run_at, attempts,
                updated_count, last_error, add_edges, target_ids, done_ids,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job.id.0)
        .bind(job.kind.as_str())
        .bind(job.account_id)
        .bind(job.relation.as_str())
        .bind(job.direction.as_str())
        .bind(&job.pagination_token)
        .bind(job.priority)
        .bind(job.paused)
        .bind(job.finished)
        .bind(job.state.as_str())
        .bind(job.run_at)
        .bind(job.attempts)
        .bind(job.updated_count)
        .bind(&job.last_error)
        .bind(job.add_edges)
        .bind(serde_json::to_string(&job.target_ids)?)
        .bind(serde_json::to_string(&job.done_ids)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Get a job by id
    pub async fn get_job(&self, id: &JobId) -> Result<Option<SyncJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncJob::try_from).transpose()
    }

    /// Find the live job for a dedup key, if any
    pub async fn find_live_job(
        &self,
        kind: JobKind,
        account_id: i64,
        relation: Relation,
        direction: Direction,
    ) -> Result<Option<SyncJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM sync_jobs
            WHERE kind = ? AND account_id = ? AND relation = ? AND direction = ?
              AND state IN ('waiting', 'active', 'delayed')
            "#,
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(relation.as_str())
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncJob::try_from).transpose()
    }

    /// Atomically claim the next due job (promotion: waiting/delayed -> active).
    ///
    /// Higher priority dequeues first; ties break on the earlier `run_at`.
    /// Paused jobs are never claimed.
    pub async fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<SyncJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE sync_jobs
            SET state = 'active', updated_at = ?2
            WHERE id = (
                SELECT id FROM sync_jobs
                WHERE state IN ('waiting', 'delayed') AND paused = 0 AND run_at <= ?1
                ORDER BY priority DESC, run_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncJob::try_from).transpose()
    }

    /// Persist a sync job's resume point after a page.
    ///
    /// This checkpoint is the crash-recovery mechanism: a restarted worker
    /// resumes exactly here.
    pub async fn checkpoint_job(
        &self,
        id: &JobId,
        pagination_token: Option<&str>,
        pages_updated: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET pagination_token = ?, updated_count = updated_count + ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(pagination_token)
        .bind(pages_updated)
        .bind(Utc::now())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a job completed and finished
    pub async fn complete_job(&self, id: &JobId) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = 'completed', finished = 1, pagination_token = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reschedule a job after a rate-limit deferral.
    ///
    /// Not a failure: attempts are not incremented and the resume token
    /// persisted by the last checkpoint is kept.
    pub async fn delay_job(&self, id: &JobId, run_at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sync_jobs SET state = 'delayed', run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(run_at)
        .bind(Utc::now())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reschedule a job after a generic error (counts against `max_attempts`)
    pub async fn retry_job(
        &self,
        id: &JobId,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = 'delayed', run_at = ?, attempts = attempts + 1,
                last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(run_at)
        .bind(error)
        .bind(Utc::now())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a job to the failed state
    pub async fn fail_job(&self, id: &JobId, error: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = 'failed', attempts = attempts + 1, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Release a claimed job back to waiting without running it
    pub async fn release_job(&self, id: &JobId) -> Result<(), AppError> {
        sqlx::query("UPDATE sync_jobs SET state = 'waiting', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Set or clear a job's paused flag
    ///
    /// # Returns
    /// `true` if a job row was updated.
    pub async fn set_job_paused(&self, id: &JobId, paused: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE sync_jobs SET paused = ?, updated_at = ? WHERE id = ?")
            .bind(paused)
            .bind(Utc::now())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a job row
    pub async fn delete_job(&self, id: &JobId) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// List jobs, optionally filtered by state, most recently touched first
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<SyncJob>, AppError> {
        let rows = match state {
            Some(state) => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM sync_jobs WHERE state = ? ORDER BY updated_at DESC LIMIT ?",
                )
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM sync_jobs ORDER BY updated_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(SyncJob::try_from).collect()
    }

    /// Current number of live (waiting/active/delayed) jobs
    pub async fn count_live_jobs(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sync_jobs WHERE state IN ('waiting', 'active', 'delayed')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Persist mutation-job progress: committed targets and decayed priority.
    pub async fn update_mutation_progress(
        &self,
        id: &JobId,
        done_ids: &[i64],
        priority: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sync_jobs SET done_ids = ?, priority = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(done_ids)?)
        .bind(priority)
        .bind(Utc::now())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Garbage-collect terminal jobs past their retention caps.
    ///
    /// Completed jobs are kept briefly; failed jobs longer, for operator
    /// inspection. Both an age cap and a count cap apply.
    pub async fn prune_jobs(
        &self,
        completed_cutoff: DateTime<Utc>,
        completed_keep: i64,
        failed_cutoff: DateTime<Utc>,
        failed_keep: i64,
    ) -> Result<u64, AppError> {
        let mut pruned = 0;

        for (state, cutoff, keep) in [
            ("completed", completed_cutoff, completed_keep),
            ("failed", failed_cutoff, failed_keep),
        ] {
            let by_age = sqlx::query(
                "DELETE FROM sync_jobs WHERE state = ? AND updated_at < ?",
            )
            .bind(state)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            let by_count = sqlx::query(
                r#"
                DELETE FROM sync_jobs
                WHERE state = ?1 AND id NOT IN (
                    SELECT id FROM sync_jobs
                    WHERE state = ?1
                    ORDER BY updated_at DESC
                    LIMIT ?2
                )
                "#,
            )
            .bind(state)
            .bind(keep)
            .execute(&self.pool)
            .await?;

            pruned += by_age.rows_affected() + by_count.rows_affected();
        }

        Ok(pruned)
    }

    // =========================================================================
    // Rate limits
    // =========================================================================

    /// Record that an account is rate-limited on an endpoint until `resets_at`
    pub async fn upsert_rate_limit(
        &self,
        account_id: i64,
        endpoint: &str,
        resets_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (account_id, endpoint, resets_at)
            VALUES (?, ?, ?)
            ON CONFLICT(account_id, endpoint) DO UPDATE SET resets_at = excluded.resets_at
            "#,
        )
        .bind(account_id)
        .bind(endpoint)
        .bind(resets_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the rate-limit record for an account/endpoint, if any
    pub async fn get_rate_limit(
        &self,
        account_id: i64,
        endpoint: &str,
    ) -> Result<Option<RateLimitRecord>, AppError> {
        let record = sqlx::query_as::<_, RateLimitRecord>(
            "SELECT * FROM rate_limits WHERE account_id = ? AND endpoint = ?",
        )
        .bind(account_id)
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Clear the rate-limit record after a successful fetch
    pub async fn clear_rate_limit(&self, account_id: i64, endpoint: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM rate_limits WHERE account_id = ? AND endpoint = ?")
            .bind(account_id)
            .bind(endpoint)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
