//! Paginated sync worker.
//!
//! Runs one sync job: walks the remote edge list page by page, mirroring
//! each page into the cache and checkpointing the resume cursor on the job
//! row after every page. Deletions are detected with a mark-for-delete
//! pass, flagging every cached edge up front and clearing flags as the
//! remote re-reports each edge; whatever stays flagged at the end of the
//! full walk has vanished remotely and is pruned.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::data::{Database, Direction, SyncJob};
use crate::error::AppError;
use crate::metrics::{EDGES_UPSERTED_TOTAL, RATE_LIMITS_HIT_TOTAL, SYNC_PAGES_TOTAL};
use crate::twitter::{FetchError, RelationFetcher};

/// How a single job invocation ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Full walk finished; the edge set is now fresh.
    Completed { updated_count: i64 },
    /// Remote rate limit hit mid-walk; resume after `resets_at`.
    RateLimited { resets_at: DateTime<Utc> },
}

pub struct RelationSyncer {
    db: Arc<Database>,
    fetcher: Arc<dyn RelationFetcher>,
    page_size: u32,
}

impl RelationSyncer {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn RelationFetcher>, page_size: u32) -> Self {
        Self {
            db,
            fetcher,
            page_size,
        }
    }

    /// Run one sync job invocation.
    ///
    /// Resumes from the job's checkpointed cursor if present; otherwise
    /// starts a fresh pass with a mark-for-delete sweep. Every page is
    /// committed before the next fetch, so a crash or deferral at any point
    /// loses at most the in-flight page.
    pub async fn run(&self, job: &SyncJob) -> Result<RunOutcome, AppError> {
        let endpoint = job.endpoint();

        // A known-unexpired rate limit means the remote would reject us;
        // defer without burning a request.
        if let Some(record) = self.db.get_rate_limit(job.account_id, endpoint).await? {
            if record.resets_at > Utc::now() {
                return Ok(RunOutcome::RateLimited {
                    resets_at: record.resets_at,
                });
            }
        }

        let mut token = job.pagination_token.clone();
        let mut updated_count = 0i64;

        if token.is_none() {
            let flagged = self
                .db
                .mark_edges_for_delete(job.relation, job.account_id, job.direction)
                .await?;
            tracing::debug!(
                job_id = %job.id,
                endpoint,
                flagged,
                "Started fresh sync pass"
            );
        }

        loop {
            let page = match self
                .fetcher
                .fetch_page(
                    job.account_id,
                    job.relation,
                    job.direction,
                    self.page_size,
                    token.as_deref(),
                )
                .await
            {
                Ok(page) => page,
                Err(FetchError::RateLimited { resets_at }) => {
                    RATE_LIMITS_HIT_TOTAL.with_label_values(&[endpoint]).inc();
                    self.db
                        .upsert_rate_limit(job.account_id, endpoint, resets_at)
                        .await?;
                    tracing::info!(
                        job_id = %job.id,
                        endpoint,
                        %resets_at,
                        "Rate limited mid-sync, deferring"
                    );
                    return Ok(RunOutcome::RateLimited { resets_at });
                }
                Err(other) => return Err(other.into()),
            };

            SYNC_PAGES_TOTAL.with_label_values(&[endpoint]).inc();

            // The remote occasionally repeats a record within a page;
            // first occurrence wins.
            let mut seen = HashSet::new();
            let records: Vec<_> = page
                .records
                .into_iter()
                .filter(|record| seen.insert(record.id))
                .collect();

            self.db.upsert_profiles(&records).await?;

            let pairs: Vec<(i64, i64)> = records
                .iter()
                .map(|record| match job.direction {
                    Direction::Followers => (record.id, job.account_id),
                    Direction::Following => (job.account_id, record.id),
                })
                .collect();

            let upserted = self.db.upsert_edges(job.relation, &pairs).await?;
            EDGES_UPSERTED_TOTAL
                .with_label_values(&[job.relation.as_str()])
                .inc_by(upserted);
            updated_count += upserted as i64;

            token = page.next_token;
            self.db
                .checkpoint_job(&job.id, token.as_deref(), upserted as i64)
                .await?;

            if token.is_none() {
                break;
            }
        }

        // Finalize: prune vanished edges, stamp freshness, forget the limit.
        let pruned = self
            .db
            .delete_flagged_edges(job.relation, job.account_id, job.direction)
            .await?;
        self.db
            .update_freshness(job.account_id, job.relation, job.direction, Utc::now())
            .await?;
        self.db.clear_rate_limit(job.account_id, endpoint).await?;

        tracing::info!(
            job_id = %job.id,
            endpoint,
            updated_count,
            pruned,
            "Sync pass completed"
        );

        Ok(RunOutcome::Completed { updated_count })
    }
}
