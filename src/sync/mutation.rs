//! Chunked mutation jobs.
//!
//! A mutation job carries a list of target accounts to follow/unfollow/
//! block/unblock/mute/unmute on behalf of one account. Each invocation
//! performs at most a small chunk of remote mutations, mirrors every
//! committed mutation into the local edge cache, and records progress on
//! the job row after each target, so an interrupted job never repeats a
//! committed mutation. A job's priority decays by the number of targets
//! committed so far, letting long mutation runs yield to newer work.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::data::{Database, SyncJob};
use crate::error::AppError;
use crate::metrics::{MUTATIONS_TOTAL, RATE_LIMITS_HIT_TOTAL};
use crate::twitter::{FetchError, RelationFetcher};

/// How a single mutation-job invocation ended.
#[derive(Debug)]
pub enum MutationOutcome {
    /// Every target has been committed remotely.
    Completed { mutated: i64 },
    /// Chunk done; pending targets remain.
    InProgress { remaining: usize },
    /// Remote rate limit hit; resume after `resets_at`.
    RateLimited { resets_at: DateTime<Utc> },
}

pub struct MutationRunner {
    db: Arc<Database>,
    fetcher: Arc<dyn RelationFetcher>,
    chunk_size: usize,
}

impl MutationRunner {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn RelationFetcher>, chunk_size: usize) -> Self {
        Self {
            db,
            fetcher,
            chunk_size,
        }
    }

    /// Run one chunk of a mutation job.
    pub async fn run(&self, job: &SyncJob) -> Result<MutationOutcome, AppError> {
        let endpoint = job.endpoint();
        let action = if job.add_edges { "add" } else { "remove" };

        if let Some(record) = self.db.get_rate_limit(job.account_id, endpoint).await? {
            if record.resets_at > Utc::now() {
                return Ok(MutationOutcome::RateLimited {
                    resets_at: record.resets_at,
                });
            }
        }

        let pending = job.pending_targets();
        if pending.is_empty() {
            return Ok(MutationOutcome::Completed {
                mutated: job.done_ids.len() as i64,
            });
        }

        let mut done = job.done_ids.clone();
        let already_done = done.len();
        // Priority decays by the number of targets actually committed.
        let decayed = |done: &Vec<i64>| (job.priority - (done.len() - already_done) as i64).max(0);

        for target_id in pending.iter().take(self.chunk_size) {
            match self
                .fetcher
                .mutate(job.relation, job.add_edges, job.account_id, *target_id)
                .await
            {
                Ok(()) => {}
                Err(FetchError::RateLimited { resets_at }) => {
                    RATE_LIMITS_HIT_TOTAL.with_label_values(&[endpoint]).inc();
                    self.db
                        .upsert_rate_limit(job.account_id, endpoint, resets_at)
                        .await?;
                    self.db
                        .update_mutation_progress(&job.id, &done, decayed(&done))
                        .await?;
                    return Ok(MutationOutcome::RateLimited { resets_at });
                }
                Err(other) => {
                    // Keep what was committed before surfacing the error.
                    self.db
                        .update_mutation_progress(&job.id, &done, decayed(&done))
                        .await?;
                    return Err(other.into());
                }
            }

            // Mirror the committed mutation into the cache.
            if job.add_edges {
                self.db
                    .upsert_edges(job.relation, &[(job.account_id, *target_id)])
                    .await?;
            } else {
                self.db
                    .delete_edge(job.relation, job.account_id, *target_id)
                    .await?;
            }

            MUTATIONS_TOTAL
                .with_label_values(&[job.relation.as_str(), action])
                .inc();

            done.push(*target_id);
            self.db
                .update_mutation_progress(&job.id, &done, decayed(&done))
                .await?;
        }

        if done.len() == job.target_ids.len() {
            self.db.clear_rate_limit(job.account_id, endpoint).await?;
            tracing::info!(
                job_id = %job.id,
                endpoint,
                action,
                mutated = done.len(),
                "Mutation job completed"
            );
            Ok(MutationOutcome::Completed {
                mutated: done.len() as i64,
            })
        } else {
            Ok(MutationOutcome::InProgress {
                remaining: job.target_ids.len() - done.len(),
            })
        }
    }
}
