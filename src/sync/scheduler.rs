//! Durable job queue and scheduler.
//!
//! [`JobQueue`] is the enqueue/control surface: single-flight submission,
//! pause/resume/delete, and completion waiting via a broadcast channel.
//! [`Scheduler`] is the promotion loop: every poll interval it claims due
//! jobs (waiting or delayed, unpaused, `run_at` reached) up to the
//! concurrency cap, dispatches them to the sync or mutation runner, and
//! sweeps terminal jobs past their retention caps.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use super::mutation::{MutationOutcome, MutationRunner};
use super::worker::{RelationSyncer, RunOutcome};
use crate::config::QueueConfig;
use crate::data::{Database, Direction, JobId, JobKind, JobState, Relation, SyncJob};
use crate::error::AppError;
use crate::metrics::{JOBS_LIVE, JOBS_PROCESSED_TOTAL};
use crate::twitter::RelationFetcher;

/// Broadcast on every job state transition the scheduler performs.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
}

/// Outcome of a submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    Enqueued(JobId),
    /// A live job with the same key already exists; its id is returned.
    AlreadyQueued(JobId),
}

impl EnqueueResult {
    /// The id of the job now covering this work.
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued(id) | Self::AlreadyQueued(id) => id,
        }
    }
}

pub struct JobQueue {
    db: Arc<Database>,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { db, events }
    }

    fn new_job(
        kind: JobKind,
        account_id: i64,
        relation: Relation,
        direction: Direction,
        priority: i64,
    ) -> SyncJob {
        let now = Utc::now();
        SyncJob {
            id: JobId::new(),
            kind,
            account_id,
            relation,
            direction,
            pagination_token: None,
            priority,
            paused: false,
            finished: false,
            state: JobState::Waiting,
            run_at: now,
            attempts: 0,
            updated_count: 0,
            last_error: None,
            add_edges: true,
            target_ids: vec![],
            done_ids: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Submit a sync job for one edge set.
    ///
    /// At most one live job exists per `(kind, account, relation,
    /// direction)`; a duplicate submission returns the existing job's id.
    pub async fn enqueue_sync(
        &self,
        account_id: i64,
        relation: Relation,
        direction: Direction,
        priority: i64,
    ) -> Result<EnqueueResult, AppError> {
        let job = Self::new_job(JobKind::Sync, account_id, relation, direction, priority);

        loop {
            if self.db.enqueue_job(&job).await? {
                tracing::debug!(job_id = %job.id, account_id, endpoint = job.endpoint(), "Sync job enqueued");
                return Ok(EnqueueResult::Enqueued(job.id.clone()));
            }

            if let Some(existing) = self
                .db
                .find_live_job(JobKind::Sync, account_id, relation, direction)
                .await?
            {
                return Ok(EnqueueResult::AlreadyQueued(existing.id));
            }
            // The duplicate finished between our insert and lookup; retry
            // until one of the two outcomes sticks.
        }
    }

    /// Submit a mutation job: apply (or remove) `relation` from
    /// `account_id` to each target, in order, in rate-limit-sized chunks.
    pub async fn enqueue_mutation(
        &self,
        account_id: i64,
        relation: Relation,
        add_edges: bool,
        target_ids: Vec<i64>,
        priority: i64,
    ) -> Result<EnqueueResult, AppError> {
        if target_ids.is_empty() {
            return Err(AppError::Validation(
                "mutation requires at least one target".to_string(),
            ));
        }

        let mut job = Self::new_job(
            JobKind::Mutation,
            account_id,
            relation,
            Direction::Following,
            priority,
        );
        job.add_edges = add_edges;
        job.target_ids = target_ids;

        loop {
            if self.db.enqueue_job(&job).await? {
                return Ok(EnqueueResult::Enqueued(job.id.clone()));
            }

            if let Some(existing) = self
                .db
                .find_live_job(JobKind::Mutation, account_id, relation, Direction::Following)
                .await?
            {
                return Ok(EnqueueResult::AlreadyQueued(existing.id));
            }
        }
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<SyncJob>, AppError> {
        self.db.get_job(id).await
    }

    pub async fn list(
        &self,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<SyncJob>, AppError> {
        self.db.list_jobs(state, limit).await
    }

    /// Pause a job: it keeps its place and progress but is never claimed.
    pub async fn pause(&self, id: &JobId) -> Result<bool, AppError> {
        self.db.set_job_paused(id, true).await
    }

    pub async fn resume(&self, id: &JobId) -> Result<bool, AppError> {
        self.db.set_job_paused(id, false).await
    }

    pub async fn delete(&self, id: &JobId) -> Result<bool, AppError> {
        self.db.delete_job(id).await
    }

    /// Publish a state transition to any waiters.
    pub(crate) fn notify(&self, job_id: &JobId, state: JobState) {
        // No receivers is fine.
        let _ = self.events.send(JobEvent {
            job_id: job_id.clone(),
            state,
        });
    }

    /// Wait until a job reaches a terminal state, up to `timeout`.
    ///
    /// # Returns
    /// The terminal job row, or `None` if the timeout elapsed first.
    pub async fn wait_for_job(
        &self,
        id: &JobId,
        timeout: Duration,
    ) -> Result<Option<SyncJob>, AppError> {
        // Subscribe before the initial check so no transition is missed.
        let mut events = self.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(job) = self.db.get_job(id).await? {
                if !job.state.is_live() {
                    return Ok(Some(job));
                }
            } else {
                // Deleted while waiting.
                return Ok(None);
            }

            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Ok(event)) if &event.job_id == id && !event.state.is_live() => break,
                    Ok(Ok(_)) => continue,
                    // Lagged: re-check the database.
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                    Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                    Err(_) => return Ok(None),
                }
            }
        }
    }
}

pub struct Scheduler {
    db: Arc<Database>,
    queue: Arc<JobQueue>,
    syncer: Arc<RelationSyncer>,
    mutations: Arc<MutationRunner>,
    config: QueueConfig,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn RelationFetcher>,
        queue: Arc<JobQueue>,
        config: QueueConfig,
        page_size: u32,
    ) -> Self {
        let syncer = Arc::new(RelationSyncer::new(db.clone(), fetcher.clone(), page_size));
        let mutations = Arc::new(MutationRunner::new(
            db.clone(),
            fetcher,
            config.mutation_chunk_size,
        ));
        Self {
            db,
            queue,
            syncer,
            mutations,
            config,
        }
    }

    /// Start the promotion loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let scheduler = Arc::new(self);
            let semaphore = Arc::new(Semaphore::new(scheduler.config.max_concurrency));
            let mut ticker = tokio::time::interval(scheduler.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                scheduler.sweep_retention().await;

                match scheduler.db.count_live_jobs().await {
                    Ok(count) => JOBS_LIVE.set(count),
                    Err(error) => tracing::warn!(%error, "Failed to count live jobs"),
                }

                // Claim as many due jobs as we have free permits.
                loop {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };

                    let job = match scheduler.db.claim_due_job(Utc::now()).await {
                        Ok(Some(job)) => job,
                        Ok(None) => break,
                        Err(error) => {
                            tracing::error!(%error, "Failed to claim job");
                            break;
                        }
                    };

                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        scheduler.dispatch(job).await;
                        drop(permit);
                    });
                }
            }
        })
    }

    /// Run one claimed job and persist its resulting state.
    async fn dispatch(&self, job: SyncJob) {
        let kind = job.kind.as_str();

        // A pause can land between the claim and this task starting; honor
        // it before any side effects.
        match self.db.get_job(&job.id).await {
            Ok(Some(current)) if current.paused => {
                if let Err(error) = self.db.release_job(&job.id).await {
                    tracing::error!(job_id = %job.id, %error, "Failed to release paused job");
                }
                return;
            }
            // Deleted after the claim.
            Ok(None) => return,
            Ok(Some(_)) => {}
            Err(error) => {
                tracing::warn!(job_id = %job.id, %error, "Failed to re-read claimed job");
            }
        }

        let result: Result<JobState, AppError> = match job.kind {
            JobKind::Sync => match self.syncer.run(&job).await {
                Ok(RunOutcome::Completed { .. }) => self
                    .db
                    .complete_job(&job.id)
                    .await
                    .map(|_| JobState::Completed),
                Ok(RunOutcome::RateLimited { resets_at }) => {
                    let run_at = resets_at + self.config.rate_limit_buffer();
                    self.db
                        .delay_job(&job.id, run_at)
                        .await
                        .map(|_| JobState::Delayed)
                }
                Err(error) => self.handle_error(&job, error).await,
            },
            JobKind::Mutation => match self.mutations.run(&job).await {
                Ok(MutationOutcome::Completed { .. }) => self
                    .db
                    .complete_job(&job.id)
                    .await
                    .map(|_| JobState::Completed),
                Ok(MutationOutcome::InProgress { .. }) => {
                    // Back to the queue; decayed priority is already stored.
                    self.db
                        .release_job(&job.id)
                        .await
                        .map(|_| JobState::Waiting)
                }
                Ok(MutationOutcome::RateLimited { resets_at }) => {
                    let run_at = resets_at + self.config.rate_limit_buffer();
                    self.db
                        .delay_job(&job.id, run_at)
                        .await
                        .map(|_| JobState::Delayed)
                }
                Err(error) => self.handle_error(&job, error).await,
            },
        };

        match result {
            Ok(state) => {
                let outcome = match state {
                    JobState::Completed => "completed",
                    JobState::Failed => "failed",
                    JobState::Delayed => "deferred",
                    _ => "requeued",
                };
                JOBS_PROCESSED_TOTAL
                    .with_label_values(&[kind, outcome])
                    .inc();
                self.queue.notify(&job.id, state);
            }
            Err(error) => {
                tracing::error!(job_id = %job.id, %error, "Failed to persist job outcome");
            }
        }
    }

    /// Retry with backoff, or fail once attempts are exhausted.
    async fn handle_error(&self, job: &SyncJob, error: AppError) -> Result<JobState, AppError> {
        let message = error.to_string();

        if job.attempts + 1 >= self.config.max_attempts {
            tracing::warn!(job_id = %job.id, %error, attempts = job.attempts + 1, "Job failed");
            self.db.fail_job(&job.id, &message).await?;
            Ok(JobState::Failed)
        } else {
            tracing::info!(job_id = %job.id, %error, "Job errored, will retry");
            let run_at = Utc::now() + self.config.retry_delay();
            self.db.retry_job(&job.id, run_at, &message).await?;
            Ok(JobState::Delayed)
        }
    }

    /// Delete terminal jobs past the retention caps.
    async fn sweep_retention(&self) {
        let now = Utc::now();
        let completed_cutoff =
            now - chrono::Duration::seconds(self.config.completed_retention_seconds as i64);
        let failed_cutoff =
            now - chrono::Duration::seconds(self.config.failed_retention_seconds as i64);

        match self
            .db
            .prune_jobs(
                completed_cutoff,
                self.config.completed_retention_count,
                failed_cutoff,
                self.config.failed_retention_count,
            )
            .await
        {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "Pruned terminal jobs"),
            Err(error) => tracing::warn!(%error, "Retention sweep failed"),
        }
    }
}
