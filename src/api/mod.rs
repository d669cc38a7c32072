//! HTTP API handlers.
//!
//! Thin layer over the queue and search engine. All ids cross the wire as
//! strings; see [`crate::data::models::id_str`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::{id_str, id_str_vec, Account, Direction, JobId, JobState, Relation, SyncJob};
use crate::error::{AppError, Result};
use crate::search::{SearchOutcome, SearchQuery};
use crate::sync::freshness::{self, CacheOptions};
use crate::sync::EnqueueResult;
use crate::AppState;

/// Router for all `/api` endpoints.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(submit_sync))
        .route("/search", post(search))
        .route("/mutations", post(submit_mutation))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/pause", post(pause_job))
        .route("/jobs/:id/resume", post(resume_job))
        .route("/accounts/:username", get(get_account))
}

/// Router for the Prometheus scrape endpoint.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    crate::metrics::gather()
}

// =============================================================================
// DTOs
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDto {
    #[serde(with = "id_str")]
    pub id: i64,
    pub username: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub profile_image_url: Option<String>,
    pub url: Option<String>,
    pub followers_count: i64,
    pub following_count: i64,
    pub tweet_count: i64,
    pub listed_count: i64,
    pub created_at: DateTime<Utc>,
    /// When the profile snapshot was last observed
    pub cached_at: DateTime<Utc>,
}

impl From<Account> for AccountDto {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            name: account.name,
            description: account.description,
            location: account.location,
            profile_image_url: account.profile_image_url,
            url: account.url,
            followers_count: account.followers_count,
            following_count: account.following_count,
            tweet_count: account.tweet_count,
            listed_count: account.listed_count,
            created_at: account.created_at,
            cached_at: account.updated_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDto {
    pub id: JobId,
    pub kind: String,
    #[serde(with = "id_str")]
    pub account_id: i64,
    pub relation: Relation,
    pub direction: Direction,
    pub state: JobState,
    pub priority: i64,
    pub paused: bool,
    pub attempts: i64,
    pub updated_count: i64,
    pub last_error: Option<String>,
    /// Mutation jobs: targets not yet committed
    pub pending_targets: usize,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SyncJob> for JobDto {
    fn from(job: SyncJob) -> Self {
        let pending_targets = job.pending_targets().len();
        Self {
            id: job.id,
            kind: job.kind.as_str().to_string(),
            account_id: job.account_id,
            relation: job.relation,
            direction: job.direction,
            state: job.state,
            priority: job.priority,
            paused: job.paused,
            attempts: job.attempts,
            updated_count: job.updated_count,
            last_error: job.last_error,
            pending_targets,
            run_at: job.run_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

// =============================================================================
// Sync
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub username: String,
    #[serde(default = "default_relation")]
    pub relation: Relation,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub priority: i64,
    /// Block until the job finishes, up to this many seconds
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

fn default_relation() -> Relation {
    Relation::Follow
}

fn default_direction() -> Direction {
    Direction::Following
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// "fresh", "queued", "completed", "failed", or "timeout"
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobDto>,
}

/// `POST /api/sync` - refresh one edge set of an account.
///
/// A fresh edge set is a no-op unless `forceRefresh` is set. With
/// `waitSeconds` the call blocks until the queued job reaches a terminal
/// state or the wait elapses.
async fn submit_sync(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Result<impl IntoResponse> {
    // Block and mute lists only exist in the outgoing direction.
    if request.relation != Relation::Follow && request.direction != Direction::Following {
        return Err(AppError::Validation(format!(
            "{} edge sets have no {} direction",
            request.relation.as_str(),
            request.direction.as_str()
        )));
    }

    let options = CacheOptions {
        use_cache_only: false,
        force_refresh: request.force_refresh,
    };
    let account = state
        .search
        .resolve_account(&request.username, &options)
        .await?;

    let last = account.freshness(request.relation, request.direction);
    let max_age = state.config.cache.relation_max_age();
    if !freshness::should_refresh(last, Utc::now(), max_age, &options) {
        return Ok((
            StatusCode::OK,
            Json(SyncResponse {
                status: "fresh",
                job: None,
            }),
        ));
    }

    let result = state
        .queue
        .enqueue_sync(account.id, request.relation, request.direction, request.priority)
        .await?;
    let job_id = result.job_id().clone();

    if let Some(wait_seconds) = request.wait_seconds {
        let waited = state
            .queue
            .wait_for_job(&job_id, Duration::from_secs(wait_seconds))
            .await?;
        return Ok(match waited {
            Some(job) => {
                let status = match job.state {
                    JobState::Completed => "completed",
                    _ => "failed",
                };
                (
                    StatusCode::OK,
                    Json(SyncResponse {
                        status,
                        job: Some(job.into()),
                    }),
                )
            }
            None => {
                let job = state.queue.get(&job_id).await?.map(JobDto::from);
                (
                    StatusCode::ACCEPTED,
                    Json(SyncResponse {
                        status: "timeout",
                        job,
                    }),
                )
            }
        });
    }

    let job = state.queue.get(&job_id).await?.map(JobDto::from);
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncResponse {
            status: "queued",
            job,
        }),
    ))
}

// =============================================================================
// Search
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(flatten)]
    pub query: SearchQuery,
    /// Wait for triggered syncs and retry, up to this many seconds
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum SearchResponse {
    #[serde(rename_all = "camelCase")]
    Results {
        status: &'static str,
        accounts: Vec<AccountDto>,
    },
    #[serde(rename_all = "camelCase")]
    Pending {
        status: &'static str,
        job_ids: Vec<JobId>,
    },
}

/// `POST /api/search` - intersection query over cached edge sets.
///
/// If the query touches stale edge sets, syncs are queued and either
/// awaited (with `waitSeconds`) or reported back as pending job ids.
async fn search(
    State(state): State<AppState>,
    Json(mut request): Json<SearchRequest>,
) -> Result<impl IntoResponse> {
    let deadline = request
        .wait_seconds
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    loop {
        let outcome = state.search.search(&request.query).await?;
        // Force is satisfied by the syncs the first pass queues; retries
        // read the refreshed cache instead of queueing again.
        request.query.options.force_refresh = false;

        match outcome {
            SearchOutcome::Results(accounts) => {
                return Ok((
                    StatusCode::OK,
                    Json(SearchResponse::Results {
                        status: "ok",
                        accounts: accounts.into_iter().map(AccountDto::from).collect(),
                    }),
                ));
            }
            SearchOutcome::Pending { job_ids } => {
                let Some(deadline) = deadline else {
                    return Ok((
                        StatusCode::ACCEPTED,
                        Json(SearchResponse::Pending {
                            status: "pending",
                            job_ids,
                        }),
                    ));
                };

                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok((
                        StatusCode::ACCEPTED,
                        Json(SearchResponse::Pending {
                            status: "pending",
                            job_ids,
                        }),
                    ));
                }

                for job_id in &job_ids {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    state.queue.wait_for_job(job_id, remaining).await?;
                }
            }
        }
    }
}

// =============================================================================
// Mutations
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub username: String,
    pub relation: Relation,
    /// "add" or "remove"
    pub action: String,
    #[serde(with = "id_str_vec")]
    pub target_ids: Vec<i64>,
    #[serde(default)]
    pub priority: i64,
}

/// `POST /api/mutations` - queue chunked remote mutations.
async fn submit_mutation(
    State(state): State<AppState>,
    Json(request): Json<MutationRequest>,
) -> Result<impl IntoResponse> {
    let add_edges = match request.action.as_str() {
        "add" => true,
        "remove" => false,
        other => {
            return Err(AppError::Validation(format!(
                "unknown action: {other} (expected \"add\" or \"remove\")"
            )))
        }
    };

    let account = state
        .search
        .resolve_account(&request.username, &CacheOptions::default())
        .await?;

    let result = state
        .queue
        .enqueue_mutation(
            account.id,
            request.relation,
            add_edges,
            request.target_ids,
            request.priority,
        )
        .await?;

    let status = match &result {
        EnqueueResult::Enqueued(_) => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    let job = state.queue.get(result.job_id()).await?.map(JobDto::from);

    Ok((status, Json(serde_json::json!({ "job": job }))))
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/jobs` - list jobs, newest activity first.
async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobDto>>> {
    let job_state = match query.state.as_deref() {
        None => None,
        Some(raw) => Some(
            JobState::parse(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown job state: {raw}")))?,
        ),
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let jobs = state.queue.list(job_state, limit).await?;
    Ok(Json(jobs.into_iter().map(JobDto::from).collect()))
}

/// `GET /api/jobs/:id`
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDto>> {
    let job = state
        .queue
        .get(&JobId::from_string(id))
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(job.into()))
}

/// `POST /api/jobs/:id/pause`
async fn pause_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    if state.queue.pause(&JobId::from_string(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}

/// `POST /api/jobs/:id/resume`
async fn resume_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    if state.queue.resume(&JobId::from_string(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}

/// `DELETE /api/jobs/:id`
async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    if state.queue.delete(&JobId::from_string(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// `GET /api/accounts/:username` - cached profile snapshot only.
async fn get_account(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<AccountDto>> {
    let account = state
        .db
        .get_account_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(account.into()))
}
