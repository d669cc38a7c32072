//! Roost - a local cache of the Twitter social graph
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                       │
//! │  - sync submission, search queries, job control             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Sync / Search Layer                     │
//! │  - durable job queue + scheduler                            │
//! │  - paginated relation sync, chunked mutations               │
//! │  - set-intersection query engine                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                             │
//! │  - SQLite (sqlx): accounts, edges, jobs, rate limits        │
//! │  - Twitter API v2 client (reqwest)                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `search`: intersection query engine with scalar filters
//! - `sync`: freshness policy, sync/mutation workers, queue, scheduler
//! - `twitter`: remote API client behind the `RelationFetcher` trait
//! - `data`: database and models
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod search;
pub mod sync;
pub mod twitter;

use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Remote graph access (swappable in tests)
    pub fetcher: Arc<dyn twitter::RelationFetcher>,

    /// Durable job queue
    pub queue: Arc<sync::JobQueue>,

    /// Intersection query engine
    pub search: Arc<search::SearchEngine>,
}

impl AppState {
    /// Initialize application state with the real Twitter client.
    ///
    /// # Errors
    /// Returns error if the database connection or migration fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let fetcher = Arc::new(twitter::TwitterClient::new(
            &config.twitter.base_url,
            &config.twitter.bearer_token,
        ));
        Self::with_fetcher(config, fetcher).await
    }

    /// Initialize application state with an injected fetcher.
    pub async fn with_fetcher(
        config: config::AppConfig,
        fetcher: Arc<dyn twitter::RelationFetcher>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        let queue = Arc::new(sync::JobQueue::new(db.clone()));
        let search = Arc::new(search::SearchEngine::new(
            db.clone(),
            fetcher.clone(),
            queue.clone(),
            config.cache.relation_max_age(),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            fetcher,
            queue,
            search,
        })
    }

    /// Start the job scheduler as a background task.
    pub fn spawn_scheduler(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = sync::Scheduler::new(
            self.db.clone(),
            self.fetcher.clone(),
            self.queue.clone(),
            self.config.queue.clone(),
            self.config.twitter.page_size,
        );
        let handle = scheduler.spawn();
        tracing::info!("Scheduler spawned");
        handle
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api", api::api_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
