//! Common test utilities for E2E tests

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;

use async_trait::async_trait;
use roost::data::{endpoint_name, AccountProfile, Direction, Relation};
use roost::twitter::{FetchError, RelationFetcher, RelationPage};
use roost::{config, AppState};

/// In-memory stand-in for the remote Twitter API.
///
/// Tests script profiles, edge lists, and rate-limit windows; the fetcher
/// serves paginated reads and records mutations.
pub struct FakeTwitter {
    inner: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    profiles: HashMap<i64, AccountProfile>,
    /// (account_id, endpoint) -> member ids, in remote order
    lists: HashMap<(i64, &'static str), Vec<i64>>,
    /// endpoint -> rate-limited until
    limited: HashMap<&'static str, DateTime<Utc>>,
    mutations: Vec<(Relation, bool, i64, i64)>,
}

impl FakeTwitter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeState::default()),
        }
    }

    pub fn profile(id: i64, username: &str, followers_count: i64) -> AccountProfile {
        AccountProfile {
            id,
            username: username.to_string(),
            name: Some(format!("User {username}")),
            description: None,
            location: None,
            profile_image_url: None,
            url: None,
            followers_count,
            following_count: 0,
            tweet_count: 0,
            listed_count: 0,
            created_at: Utc::now() - chrono::Duration::days(500),
        }
    }

    pub fn add_user(&self, profile: AccountProfile) {
        self.inner.lock().unwrap().profiles.insert(profile.id, profile);
    }

    pub fn set_list(&self, account_id: i64, relation: Relation, direction: Direction, ids: Vec<i64>) {
        let endpoint = endpoint_name(relation, direction);
        self.inner
            .lock()
            .unwrap()
            .lists
            .insert((account_id, endpoint), ids);
    }

    /// Rate-limit an endpoint until `resets_at` for every account.
    pub fn limit_endpoint(&self, endpoint: &'static str, resets_at: DateTime<Utc>) {
        self.inner.lock().unwrap().limited.insert(endpoint, resets_at);
    }

    pub fn mutations(&self) -> Vec<(Relation, bool, i64, i64)> {
        self.inner.lock().unwrap().mutations.clone()
    }
}

#[async_trait]
impl RelationFetcher for FakeTwitter {
    async fn fetch_page(
        &self,
        account_id: i64,
        relation: Relation,
        direction: Direction,
        page_size: u32,
        pagination_token: Option<&str>,
    ) -> Result<RelationPage, FetchError> {
        let endpoint = endpoint_name(relation, direction);
        let inner = self.inner.lock().unwrap();

        if let Some(resets_at) = inner.limited.get(endpoint) {
            if *resets_at > Utc::now() {
                return Err(FetchError::RateLimited {
                    resets_at: *resets_at,
                });
            }
        }

        let ids = inner
            .lists
            .get(&(account_id, endpoint))
            .cloned()
            .unwrap_or_default();

        let offset: usize = pagination_token
            .map(|token| token.parse().expect("numeric test cursor"))
            .unwrap_or(0);
        let end = (offset + page_size as usize).min(ids.len());

        let records = ids[offset..end]
            .iter()
            .map(|id| {
                inner
                    .profiles
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Self::profile(*id, &format!("user{id}"), 0))
            })
            .collect();

        Ok(RelationPage {
            records,
            next_token: (end < ids.len()).then(|| end.to_string()),
        })
    }

    async fn lookup_username(&self, username: &str) -> Result<AccountProfile, FetchError> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .values()
            .find(|profile| profile.username == username)
            .cloned()
            .ok_or(FetchError::NotFound)
    }

    async fn mutate(
        &self,
        relation: Relation,
        add: bool,
        source_id: i64,
        target_id: i64,
    ) -> Result<(), FetchError> {
        let mut inner = self.inner.lock().unwrap();

        let endpoint = match relation {
            Relation::Follow => "following",
            Relation::Block => "blocking",
            Relation::Mute => "muting",
        };
        if let Some(resets_at) = inner.limited.get(endpoint) {
            if *resets_at > Utc::now() {
                return Err(FetchError::RateLimited {
                    resets_at: *resets_at,
                });
            }
        }

        inner.mutations.push((relation, add, source_id, target_id));
        Ok(())
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub twitter: Arc<FakeTwitter>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance with a scripted remote.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = test_config(db_path);

        let twitter = Arc::new(FakeTwitter::new());
        let state = AppState::with_fetcher(config, twitter.clone())
            .await
            .unwrap();
        state.spawn_scheduler();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = roost::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        Self {
            addr: addr_str,
            state,
            twitter,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}

fn test_config(db_path: PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
        },
        database: config::DatabaseConfig { path: db_path },
        twitter: config::TwitterConfig {
            base_url: "http://twitter.invalid".to_string(),
            bearer_token: "test-token".to_string(),
            // Small pages so multi-page sync paths get exercised.
            page_size: 2,
        },
        cache: config::CacheConfig {
            relation_max_age_seconds: 36_000,
        },
        queue: config::QueueConfig {
            poll_interval_ms: 25,
            rate_limit_buffer_ms: 50,
            max_concurrency: 4,
            max_attempts: 3,
            retry_delay_ms: 50,
            mutation_chunk_size: 2,
            completed_retention_seconds: 3600,
            completed_retention_count: 100,
            failed_retention_seconds: 172_800,
            failed_retention_count: 1000,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}
