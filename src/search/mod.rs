//! Graph search: set intersection over cached edge sets plus scalar
//! filters over cached profile snapshots.
//!
//! A query names accounts whose edge sets constrain the result ("followed
//! by alice", "follower of bob") and optional scalar filters over the
//! candidates' cached counters and text fields. Every referenced edge set
//! must be fresh before the intersection runs; stale sets trigger sync
//! jobs and the query reports the job ids so the caller can wait and
//! retry.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::data::{Account, Database, Direction, JobId, Relation};
use crate::error::AppError;
use crate::metrics::SEARCH_QUERIES_TOTAL;
use crate::sync::freshness::{self, CacheOptions};
use crate::sync::JobQueue;
use crate::twitter::{FetchError, RelationFetcher};

/// Priority for syncs triggered by an interactive query.
const SEARCH_SYNC_PRIORITY: i64 = 10;

/// A scalar predicate over a cached profile snapshot.
///
/// Count filters compare against snapshot counters, which can lag the
/// remote values by up to the freshness window.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ScalarFilter {
    FollowersCountGreaterThan(i64),
    FollowersCountLessThan(i64),
    FollowingCountGreaterThan(i64),
    FollowingCountLessThan(i64),
    TweetCountGreaterThan(i64),
    TweetCountLessThan(i64),
    ListedCountGreaterThan(i64),
    ListedCountLessThan(i64),
    CreatedBefore(DateTime<Utc>),
    CreatedAfter(DateTime<Utc>),
    UsernameContains(String),
    NameContains(String),
    DescriptionContains(String),
    LocationContains(String),
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|text| text.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

impl ScalarFilter {
    pub fn matches(&self, account: &Account) -> bool {
        match self {
            Self::FollowersCountGreaterThan(n) => account.followers_count > *n,
            Self::FollowersCountLessThan(n) => account.followers_count < *n,
            Self::FollowingCountGreaterThan(n) => account.following_count > *n,
            Self::FollowingCountLessThan(n) => account.following_count < *n,
            Self::TweetCountGreaterThan(n) => account.tweet_count > *n,
            Self::TweetCountLessThan(n) => account.tweet_count < *n,
            Self::ListedCountGreaterThan(n) => account.listed_count > *n,
            Self::ListedCountLessThan(n) => account.listed_count < *n,
            Self::CreatedBefore(t) => account.created_at < *t,
            Self::CreatedAfter(t) => account.created_at > *t,
            Self::UsernameContains(s) => contains_ci(Some(&account.username), s),
            Self::NameContains(s) => contains_ci(account.name.as_deref(), s),
            Self::DescriptionContains(s) => contains_ci(account.description.as_deref(), s),
            Self::LocationContains(s) => contains_ci(account.location.as_deref(), s),
        }
    }
}

/// A graph search query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchQuery {
    /// Results must be followed by each of these users
    pub followed_by: Vec<String>,
    /// Results must follow each of these users
    pub follower_of: Vec<String>,
    #[serde(rename = "filters")]
    pub scalar_filters: Vec<ScalarFilter>,
    #[serde(flatten)]
    pub options: CacheOptions,
}

/// Outcome of a query.
#[derive(Debug)]
pub enum SearchOutcome {
    Results(Vec<Account>),
    /// One or more referenced edge sets are stale; syncs are queued.
    Pending { job_ids: Vec<JobId> },
}

/// An edge set a query depends on.
struct RequiredSet {
    account: Account,
    direction: Direction,
}

pub struct SearchEngine {
    db: Arc<Database>,
    fetcher: Arc<dyn RelationFetcher>,
    queue: Arc<JobQueue>,
    max_age: Duration,
}

impl SearchEngine {
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn RelationFetcher>,
        queue: Arc<JobQueue>,
        max_age: Duration,
    ) -> Self {
        Self {
            db,
            fetcher,
            queue,
            max_age,
        }
    }

    /// Execute a query.
    ///
    /// # Errors
    /// * [`AppError::Validation`] if the query names no edge sets
    /// * [`AppError::UnknownUser`] if a referenced username doesn't resolve
    /// * [`AppError::CacheUnavailable`] if a cache-only query references a
    ///   never-fetched edge set
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, AppError> {
        if query.followed_by.is_empty() && query.follower_of.is_empty() {
            return Err(AppError::Validation(
                "query must reference at least one account via followedBy or followerOf"
                    .to_string(),
            ));
        }

        // Resolve every referenced username and the edge set it implies.
        // "followed by alice" needs alice's following list; "follower of
        // bob" needs bob's follower list.
        let mut required = Vec::new();
        for username in &query.followed_by {
            required.push(RequiredSet {
                account: self.resolve_account(username, &query.options).await?,
                direction: Direction::Following,
            });
        }
        for username in &query.follower_of {
            required.push(RequiredSet {
                account: self.resolve_account(username, &query.options).await?,
                direction: Direction::Followers,
            });
        }

        // Freshness gate: queue syncs for every stale set before running
        // anything, so one wait covers them all.
        let now = Utc::now();
        let mut job_ids = Vec::new();
        for set in &required {
            let last = set.account.freshness(Relation::Follow, set.direction);

            if query.options.use_cache_only {
                if freshness::never_fetched(last) {
                    return Err(AppError::CacheUnavailable(format!(
                        "{} list of {} has never been fetched",
                        set.direction.as_str(),
                        set.account.username
                    )));
                }
                continue;
            }

            if freshness::should_refresh(last, now, self.max_age, &query.options) {
                let result = self
                    .queue
                    .enqueue_sync(
                        set.account.id,
                        Relation::Follow,
                        set.direction,
                        SEARCH_SYNC_PRIORITY,
                    )
                    .await?;
                job_ids.push(result.job_id().clone());
            }
        }

        if !job_ids.is_empty() {
            SEARCH_QUERIES_TOTAL.with_label_values(&["pending"]).inc();
            return Ok(SearchOutcome::Pending { job_ids });
        }

        // Progressive intersection, smallest set first so the working set
        // only shrinks.
        let mut sets = Vec::with_capacity(required.len());
        for set in &required {
            let ids: HashSet<i64> = match set.direction {
                Direction::Following => self
                    .db
                    .get_target_ids(Relation::Follow, set.account.id)
                    .await?
                    .into_iter()
                    .collect(),
                Direction::Followers => self
                    .db
                    .get_source_ids(Relation::Follow, set.account.id)
                    .await?
                    .into_iter()
                    .collect(),
            };
            sets.push(ids);
        }
        sets.sort_by_key(HashSet::len);

        let mut candidates = sets.remove(0);
        for set in &sets {
            candidates.retain(|id| set.contains(id));
            if candidates.is_empty() {
                break;
            }
        }

        let candidate_ids: Vec<i64> = candidates.into_iter().collect();
        let mut accounts = self.db.get_accounts_by_ids(&candidate_ids).await?;
        accounts.retain(|account| {
            query
                .scalar_filters
                .iter()
                .all(|filter| filter.matches(account))
        });
        accounts.sort_by_key(|account| account.id);

        SEARCH_QUERIES_TOTAL.with_label_values(&["results"]).inc();
        Ok(SearchOutcome::Results(accounts))
    }

    /// Resolve a username to a cached account, fetching it remotely on a
    /// cache miss unless the query is cache-only.
    pub async fn resolve_account(
        &self,
        username: &str,
        options: &CacheOptions,
    ) -> Result<Account, AppError> {
        if let Some(account) = self.db.get_account_by_username(username).await? {
            return Ok(account);
        }

        if options.use_cache_only {
            return Err(AppError::UnknownUser(username.to_string()));
        }

        let profile = match self.fetcher.lookup_username(username).await {
            Ok(profile) => profile,
            Err(FetchError::NotFound) => {
                return Err(AppError::UnknownUser(username.to_string()))
            }
            Err(other) => return Err(other.into()),
        };

        self.db.upsert_profiles(std::slice::from_ref(&profile)).await?;
        self.db
            .get_account(profile.id)
            .await?
            .ok_or_else(|| AppError::InvariantViolation("upserted account vanished".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    use crate::data::{AccountProfile, JobState};
    use crate::twitter::RelationPage;

    struct LookupFetcher {
        known: Vec<AccountProfile>,
    }

    #[async_trait]
    impl RelationFetcher for LookupFetcher {
        async fn fetch_page(
            &self,
            _account_id: i64,
            _relation: Relation,
            _direction: Direction,
            _page_size: u32,
            _pagination_token: Option<&str>,
        ) -> Result<RelationPage, FetchError> {
            unimplemented!("the engine never fetches pages directly")
        }

        async fn lookup_username(&self, username: &str) -> Result<AccountProfile, FetchError> {
            self.known
                .iter()
                .find(|profile| profile.username == username)
                .cloned()
                .ok_or(FetchError::NotFound)
        }

        async fn mutate(
            &self,
            _relation: Relation,
            _add: bool,
            _source_id: i64,
            _target_id: i64,
        ) -> Result<(), FetchError> {
            unimplemented!("the engine never mutates")
        }
    }

    fn profile(id: i64, username: &str, followers_count: i64) -> AccountProfile {
        AccountProfile {
            id,
            username: username.to_string(),
            name: None,
            description: None,
            location: None,
            profile_image_url: None,
            url: None,
            followers_count,
            following_count: 0,
            tweet_count: 0,
            listed_count: 0,
            created_at: Utc::now() - ChronoDuration::days(100),
        }
    }

    const TEN_HOURS: Duration = Duration::from_secs(36_000);

    async fn setup(known: Vec<AccountProfile>) -> (Arc<Database>, SearchEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let queue = Arc::new(JobQueue::new(db.clone()));
        let engine = SearchEngine::new(
            db.clone(),
            Arc::new(LookupFetcher { known }),
            queue,
            TEN_HOURS,
        );
        (db, engine, dir)
    }

    /// Cache alice with a fresh following list of the given targets.
    async fn cache_following(db: &Database, owner: &AccountProfile, targets: &[AccountProfile]) {
        db.upsert_profiles(std::slice::from_ref(owner)).await.unwrap();
        db.upsert_profiles(targets).await.unwrap();
        let pairs: Vec<(i64, i64)> = targets.iter().map(|t| (owner.id, t.id)).collect();
        db.upsert_edges(Relation::Follow, &pairs).await.unwrap();
        db.update_freshness(owner.id, Relation::Follow, Direction::Following, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn intersection_with_scalar_filter() {
        let (db, engine, _dir) = setup(vec![]).await;

        let alice = profile(1, "alice", 50);
        let a = profile(10, "a", 50);
        let b = profile(11, "b", 500);
        cache_following(&db, &alice, &[a, b]).await;

        let query = SearchQuery {
            followed_by: vec!["alice".to_string()],
            scalar_filters: vec![ScalarFilter::FollowersCountGreaterThan(100)],
            ..Default::default()
        };

        let outcome = engine.search(&query).await.unwrap();
        let SearchOutcome::Results(accounts) = outcome else {
            panic!("expected results from a fresh cache");
        };
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, "b");
    }

    #[tokio::test]
    async fn multiple_terms_intersect() {
        let (db, engine, _dir) = setup(vec![]).await;

        let alice = profile(1, "alice", 0);
        let bob = profile(2, "bob", 0);
        let shared = profile(10, "shared", 0);
        let only_alice = profile(11, "onlyalice", 0);
        cache_following(&db, &alice, &[shared.clone(), only_alice]).await;
        cache_following(&db, &bob, &[shared]).await;

        let query = SearchQuery {
            followed_by: vec!["alice".to_string(), "bob".to_string()],
            ..Default::default()
        };

        let SearchOutcome::Results(accounts) = engine.search(&query).await.unwrap() else {
            panic!("expected results");
        };
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, "shared");
    }

    #[tokio::test]
    async fn stale_edge_set_queues_sync_and_reports_pending() {
        let (db, engine, _dir) = setup(vec![]).await;

        let alice = profile(1, "alice", 0);
        db.upsert_profiles(&[alice]).await.unwrap();
        // Never fetched: freshness is the epoch sentinel.

        let query = SearchQuery {
            followed_by: vec!["alice".to_string()],
            ..Default::default()
        };

        let SearchOutcome::Pending { job_ids } = engine.search(&query).await.unwrap() else {
            panic!("expected pending syncs");
        };
        assert_eq!(job_ids.len(), 1);

        let job = db.get_job(&job_ids[0]).await.unwrap().unwrap();
        assert_eq!(job.account_id, 1);
        assert_eq!(job.state, JobState::Waiting);

        // A repeated query reuses the live job instead of stacking another.
        let SearchOutcome::Pending { job_ids: again } = engine.search(&query).await.unwrap()
        else {
            panic!("still pending");
        };
        assert_eq!(again, job_ids);
    }

    #[tokio::test]
    async fn cache_only_serves_stale_data_but_rejects_never_fetched() {
        let (db, engine, _dir) = setup(vec![]).await;

        let alice = profile(1, "alice", 0);
        let target = profile(10, "t", 0);
        cache_following(&db, &alice, &[target]).await;
        // Age the freshness marker well past the window.
        db.update_freshness(
            1,
            Relation::Follow,
            Direction::Following,
            Utc::now() - ChronoDuration::days(30),
        )
        .await
        .unwrap();

        let query = SearchQuery {
            followed_by: vec!["alice".to_string()],
            options: CacheOptions {
                use_cache_only: true,
                force_refresh: false,
            },
            ..Default::default()
        };

        let SearchOutcome::Results(accounts) = engine.search(&query).await.unwrap() else {
            panic!("cache-only must serve stale data");
        };
        assert_eq!(accounts.len(), 1);

        // Never-fetched set under cache-only is an explicit failure.
        let bob = profile(2, "bob", 0);
        db.upsert_profiles(&[bob]).await.unwrap();
        let query = SearchQuery {
            followed_by: vec!["bob".to_string()],
            options: CacheOptions {
                use_cache_only: true,
                force_refresh: false,
            },
            ..Default::default()
        };
        assert!(matches!(
            engine.search(&query).await,
            Err(AppError::CacheUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unknown_username_resolves_remotely_then_errors_if_absent() {
        let (db, engine, _dir) = setup(vec![profile(5, "carol", 0)]).await;

        // carol resolves remotely, gets cached, and her never-fetched
        // following list queues a sync.
        let query = SearchQuery {
            followed_by: vec!["carol".to_string()],
            ..Default::default()
        };
        let outcome = engine.search(&query).await.unwrap();
        assert!(matches!(outcome, SearchOutcome::Pending { .. }));
        assert!(db.get_account(5).await.unwrap().is_some());

        // dave doesn't exist anywhere.
        let query = SearchQuery {
            followed_by: vec!["dave".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            engine.search(&query).await,
            Err(AppError::UnknownUser(name)) if name == "dave"
        ));
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (_db, engine, _dir) = setup(vec![]).await;
        assert!(matches!(
            engine.search(&SearchQuery::default()).await,
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn scalar_filters_cover_text_and_time_fields() {
        let mut account = Account {
            id: 1,
            username: "Alice".to_string(),
            name: Some("Alice Doe".to_string()),
            description: Some("Rustacean in Berlin".to_string()),
            location: Some("Berlin".to_string()),
            profile_image_url: None,
            url: None,
            followers_count: 10,
            following_count: 20,
            tweet_count: 300,
            listed_count: 4,
            created_at: Utc::now() - ChronoDuration::days(10),
            updated_at: Utc::now(),
            followers_updated_at: Utc::now(),
            following_updated_at: Utc::now(),
            blocking_updated_at: Utc::now(),
            muting_updated_at: Utc::now(),
        };

        assert!(ScalarFilter::UsernameContains("ali".to_string()).matches(&account));
        assert!(ScalarFilter::DescriptionContains("rust".to_string()).matches(&account));
        assert!(ScalarFilter::LocationContains("berlin".to_string()).matches(&account));
        assert!(ScalarFilter::TweetCountGreaterThan(100).matches(&account));
        assert!(!ScalarFilter::TweetCountLessThan(100).matches(&account));
        assert!(ScalarFilter::CreatedAfter(Utc::now() - ChronoDuration::days(30)).matches(&account));
        assert!(!ScalarFilter::CreatedBefore(Utc::now() - ChronoDuration::days(30)).matches(&account));

        account.description = None;
        assert!(!ScalarFilter::DescriptionContains("rust".to_string()).matches(&account));
    }

    #[test]
    fn filters_deserialize_from_tagged_json() {
        let filter: ScalarFilter = serde_json::from_str(
            r#"{"type":"followersCountGreaterThan","value":100}"#,
        )
        .unwrap();
        assert!(matches!(filter, ScalarFilter::FollowersCountGreaterThan(100)));

        let query: SearchQuery = serde_json::from_str(
            r#"{"followedBy":["alice"],"filters":[{"type":"usernameContains","value":"bo"}],"useCacheOnly":true}"#,
        )
        .unwrap();
        assert_eq!(query.followed_by, vec!["alice"]);
        assert!(query.options.use_cache_only);
    }
}
