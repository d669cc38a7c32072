//! Data models
//!
//! Rust structs representing database entities. Job ids use ULID; remote
//! account ids are Twitter snowflakes stored as `i64` and serialized as
//! strings at every JSON boundary (see [`id_str`]).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Job ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The epoch sentinel meaning "never fetched" for freshness timestamps.
pub fn never_synced() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// Serialize/deserialize an `i64` id as a JSON string.
///
/// Twitter snowflake ids exceed 2^53 and silently lose precision as JSON
/// numbers, so the wire format is always a string.
pub mod id_str {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<i64>().map_err(serde::de::Error::custom)
    }
}

/// Same as [`id_str`] but for `Vec<i64>`.
pub mod id_str_vec {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ids: &[i64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(ids.iter().map(|id| id.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|s| s.parse::<i64>().map_err(serde::de::Error::custom))
            .collect()
    }
}

// =============================================================================
// Relations
// =============================================================================

/// Relation type for a directed edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Follow,
    Block,
    Mute,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Block => "block",
            Self::Mute => "mute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "follow" => Some(Self::Follow),
            "block" => Some(Self::Block),
            "mute" => Some(Self::Mute),
            _ => None,
        }
    }
}

/// Edge-set direction relative to the owning account.
///
/// Only `follow` has a meaningful `Followers` direction; block and mute
/// lists are always outgoing (`Following`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Followers,
    Following,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Followers => "followers",
            Self::Following => "following",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "followers" => Some(Self::Followers),
            "following" => Some(Self::Following),
            _ => None,
        }
    }
}

/// Logical remote endpoint for a `(relation, direction)` pair.
///
/// Rate-limit records and freshness columns are keyed by this name.
pub fn endpoint_name(relation: Relation, direction: Direction) -> &'static str {
    match (relation, direction) {
        (Relation::Follow, Direction::Followers) => "followers",
        (Relation::Follow, Direction::Following) => "following",
        (Relation::Block, _) => "blocking",
        (Relation::Mute, _) => "muting",
    }
}

// =============================================================================
// Account
// =============================================================================

/// A cached snapshot of a remote Twitter profile.
///
/// A row exists iff at least one fetch has observed the account, either a
/// direct lookup or membership in someone's edge list. Counter fields are
/// snapshot values used only for range filters, never live data.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
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
    /// Remote account-creation time (immutable)
    pub created_at: DateTime<Utc>,
    /// Local cache write time
    pub updated_at: DateTime<Utc>,
    pub followers_updated_at: DateTime<Utc>,
    pub following_updated_at: DateTime<Utc>,
    pub blocking_updated_at: DateTime<Utc>,
    pub muting_updated_at: DateTime<Utc>,
}

impl Account {
    /// Freshness timestamp for one edge set of this account.
    pub fn freshness(&self, relation: Relation, direction: Direction) -> DateTime<Utc> {
        match (relation, direction) {
            (Relation::Follow, Direction::Followers) => self.followers_updated_at,
            (Relation::Follow, Direction::Following) => self.following_updated_at,
            (Relation::Block, _) => self.blocking_updated_at,
            (Relation::Mute, _) => self.muting_updated_at,
        }
    }
}

/// A profile snapshot as observed by a remote fetch.
///
/// This is what edge-list pages and username lookups yield; upserting it
/// refreshes an account's display and counter fields without touching the
/// freshness columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountProfile {
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
}

/// One directed relation instance between two accounts.
///
/// For `follow`, source follows target.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Edge {
    pub source_id: i64,
    pub target_id: i64,
    pub updated_at: DateTime<Utc>,
    pub to_delete: bool,
}

// =============================================================================
// Jobs
// =============================================================================

/// What a queued job does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Paginated read-sync of one edge set
    Sync,
    /// Chunked remote mutations (follow/unfollow/block/...)
    Mutation,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Mutation => "mutation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "mutation" => Some(Self::Mutation),
            _ => None,
        }
    }
}

/// Queue lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    /// Rescheduled with a delay (rate limit or generic retry)
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "delayed" => Some(Self::Delayed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Live states participate in single-flight dedup.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active | Self::Delayed)
    }
}

/// A unit of scheduled work, keyed by `(kind, account, relation, direction)`
/// while live.
///
/// `pagination_token` is the crash-safe resume point for sync jobs; the
/// mutation payload fields are only meaningful for `kind = Mutation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub kind: JobKind,
    #[serde(with = "id_str")]
    pub account_id: i64,
    pub relation: Relation,
    pub direction: Direction,
    pub pagination_token: Option<String>,
    pub priority: i64,
    pub paused: bool,
    pub finished: bool,
    pub state: JobState,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
    pub updated_count: i64,
    pub last_error: Option<String>,
    /// Mutation jobs: true adds the relation, false removes it
    pub add_edges: bool,
    /// Mutation jobs: all target account ids
    #[serde(with = "id_str_vec")]
    pub target_ids: Vec<i64>,
    /// Mutation jobs: targets already committed remotely
    #[serde(with = "id_str_vec")]
    pub done_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// Logical remote endpoint this job talks to.
    pub fn endpoint(&self) -> &'static str {
        endpoint_name(self.relation, self.direction)
    }

    /// Mutation targets not yet committed remotely, in submission order.
    pub fn pending_targets(&self) -> Vec<i64> {
        self.target_ids
            .iter()
            .copied()
            .filter(|id| !self.done_ids.contains(id))
            .collect()
    }
}

/// Records that an account's credentials are rate-limited on a logical
/// endpoint until `resets_at`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitRecord {
    #[serde(with = "id_str")]
    pub account_id: i64,
    pub endpoint: String,
    pub resets_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_name_ignores_direction_for_block_and_mute() {
        assert_eq!(endpoint_name(Relation::Block, Direction::Followers), "blocking");
        assert_eq!(endpoint_name(Relation::Block, Direction::Following), "blocking");
        assert_eq!(endpoint_name(Relation::Mute, Direction::Followers), "muting");
        assert_eq!(endpoint_name(Relation::Follow, Direction::Followers), "followers");
        assert_eq!(endpoint_name(Relation::Follow, Direction::Following), "following");
    }

    #[test]
    fn relation_round_trips_through_as_str() {
        for relation in [Relation::Follow, Relation::Block, Relation::Mute] {
            assert_eq!(Relation::parse(relation.as_str()), Some(relation));
        }
        assert_eq!(Relation::parse("like"), None);
    }

    #[test]
    fn job_state_liveness() {
        assert!(JobState::Waiting.is_live());
        assert!(JobState::Active.is_live());
        assert!(JobState::Delayed.is_live());
        assert!(!JobState::Completed.is_live());
        assert!(!JobState::Failed.is_live());
    }

    #[test]
    fn account_ids_serialize_as_strings() {
        #[derive(serde::Deserialize, serde::Serialize)]
        struct Probe {
            #[serde(with = "id_str")]
            id: i64,
        }
        let json = serde_json::json!({ "id": "1234567890123456789" });
        let probe: Probe = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(probe.id, 1_234_567_890_123_456_789);
        assert_eq!(serde_json::to_value(&probe).unwrap(), json);
    }

    #[test]
    fn pending_targets_excludes_done_ids() {
        let mut job = sample_mutation_job();
        job.target_ids = vec![1, 2, 3, 4];
        job.done_ids = vec![2, 4];
        assert_eq!(job.pending_targets(), vec![1, 3]);
    }

    fn sample_mutation_job() -> SyncJob {
        SyncJob {
            id: JobId::new(),
            kind: JobKind::Mutation,
            account_id: 1,
            relation: Relation::Follow,
            direction: Direction::Following,
            pagination_token: None,
            priority: 0,
            paused: false,
            finished: false,
            state: JobState::Waiting,
            run_at: Utc::now(),
            attempts: 0,
            updated_count: 0,
            last_error: None,
            add_edges: true,
            target_ids: vec![],
            done_ids: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
