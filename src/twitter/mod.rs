//! Remote Twitter API access.
//!
//! The sync and search layers talk to the remote graph through
//! [`RelationFetcher`], a trait seam so tests can substitute a scripted
//! fetcher for the real HTTP client.

mod client;

pub use client::TwitterClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::data::{AccountProfile, Direction, Relation};

/// One page of an edge-list fetch.
#[derive(Debug, Clone)]
pub struct RelationPage {
    pub records: Vec<AccountProfile>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Errors surfaced by remote fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The credentials are rate-limited on this endpoint until `resets_at`.
    #[error("rate limited until {resets_at}")]
    RateLimited { resets_at: DateTime<Utc> },
    /// The referenced account does not exist remotely
    #[error("account not found")]
    NotFound,
    /// Remote returned an error body or unexpected status
    #[error("remote error: {0}")]
    Remote(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Remote graph access as seen by the sync worker and search engine.
#[async_trait]
pub trait RelationFetcher: Send + Sync {
    /// Fetch one page of an account's edge set.
    ///
    /// # Arguments
    /// * `pagination_token` - resume cursor from a previous page, if any
    async fn fetch_page(
        &self,
        account_id: i64,
        relation: Relation,
        direction: Direction,
        page_size: u32,
        pagination_token: Option<&str>,
    ) -> Result<RelationPage, FetchError>;

    /// Resolve a username to a profile snapshot
    async fn lookup_username(&self, username: &str) -> Result<AccountProfile, FetchError>;

    /// Apply or remove one relation edge remotely.
    ///
    /// `add` follows/blocks/mutes the target; `!add` undoes it.
    async fn mutate(
        &self,
        relation: Relation,
        add: bool,
        source_id: i64,
        target_id: i64,
    ) -> Result<(), FetchError>;
}
