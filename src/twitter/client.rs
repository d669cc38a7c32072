//! Twitter API v2 HTTP client.
//!
//! Edge-set reads use the paginated `/2/users/:id/{followers,following,
//! blocking,muting}` endpoints; mutations use their POST/DELETE
//! counterparts. A 429 is translated into [`FetchError::RateLimited`] using
//! the `x-rate-limit-reset` header so callers can defer instead of retrying.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{FetchError, RelationFetcher, RelationPage};
use crate::data::{endpoint_name, AccountProfile, Direction, Relation};
use crate::metrics::REMOTE_REQUESTS_TOTAL;

const USER_FIELDS: &str =
    "created_at,description,location,profile_image_url,public_metrics,url";

pub struct TwitterClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

#[derive(Deserialize)]
struct UserObject {
    id: String,
    username: String,
    name: Option<String>,
    description: Option<String>,
    location: Option<String>,
    profile_image_url: Option<String>,
    url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    public_metrics: Option<PublicMetrics>,
}

#[derive(Deserialize, Default)]
struct PublicMetrics {
    #[serde(default)]
    followers_count: i64,
    #[serde(default)]
    following_count: i64,
    #[serde(default)]
    tweet_count: i64,
    #[serde(default)]
    listed_count: i64,
}

#[derive(Deserialize)]
struct PageResponse {
    #[serde(default)]
    data: Vec<UserObject>,
    #[serde(default)]
    meta: PageMeta,
}

#[derive(Deserialize, Default)]
struct PageMeta {
    next_token: Option<String>,
}

#[derive(Deserialize)]
struct UserResponse {
    data: Option<UserObject>,
}

impl UserObject {
    fn into_profile(self) -> Result<AccountProfile, FetchError> {
        let id = self
            .id
            .parse::<i64>()
            .map_err(|_| FetchError::Remote(format!("non-numeric user id: {}", self.id)))?;
        let metrics = self.public_metrics.unwrap_or_default();

        Ok(AccountProfile {
            id,
            username: self.username,
            name: self.name,
            description: self.description,
            location: self.location,
            profile_image_url: self.profile_image_url,
            url: self.url,
            followers_count: metrics.followers_count,
            following_count: metrics.following_count,
            tweet_count: metrics.tweet_count,
            listed_count: metrics.listed_count,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

impl TwitterClient {
    pub fn new(base_url: &str, bearer_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.to_string(),
        }
    }

    /// Convert a non-success response into the matching [`FetchError`].
    async fn error_for(
        endpoint: &str,
        response: reqwest::Response,
    ) -> FetchError {
        let status = response.status();
        REMOTE_REQUESTS_TOTAL
            .with_label_values(&[endpoint, status.as_str()])
            .inc();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let resets_at = response
                .headers()
                .get("x-rate-limit-reset")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<i64>().ok())
                .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
                // Header missing or malformed: assume a full 15-minute window.
                .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(15));
            return FetchError::RateLimited { resets_at };
        }

        if status == StatusCode::NOT_FOUND {
            return FetchError::NotFound;
        }

        let body = response.text().await.unwrap_or_default();
        FetchError::Remote(format!("{status}: {body}"))
    }

    async fn get(&self, endpoint: &str, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(endpoint, response).await);
        }

        REMOTE_REQUESTS_TOTAL
            .with_label_values(&[endpoint, response.status().as_str()])
            .inc();
        Ok(response)
    }
}

#[async_trait]
impl RelationFetcher for TwitterClient {
    async fn fetch_page(
        &self,
        account_id: i64,
        relation: Relation,
        direction: Direction,
        page_size: u32,
        pagination_token: Option<&str>,
    ) -> Result<RelationPage, FetchError> {
        let endpoint = endpoint_name(relation, direction);
        let mut url = format!(
            "{}/2/users/{}/{}?max_results={}&user.fields={}",
            self.base_url, account_id, endpoint, page_size, USER_FIELDS
        );
        if let Some(token) = pagination_token {
            url.push_str("&pagination_token=");
            url.push_str(token);
        }

        let response = self.get(endpoint, &url).await?;
        let page: PageResponse = response.json().await?;

        let records = page
            .data
            .into_iter()
            .map(UserObject::into_profile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RelationPage {
            records,
            next_token: page.meta.next_token,
        })
    }

    async fn lookup_username(&self, username: &str) -> Result<AccountProfile, FetchError> {
        let url = format!(
            "{}/2/users/by/username/{}?user.fields={}",
            self.base_url, username, USER_FIELDS
        );

        let response = self.get("user_lookup", &url).await?;
        let body: UserResponse = response.json().await?;

        // The API reports unknown usernames inside a 200 body.
        body.data
            .ok_or(FetchError::NotFound)?
            .into_profile()
    }

    async fn mutate(
        &self,
        relation: Relation,
        add: bool,
        source_id: i64,
        target_id: i64,
    ) -> Result<(), FetchError> {
        let segment = match relation {
            Relation::Follow => "following",
            Relation::Block => "blocking",
            Relation::Mute => "muting",
        };

        let response = if add {
            let url = format!("{}/2/users/{}/{}", self.base_url, source_id, segment);
            let body = serde_json::json!({ "target_user_id": target_id.to_string() });
            self.http
                .post(&url)
                .bearer_auth(&self.bearer_token)
                .json(&body)
                .send()
                .await?
        } else {
            let url = format!(
                "{}/2/users/{}/{}/{}",
                self.base_url, source_id, segment, target_id
            );
            self.http
                .delete(&url)
                .bearer_auth(&self.bearer_token)
                .send()
                .await?
        };

        if !response.status().is_success() {
            return Err(Self::error_for(segment, response).await);
        }

        REMOTE_REQUESTS_TOTAL
            .with_label_values(&[segment, response.status().as_str()])
            .inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_object_parses_snowflake_ids() {
        let user = UserObject {
            id: "1234567890123456789".to_string(),
            username: "alice".to_string(),
            name: None,
            description: None,
            location: None,
            profile_image_url: None,
            url: None,
            created_at: None,
            public_metrics: Some(PublicMetrics {
                followers_count: 5,
                ..Default::default()
            }),
        };

        let profile = user.into_profile().expect("valid profile");
        assert_eq!(profile.id, 1_234_567_890_123_456_789);
        assert_eq!(profile.followers_count, 5);
    }

    #[test]
    fn user_object_rejects_non_numeric_id() {
        let user = UserObject {
            id: "not-a-number".to_string(),
            username: "alice".to_string(),
            name: None,
            description: None,
            location: None,
            profile_image_url: None,
            url: None,
            created_at: None,
            public_metrics: None,
        };

        assert!(matches!(user.into_profile(), Err(FetchError::Remote(_))));
    }

    #[test]
    fn page_response_tolerates_empty_body() {
        let page: PageResponse = serde_json::from_str(r#"{"meta":{"result_count":0}}"#)
            .expect("empty page parses");
        assert!(page.data.is_empty());
        assert!(page.meta.next_token.is_none());
    }
}
