//! E2E tests for sync submission and the sync lifecycle

mod common;

use chrono::Utc;
use common::{FakeTwitter, TestServer};
use roost::data::{Direction, Relation};
use serde_json::json;

#[tokio::test]
async fn test_sync_fetches_multi_page_edge_set() {
    let server = TestServer::new().await;

    server.twitter.add_user(FakeTwitter::profile(1, "alice", 10));
    for id in [10, 11, 12] {
        server
            .twitter
            .add_user(FakeTwitter::profile(id, &format!("target{id}"), 0));
    }
    // Page size is 2, so three targets span two pages.
    server
        .twitter
        .set_list(1, Relation::Follow, Direction::Following, vec![10, 11, 12]);

    let response = server
        .client
        .post(&server.url("/api/sync"))
        .json(&json!({
            "username": "alice",
            "relation": "follow",
            "direction": "following",
            "waitSeconds": 5
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["job"]["state"], "completed");

    let mut targets = server
        .state
        .db
        .get_target_ids(Relation::Follow, 1)
        .await
        .unwrap();
    targets.sort();
    assert_eq!(targets, vec![10, 11, 12]);
}

#[tokio::test]
async fn test_block_list_has_no_followers_direction() {
    let server = TestServer::new().await;
    server.twitter.add_user(FakeTwitter::profile(1, "alice", 10));

    for relation in ["block", "mute"] {
        let response = server
            .client
            .post(&server.url("/api/sync"))
            .json(&json!({
                "username": "alice",
                "relation": relation,
                "direction": "followers"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }
}

#[tokio::test]
async fn test_fresh_edge_set_is_not_resynced() {
    let server = TestServer::new().await;

    server.twitter.add_user(FakeTwitter::profile(1, "alice", 10));
    server
        .twitter
        .set_list(1, Relation::Follow, Direction::Following, vec![10]);

    let first: serde_json::Value = server
        .client
        .post(&server.url("/api/sync"))
        .json(&json!({ "username": "alice", "waitSeconds": 5 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["status"], "completed");

    // Same request again: the set is fresh, nothing is queued.
    let second = server
        .client
        .post(&server.url("/api/sync"))
        .json(&json!({ "username": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["status"], "fresh");

    // forceRefresh overrides freshness.
    let forced = server
        .client
        .post(&server.url("/api/sync"))
        .json(&json!({ "username": "alice", "forceRefresh": true, "waitSeconds": 5 }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = forced.json().await.unwrap();
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_resync_prunes_unfollowed_accounts() {
    let server = TestServer::new().await;

    server.twitter.add_user(FakeTwitter::profile(1, "alice", 10));
    server
        .twitter
        .set_list(1, Relation::Follow, Direction::Following, vec![10, 11]);

    let sync = |wait: u64| {
        server
            .client
            .post(&server.url("/api/sync"))
            .json(&json!({ "username": "alice", "forceRefresh": true, "waitSeconds": wait }))
            .send()
    };

    sync(5).await.unwrap();

    // Alice unfollows 11 remotely.
    server
        .twitter
        .set_list(1, Relation::Follow, Direction::Following, vec![10]);
    sync(5).await.unwrap();

    let targets = server
        .state
        .db
        .get_target_ids(Relation::Follow, 1)
        .await
        .unwrap();
    assert_eq!(targets, vec![10]);
}

#[tokio::test]
async fn test_rate_limited_sync_defers_and_completes() {
    let server = TestServer::new().await;

    server.twitter.add_user(FakeTwitter::profile(1, "alice", 10));
    server
        .twitter
        .set_list(1, Relation::Follow, Direction::Following, vec![10]);
    // Remote rejects until shortly from now; the job must defer, not fail.
    server
        .twitter
        .limit_endpoint("following", Utc::now() + chrono::Duration::milliseconds(300));

    let response = server
        .client
        .post(&server.url("/api/sync"))
        .json(&json!({ "username": "alice", "waitSeconds": 10 }))
        .send()
        .await
        .unwrap();

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    // Deferrals never count as attempts.
    assert_eq!(body["job"]["attempts"], 0);
}

#[tokio::test]
async fn test_sync_unknown_user_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(&server.url("/api/sync"))
        .json(&json!({ "username": "nobody" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_mutation_job_commits_all_targets_in_chunks() {
    let server = TestServer::new().await;

    server.twitter.add_user(FakeTwitter::profile(1, "alice", 10));

    let response = server
        .client
        .post(&server.url("/api/mutations"))
        .json(&json!({
            "username": "alice",
            "relation": "block",
            "action": "add",
            "targetIds": ["20", "21", "22"],
            "priority": 5
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let job_id = body["job"]["id"].as_str().unwrap().to_string();

    // Wait for the chunked job (chunk size 2, so two invocations).
    let mut done = false;
    for _ in 0..100 {
        let job: serde_json::Value = server
            .client
            .get(&server.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if job["state"] == "completed" {
            done = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(done, "mutation job did not complete");

    let mutations = server.twitter.mutations();
    assert_eq!(
        mutations,
        vec![
            (Relation::Block, true, 1, 20),
            (Relation::Block, true, 1, 21),
            (Relation::Block, true, 1, 22),
        ]
    );

    // Committed mutations are mirrored locally.
    let mut targets = server
        .state
        .db
        .get_target_ids(Relation::Block, 1)
        .await
        .unwrap();
    targets.sort();
    assert_eq!(targets, vec![20, 21, 22]);
}
