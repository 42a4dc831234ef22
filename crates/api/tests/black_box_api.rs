use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use estimator_api::auth::Claims;
use estimator_core::UserId;
use estimator_infra::{EstimationCore, Settings};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    core: Arc<EstimationCore>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(true).await
    }

    /// `start_workers = false` leaves submitted jobs queued.
    async fn spawn_with(start_workers: bool) -> Self {
        estimator_observability::tracing::init_for_tests();

        let core = Arc::new(EstimationCore::init(Settings::default()).expect("failed to init core"));
        if start_workers {
            core.start();
        }

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = estimator_api::app::build_app(core.clone(), JWT_SECRET);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, core, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(secret: &str, expires_in: ChronoDuration) -> String {
    let claims = Claims {
        user_id: UserId::new(),
        exp: (Utc::now() + expires_in).timestamp(),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn token() -> String {
    mint_jwt(JWT_SECRET, ChronoDuration::minutes(10))
}

async fn create_estimate(client: &reqwest::Client, srv: &TestServer, token: &str) -> String {
    let res = client
        .post(srv.url("/api/estimates"))
        .bearer_auth(token)
        .json(&json!({
            "project_name": "Office Building Renovation",
            "description": "Complete electrical system upgrade",
            "labor_hours": "40"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    created["id"].as_str().unwrap().to_string()
}

/// Write `bytes` to a fresh temp file and return its path.
fn image_file(bytes: &[u8]) -> String {
    let path = std::env::temp_dir().join(format!("upload-{}.jpg", uuid::Uuid::now_v7()));
    std::fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

async fn wait_for_job(client: &reqwest::Client, srv: &TestServer, token: &str, job_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/api/jobs/{job_id}")))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let job: serde_json::Value = res.json().await.unwrap();

        if job["state"] == "SUCCEEDED" || job["state"] == "FAILED" {
            return job;
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("job {job_id} did not finish within timeout");
}

#[tokio::test]
async fn health_is_public_and_carries_standard_headers() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/api/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let headers = res.headers().clone();
    let timing = headers["x-response-time"].to_str().unwrap();
    assert!(timing.ends_with('s'), "unexpected X-Response-Time {timing}");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["content-security-policy"], "default-src 'self'");

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/api/estimates")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "No token provided");

    let res = client
        .get(srv.url("/api/estimates"))
        .bearer_auth("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Invalid token");

    let expired = mint_jwt(JWT_SECRET, ChronoDuration::minutes(-10));
    let res = client
        .get(srv.url("/api/estimates"))
        .bearer_auth(expired)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Token has expired");

    let wrong_secret = mint_jwt("other-secret", ChronoDuration::minutes(10));
    let res = client
        .get(srv.url("/api/estimates"))
        .bearer_auth(wrong_secret)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_estimate_input_lists_every_problem() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/api/estimates"))
        .bearer_auth(token())
        .json(&json!({ "project_name": "x".repeat(201), "labor_hours": "many" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    let details: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d.as_str().unwrap())
        .collect();
    assert_eq!(
        details,
        vec![
            "Field 'description' is required",
            "Project name must be less than 200 characters",
            "Labor hours must be a valid number",
        ]
    );
}

#[tokio::test]
async fn estimate_reads_are_cached_timed_and_invalidated_on_update() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();
    let id = create_estimate(&client, &srv, &token).await;

    for _ in 0..2 {
        let res = client
            .get(srv.url(&format!("/api/estimates/{id}")))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let estimate: serde_json::Value = res.json().await.unwrap();
        assert_eq!(estimate["labor_hours"], 40.0);
    }
    let stats = srv.core.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);

    let res = client
        .patch(srv.url(&format!("/api/estimates/{id}")))
        .bearer_auth(&token)
        .json(&json!({ "status": "completed", "total_cost": 1200.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // The cached copy was dropped, so the read sees the update.
    let estimate: serde_json::Value = client
        .get(srv.url(&format!("/api/estimates/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(estimate["status"], "completed");
    assert_eq!(estimate["total_cost"], 1200.0);

    let metrics: serde_json::Value = client
        .get(srv.url("/api/metrics/get_estimate"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["count"], 3);

    let unknown: serde_json::Value = client
        .get(srv.url("/api/metrics/never_recorded"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unknown, json!({}));
}

#[tokio::test]
async fn updates_reject_blank_fields_and_server_owned_fields() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();
    let id = create_estimate(&client, &srv, &token).await;
    let url = srv.url(&format!("/api/estimates/{id}"));

    let res = client
        .patch(&url)
        .bearer_auth(&token)
        .json(&json!({ "project_name": "", "total_cost": -5.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["details"].as_array().unwrap().len(), 2);

    let res = client
        .patch(&url)
        .bearer_auth(&token)
        .json(&json!({ "analysis_confidence": 7.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");

    let estimate: serde_json::Value = client
        .get(&url)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(estimate["project_name"], "Office Building Renovation");
    assert!(estimate["analysis_confidence"].is_null());
}

#[tokio::test]
async fn estimate_listing_is_paginated_newest_first() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(create_estimate(&client, &srv, &token).await);
    }

    let page: serde_json::Value = client
        .get(srv.url("/api/estimates?page=1&per_page=2"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["page"], 1);
    assert_eq!(page["per_page"], 2);
    assert_eq!(page["pages"], 2);
    let listed: Vec<&str> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(listed, vec![ids[2].as_str(), ids[1].as_str()]);

    let defaults: serde_json::Value = client
        .get(srv.url("/api/estimates"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(defaults["per_page"], 20);
    assert_eq!(defaults["items"].as_array().unwrap().len(), 3);

    for query in ["page=0", "per_page=0", "per_page=101"] {
        let res = client
            .get(srv.url(&format!("/api/estimates?{query}")))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{query}");
    }
}

#[tokio::test]
async fn missing_and_malformed_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();

    let res = client
        .get(srv.url("/api/estimates/not-a-uuid"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url(&format!("/api/estimates/{}", estimator_core::EstimateId::new())))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(srv.url(&format!("/api/jobs/{}", uuid::Uuid::now_v7())))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(srv.url("/api/nowhere")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Endpoint not found");
}

#[tokio::test]
async fn analysis_job_updates_the_estimate() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();
    let id = create_estimate(&client, &srv, &token).await;

    let res = client
        .post(srv.url("/api/analyze"))
        .bearer_auth(&token)
        .json(&json!({ "image_path": image_file(b"panel photo"), "estimate_id": id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: serde_json::Value = res.json().await.unwrap();
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let job = wait_for_job(&client, &srv, &token, &job_id).await;
    assert_eq!(job["state"], "SUCCEEDED", "job failed: {job}");
    assert_eq!(job["result"]["result"]["confidence"], 0.85);

    let estimate: serde_json::Value = client
        .get(srv.url(&format!("/api/estimates/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(estimate["status"], "analyzed");
    assert_eq!(estimate["total_cost"], 450.0);
    assert_eq!(estimate["materials"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn batch_analysis_job_covers_every_image() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();

    let res = client
        .post(srv.url("/api/analyze/batch"))
        .bearer_auth(&token)
        .json(&json!({ "image_paths": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let paths = [image_file(b"east wall"), image_file(b"west wall")];
    let res = client
        .post(srv.url("/api/analyze/batch"))
        .bearer_auth(&token)
        .json(&json!({ "image_paths": paths }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: serde_json::Value = res.json().await.unwrap();

    let job = wait_for_job(&client, &srv, &token, accepted["job_id"].as_str().unwrap()).await;
    assert_eq!(job["state"], "SUCCEEDED", "job failed: {job}");
    assert_eq!(job["progress"], json!({ "current": 2, "total": 2 }));
    let results = job["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["image_path"], json!(paths[0]));
    assert_eq!(results[1]["result"]["confidence"], 0.85);
}

#[tokio::test]
async fn report_job_records_path() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();
    let id = create_estimate(&client, &srv, &token).await;

    let res = client
        .post(srv.url(&format!("/api/estimates/{id}/report")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: serde_json::Value = res.json().await.unwrap();

    let job = wait_for_job(&client, &srv, &token, accepted["job_id"].as_str().unwrap()).await;
    assert_eq!(job["state"], "SUCCEEDED", "job failed: {job}");
    assert_eq!(job["result"]["pdf_path"], format!("reports/estimate_{id}.pdf"));
}

#[tokio::test]
async fn batch_job_reports_final_progress() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = token();

    let res = client
        .post(srv.url("/api/batch"))
        .bearer_auth(&token)
        .json(&json!({ "items": [{ "sku": 1 }, { "sku": 2 }, { "sku": 3 }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: serde_json::Value = res.json().await.unwrap();

    let job = wait_for_job(&client, &srv, &token, accepted["job_id"].as_str().unwrap()).await;
    assert_eq!(job["state"], "SUCCEEDED");
    assert_eq!(job["progress"], json!({ "current": 3, "total": 3 }));
    assert_eq!(job["result"]["results"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn queued_job_can_be_cancelled_once() {
    let srv = TestServer::spawn_with(false).await;
    let client = reqwest::Client::new();
    let token = token();

    let res = client
        .post(srv.url("/api/batch"))
        .bearer_auth(&token)
        .json(&json!({ "items": [] }))
        .send()
        .await
        .unwrap();
    let accepted: serde_json::Value = res.json().await.unwrap();
    let job_url = srv.url(&format!("/api/jobs/{}", accepted["job_id"].as_str().unwrap()));

    let res = client.delete(&job_url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let job: serde_json::Value = res.json().await.unwrap();
    assert_eq!(job["state"], "FAILED");
    assert_eq!(job["error"]["kind"], "cancelled");

    let res = client.delete(&job_url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn cors_allows_only_configured_origins() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .request(reqwest::Method::OPTIONS, srv.url("/api/estimates"))
        .header("Origin", "http://localhost:5173")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(res.headers()["access-control-allow-origin"], "http://localhost:5173");
    assert_eq!(res.headers()["access-control-allow-credentials"], "true");

    let res = client
        .get(srv.url("/api/health"))
        .header("Origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get("access-control-allow-origin").is_none());
}
