use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use servimarket_server::app_state::AppState;
use servimarket_server::collaborators::Collaborators;
use servimarket_server::config::LedgerConfig;
use servimarket_server::services::Services;
use servimarket_server::store::MemoryLedgerStore;

const SECRET: &str = "test-webhook-secret";

fn test_app(webhook_secret: Option<&str>) -> Router {
    let services = Services::new(
        Arc::new(MemoryLedgerStore::new()),
        Arc::new(LedgerConfig::default()),
        Collaborators::local(),
        Duration::from_secs(60),
    );
    servimarket_server::app(AppState::new(
        services,
        webhook_secret.map(str::to_string),
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_request(app: &Router, total_amount: i64) -> Value {
    let (status, body) = send(
        app,
        post_json(
            "/api/service-requests",
            json!({
                "requester_id": Uuid::new_v4(),
                "provider_id": Uuid::new_v4(),
                "total_amount": total_amount,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"].clone()
}

#[tokio::test]
async fn health_check_responds() {
    let app = test_app(None);
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn captured_request_settles_on_close() {
    let app = test_app(None);
    let request = create_request(&app, 100_000).await;
    let id = request["id"].as_str().unwrap().to_string();
    assert_eq!(request["status"], "scheduled");

    let (status, body) = send(
        &app,
        post_json(&format!("/api/service-requests/{}/capture", id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["payment_status"], "held_for_release");

    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/service-requests/{}/transition", id),
            json!({ "status": "closed_with_rating" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["settled"], true);
    assert_eq!(body["data"]["request"]["payment_status"], "released_to_provider");
    assert_eq!(
        body["data"]["request"]["financial_breakdown"]["provider_payout"],
        90_000
    );

    let (status, body) = send(&app, get("/api/loyalty/fund")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_amount"], 600);
    assert_eq!(body["data"]["contributions"], 1);

    // Reopening a finalized request is refused.
    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/service-requests/{}/transition", id),
            json!({ "status": "paid" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn webhook_fails_closed_without_secret() {
    let app = test_app(None);
    let request = create_request(&app, 50_000).await;

    let (status, _) = send(
        &app,
        post_json(
            "/api/service-requests/webhook",
            json!({ "service_request_id": request["id"], "status": "paid" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn webhook_rejects_wrong_secret() {
    let app = test_app(Some(SECRET));
    let request = create_request(&app, 50_000).await;

    let mut webhook = post_json(
        "/api/service-requests/webhook",
        json!({ "service_request_id": request["id"], "status": "paid" }),
    );
    webhook
        .headers_mut()
        .insert("X-Webhook-Secret", "nope".parse().unwrap());

    let (status, body) = send(&app, webhook).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn webhook_applies_status_with_secret() {
    let app = test_app(Some(SECRET));
    let request = create_request(&app, 50_000).await;

    let mut webhook = post_json(
        "/api/service-requests/webhook",
        json!({ "service_request_id": request["id"], "status": "provider_en_route" }),
    );
    webhook
        .headers_mut()
        .insert("X-Webhook-Secret", SECRET.parse().unwrap());

    let (status, body) = send(&app, webhook).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "provider_en_route");
}

#[tokio::test]
async fn withdrawal_without_accepted_fee_returns_quote() {
    let app = test_app(None);
    let (status, body) = send(
        &app,
        post_json(
            "/api/withdrawals",
            json!({
                "account_id": Uuid::new_v4(),
                "amount": 10_000,
                "bank_details": {
                    "account_holder": "Ana Ruiz",
                    "account_number": "00123456789",
                    "bank_code": "BANK01",
                    "country": "mx",
                },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["kind"], "quote");
    assert_eq!(body["data"]["withdrawal"]["fee"], 350);
    assert_eq!(body["data"]["withdrawal"]["total_deducted"], 10_350);
}

#[tokio::test]
async fn invalid_amount_is_a_bad_request() {
    let app = test_app(None);
    let (status, body) = send(
        &app,
        post_json(
            "/api/service-requests",
            json!({
                "requester_id": Uuid::new_v4(),
                "provider_id": Uuid::new_v4(),
                "total_amount": 0,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Validation error"));
}

#[tokio::test]
async fn unknown_service_request_is_not_found() {
    let app = test_app(None);
    let (status, body) = send(
        &app,
        get(&format!("/api/service-requests/{}", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn release_of_an_open_request_conflicts() {
    let app = test_app(None);
    let request = create_request(&app, 40_000).await;
    let id = request["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        post_json(&format!("/api/service-requests/{}/capture", id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post_json(&format!("/api/service-requests/{}/release", id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}
