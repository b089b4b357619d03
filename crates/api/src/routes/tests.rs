//! Router tests against in-memory stores and a mocked Mercado Pago API

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use hmac::{Hmac, Mac};
use medibook_billing::{BillingService, MercadoPagoClient, MercadoPagoConfig, WhatsAppNotifier};
use medibook_shared::{
    AppointmentStatus, DuplicatePolicy, MemoryStore, NewWebhookEvent, PaymentStatus,
    SubscriptionStatus, WebhookEventStore,
};
use serde_json::{json, Value};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::{config::Config, state::AppState};

const JWT_SECRET: &str = "test-jwt-secret";
const WEBHOOK_SECRET: &str = "test-webhook-secret";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    state: AppState,
}

fn billing_for(
    server: &mockito::Server,
    store: &Arc<MemoryStore>,
    webhook_secret: Option<&str>,
) -> BillingService {
    let config = MercadoPagoConfig {
        access_token: "TEST-token".to_string(),
        webhook_secret: webhook_secret.map(String::from),
        api_url: server.url(),
    };
    let client = MercadoPagoClient::new(config.clone()).unwrap();

    BillingService::new(
        config,
        Arc::new(client),
        store.clone(),
        store.clone(),
        Arc::new(WhatsAppNotifier::new(None).unwrap()),
    )
}

fn app_with(server: &mockito::Server, configure: impl FnOnce(&mut Config)) -> TestApp {
    app_with_secret(server, None, configure)
}

fn app_with_secret(
    server: &mockito::Server,
    webhook_secret: Option<&str>,
    configure: impl FnOnce(&mut Config),
) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let mut config = Config::for_tests(JWT_SECRET);
    configure(&mut config);

    let state = AppState::from_parts(
        config,
        store.clone(),
        store.clone(),
        billing_for(server, &store, webhook_secret),
    );

    TestApp {
        router: create_router(state.clone()),
        store,
        state,
    }
}

fn bearer(app: &TestApp, user_id: Uuid) -> String {
    let token = app
        .state
        .jwt_manager
        .generate_access_token(user_id, Some("ana@example.com"), "patient")
        .unwrap();
    format!("Bearer {}", token)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// =============================================================================
// Health & payments
// =============================================================================

#[tokio::test]
async fn test_health() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let (status, body) = send_json(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_payment_status_found() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let user = app.store.add_user("Ana", None).await;
    let doctor = app.store.add_doctor("Dr. Grey").await;
    let appointment = app
        .store
        .add_appointment(user, doctor, AppointmentStatus::Pending, OffsetDateTime::now_utc())
        .await;
    let payment = app
        .store
        .add_payment(appointment.id, PaymentStatus::Pending, 15_000.0)
        .await;

    let (status, body) =
        send_json(&app.router, get(&format!("/payments/status/{}", payment.id))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["amount"], 15_000.0);
    assert_eq!(body["currency"], "ARS");
    assert_eq!(body["appointmentId"], appointment.id.to_string());
    assert!(body.get("payerEmail").is_some());
}

#[tokio::test]
async fn test_payment_status_unknown_is_404() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let (status, body) = send_json(
        &app.router,
        get(&format!("/payments/status/{}", Uuid::new_v4())),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
    assert!(body.get("status").is_none());
}

// =============================================================================
// Cron cleanup
// =============================================================================

#[tokio::test]
async fn test_cleanup_reaps_stale_pending_appointment() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let user = app.store.add_user("Ana", None).await;
    let doctor = app.store.add_doctor("Dr. Grey").await;
    let stale = app
        .store
        .add_appointment(
            user,
            doctor,
            AppointmentStatus::Pending,
            OffsetDateTime::now_utc() - Duration::minutes(61),
        )
        .await;
    app.store
        .add_payment(stale.id, PaymentStatus::Pending, 15_000.0)
        .await;

    let (status, body) = send_json(&app.router, get("/cron/cleanup")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);
    assert!(body["message"].is_string());
    assert!(body["timestamp"].is_string());
    assert!(app.store.appointment(stale.id).await.is_none());

    let history = app.store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, "TIMEOUT_PAYMENT");
}

#[tokio::test]
async fn test_cleanup_requires_cron_secret_when_configured() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |c| c.cron_secret = Some("cron-secret".to_string()));

    let (status, _) = send(&app.router, get("/cron/cleanup")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/cron/cleanup")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/cron/cleanup")
        .header(header::AUTHORIZATION, "Bearer cron-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, right).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cleanup_failure_returns_500_without_partial_effect() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let user = app.store.add_user("Ana", None).await;
    let doctor = app.store.add_doctor("Dr. Grey").await;
    let stale = app
        .store
        .add_appointment(
            user,
            doctor,
            AppointmentStatus::Pending,
            OffsetDateTime::now_utc() - Duration::minutes(90),
        )
        .await;
    app.store.fail_next_archive().await;

    let (status, body) = send_json(&app.router, get("/cron/cleanup")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
    assert!(body["details"].is_string());
    assert!(app.store.appointment(stale.id).await.is_some());
    assert!(app.store.history().await.is_empty());
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_subscription_routes_require_session() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let request = Request::builder()
        .method("POST")
        .uri("/subscriptions/cancel")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let request = Request::builder()
        .uri("/subscriptions/access")
        .header(header::AUTHORIZATION, "Bearer not-a-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cancel_subscription_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/preapproval/pre-1")
        .with_status(200)
        .with_body(r#"{"id":"pre-1","status":"cancelled"}"#)
        .create_async()
        .await;
    let app = app_with(&server, |_| {});

    let user = app.store.add_user("Ana", None).await;
    let subscription = app
        .store
        .add_subscription(user, Some("pre-1"), SubscriptionStatus::Active)
        .await;

    let request = Request::builder()
        .method("POST")
        .uri("/subscriptions/cancel")
        .header(header::AUTHORIZATION, bearer(&app, user))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app.router, request).await;

    mock.assert_async().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(
        app.store.subscription(subscription.id).await.unwrap().status,
        SubscriptionStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_subscription_processor_failure_keeps_local_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("PUT", "/preapproval/pre-1")
        .with_status(500)
        .create_async()
        .await;
    let app = app_with(&server, |_| {});

    let user = app.store.add_user("Ana", None).await;
    let subscription = app
        .store
        .add_subscription(user, Some("pre-1"), SubscriptionStatus::Active)
        .await;

    let request = Request::builder()
        .method("POST")
        .uri("/subscriptions/cancel")
        .header(header::AUTHORIZATION, bearer(&app, user))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        app.store.subscription(subscription.id).await.unwrap().status,
        SubscriptionStatus::Active
    );
}

#[tokio::test]
async fn test_cancel_without_subscription_is_404() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});
    let user = app.store.add_user("Ana", None).await;

    let request = Request::builder()
        .method("POST")
        .uri("/subscriptions/cancel")
        .header(header::AUTHORIZATION, bearer(&app, user))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_access_follows_processor_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/preapproval/pre-ok")
        .with_status(200)
        .with_body(r#"{"id":"pre-ok","status":"authorized"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/preapproval/pre-gone")
        .with_status(404)
        .create_async()
        .await;
    let app = app_with(&server, |_| {});

    let active = app.store.add_user("Ana", None).await;
    app.store
        .add_subscription(active, Some("pre-ok"), SubscriptionStatus::Active)
        .await;
    let lapsed = app.store.add_user("Bruno", None).await;
    app.store
        .add_subscription(lapsed, Some("pre-gone"), SubscriptionStatus::Active)
        .await;

    for (user, expected) in [(active, true), (lapsed, false)] {
        let request = Request::builder()
            .uri("/subscriptions/access")
            .header(header::AUTHORIZATION, bearer(&app, user))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_json(&app.router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_access"], expected);
    }
}

// =============================================================================
// WhatsApp webhooks
// =============================================================================

#[tokio::test]
async fn test_whatsapp_handshake() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |c| c.whatsapp_verify_token = Some("verify-me".to_string()));

    let (status, body) = send(
        &app.router,
        get("/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"1158201444");

    let (status, _) = send(
        &app.router,
        get("/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_whatsapp_event_is_stored_and_processed() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "102290129340398",
            "changes": [{
                "field": "messages",
                "value": {
                    "statuses": [{"id": "wamid.1", "status": "read", "recipient_id": "5491100000000"}]
                }
            }]
        }]
    });

    let (status, body) = send(&app.router, post_json("/webhooks/whatsapp", &payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"EVENT_RECEIVED");

    let events = app.store.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "whatsapp");
    assert!(events[0].processed);
}

fn whatsapp_status(wamid: &str, status: &str) -> Value {
    json!({
        "field": "messages",
        "value": {
            "statuses": [{"id": wamid, "status": status, "recipient_id": "5491100000000"}]
        }
    })
}

fn whatsapp_body(changes: Vec<Value>) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{ "id": "102290129340398", "changes": changes }]
    })
}

#[tokio::test]
async fn test_whatsapp_dedupe_keeps_distinct_messages() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |c| c.duplicate_policy = DuplicatePolicy::Dedupe);

    // Same business account, different messages
    for wamid in ["wamid.1", "wamid.2"] {
        let body = whatsapp_body(vec![whatsapp_status(wamid, "delivered")]);
        let (status, _) = send(&app.router, post_json("/webhooks/whatsapp", &body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let events = app.store.events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.processed));
    let keys: Vec<_> = events.iter().map(|e| e.data_id.as_deref()).collect();
    assert_eq!(keys, vec![Some("wamid.1:delivered"), Some("wamid.2:delivered")]);

    // A real redelivery is still collapsed
    let body = whatsapp_body(vec![whatsapp_status("wamid.1", "delivered")]);
    send(&app.router, post_json("/webhooks/whatsapp", &body)).await;
    assert_eq!(app.store.events().await.len(), 2);
}

#[tokio::test]
async fn test_whatsapp_redelivery_after_partial_store_is_absorbed() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |c| c.duplicate_policy = DuplicatePolicy::Dedupe);

    // An earlier delivery stored its first change and then failed
    let first = whatsapp_status("wamid.1", "sent");
    app.store
        .create_event(
            NewWebhookEvent::new("whatsapp", first.clone()).data_id("wamid.1:sent"),
            DuplicatePolicy::Dedupe,
        )
        .await
        .unwrap();

    let body = whatsapp_body(vec![first, whatsapp_status("wamid.1", "delivered")]);
    let (status, _) = send(&app.router, post_json("/webhooks/whatsapp", &body)).await;

    assert_eq!(status, StatusCode::OK);
    let events = app.store.events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.processed), "queued change is picked up too");
}

#[tokio::test]
async fn test_whatsapp_rejects_other_objects_and_malformed_bodies() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let (status, _) = send(
        &app.router,
        post_json("/webhooks/whatsapp", &json!({ "object": "page", "entry": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let malformed = Request::builder()
        .method("POST")
        .uri("/webhooks/whatsapp")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app.router, malformed).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    assert!(app.store.events().await.is_empty());
}

// =============================================================================
// Mercado Pago webhooks
// =============================================================================

fn sign(data_id: &str, request_id: &str, ts: &str) -> String {
    let manifest = format!("id:{};request-id:{};ts:{};", data_id, request_id, ts);
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(manifest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn test_mercadopago_payment_confirms_appointment() {
    let mut server = mockito::Server::new_async().await;
    let app = app_with_secret(&server, Some(WEBHOOK_SECRET), |_| {});

    let user = app.store.add_user("Ana", None).await;
    let doctor = app.store.add_doctor("Dr. Grey").await;
    let appointment = app
        .store
        .add_appointment(user, doctor, AppointmentStatus::Pending, OffsetDateTime::now_utc())
        .await;
    app.store
        .add_payment(appointment.id, PaymentStatus::Pending, 15_000.0)
        .await;

    server
        .mock("GET", "/v1/payments/123456")
        .with_status(200)
        .with_body(
            json!({
                "id": 123456,
                "status": "approved",
                "external_reference": appointment.id.to_string(),
                "transaction_amount": 15000.0,
                "currency_id": "ARS",
                "payer": {"email": "ana@example.com"}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let payload = json!({
        "action": "payment.updated",
        "type": "payment",
        "data": {"id": "123456"}
    });
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/mercadopago?data.id=123456&type=payment")
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            "x-signature",
            format!("ts=1704908010,v1={}", sign("123456", "req-1", "1704908010")),
        )
        .header("x-request-id", "req-1")
        .body(Body::from(payload.to_string()))
        .unwrap();

    let (status, body) = send_json(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "processed");
    assert!(body["event_id"].is_string());
    assert_eq!(
        app.store.appointment(appointment.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
    assert_eq!(
        app.store.payment_for(appointment.id).await.unwrap().status,
        PaymentStatus::Approved
    );
}

#[tokio::test]
async fn test_mercadopago_bad_signature_is_401_and_not_stored() {
    let server = mockito::Server::new_async().await;
    let app = app_with_secret(&server, Some(WEBHOOK_SECRET), |_| {});

    let payload = json!({ "type": "payment", "data": {"id": "123456"} });
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/mercadopago")
        .header("x-signature", "ts=1704908010,v1=deadbeef")
        .header("x-request-id", "req-1")
        .body(Body::from(payload.to_string()))
        .unwrap();

    let (status, _) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.store.events().await.is_empty());
}

#[tokio::test]
async fn test_mercadopago_malformed_body_is_400() {
    let server = mockito::Server::new_async().await;
    let app = app_with(&server, |_| {});

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/mercadopago")
        .body(Body::from(r#"{"data": {}}"#))
        .unwrap();
    let (status, _) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.store.events().await.is_empty());
}

#[tokio::test]
async fn test_mercadopago_processing_failure_still_acknowledged() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/v1/payments/777")
        .with_status(503)
        .create_async()
        .await;
    let app = app_with(&server, |_| {});

    let payload = json!({ "type": "payment", "data": {"id": 777} });
    let (status, body) = send_json(&app.router, post_json("/webhooks/mercadopago", &payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "failed_will_retry");

    let events = app.store.events().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].processed);
    assert!(events[0].failed_at.is_none());
}
