mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use commerce_backend::channels::Channel;
use commerce_backend::routes;
use commerce_backend::AppState;

use common::{
    harness, harness_with_llm, sign, FailingLlm, PLATFORM_SECRET, SMS_SECRET, WHATSAPP_SECRET,
};

const TENANT: &str = "6b8ff75a-42a3-4a70-a7a9-8a4f2a1f9d01";
const STORE_PHONE: &str = "+15559998888";
const WA_STORE_PHONE: &str = "+15557770000";
const CUSTOMER: &str = "+15551230000";

fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/webhook/sms", post(routes::webhook::handle_sms))
        .route(
            "/api/webhook/whatsapp",
            get(routes::webhook::verify_whatsapp).post(routes::webhook::handle_whatsapp),
        )
        .route(
            "/api/webhook/platform",
            post(routes::webhook::handle_platform),
        )
        .route(
            "/api/integration/conversations",
            get(routes::conversations::list_conversations),
        )
        .route(
            "/api/integration/conversations/:id/messages",
            get(routes::conversations::get_conversation_messages),
        )
        .route(
            "/api/integration/messages",
            post(routes::conversations::send_message),
        )
        .with_state(state)
}

fn tenant() -> Uuid {
    TENANT.parse().expect("tenant uuid")
}

fn sms_inbound_body(sid: &str, body: &str) -> String {
    format!(
        "MessageSid={}&From={}&To={}&Body={}",
        sid,
        CUSTOMER.replace('+', "%2B"),
        STORE_PHONE.replace('+', "%2B"),
        body.replace(' ', "+"),
    )
}

fn signed_sms_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/webhook/sms")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-twilio-signature", sign(body.as_bytes(), SMS_SECRET))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn unsigned_sms_webhook_is_rejected_before_any_state_mutation() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "do you have candles");
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhook/sms")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(harness.store.conversations().is_empty());
    assert!(harness.store.messages().is_empty());
}

#[tokio::test]
async fn inbound_sms_creates_a_conversation_and_replies_in_kind() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "do you have candles");
    let response = app.oneshot(signed_sms_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_string(response).await;
    assert!(text.contains("<Response></Response>"));

    let conversations = harness.store.conversations();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].status, "active");
    assert_eq!(conversations[0].customer_phone, CUSTOMER);
    assert!(conversations[0].last_message_at.is_some());

    let messages = harness.store.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].direction, "inbound");
    assert_eq!(messages[0].channel_message_id.as_deref(), Some("SM1"));
    assert_eq!(messages[1].direction, "outbound");
    assert_eq!(messages[1].content, "Happy to help!");
    assert_eq!(messages[1].status, "sent");
    assert_eq!(messages[1].channel_message_id.as_deref(), Some("SM-test-0"));

    let sent = harness.sms_provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, CUSTOMER);
    assert_eq!(sent[0].from, STORE_PHONE);
}

#[tokio::test]
async fn replayed_inbound_webhook_is_idempotent() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "hello");
    let first = app.clone().oneshot(signed_sms_request(&body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = app.oneshot(signed_sms_request(&body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let messages = harness.store.messages();
    let inbound_count = messages.iter().filter(|m| m.direction == "inbound").count();
    assert_eq!(inbound_count, 1);
    // The duplicate delivery must not trigger a second reply either.
    assert_eq!(harness.sms_provider.sent().len(), 1);
}

#[tokio::test]
async fn status_callbacks_advance_but_never_regress() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "hello");
    app.clone()
        .oneshot(signed_sms_request(&body))
        .await
        .unwrap();

    let callback = "MessageSid=SM-test-0&MessageStatus=delivered";
    let response = app
        .clone()
        .oneshot(signed_sms_request(callback))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK");

    let outbound = harness
        .store
        .messages()
        .into_iter()
        .find(|m| m.direction == "outbound")
        .expect("outbound message");
    assert_eq!(outbound.status, "delivered");
    assert!(outbound.delivered_at.is_some());

    // An out-of-order `sent` replay must not regress the status.
    let stale = "MessageSid=SM-test-0&MessageStatus=sent";
    app.clone()
        .oneshot(signed_sms_request(stale))
        .await
        .unwrap();
    let outbound = harness
        .store
        .messages()
        .into_iter()
        .find(|m| m.direction == "outbound")
        .expect("outbound message");
    assert_eq!(outbound.status, "delivered");

    // A callback for a message we never sent is acknowledged, not an error.
    let unknown = "MessageSid=SM-unknown&MessageStatus=delivered";
    let response = app.oneshot(signed_sms_request(unknown)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn model_failure_still_produces_a_reply() {
    let harness = harness_with_llm(std::sync::Arc::new(FailingLlm));
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "do you have candles");
    let response = app.oneshot(signed_sms_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let outbound = harness
        .store
        .messages()
        .into_iter()
        .find(|m| m.direction == "outbound")
        .expect("fallback outbound message");
    assert!(!outbound.content.is_empty());
    assert_eq!(harness.sms_provider.sent().len(), 1);
}

#[tokio::test]
async fn failed_send_is_recorded_without_losing_the_reply_text() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    // Both the first attempt and the single retry fail.
    harness.sms_provider.fail_next(2);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "hello");
    let response = app.oneshot(signed_sms_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let outbound = harness
        .store
        .messages()
        .into_iter()
        .find(|m| m.direction == "outbound")
        .expect("outbound message");
    assert_eq!(outbound.status, "failed");
    assert_eq!(outbound.content, "Happy to help!");
    assert!(outbound.failure_reason.is_some());
    assert!(outbound.failed_at.is_some());
}

#[tokio::test]
async fn whatsapp_inbound_flows_through_the_same_pipeline() {
    let harness = harness();
    harness
        .store
        .add_number(WA_STORE_PHONE, tenant(), Channel::WhatsApp);
    let app = app(harness.state.clone());

    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "1",
            "changes": [{
                "field": "messages",
                "value": {
                    "metadata": { "display_phone_number": WA_STORE_PHONE.trim_start_matches('+') },
                    "messages": [{
                        "id": "wamid.abc",
                        "from": CUSTOMER.trim_start_matches('+'),
                        "timestamp": "1738000000",
                        "type": "text",
                        "text": { "body": "hi there" }
                    }]
                }
            }]
        }]
    })
    .to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/api/webhook/whatsapp")
        .header("content-type", "application/json")
        .header(
            "x-hub-signature-256",
            format!("sha256={}", sign(payload.as_bytes(), WHATSAPP_SECRET)),
        )
        .body(Body::from(payload))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conversations = harness.store.conversations();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].store_phone, WA_STORE_PHONE);
    assert_eq!(harness.whatsapp_provider.sent().len(), 1);
    assert!(harness.sms_provider.sent().is_empty());
}

#[tokio::test]
async fn whatsapp_subscription_handshake_echoes_the_challenge() {
    let harness = harness();
    let app = app(harness.state.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/api/webhook/whatsapp?hub.mode=subscribe&hub.verify_token=wa_verify_test&hub.challenge=12345")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "12345");

    let bad = Request::builder()
        .method("GET")
        .uri("/api/webhook/whatsapp?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn platform_webhook_pauses_automation_for_the_conversation() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "I want to buy the candle");
    app.clone()
        .oneshot(signed_sms_request(&body))
        .await
        .unwrap();
    assert_eq!(harness.sms_provider.sent().len(), 1);

    let event = json!({
        "event": "order_created",
        "tenant_id": TENANT,
        "customer_phone": CUSTOMER,
        "store_phone": STORE_PHONE,
    })
    .to_string();

    let unauthorized = Request::builder()
        .method("POST")
        .uri("/api/webhook/platform")
        .header("content-type", "application/json")
        .header("x-platform-signature", sign(event.as_bytes(), "wrong_secret"))
        .body(Body::from(event.clone()))
        .unwrap();
    let response = app.clone().oneshot(unauthorized).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/api/webhook/platform")
        .header("content-type", "application/json")
        .header(
            "x-platform-signature",
            sign(event.as_bytes(), PLATFORM_SECRET),
        )
        .body(Body::from(event))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conversations = harness.store.conversations();
    assert_eq!(conversations[0].status, "paused");

    // A paused conversation records inbound traffic but stays quiet.
    let body = sms_inbound_body("SM2", "thanks");
    app.oneshot(signed_sms_request(&body)).await.unwrap();
    let messages = harness.store.messages();
    assert_eq!(
        messages.iter().filter(|m| m.direction == "inbound").count(),
        2
    );
    assert_eq!(harness.sms_provider.sent().len(), 1);
}

#[tokio::test]
async fn integration_api_lists_and_sends() {
    let harness = harness();
    harness.store.add_number(STORE_PHONE, tenant(), Channel::Sms);
    let app = app(harness.state.clone());

    let body = sms_inbound_body("SM1", "hello");
    app.clone()
        .oneshot(signed_sms_request(&body))
        .await
        .unwrap();
    let conversation_id = harness.store.conversations()[0].id;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/integration/conversations?tenant_id={}", TENANT))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json");
    assert_eq!(listed.as_array().map(|a| a.len()), Some(1));

    let request = Request::builder()
        .method("GET")
        .uri(format!(
            "/api/integration/conversations/{}/messages",
            conversation_id
        ))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json");
    assert_eq!(
        detail["messages"].as_array().map(|a| a.len()),
        Some(2)
    );

    let send = json!({ "conversation_id": conversation_id, "text": "An operator will call you." })
        .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/api/integration/messages")
        .header("content-type", "application/json")
        .body(Body::from(send))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.sms_provider.sent().len(), 2);
    let outbound_count = harness
        .store
        .messages()
        .iter()
        .filter(|m| m.direction == "outbound")
        .count();
    assert_eq!(outbound_count, 2);
}
