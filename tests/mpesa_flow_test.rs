//! End-to-end payment flows through the HTTP router, against a mocked Daraja
//! API and the in-memory transaction store.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use mpesa_stk_backend::api::{self, AppState, ServiceInfo};
use mpesa_stk_backend::database::{MemoryTransactionStore, TransactionStatus, TransactionStore};
use mpesa_stk_backend::payments::providers::mpesa::{signer, MpesaConfig};
use mpesa_stk_backend::payments::providers::MpesaProvider;
use mpesa_stk_backend::payments::{
    CallbackGuard, CallbackReceiver, PaymentProvider, PaymentService, StatusReconciler,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHECKOUT_ID: &str = "ws_CO_191220191020363925";
const MERCHANT_ID: &str = "29115-34620561-1";

struct Harness {
    app: Router,
    store: Arc<MemoryTransactionStore>,
    server: MockServer,
}

async fn harness(secret: Option<&str>, token_exchanges: u64) -> Harness {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "tok", "expires_in": "3599"})),
        )
        .expect(token_exchanges)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MerchantRequestID": MERCHANT_ID,
            "CheckoutRequestID": CHECKOUT_ID,
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .mount(&server)
        .await;

    let config = MpesaConfig {
        base_url: server.uri(),
        consumer_key: "consumer".to_string(),
        consumer_secret: "secret".to_string(),
        shortcode: "174379".to_string(),
        passkey: "passkey".to_string(),
        callback_url: "https://example.org/api/payments/mpesa/callback".to_string(),
        callback_secret: secret.map(str::to_string),
        timeout_secs: 5,
        ..MpesaConfig::default()
    };

    let store = Arc::new(MemoryTransactionStore::new());
    let provider: Arc<dyn PaymentProvider> = Arc::new(MpesaProvider::new(config).unwrap());
    let reconciler = StatusReconciler::new(provider.clone(), store.clone())
        .with_retry_delay(Duration::from_millis(10));

    let state = AppState {
        payments: Arc::new(PaymentService::new(provider, store.clone())),
        reconciler: Arc::new(reconciler),
        callbacks: Arc::new(
            CallbackReceiver::new(store.clone()).with_guard(CallbackGuard::new(secret, Vec::new())),
        ),
        info: Arc::new(ServiceInfo {
            environment: "development".to_string(),
            mpesa_environment: "sandbox".to_string(),
            mpesa_configured: true,
        }),
    };

    Harness {
        app: api::router(state),
        store,
        server,
    }
}

async fn post(app: &Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn initiate(app: &Router) -> (StatusCode, Value) {
    post(
        app,
        "/api/payments/mpesa/initiate",
        json!({"phone": "0712345678", "amount": 500, "purpose": "Tithe", "name": "Jane"})
            .to_string(),
    )
    .await
}

fn success_callback() -> String {
    json!({"Body": {"stkCallback": {
        "MerchantRequestID": MERCHANT_ID,
        "CheckoutRequestID": CHECKOUT_ID,
        "ResultCode": 0,
        "ResultDesc": "The service request is processed successfully.",
        "CallbackMetadata": {"Item": [
            {"Name": "Amount", "Value": 500},
            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
            {"Name": "TransactionDate", "Value": 20191219102115u64},
            {"Name": "PhoneNumber", "Value": 254712345678u64}
        ]}
    }}})
    .to_string()
}

fn cancelled_callback() -> String {
    json!({"Body": {"stkCallback": {
        "MerchantRequestID": MERCHANT_ID,
        "CheckoutRequestID": CHECKOUT_ID,
        "ResultCode": 1032,
        "ResultDesc": "Request cancelled by user"
    }}})
    .to_string()
}

fn assert_ack(status: StatusCode, body: &Value) {
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, &json!({"ResultCode": 0, "ResultDesc": "Accepted"}));
}

#[tokio::test]
async fn initiation_records_pending_with_normalized_phone() {
    let h = harness(None, 1).await;

    let (status, body) = initiate(&h.app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["checkout_request_id"], CHECKOUT_ID);
    assert_eq!(body["merchant_request_id"], MERCHANT_ID);

    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Pending);
    assert_eq!(record.phone.as_deref(), Some("254712345678"));
    assert_eq!(record.transaction_id.to_string(), body["transaction_id"].as_str().unwrap());

    let requests = h.server.received_requests().await.unwrap();
    let push = requests
        .iter()
        .find(|r| r.url.path() == "/mpesa/stkpush/v1/processrequest")
        .unwrap();
    let payload: Value = serde_json::from_slice(&push.body).unwrap();
    assert_eq!(payload["PartyA"], "254712345678");
    assert_eq!(payload["PhoneNumber"], "254712345678");
    let timestamp = payload["Timestamp"].as_str().unwrap();
    assert_eq!(
        payload["Password"].as_str().unwrap(),
        signer::password("174379", "passkey", timestamp)
    );
}

#[tokio::test]
async fn success_callback_completes_payment() {
    let h = harness(None, 1).await;
    initiate(&h.app).await;

    let (status, body) = post(&h.app, "/api/payments/mpesa/callback", success_callback()).await;
    assert_ack(status, &body);

    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Completed);
    assert_eq!(record.receipt_number.as_deref(), Some("NLJ7RT61SV"));
    assert_eq!(record.amount.as_deref(), Some("500"));

    let (status, body) = post(
        &h.app,
        "/api/payments/mpesa/status",
        json!({"checkout_request_id": CHECKOUT_ID}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["receipt_number"], "NLJ7RT61SV");
    assert_eq!(body["source"], "store");
}

#[tokio::test]
async fn cancelled_callback_fails_payment_without_receipt() {
    let h = harness(None, 1).await;
    initiate(&h.app).await;

    let (status, body) = post(&h.app, "/api/payments/mpesa/callback", cancelled_callback()).await;
    assert_ack(status, &body);

    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Failed);
    assert_eq!(record.result_code, Some(1032));
    assert_eq!(record.result_desc.as_deref(), Some("Request cancelled by user"));
    assert_eq!(record.receipt_number, None);
}

#[tokio::test]
async fn two_initiations_share_one_token_exchange() {
    let h = harness(None, 1).await;

    for _ in 0..2 {
        let (status, _) = initiate(&h.app).await;
        assert_eq!(status, StatusCode::OK);
    }
    // The token mock's expect(1) is verified when the server drops.
}

#[tokio::test]
async fn concurrent_duplicate_callbacks_apply_once() {
    let h = harness(None, 1).await;
    initiate(&h.app).await;

    let body = success_callback();
    let deliveries: Vec<_> = (0..8)
        .map(|_| {
            let app = h.app.clone();
            let body = body.clone();
            tokio::spawn(async move { post(&app, "/api/payments/mpesa/callback", body).await })
        })
        .collect();

    for delivery in deliveries {
        let (status, body) = delivery.await.unwrap();
        assert_ack(status, &body);
    }

    let outcomes: Vec<String> = h
        .store
        .callback_events()
        .await
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes.iter().filter(|o| *o == "applied").count(), 1);
    assert_eq!(outcomes.iter().filter(|o| *o == "duplicate").count(), 7);

    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn callback_and_status_poll_race_to_single_outcome() {
    let h = harness(None, 1).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpushquery/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResponseCode": "0",
            "ResponseDescription": "The service request has been accepted successsfully",
            "MerchantRequestID": MERCHANT_ID,
            "CheckoutRequestID": CHECKOUT_ID,
            "ResultCode": "0",
            "ResultDesc": "The service request is processed successfully."
        })))
        .mount(&h.server)
        .await;

    initiate(&h.app).await;

    let status_body = json!({"checkout_request_id": CHECKOUT_ID}).to_string();
    let ((cb_status, cb_body), (poll_status, poll_body)) = tokio::join!(
        post(&h.app, "/api/payments/mpesa/callback", success_callback()),
        post(&h.app, "/api/payments/mpesa/status", status_body),
    );

    assert_ack(cb_status, &cb_body);
    assert_eq!(poll_status, StatusCode::OK);
    assert_eq!(poll_body["status"], "completed");

    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Completed);
    // Whichever path won, the callback's receipt ends up on the record.
    assert_eq!(record.receipt_number.as_deref(), Some("NLJ7RT61SV"));
}

#[tokio::test]
async fn status_poll_while_processing_stays_pending() {
    let h = harness(None, 1).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpushquery/v1/query"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "requestId": "r-1",
            "errorCode": "500.001.1001",
            "errorMessage": "The transaction is being processed"
        })))
        .mount(&h.server)
        .await;

    initiate(&h.app).await;

    let (status, body) = post(
        &h.app,
        "/api/payments/mpesa/status",
        json!({"checkout_request_id": CHECKOUT_ID}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["source"], "provider");
}

#[tokio::test]
async fn malformed_callback_is_acknowledged() {
    let h = harness(None, 0).await;

    let (status, body) = post(&h.app, "/api/payments/mpesa/callback", "{\"Body\": oops").await;
    assert_ack(status, &body);

    assert!(h.store.is_empty().await);
    assert_eq!(h.store.callback_events().await[0].outcome, "parse_error");
}

#[tokio::test]
async fn callback_secret_is_enforced() {
    let h = harness(Some("hook-7f3a"), 1).await;
    initiate(&h.app).await;

    for uri in [
        "/api/payments/mpesa/callback",
        "/api/payments/mpesa/callback/wrong",
    ] {
        let (status, body) = post(&h.app, uri, success_callback()).await;
        assert_ack(status, &body);
    }
    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Pending);

    let (status, body) = post(
        &h.app,
        "/api/payments/mpesa/callback/hook-7f3a",
        success_callback(),
    )
    .await;
    assert_ack(status, &body);
    let record = h.store.find_by_checkout_id(CHECKOUT_ID).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_provider() {
    let h = harness(None, 0).await;

    let (status, body) = post(
        &h.app,
        "/api/payments/mpesa/initiate",
        json!({"phone": "254312345678", "amount": 500, "name": "Jane"}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = post(
        &h.app,
        "/api/payments/mpesa/initiate",
        json!({"phone": "0712345678", "amount": 0, "name": "Jane"}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let h = harness(None, 0).await;
    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}
