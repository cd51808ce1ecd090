//! M-Pesa payment endpoints
//!
//! `initiate` and `status` serve the donation form. `callback` is called by the
//! provider and answers 200 with the standard ack no matter what it receives.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use super::AppState;
use crate::database::TransactionStatus;
use crate::error::AppResult;
use crate::payments::callback::{CallbackAck, CallbackDelivery};
use crate::payments::reconciler::StatusSource;
use crate::payments::types::PaymentRequest;

const DEFAULT_PURPOSE: &str = "Donation";

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentBody {
    pub phone: String,
    pub amount: i64,
    #[serde(default)]
    pub purpose: Option<String>,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<InitiatePaymentBody> for PaymentRequest {
    fn from(body: InitiatePaymentBody) -> Self {
        let purpose = body
            .purpose
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PURPOSE.to_string());
        PaymentRequest {
            phone: body.phone,
            amount: body.amount,
            purpose,
            payer_name: body.name,
            payer_email: body.email,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiatePaymentResponse {
    pub success: bool,
    pub message: String,
    pub transaction_id: Uuid,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub customer_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQueryBody {
    pub checkout_request_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusQueryResponse {
    pub success: bool,
    pub checkout_request_id: String,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_number: Option<String>,
    pub source: StatusSource,
}

pub async fn initiate(
    State(state): State<AppState>,
    Json(body): Json<InitiatePaymentBody>,
) -> AppResult<Json<InitiatePaymentResponse>> {
    let response = state.payments.initiate(body.into()).await?;

    Ok(Json(InitiatePaymentResponse {
        success: true,
        message: "Payment request sent. Check your phone and enter your M-Pesa PIN.".to_string(),
        transaction_id: response.transaction_id,
        merchant_request_id: response.correlation.merchant_request_id,
        checkout_request_id: response.correlation.checkout_request_id,
        customer_message: response.customer_message,
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Json(body): Json<StatusQueryBody>,
) -> AppResult<Json<StatusQueryResponse>> {
    let report = state.reconciler.query(&body.checkout_request_id).await?;

    Ok(Json(StatusQueryResponse {
        success: true,
        checkout_request_id: report.checkout_request_id,
        status: report.status,
        result_code: report.result_code,
        result_desc: report.result_desc,
        receipt_number: report.receipt_number,
        source: report.source,
    }))
}

/// First `X-Forwarded-For` hop, else the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| peer.map(|addr| addr.ip()))
}

async fn deliver(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    path_secret: Option<&str>,
    body: &[u8],
) -> Json<CallbackAck> {
    let delivery = CallbackDelivery {
        body,
        path_secret,
        source: client_ip(headers, peer.map(|ConnectInfo(addr)| addr)),
    };
    Json(state.callbacks.receive(delivery).await)
}

pub async fn callback(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<CallbackAck> {
    deliver(&state, &headers, peer, None, &body).await
}

pub async fn callback_with_secret(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<CallbackAck> {
    deliver(&state, &headers, peer, Some(&secret), &body).await
}
