//! M-Pesa (Daraja) STK push provider
//!
//! Sends the "Lipa na M-Pesa Online" push that prompts the payer for their PIN,
//! and queries the provider for the outcome of an earlier push.

pub mod config;
pub mod phone;
pub mod signer;
pub mod token;
pub mod wire;

pub use config::{MpesaConfig, MpesaEnvironment};
pub use token::{AccessToken, TokenCache};

use crate::error::{AppError, AppResult, ValidationError};
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{
    CorrelationPair, PaymentRequest, PaymentResponse, ProviderState, ProviderStatus,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;
use wire::{
    ErrorResponse, StkPushPayload, StkPushResponse, StkQueryPayload, StkQueryResponse,
    STILL_PROCESSING_ERROR_CODE, STILL_PROCESSING_RESULT_CODE, STK_PUSH_PATH, STK_QUERY_PATH,
    TRANSACTION_TYPE,
};

#[cfg(feature = "cache")]
use crate::cache::RedisCache;

const PROVIDER: &str = "M-Pesa";

/// M-Pesa payment provider
pub struct MpesaProvider {
    config: MpesaConfig,
    client: Client,
    tokens: TokenCache,
}

impl MpesaProvider {
    pub fn new(config: MpesaConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        let tokens = TokenCache::new(
            client.clone(),
            &config.base_url,
            config.consumer_key.clone(),
            config.consumer_secret.clone(),
            std::time::Duration::from_secs(config.token_expiry_margin_secs),
            config.timeout(),
        );

        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    /// Create provider from environment variables
    pub fn from_env() -> AppResult<Self> {
        Self::new(MpesaConfig::from_env()?)
    }

    /// Share access tokens with other replicas through Redis
    #[cfg(feature = "cache")]
    pub fn with_shared_tokens(mut self, cache: RedisCache) -> Self {
        self.tokens = self.tokens.with_shared(cache);
        self
    }

    pub fn config(&self) -> &MpesaConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    fn build_push_payload(&self, request: &PaymentRequest, phone: &str) -> StkPushPayload {
        let signed = signer::sign(&self.config.shortcode, &self.config.passkey);
        StkPushPayload {
            business_short_code: self.config.shortcode.clone(),
            password: signed.password,
            timestamp: signed.timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount: request.amount,
            party_a: phone.to_string(),
            party_b: self.config.shortcode.clone(),
            phone_number: phone.to_string(),
            call_back_url: self.config.callback_url.clone(),
            account_reference: wire::account_reference(
                &request.purpose,
                &self.config.account_reference,
            ),
            transaction_desc: wire::transaction_desc(&request.purpose),
        }
    }

    /// POST a bearer-authenticated JSON body. Never retries.
    async fn post_json<B, R>(&self, endpoint: &str, body: &B) -> AppResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let token = self.tokens.get_token().await?;
        let url = self.config.endpoint(endpoint);

        let response = timeout(
            self.config.timeout(),
            self.client
                .post(&url)
                .bearer_auth(&token.value)
                .json(body)
                .send(),
        )
        .await
        .map_err(|_| AppError::timeout(PROVIDER, self.config.timeout_secs))?
        .map_err(|e| {
            if e.is_timeout() {
                AppError::timeout(PROVIDER, self.config.timeout_secs)
            } else {
                AppError::provider(PROVIDER, format!("request failed: {}", e), None, true)
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&token).await;
            return Err(AppError::authentication(
                PROVIDER,
                "access token rejected by provider",
            ));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(endpoint, retry_after = ?retry_after, "M-Pesa rate limit hit");
            return Err(AppError::rate_limit(PROVIDER, retry_after));
        }

        if !status.is_success() {
            let body: ErrorResponse = serde_json::from_str(&text).unwrap_or_default();
            let message = body
                .error_message
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(AppError::provider(
                PROVIDER,
                message,
                body.error_code,
                status.is_server_error(),
            ));
        }

        serde_json::from_str(&text).map_err(|e| {
            error!("Failed to parse M-Pesa response from {}: {}", endpoint, e);
            AppError::provider(
                PROVIDER,
                format!("Invalid response format: {}", e),
                None,
                false,
            )
        })
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn initiate_payment(&self, request: &PaymentRequest) -> AppResult<PaymentResponse> {
        self.config.validate()?;
        request.validate()?;
        let phone = phone::normalize(&request.phone)?;

        info!(
            phone = %phone,
            amount = request.amount,
            purpose = %request.purpose,
            "Initiating M-Pesa STK push"
        );

        let payload = self.build_push_payload(request, &phone);
        let response: StkPushResponse = self
            .post_json(STK_PUSH_PATH, &payload)
            .await
            .map_err(|e| e.with_context("stk push"))?;

        if response.response_code != "0" {
            warn!(
                response_code = %response.response_code,
                "M-Pesa rejected STK push: {}", response.response_description
            );
            return Err(AppError::provider(
                PROVIDER,
                response.response_description,
                Some(response.response_code),
                false,
            ));
        }

        if response.checkout_request_id.is_empty() {
            return Err(AppError::provider(
                PROVIDER,
                "accepted push carried no CheckoutRequestID",
                None,
                false,
            ));
        }

        let transaction_id = Uuid::new_v4();
        info!(
            transaction_id = %transaction_id,
            merchant_request_id = %response.merchant_request_id,
            checkout_request_id = %response.checkout_request_id,
            "M-Pesa STK push accepted"
        );

        Ok(PaymentResponse {
            transaction_id,
            correlation: CorrelationPair {
                merchant_request_id: response.merchant_request_id,
                checkout_request_id: response.checkout_request_id,
            },
            phone,
            customer_message: response.customer_message,
        })
    }

    async fn query_status(&self, checkout_request_id: &str) -> AppResult<ProviderStatus> {
        self.config.validate()?;
        let checkout_request_id = checkout_request_id.trim();
        if checkout_request_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "checkout_request_id",
            }
            .into());
        }

        // Signed for the current moment, not the moment of initiation.
        let signed = signer::sign(&self.config.shortcode, &self.config.passkey);
        let payload = StkQueryPayload {
            business_short_code: self.config.shortcode.clone(),
            password: signed.password,
            timestamp: signed.timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let response: StkQueryResponse = match self.post_json(STK_QUERY_PATH, &payload).await {
            Ok(response) => response,
            Err(e) if e.provider_code() == Some(STILL_PROCESSING_ERROR_CODE) => {
                info!(checkout_request_id, "M-Pesa transaction still processing");
                return Ok(ProviderStatus::pending(
                    checkout_request_id,
                    "The transaction is being processed",
                ));
            }
            Err(e) => return Err(e.with_context("stk query")),
        };

        if response.response_code != "0" {
            return Err(AppError::provider(
                PROVIDER,
                response.response_description,
                Some(response.response_code),
                false,
            ));
        }

        let description = response
            .result_desc
            .clone()
            .unwrap_or_else(|| response.response_description.clone());

        let state = match response.result_code {
            None | Some(STILL_PROCESSING_RESULT_CODE) => ProviderState::Pending,
            Some(0) => ProviderState::Completed,
            Some(_) => ProviderState::Failed,
        };

        info!(
            checkout_request_id,
            result_code = ?response.result_code,
            state = ?state,
            "M-Pesa status query answered"
        );

        Ok(ProviderStatus {
            checkout_request_id: checkout_request_id.to_string(),
            merchant_request_id: response.merchant_request_id,
            state,
            result_code: response.result_code,
            description,
        })
    }
}
