//! Redirect-based e-wallet gateway client.
//!
//! The gateway speaks a "sources" API: we create a source for an amount and
//! the customer authorizes it at `checkout_url`. An authorized source is
//! `chargeable` but holds no money until it is captured into a payment. The
//! gateway reports the outcome by webhook or when polled. Amounts cross the
//! REST API in minor units.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{config::GatewayConfig, errors::ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GatewaySourceStatus {
    Pending,
    Chargeable,
    /// Captured into a payment; the payment carries the outcome.
    Consumed,
    Paid,
    Failed,
    Cancelled,
    Expired,
}

impl GatewaySourceStatus {
    /// Terminal outcome as seen by reconciliation, if any. `chargeable` is
    /// not one: the funds are only authorized until captured.
    pub fn outcome(self) -> Option<GatewayOutcome> {
        match self {
            Self::Paid => Some(GatewayOutcome::Paid),
            Self::Failed | Self::Cancelled | Self::Expired => Some(GatewayOutcome::Failed),
            Self::Pending | Self::Chargeable | Self::Consumed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOutcome {
    Paid,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CreateSourceRequest {
    pub amount: Decimal,
    pub currency: String,
    pub order_id: Uuid,
    pub order_number: String,
    pub payment_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySource {
    pub source_id: String,
    pub checkout_url: String,
    pub status: GatewaySourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySourceState {
    pub source_id: String,
    pub status: GatewaySourceStatus,
    pub amount: Decimal,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_source(
        &self,
        request: &CreateSourceRequest,
    ) -> Result<GatewaySource, ServiceError>;

    async fn retrieve_source(&self, source_id: &str) -> Result<GatewaySourceState, ServiceError>;

    /// Captures a `chargeable` source into a payment. `None` while the
    /// gateway is still settling the capture.
    async fn capture_source(
        &self,
        source: &GatewaySourceState,
    ) -> Result<Option<GatewayOutcome>, ServiceError>;
}

/// Converts a 2-dp amount to minor units (centavos).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

#[derive(Serialize)]
struct SourceEnvelope<T> {
    data: T,
}

#[derive(Serialize)]
struct CreateSourceData<'a> {
    attributes: CreateSourceAttributes<'a>,
}

#[derive(Serialize)]
struct CreateSourceAttributes<'a> {
    amount: i64,
    currency: &'a str,
    #[serde(rename = "type")]
    source_type: &'a str,
    redirect: RedirectUrls<'a>,
    metadata: SourceMetadata,
}

#[derive(Serialize)]
struct RedirectUrls<'a> {
    success: &'a str,
    failed: &'a str,
}

#[derive(Serialize)]
struct SourceMetadata {
    order_id: String,
    order_number: String,
    payment_id: String,
}

#[derive(Debug, Deserialize)]
struct SourceResponse {
    data: SourceResource,
}

#[derive(Debug, Deserialize)]
struct SourceResource {
    id: String,
    attributes: SourceAttributes,
}

#[derive(Debug, Deserialize)]
struct SourceAttributes {
    amount: i64,
    currency: String,
    status: GatewaySourceStatus,
    #[serde(default)]
    redirect: Option<SourceRedirect>,
}

#[derive(Debug, Deserialize)]
struct SourceRedirect {
    checkout_url: Option<String>,
}

#[derive(Serialize)]
struct CreatePaymentData<'a> {
    attributes: CreatePaymentAttributes<'a>,
}

#[derive(Serialize)]
struct CreatePaymentAttributes<'a> {
    amount: i64,
    currency: &'a str,
    source: SourceRef<'a>,
}

#[derive(Serialize)]
struct SourceRef<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    data: PaymentResource,
}

#[derive(Debug, Deserialize)]
struct PaymentResource {
    id: String,
    attributes: PaymentAttributes,
}

#[derive(Debug, Deserialize)]
struct PaymentAttributes {
    status: CapturedStatus,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CapturedStatus {
    Pending,
    Paid,
    Failed,
}

/// HTTP client for the gateway REST API.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn read_json<T>(response: reqwest::Response) -> Result<T, ServiceError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "Gateway returned an error");
            return Err(ServiceError::ExternalServiceError(format!(
                "gateway responded with {}",
                status
            )));
        }
        Ok(response.json().await?)
    }

    async fn read_source(response: reqwest::Response) -> Result<SourceResource, ServiceError> {
        let parsed: SourceResponse = Self::read_json(response).await?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id, payment_id = %request.payment_id))]
    async fn create_source(
        &self,
        request: &CreateSourceRequest,
    ) -> Result<GatewaySource, ServiceError> {
        let body = SourceEnvelope {
            data: CreateSourceData {
                attributes: CreateSourceAttributes {
                    amount: to_minor_units(request.amount)?,
                    currency: &request.currency,
                    source_type: &self.config.source_type,
                    redirect: RedirectUrls {
                        success: &self.config.success_url,
                        failed: &self.config.failed_url,
                    },
                    metadata: SourceMetadata {
                        order_id: request.order_id.to_string(),
                        order_number: request.order_number.clone(),
                        payment_id: request.payment_id.to_string(),
                    },
                },
            },
        };

        let response = self
            .client
            .post(self.url("sources"))
            .basic_auth(&self.config.secret_key, Some(""))
            .json(&body)
            .send()
            .await?;
        let source = Self::read_source(response).await?;

        let checkout_url = source
            .attributes
            .redirect
            .and_then(|r| r.checkout_url)
            .ok_or_else(|| {
                ServiceError::ExternalServiceError("gateway source has no checkout url".into())
            })?;

        info!(source_id = %source.id, "Created gateway source");
        Ok(GatewaySource {
            source_id: source.id,
            checkout_url,
            status: source.attributes.status,
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_source(&self, source_id: &str) -> Result<GatewaySourceState, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("sources/{}", source_id)))
            .basic_auth(&self.config.secret_key, Some(""))
            .send()
            .await?;
        let source = Self::read_source(response).await?;

        Ok(GatewaySourceState {
            source_id: source.id,
            status: source.attributes.status,
            amount: from_minor_units(source.attributes.amount),
            currency: source.attributes.currency,
        })
    }

    #[instrument(skip(self, source), fields(source_id = %source.source_id))]
    async fn capture_source(
        &self,
        source: &GatewaySourceState,
    ) -> Result<Option<GatewayOutcome>, ServiceError> {
        let body = SourceEnvelope {
            data: CreatePaymentData {
                attributes: CreatePaymentAttributes {
                    amount: to_minor_units(source.amount)?,
                    currency: &source.currency,
                    source: SourceRef {
                        id: &source.source_id,
                        kind: "source",
                    },
                },
            },
        };

        let response = self
            .client
            .post(self.url("payments"))
            .basic_auth(&self.config.secret_key, Some(""))
            .json(&body)
            .send()
            .await?;
        let payment: PaymentResponse = Self::read_json(response).await?;

        info!(gateway_payment_id = %payment.data.id, status = ?payment.data.attributes.status, "Captured gateway source");
        Ok(match payment.data.attributes.status {
            CapturedStatus::Paid => Some(GatewayOutcome::Paid),
            CapturedStatus::Failed => Some(GatewayOutcome::Failed),
            CapturedStatus::Pending => None,
        })
    }
}
