use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    entities::payment,
    errors::ServiceError,
    handlers::AppState,
    services::{
        payments::{GatewayPaymentCreated, ProofSubmission},
        reconciliation::VerifyResult,
    },
    ApiResponse,
};

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "amount": "160.80"
}))]
pub struct CreateSourceBody {
    /// Order to pay
    pub order_id: Uuid,
    /// Must equal the order total
    #[schema(example = "160.80")]
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct ProofOfPaymentBody {
    pub order_id: Uuid,
    /// Transfer reference printed on the customer's receipt
    #[validate(length(min = 1, max = 100))]
    pub reference_number: String,
    /// Location of the uploaded receipt image
    #[validate(url)]
    pub proof_url: Option<String>,
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/payments/source", post(create_payment_source))
        .route("/payments/proof", post(submit_proof_of_payment))
        .route("/payments/verify/:reference_id", get(verify_payment))
}

/// Start a gateway payment and get the redirect for the customer
#[utoipa::path(
    post,
    path = "/api/v1/payments/source",
    request_body = CreateSourceBody,
    responses(
        (status = 200, description = "Gateway source created", body = ApiResponse<GatewayPaymentCreated>),
        (status = 400, description = "Amount does not match the order total", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found or not payable", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_payment_source(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<CreateSourceBody>,
) -> Result<Json<ApiResponse<GatewayPaymentCreated>>, ServiceError> {
    body.validate()?;
    if body.amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "amount must be positive".to_string(),
        ));
    }

    let created = state
        .services
        .payments
        .create_gateway_payment(&identity, body.order_id, body.amount)
        .await
        .map_err(|err| match err {
            ServiceError::OrderNotPayable(msg) => ServiceError::NotFound(msg),
            other => other,
        })?;
    Ok(Json(ApiResponse::success(created)))
}

/// Submit a bank-transfer reference and receipt for admin review
#[utoipa::path(
    post,
    path = "/api/v1/payments/proof",
    request_body = ProofOfPaymentBody,
    responses(
        (status = 201, description = "Proof recorded; order awaits review", body = ApiResponse<payment::Model>),
        (status = 400, description = "Order is not awaiting payment", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn submit_proof_of_payment(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<ProofOfPaymentBody>,
) -> Result<(StatusCode, Json<ApiResponse<payment::Model>>), ServiceError> {
    body.validate()?;
    let payment = state
        .services
        .payments
        .submit_proof(
            &identity,
            ProofSubmission {
                order_id: body.order_id,
                reference_number: body.reference_number,
                proof_url: body.proof_url,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(payment))))
}

/// Poll the gateway for a payment source and apply a terminal result
#[utoipa::path(
    get,
    path = "/api/v1/payments/verify/{reference_id}",
    params(("reference_id" = String, Path, description = "Gateway source id")),
    responses(
        (status = 200, description = "Current payment and order status", body = ApiResponse<VerifyResult>),
        (status = 404, description = "Unknown reference", body = crate::errors::ErrorResponse),
        (status = 422, description = "Gateway amount differs from the payment", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(reference_id): Path<String>,
) -> Result<Json<ApiResponse<VerifyResult>>, ServiceError> {
    let result = state
        .services
        .reconciliation
        .verify(&identity, &reference_id)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}
