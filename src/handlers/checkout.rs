use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::post,
    Router,
};

use crate::{
    auth::Identity,
    errors::ServiceError,
    handlers::AppState,
    services::{
        checkout::{CheckoutRequest, CheckoutResult},
        pricing::PriceBreakdown,
    },
    ApiResponse,
};

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(create_checkout))
        .route("/checkout/quote", post(quote_checkout))
}

/// Convert a cart into a `pending_payment` order with stock reserved
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<CheckoutResult>),
        (status = 400, description = "Invalid cart, coupon, shipping method or insufficient stock", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing identity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown medicine or shipping method", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResult>>), ServiceError> {
    let result = state.services.checkout.checkout(&identity, &request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(result))))
}

/// Price a cart without creating anything
#[utoipa::path(
    post,
    path = "/api/v1/checkout/quote",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Price breakdown", body = ApiResponse<PriceBreakdown>),
        (status = 400, description = "Invalid cart, coupon or shipping method", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown medicine or shipping method", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn quote_checkout(
    State(state): State<AppState>,
    _identity: Identity,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<ApiResponse<PriceBreakdown>>, ServiceError> {
    let breakdown = state.services.checkout.quote(&request).await?;
    Ok(Json(ApiResponse::success(breakdown)))
}
