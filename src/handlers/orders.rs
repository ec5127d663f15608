use axum::{
    extract::{Json, Path, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    entities::order,
    errors::ServiceError,
    handlers::AppState,
    services::orders::OrderDetails,
    ApiResponse,
};

#[derive(Debug, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CancelOrderBody {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
}

/// Get an order with its lines, payments, tracking and status history
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderDetails>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let details = state.services.orders.get(&identity, id).await?;
    Ok(Json(ApiResponse::success(details)))
}

/// Cancel an order that is still awaiting payment; reserved stock is released
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body(content = CancelOrderBody, description = "Optional reason"),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<order::Model>),
        (status = 400, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order changed concurrently", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelOrderBody>>,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate()?;
    let order = state
        .services
        .orders
        .cancel(&identity, id, body.reason)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}
