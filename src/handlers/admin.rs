use axum::{
    extract::{Json, Path, Query, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    entities::{
        order::{self, OrderStatus},
        reconciliation_issue,
    },
    errors::ServiceError,
    handlers::AppState,
    services::reconciliation::ReconcileOutcome,
    ApiResponse,
};

#[derive(Debug, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct ReviewBody {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderStatusBody {
    pub status: OrderStatus,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct IssueFilter {
    /// Include issues already marked resolved
    #[serde(default)]
    pub include_resolved: bool,
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/payments/:id/approve", post(approve_payment))
        .route("/admin/payments/:id/reject", post(reject_payment))
        .route("/admin/orders/:id/status", post(update_order_status))
        .route("/admin/reconciliation-issues", get(list_reconciliation_issues))
}

/// Approve a manual proof of payment
#[utoipa::path(
    post,
    path = "/api/v1/admin/payments/{id}/approve",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, description = "Payment approved or already approved", body = ApiResponse<ReconcileOutcome>),
        (status = 400, description = "Payment already settled differently", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Admin"
)]
pub async fn approve_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ReconcileOutcome>>, ServiceError> {
    let outcome = state.services.payments.approve(&identity, id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Reject a manual proof of payment; the order returns to `pending_payment`
#[utoipa::path(
    post,
    path = "/api/v1/admin/payments/{id}/reject",
    params(("id" = Uuid, Path, description = "Payment id")),
    request_body(content = ReviewBody, description = "Optional rejection reason"),
    responses(
        (status = 200, description = "Payment rejected or already rejected", body = ApiResponse<ReconcileOutcome>),
        (status = 400, description = "Payment already settled differently", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Admin"
)]
pub async fn reject_payment(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    body: Option<Json<ReviewBody>>,
) -> Result<Json<ApiResponse<ReconcileOutcome>>, ServiceError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate()?;
    let outcome = state
        .services
        .payments
        .reject(&identity, id, body.reason)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Move an order along the fulfilment part of its lifecycle
#[utoipa::path(
    post,
    path = "/api/v1/admin/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderStatusBody,
    responses(
        (status = 200, description = "Order updated", body = ApiResponse<order::Model>),
        (status = 400, description = "Illegal transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order changed concurrently", body = crate::errors::ErrorResponse)
    ),
    tag = "Admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateOrderStatusBody>,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    body.validate()?;
    let order = state
        .services
        .orders
        .admin_update_status(&identity, id, body.status, body.reason)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Gateway signals waiting for manual reconciliation
#[utoipa::path(
    get,
    path = "/api/v1/admin/reconciliation-issues",
    params(IssueFilter),
    responses(
        (status = 200, description = "Open issues, newest first", body = ApiResponse<Vec<reconciliation_issue::Model>>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse)
    ),
    tag = "Admin"
)]
pub async fn list_reconciliation_issues(
    State(state): State<AppState>,
    identity: Identity,
    Query(filter): Query<IssueFilter>,
) -> Result<Json<ApiResponse<Vec<reconciliation_issue::Model>>>, ServiceError> {
    let issues = state
        .services
        .reconciliation
        .list_issues(&identity, filter.include_resolved)
        .await?;
    Ok(Json(ApiResponse::success(issues)))
}
