use axum::{response::Json, routing::get, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Pharmacy Checkout API",
        version = "0.1.0",
        description = r#"
Checkout and payment reconciliation for an online pharmacy.

## Identity

Requests are authenticated upstream. Every call carries the verified caller in
two headers:

```
x-user-id: <uuid>
x-user-role: customer | admin
```

## Errors

Failures use one body shape and a stable `code` the client can branch on:

```json
{
  "error": "Bad Request",
  "code": "coupon_expired",
  "message": "Coupon expired: SAVE10",
  "request_id": "req-abc123",
  "timestamp": "2026-10-17T00:00:00Z"
}
```
"#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Pricing and order creation"),
        (name = "Orders", description = "Order status and cancellation"),
        (name = "Payments", description = "Gateway and manual payments"),
        (name = "Admin", description = "Payment review and reconciliation")
    ),
    paths(
        crate::handlers::checkout::create_checkout,
        crate::handlers::checkout::quote_checkout,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::payments::create_payment_source,
        crate::handlers::payments::submit_proof_of_payment,
        crate::handlers::payments::verify_payment,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::admin::approve_payment,
        crate::handlers::admin::reject_payment,
        crate::handlers::admin::update_order_status,
        crate::handlers::admin::list_reconciliation_issues,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::services::checkout::CheckoutRequest,
            crate::services::checkout::CheckoutResult,
            crate::services::checkout::ShippingAddress,
            crate::services::pricing::PriceBreakdown,
            crate::services::pricing::LineItemInput,
            crate::services::payments::GatewayPaymentCreated,
            crate::services::reconciliation::ReconcileOutcome,
            crate::services::reconciliation::VerifyResult,
            crate::services::orders::OrderDetails,
            crate::handlers::payments::CreateSourceBody,
            crate::handlers::payments::ProofOfPaymentBody,
            crate::handlers::payment_webhooks::WebhookPayload,
            crate::handlers::payment_webhooks::WebhookAck,
            crate::handlers::orders::CancelOrderBody,
            crate::handlers::admin::ReviewBody,
            crate::handlers::admin::UpdateOrderStatusBody,
        )
    )
)]
pub struct ApiDocV1;

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDocV1::openapi()) }),
    )
}
