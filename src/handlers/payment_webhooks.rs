use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    entities::reconciliation_issue::IssueKind,
    errors::{ErrorCategory, ServiceError},
    handlers::AppState,
    services::{
        gateway::GatewayOutcome,
        reconciliation::{GatewayEvent, NewIssue, ReconcileOutcome},
    },
    ApiResponse,
};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Body posted by the gateway.
#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookPayload {
    /// Gateway event id, when the gateway sends one
    pub id: Option<String>,
    /// `payment.paid` or `payment.failed`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Source id returned when the payment was started
    #[serde(alias = "referenceId")]
    pub reference_id: String,
    /// Major units as a decimal, e.g. `"160.80"`. The gateway REST API uses
    /// integer minor units; webhook bodies do not.
    #[schema(example = "160.80")]
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: Option<ReconcileOutcome>,
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/payments/webhook", post(payment_webhook))
}

/// Gateway webhook. Answers 200 for anything well-formed so the gateway does
/// not retry business rejections; those are logged and queued for review.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = WebhookPayload,
    responses(
        (status = 200, description = "Webhook accepted", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 500, description = "Storage unavailable; safe to redeliver", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookAck>>, ServiceError> {
    let raw = String::from_utf8_lossy(&body).into_owned();

    if let Some(secret) = state.config.gateway.webhook_secret.as_deref() {
        let tolerance = state.config.gateway.webhook_tolerance_secs;
        if !verify_signature(&headers, &body, secret, tolerance, chrono::Utc::now().timestamp()) {
            warn!("Payment webhook signature verification failed");
            counter!("pharmacy.webhooks.rejected", 1, "reason" => "signature");
            let issue = NewIssue {
                kind: IssueKind::InvalidSignature,
                payment_id: None,
                order_id: None,
                external_reference: None,
                detail: "webhook signature missing, stale or invalid".to_string(),
                payload: Some(raw),
            };
            if let Err(e) = state.services.reconciliation.flag(issue).await {
                error!(error = %e, "Could not record invalid-signature issue");
            }
            return Err(ServiceError::InvalidSignature);
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))?;

    let outcome = match payload.event_type.as_str() {
        "payment.paid" => GatewayOutcome::Paid,
        "payment.failed" => GatewayOutcome::Failed,
        other => {
            info!(event_type = other, "Unhandled payment webhook type");
            return Ok(Json(ApiResponse::success(WebhookAck {
                received: true,
                outcome: None,
            })));
        }
    };

    let event = GatewayEvent {
        event_id: payload.id,
        outcome,
        reference_id: payload.reference_id,
        amount: payload.amount,
        currency: payload.currency,
    };

    match state
        .services
        .reconciliation
        .on_gateway_event(&event, Some(&raw))
        .await
    {
        Ok(result) => Ok(Json(ApiResponse::success(WebhookAck {
            received: true,
            outcome: Some(result),
        }))),
        Err(err) if err.category() == ErrorCategory::Infrastructure => {
            error!(error = %err, reference_id = %event.reference_id, "Webhook could not be stored");
            Err(err)
        }
        Err(err) => {
            warn!(error = %err, reference_id = %event.reference_id, "Webhook not applied");
            counter!("pharmacy.webhooks.rejected", 1, "reason" => err.code());
            Ok(Json(ApiResponse::success(WebhookAck {
                received: true,
                outcome: None,
            })))
        }
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `x-timestamp` / `x-signature` against the shared secret. The
/// timestamp must be within `tolerance_secs` of `now`.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> bool {
    let (Some(ts), Some(sig)) = (
        headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()),
        headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
    ) else {
        return false;
    };

    let Ok(ts) = ts.trim().parse::<i64>() else {
        return false;
    };
    if (now - ts).unsigned_abs() > tolerance_secs {
        return false;
    }

    match sign_payload(secret, ts, payload) {
        Some(expected) => constant_time_eq(&expected, sig.trim()),
        None => false,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"type":"payment.paid","referenceId":"src_1","amount":"160.80","currency":"PHP"}"#;

    fn signed_headers(ts: i64, sig: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&ts.to_string()).unwrap());
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(sig).unwrap());
        headers
    }

    #[test]
    fn accepts_valid_signature_within_tolerance() {
        let ts = 1_700_000_000;
        let sig = sign_payload(SECRET, ts, BODY).unwrap();
        assert!(verify_signature(&signed_headers(ts, &sig), BODY, SECRET, 300, ts + 10));
    }

    #[test]
    fn rejects_tampered_body() {
        let ts = 1_700_000_000;
        let sig = sign_payload(SECRET, ts, BODY).unwrap();
        let tampered = br#"{"type":"payment.paid","referenceId":"src_1","amount":"1.00","currency":"PHP"}"#;
        assert!(!verify_signature(&signed_headers(ts, &sig), tampered, SECRET, 300, ts));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let ts = 1_700_000_000;
        let sig = sign_payload(SECRET, ts, BODY).unwrap();
        assert!(!verify_signature(&signed_headers(ts, &sig), BODY, SECRET, 300, ts + 301));
    }

    #[test]
    fn rejects_missing_headers_and_wrong_secret() {
        assert!(!verify_signature(&HeaderMap::new(), BODY, SECRET, 300, 0));

        let ts = 1_700_000_000;
        let sig = sign_payload("other", ts, BODY).unwrap();
        assert!(!verify_signature(&signed_headers(ts, &sig), BODY, SECRET, 300, ts));
    }

    #[test]
    fn payload_accepts_camel_case_reference() {
        let payload: WebhookPayload = serde_json::from_slice(BODY).unwrap();
        assert_eq!(payload.reference_id, "src_1");
        assert_eq!(payload.event_type, "payment.paid");
        assert_eq!(payload.amount, rust_decimal_macros::dec!(160.80));
    }

    #[test]
    fn constant_time_eq_compares_contents() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
