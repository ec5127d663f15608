//! HTTP gateway client against a mock gateway server.

use assert_matches::assert_matches;
use pharmacy_checkout::{
    config::GatewayConfig,
    errors::ServiceError,
    services::gateway::{
        CreateSourceRequest, GatewayOutcome, GatewaySourceState, GatewaySourceStatus,
        HttpPaymentGateway, PaymentGateway,
    },
};
use rstest::rstest;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::{
    matchers::{basic_auth, body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

const SECRET_KEY: &str = "sk_test_123";

fn gateway_for(server: &MockServer) -> HttpPaymentGateway {
    HttpPaymentGateway::new(GatewayConfig {
        base_url: format!("{}/v1", server.uri()),
        secret_key: SECRET_KEY.to_string(),
        success_url: "https://shop.test/payment/success".to_string(),
        failed_url: "https://shop.test/payment/failed".to_string(),
        ..GatewayConfig::default()
    })
    .expect("gateway client")
}

fn source_body(id: &str, status: &str, amount: i64, checkout_url: Option<&str>) -> serde_json::Value {
    json!({
        "data": {
            "id": id,
            "type": "source",
            "attributes": {
                "amount": amount,
                "currency": "PHP",
                "status": status,
                "type": "gcash",
                "redirect": {
                    "checkout_url": checkout_url,
                    "success": "https://shop.test/payment/success",
                    "failed": "https://shop.test/payment/failed"
                }
            }
        }
    })
}

fn create_request() -> CreateSourceRequest {
    CreateSourceRequest {
        amount: dec!(160.80),
        currency: "PHP".to_string(),
        order_id: Uuid::new_v4(),
        order_number: "ORD-20261017-3F2A9C1B".to_string(),
        payment_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn create_source_posts_minor_units_with_basic_auth() {
    let server = MockServer::start().await;
    let request = create_request();

    Mock::given(method("POST"))
        .and(path("/v1/sources"))
        .and(basic_auth(SECRET_KEY, ""))
        .and(body_partial_json(json!({
            "data": {
                "attributes": {
                    "amount": 16080,
                    "currency": "PHP",
                    "type": "gcash",
                    "redirect": {
                        "success": "https://shop.test/payment/success",
                        "failed": "https://shop.test/payment/failed"
                    },
                    "metadata": {
                        "order_id": request.order_id.to_string(),
                        "order_number": "ORD-20261017-3F2A9C1B",
                        "payment_id": request.payment_id.to_string()
                    }
                }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(source_body(
            "src_abc",
            "pending",
            16080,
            Some("https://pay.test/gcash/src_abc"),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let source = gateway_for(&server).create_source(&request).await.unwrap();
    assert_eq!(source.source_id, "src_abc");
    assert_eq!(source.checkout_url, "https://pay.test/gcash/src_abc");
    assert_eq!(source.status, GatewaySourceStatus::Pending);
}

#[tokio::test]
async fn source_without_checkout_url_is_an_external_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(source_body(
            "src_abc", "pending", 16080, None,
        )))
        .mount(&server)
        .await;

    let err = gateway_for(&server)
        .create_source(&create_request())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}

#[rstest]
#[case(400)]
#[case(401)]
#[case(500)]
#[case(503)]
#[tokio::test]
async fn gateway_error_statuses_become_external_errors(#[case] status: u16) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sources"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "errors": [{ "code": "failed", "detail": "nope" }]
        })))
        .mount(&server)
        .await;

    let err = gateway_for(&server)
        .create_source(&create_request())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(msg) if msg.contains(&status.to_string()));
}

#[rstest]
#[case("pending", GatewaySourceStatus::Pending)]
#[case("chargeable", GatewaySourceStatus::Chargeable)]
#[case("consumed", GatewaySourceStatus::Consumed)]
#[case("paid", GatewaySourceStatus::Paid)]
#[case("expired", GatewaySourceStatus::Expired)]
#[tokio::test]
async fn retrieve_source_reads_status_and_amount(
    #[case] wire: &str,
    #[case] expected: GatewaySourceStatus,
) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sources/src_abc"))
        .and(basic_auth(SECRET_KEY, ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(source_body(
            "src_abc",
            wire,
            16080,
            Some("https://pay.test/gcash/src_abc"),
        )))
        .mount(&server)
        .await;

    let state = gateway_for(&server).retrieve_source("src_abc").await.unwrap();
    assert_eq!(state.source_id, "src_abc");
    assert_eq!(state.status, expected);
    assert_eq!(state.amount, dec!(160.80));
    assert_eq!(state.currency, "PHP");
}

#[tokio::test]
async fn malformed_gateway_body_is_an_external_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sources/src_abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = gateway_for(&server)
        .retrieve_source("src_abc")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}

fn chargeable_source() -> GatewaySourceState {
    GatewaySourceState {
        source_id: "src_abc".to_string(),
        status: GatewaySourceStatus::Chargeable,
        amount: dec!(160.80),
        currency: "PHP".to_string(),
    }
}

#[rstest]
#[case("paid", Some(GatewayOutcome::Paid))]
#[case("failed", Some(GatewayOutcome::Failed))]
#[case("pending", None)]
#[tokio::test]
async fn capture_creates_a_payment_from_the_source(
    #[case] wire: &str,
    #[case] expected: Option<GatewayOutcome>,
) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payments"))
        .and(basic_auth(SECRET_KEY, ""))
        .and(body_partial_json(json!({
            "data": {
                "attributes": {
                    "amount": 16080,
                    "currency": "PHP",
                    "source": { "id": "src_abc", "type": "source" }
                }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "id": "pay_123",
                "type": "payment",
                "attributes": { "amount": 16080, "currency": "PHP", "status": wire }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway_for(&server)
        .capture_source(&chargeable_source())
        .await
        .unwrap();
    assert_eq!(outcome, expected);
}

#[tokio::test]
async fn rejected_capture_is_an_external_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payments"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{ "code": "resource_not_chargeable_state", "detail": "consumed" }]
        })))
        .mount(&server)
        .await;

    let err = gateway_for(&server)
        .capture_source(&chargeable_source())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(msg) if msg.contains("400"));
}
