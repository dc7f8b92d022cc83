use std::time::Duration;

use gym_billing::billing::gateway::{CreateSubscriptionRequest, FrequencyType};
use gym_billing::billing::{GatewayClient, GatewayError, HttpGatewayClient, HttpGatewayConfig};
use httpmock::prelude::*;
use rust_decimal_macros::dec;
use serde_json::json;

fn client(server: &MockServer, timeout: Duration) -> HttpGatewayClient {
    HttpGatewayClient::new(HttpGatewayConfig {
        name: "mercadopago".into(),
        base_url: server.base_url(),
        access_token: Some("test-token".into()),
        timeout,
    })
    .unwrap()
}

#[tokio::test]
async fn fetches_payment_with_numeric_id() {
    let server = MockServer::start_async().await;
    let payment_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/payments/123456")
            .header("authorization", "Bearer test-token");
        then.status(200).json_body(json!({
            "id": 123456,
            "status": "approved",
            "external_reference": "MAT-42-abc",
            "transaction_amount": 150.0,
            "date_approved": "2024-05-02T13:00:00.000-03:00",
            "payment_type_id": "pix"
        }));
    });

    let gateway = client(&server, Duration::from_secs(5));
    let payment = gateway.get_payment("123456").await.unwrap();

    assert_eq!(payment.id, "123456");
    assert!(payment.is_approved());
    assert_eq!(payment.external_reference.as_deref(), Some("MAT-42-abc"));
    assert_eq!(payment.amount, Some(dec!(150)));
    assert_eq!(payment.payment_type_id.as_deref(), Some("pix"));
    assert!(payment.approved_at.is_some());
    payment_mock.assert();
}

#[tokio::test]
async fn searches_payments_by_reference() {
    let server = MockServer::start_async().await;
    let search_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/payments/search")
            .query_param("external_reference", "PKG-7-31");
        then.status(200).json_body(json!({
            "results": [
                {"id": "p2", "status": "pending", "external_reference": "PKG-7-31"},
                {"id": "p1", "status": "approved", "external_reference": "PKG-7-31"}
            ]
        }));
    });

    let gateway = client(&server, Duration::from_secs(5));
    let payments = gateway
        .find_payments_by_external_reference("PKG-7-31")
        .await
        .unwrap();

    assert_eq!(payments.len(), 2);
    assert!(payments.iter().any(|payment| payment.is_approved()));
    search_mock.assert();
}

#[tokio::test]
async fn distinguishes_not_found_rejected_and_unavailable() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/v1/payments/missing");
        then.status(404).json_body(json!({"message": "Payment not found"}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/v1/payments/forbidden");
        then.status(401).json_body(json!({"message": "invalid access token"}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/v1/payments/flaky");
        then.status(502);
    });

    let gateway = client(&server, Duration::from_secs(5));

    assert!(matches!(
        gateway.get_payment("missing").await,
        Err(GatewayError::NotFound(_))
    ));
    match gateway.get_payment("forbidden").await {
        Err(GatewayError::Rejected { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid access token");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(matches!(
        gateway.get_payment("flaky").await,
        Err(GatewayError::Unavailable(_))
    ));
}

#[tokio::test]
async fn slow_gateway_counts_as_unavailable() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/preapproval/sub-1");
        then.status(200)
            .delay(Duration::from_millis(1500))
            .json_body(json!({"id": "sub-1", "status": "authorized"}));
    });

    let gateway = client(&server, Duration::from_millis(200));
    assert!(matches!(
        gateway.get_subscription("sub-1").await,
        Err(GatewayError::Unavailable(_))
    ));
}

#[tokio::test]
async fn creates_and_cancels_subscriptions() {
    let server = MockServer::start_async().await;
    let create_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/preapproval")
            .json_body_partial(r#"{"external_reference": "MAT-42-abc", "status": "pending"}"#);
        then.status(201).json_body(json!({
            "id": "2c938084",
            "status": "pending",
            "external_reference": "MAT-42-abc",
            "reason": "Monthly plan"
        }));
    });
    let cancel_mock = server.mock(|when, then| {
        when.method(PUT)
            .path("/preapproval/2c938084")
            .json_body(json!({"status": "cancelled"}));
        then.status(200).json_body(json!({"id": "2c938084", "status": "cancelled"}));
    });

    let gateway = client(&server, Duration::from_secs(5));
    let created = gateway
        .create_subscription(&CreateSubscriptionRequest {
            reason: "Monthly plan".into(),
            external_reference: "MAT-42-abc".into(),
            amount: dec!(99.90),
            currency: "BRL".into(),
            frequency: 1,
            frequency_type: FrequencyType::Months,
            start_date: None,
            payer_email: None,
            back_url: None,
        })
        .await
        .unwrap();
    assert_eq!(created.id, "2c938084");

    gateway.cancel_subscription(&created.id).await.unwrap();

    create_mock.assert();
    cancel_mock.assert();
}
