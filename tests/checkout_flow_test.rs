//! Checkout orchestration against a real (in-memory) database: pricing,
//! reservation, order persistence, coupon usage and cancellation.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{admin, checkout_request, customer, TestContext};
use pharmacy_checkout::{
    entities::{
        coupon::{self, DiscountType},
        order::OrderStatus,
    },
    errors::ServiceError,
    events::Event,
};
use rust_decimal_macros::dec;
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

#[tokio::test]
async fn checkout_prices_reserves_and_persists_pending_order() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let user = customer();

    let request = checkout_request(&[(catalog.medicine_id, 2)], catalog.shipping_id, Some("save10"));
    let result = ctx.services.checkout.checkout(&user, &request).await.unwrap();

    assert_eq!(result.total_amount, dec!(160.80));
    assert_eq!(result.breakdown.subtotal, dec!(100.00));
    assert_eq!(result.breakdown.discount_amount, dec!(10.00));
    assert_eq!(result.breakdown.tax_amount, dec!(10.80));
    assert_eq!(result.breakdown.shipping_cost, dec!(60.00));
    assert!(result.order_number.starts_with("ORD-"));

    let order = ctx.order(result.order_id).await;
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.user_id, user.user_id);
    assert_eq!(order.total_amount, dec!(160.80));
    assert_eq!(order.coupon_code.as_deref(), Some("SAVE10"));
    assert_eq!(order.version, 1);

    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 8);
    assert_eq!(ctx.coupon_used_count(catalog.coupon_id).await, 1);

    let details = ctx.services.orders.get(&user, result.order_id).await.unwrap();
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].quantity, 2);
    assert_eq!(details.items[0].unit_price, dec!(50.00));
    assert_eq!(details.history.len(), 1);
    assert_eq!(details.history[0].from_status, None);
    assert_eq!(details.history[0].to_status, OrderStatus::PendingPayment);

    let events = ctx.drain_events();
    assert_eq!(
        events,
        vec![Event::OrderCreated {
            order_id: result.order_id,
            user_id: user.user_id,
            total_amount: result.total_amount,
        }]
    );
}

#[tokio::test]
async fn insufficient_stock_rejects_checkout_without_side_effects() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(1).await;

    let request = checkout_request(&[(catalog.medicine_id, 2)], catalog.shipping_id, Some("SAVE10"));
    let err = ctx
        .services
        .checkout
        .checkout(&customer(), &request)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::OutOfStock(_));
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 1);
    assert_eq!(ctx.order_count().await, 0);
    assert_eq!(ctx.coupon_used_count(catalog.coupon_id).await, 0);
    assert!(ctx.drain_events().is_empty());
}

#[tokio::test]
async fn expired_coupon_is_a_specific_error() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    coupon::Entity::update_many()
        .col_expr(coupon::Column::ValidUntil, Expr::value(Utc::now() - Duration::hours(1)))
        .filter(coupon::Column::Id.eq(catalog.coupon_id))
        .exec(&*ctx.db)
        .await
        .unwrap();

    let request = checkout_request(&[(catalog.medicine_id, 1)], catalog.shipping_id, Some("SAVE10"));
    let err = ctx
        .services
        .checkout
        .checkout(&customer(), &request)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::CouponExpired(code) if code == "SAVE10");
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 10);
}

#[tokio::test]
async fn coupon_usage_limit_is_enforced_across_checkouts() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let once = ctx
        .seed_coupon("ONCE", DiscountType::Fixed, dec!(5.00), Some(1))
        .await;

    let request = checkout_request(&[(catalog.medicine_id, 1)], catalog.shipping_id, Some("once"));
    ctx.services
        .checkout
        .checkout(&customer(), &request)
        .await
        .unwrap();
    assert_eq!(ctx.coupon_used_count(once).await, 1);

    let err = ctx
        .services
        .checkout
        .checkout(&customer(), &request)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::CouponExhausted(_));
    assert_eq!(ctx.coupon_used_count(once).await, 1);
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 9);
}

#[tokio::test]
async fn unknown_coupon_medicine_and_shipping_are_rejected() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let user = customer();

    let err = ctx
        .services
        .checkout
        .checkout(
            &user,
            &checkout_request(&[(catalog.medicine_id, 1)], catalog.shipping_id, Some("NOPE")),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::CouponNotFound(_));

    let err = ctx
        .services
        .checkout
        .checkout(
            &user,
            &checkout_request(&[(Uuid::new_v4(), 1)], catalog.shipping_id, None),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    let err = ctx
        .services
        .checkout
        .checkout(
            &user,
            &checkout_request(&[(catalog.medicine_id, 1)], Uuid::new_v4(), None),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidShippingMethod(_));

    let err = ctx
        .services
        .checkout
        .checkout(&user, &checkout_request(&[], catalog.shipping_id, None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    assert_eq!(ctx.order_count().await, 0);
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 10);
}

#[tokio::test]
async fn duplicate_lines_are_merged_into_one_order_item() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let user = customer();

    let request = checkout_request(
        &[(catalog.medicine_id, 1), (catalog.medicine_id, 2)],
        catalog.shipping_id,
        None,
    );
    let result = ctx.services.checkout.checkout(&user, &request).await.unwrap();

    let details = ctx.services.orders.get(&user, result.order_id).await.unwrap();
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].quantity, 3);
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 7);
}

#[tokio::test]
async fn tax_exempt_lines_are_not_taxed() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let insulin = ctx
        .seed_medicine_with("Prescription insulin", dec!(100.00), 5, true)
        .await;

    let request = checkout_request(
        &[(catalog.medicine_id, 2), (insulin, 1)],
        catalog.shipping_id,
        None,
    );
    let result = ctx.services.checkout.checkout(&customer(), &request).await.unwrap();

    assert_eq!(result.breakdown.subtotal, dec!(200.00));
    assert_eq!(result.breakdown.taxable_amount, dec!(100.00));
    assert_eq!(result.breakdown.tax_amount, dec!(12.00));
    assert_eq!(result.total_amount, dec!(272.00));
}

#[tokio::test]
async fn quote_matches_checkout_and_writes_nothing() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;

    let request = checkout_request(&[(catalog.medicine_id, 2)], catalog.shipping_id, Some("SAVE10"));
    let quote = ctx.services.checkout.quote(&request).await.unwrap();
    assert_eq!(quote.total_amount, dec!(160.80));
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 10);
    assert_eq!(ctx.coupon_used_count(catalog.coupon_id).await, 0);
    assert_eq!(ctx.order_count().await, 0);

    let result = ctx.services.checkout.checkout(&customer(), &request).await.unwrap();
    assert_eq!(result.breakdown, quote);
}

#[tokio::test]
async fn cancel_releases_stock_exactly_once() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let user = customer();

    let request = checkout_request(&[(catalog.medicine_id, 3)], catalog.shipping_id, None);
    let result = ctx.services.checkout.checkout(&user, &request).await.unwrap();
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 7);
    ctx.drain_events();

    let cancelled = ctx
        .services
        .orders
        .cancel(&user, result.order_id, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 10);
    assert_eq!(
        ctx.drain_events(),
        vec![Event::OrderCancelled {
            order_id: result.order_id
        }]
    );

    let err = ctx
        .services
        .orders
        .cancel(&user, result.order_id, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStateTransition(_));
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 10);
}

#[tokio::test]
async fn customers_only_see_their_own_orders() {
    let ctx = TestContext::new().await;
    let catalog = ctx.seed_worked_example(10).await;
    let owner = customer();

    let request = checkout_request(&[(catalog.medicine_id, 1)], catalog.shipping_id, None);
    let result = ctx.services.checkout.checkout(&owner, &request).await.unwrap();

    let err = ctx
        .services
        .orders
        .get(&customer(), result.order_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    let err = ctx
        .services
        .orders
        .cancel(&customer(), result.order_id, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
    assert_eq!(ctx.stock_of(catalog.medicine_id).await, 9);

    let details = ctx.services.orders.get(&admin(), result.order_id).await.unwrap();
    assert_eq!(details.order.id, result.order_id);
}
