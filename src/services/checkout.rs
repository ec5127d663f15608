//! Checkout orchestration: one unit of work per checkout request.
//!
//! snapshot catalog -> price -> reserve stock -> persist order, lines and
//! history in `pending_payment` -> count coupon usage -> commit. Any failure
//! rolls the whole unit back; the order-created notification is sent only
//! after commit.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Condition, Expr},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    entities::{
        coupon,
        order::{self, OrderStatus},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::{CatalogSnapshot, DbCatalogReader},
        inventory_ledger::{self, ReservationLine},
        order_state,
        pricing::{self, Destination, LineItemInput, PriceBreakdown, PriceRequest},
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 120))]
    pub recipient_name: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[validate(length(max = 255))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(max = 100))]
    pub state: Option<String>,
    #[validate(length(max = 20))]
    pub postal_code: Option<String>,
    #[validate(length(min = 2, max = 64))]
    pub country: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

impl ShippingAddress {
    pub fn destination(&self) -> Destination {
        Destination {
            country: self.country.clone(),
            state: self.state.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<LineItemInput>,
    pub shipping_method_id: Uuid,
    #[validate]
    pub shipping_address: ShippingAddress,
    #[validate(length(max = 64))]
    pub coupon_code: Option<String>,
}

impl CheckoutRequest {
    pub fn price_request(&self) -> PriceRequest {
        PriceRequest {
            items: self.items.clone(),
            shipping_method_id: self.shipping_method_id,
            destination: self.shipping_address.destination(),
            coupon_code: self.coupon_code.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResult {
    pub order_id: Uuid,
    pub order_number: String,
    pub total_amount: Decimal,
    pub breakdown: PriceBreakdown,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    events: EventSender,
    currency: String,
}

impl CheckoutService {
    pub fn new(db: Arc<DatabaseConnection>, events: EventSender, currency: String) -> Self {
        Self {
            db,
            events,
            currency,
        }
    }

    /// Dry-run pricing. Reads the catalog, writes nothing.
    #[instrument(skip(self, request))]
    pub async fn quote(&self, request: &CheckoutRequest) -> Result<PriceBreakdown, ServiceError> {
        request.validate()?;
        let price_request = request.price_request();
        let reader = DbCatalogReader::new(&*self.db);
        let snapshot = CatalogSnapshot::load(&reader, &price_request).await?;
        pricing::price(&snapshot, &price_request, Utc::now())
    }

    #[instrument(skip(self, identity, request), fields(user_id = %identity.user_id, lines = request.items.len()))]
    pub async fn checkout(
        &self,
        identity: &Identity,
        request: &CheckoutRequest,
    ) -> Result<CheckoutResult, ServiceError> {
        request.validate()?;
        let price_request = request.price_request();
        let shipping_address = serde_json::to_string(&request.shipping_address)
            .map_err(|e| ServiceError::InternalError(format!("address encoding: {}", e)))?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let reader = DbCatalogReader::new(&txn);
        let snapshot = CatalogSnapshot::load(&reader, &price_request).await?;
        let breakdown = pricing::price(&snapshot, &price_request, Utc::now()).map_err(|e| {
            counter!("pharmacy.checkout.rejected", 1, "code" => e.code());
            e
        })?;

        let order_id = Uuid::new_v4();
        let reservation: Vec<ReservationLine> = breakdown
            .lines
            .iter()
            .map(|l| ReservationLine {
                medicine_id: l.medicine_id,
                quantity: l.quantity,
            })
            .collect();
        inventory_ledger::reserve(&txn, order_id, &reservation).await?;

        let order = self
            .insert_order(&txn, identity.user_id, order_id, shipping_address, &breakdown)
            .await?;

        if let Some(applied) = &breakdown.coupon {
            claim_coupon_use(&txn, applied.id, &applied.code).await?;
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("pharmacy.checkout.completed", 1);
        info!(order_id = %order.id, total = %order.total_amount, "Checkout completed");
        self.events
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                user_id: order.user_id,
                total_amount: order.total_amount,
            });

        Ok(CheckoutResult {
            order_id: order.id,
            order_number: order.order_number,
            total_amount: order.total_amount,
            breakdown,
        })
    }

    async fn insert_order<C>(
        &self,
        conn: &C,
        user_id: Uuid,
        order_id: Uuid,
        shipping_address: String,
        breakdown: &PriceBreakdown,
    ) -> Result<order::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let model = order::Model {
            id: order_id,
            order_number: order_number(order_id, now),
            user_id,
            shipping_method_id: breakdown.shipping_method_id,
            shipping_address,
            subtotal: breakdown.subtotal,
            discount_amount: breakdown.discount_amount,
            tax_amount: breakdown.tax_amount,
            shipping_cost: breakdown.shipping_cost,
            total_amount: breakdown.total_amount,
            currency: self.currency.clone(),
            coupon_id: breakdown.coupon.as_ref().map(|c| c.id),
            coupon_code: breakdown.coupon.as_ref().map(|c| c.code.clone()),
            status: OrderStatus::PendingPayment,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let active: order::ActiveModel = model.clone().into();
        order::Entity::insert(active)
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let items: Vec<order_item::ActiveModel> = breakdown
            .lines
            .iter()
            .map(|line| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                medicine_id: Set(line.medicine_id),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_total: Set(line.line_total),
            })
            .collect();
        order_item::Entity::insert_many(items)
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;

        order_state::record_history(
            conn,
            order_id,
            None,
            OrderStatus::PendingPayment,
            Some("checkout"),
        )
        .await?;

        Ok(model)
    }
}

/// Counts one use of a coupon, failing when the last slot was taken by a
/// concurrent checkout since the snapshot was read.
pub async fn claim_coupon_use<C>(conn: &C, coupon_id: Uuid, code: &str) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let result = coupon::Entity::update_many()
        .col_expr(
            coupon::Column::UsedCount,
            Expr::col(coupon::Column::UsedCount).add(1),
        )
        .filter(coupon::Column::Id.eq(coupon_id))
        .filter(
            Condition::any()
                .add(coupon::Column::UsageLimit.is_null())
                .add(Expr::col(coupon::Column::UsedCount).lt(Expr::col(coupon::Column::UsageLimit))),
        )
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        warn!(%coupon_id, "Coupon usage limit reached during checkout");
        counter!("pharmacy.checkout.rejected", 1, "code" => "coupon_exhausted");
        return Err(ServiceError::CouponExhausted(code.to_string()));
    }
    Ok(())
}

/// Human-facing order number, e.g. `ORD-20261017-3F2A9C1B`.
fn order_number(order_id: Uuid, at: chrono::DateTime<Utc>) -> String {
    let simple = order_id.simple().to_string().to_uppercase();
    format!("ORD-{}-{}", at.format("%Y%m%d"), &simple[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ShippingAddress {
        ShippingAddress {
            recipient_name: "Juan Dela Cruz".into(),
            line1: "123 Rizal Ave".into(),
            line2: None,
            city: "Manila".into(),
            state: Some("Metro Manila".into()),
            postal_code: Some("1000".into()),
            country: "PH".into(),
            phone: None,
        }
    }

    #[test]
    fn order_number_has_date_and_id_prefix() {
        let id = Uuid::parse_str("3f2a9c1b-0000-4000-8000-000000000000").unwrap();
        let at = chrono::DateTime::parse_from_rfc3339("2026-10-17T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(order_number(id, at), "ORD-20261017-3F2A9C1B");
    }

    #[test]
    fn request_validation_runs_before_any_side_effect() {
        let mut request = CheckoutRequest {
            items: vec![],
            shipping_method_id: Uuid::new_v4(),
            shipping_address: address(),
            coupon_code: None,
        };
        assert!(request.validate().is_err());

        request.items.push(LineItemInput {
            medicine_id: Uuid::new_v4(),
            quantity: 1,
        });
        assert!(request.validate().is_ok());

        request.shipping_address.country = String::new();
        assert!(request.validate().is_err());
    }

    #[test]
    fn destination_comes_from_shipping_address() {
        let request = CheckoutRequest {
            items: vec![],
            shipping_method_id: Uuid::new_v4(),
            shipping_address: address(),
            coupon_code: Some("save10".into()),
        };
        let price_request = request.price_request();
        assert_eq!(price_request.destination.country, "PH");
        assert_eq!(price_request.coupon_code().as_deref(), Some("SAVE10"));
    }
}
