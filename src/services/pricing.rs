//! Checkout pricing.
//!
//! [`price`] is a pure function of a [`CatalogSnapshot`], the request and the
//! clock. It performs the steps in a fixed order so that the coupon minimum is
//! checked against the goods subtotal and tax never applies to shipping:
//!
//! 1. resolve and snapshot unit prices, checking availability
//! 2. subtotal of the goods
//! 3. shipping cost (kept separate from the subtotal)
//! 4. coupon discount, clamped to its cap and to the subtotal
//! 5. tax on the discounted goods
//! 6. total, rounded half-up to 2 places

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        coupon::{self, DiscountType},
        tax_rate,
    },
    errors::ServiceError,
    services::catalog::CatalogSnapshot,
};

/// Fixed currency precision.
pub const MONEY_DP: u32 = 2;

/// Rounds half-up (away from zero) to currency precision.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LineItemInput {
    pub medicine_id: Uuid,
    pub quantity: i32,
}

/// Shipment destination used for tax resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Destination {
    pub country: String,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRequest {
    pub items: Vec<LineItemInput>,
    pub shipping_method_id: Uuid,
    pub destination: Destination,
    pub coupon_code: Option<String>,
}

impl PriceRequest {
    /// Normalized coupon code, `None` when absent or blank.
    pub fn coupon_code(&self) -> Option<String> {
        self.coupon_code
            .as_deref()
            .map(coupon::normalize_code)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PricedLine {
    pub medicine_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub tax_exempt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AppliedCoupon {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
}

/// Every intermediate figure of a pricing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceBreakdown {
    pub lines: Vec<PricedLine>,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub coupon: Option<AppliedCoupon>,
    /// Goods value the tax rate was applied to
    pub taxable_amount: Decimal,
    /// Percentage, e.g. `12` for 12%
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub shipping_method_id: Uuid,
    pub shipping_cost: Decimal,
    pub total_amount: Decimal,
}

/// Prices a cart against a catalog snapshot. No side effects.
pub fn price(
    snapshot: &CatalogSnapshot,
    request: &PriceRequest,
    now: DateTime<Utc>,
) -> Result<PriceBreakdown, ServiceError> {
    let items = merge_line_items(&request.items)?;

    // 1. unit prices and availability
    let mut lines = Vec::with_capacity(items.len());
    for item in &items {
        let medicine = snapshot
            .medicines
            .get(&item.medicine_id)
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Medicine {} not found", item.medicine_id))
            })?;

        if item.quantity > medicine.stock_quantity {
            return Err(ServiceError::OutOfStock(format!(
                "medicine {} has {} available, {} requested",
                medicine.id, medicine.stock_quantity, item.quantity
            )));
        }

        let unit_price = round_money(medicine.price);
        lines.push(PricedLine {
            medicine_id: medicine.id,
            name: medicine.name.clone(),
            quantity: item.quantity,
            unit_price,
            line_total: round_money(unit_price * Decimal::from(item.quantity)),
            tax_exempt: medicine.is_tax_exempt,
        });
    }

    // 2. subtotal
    let subtotal: Decimal = lines.iter().map(|l| l.line_total).sum();

    // 3. shipping
    let shipping = snapshot
        .shipping_method
        .as_ref()
        .filter(|s| s.id == request.shipping_method_id && s.is_active)
        .ok_or_else(|| {
            ServiceError::InvalidShippingMethod(format!(
                "shipping method {} is unavailable",
                request.shipping_method_id
            ))
        })?;
    let shipping_cost = round_money(shipping.base_cost.max(Decimal::ZERO));

    // 4. coupon
    let (discount_amount, applied) = match request.coupon_code() {
        Some(code) => {
            let coupon = snapshot
                .coupon
                .as_ref()
                .filter(|c| c.code == code)
                .ok_or_else(|| ServiceError::CouponNotFound(code.clone()))?;
            let discount = coupon_discount(coupon, subtotal, now)?;
            let applied = AppliedCoupon {
                id: coupon.id,
                code: coupon.code.clone(),
                discount_type: coupon.discount_type,
                discount_value: coupon.discount_value,
            };
            (discount, Some(applied))
        }
        None => (Decimal::ZERO, None),
    };

    // 5. tax
    let tax_rate = resolve_tax_rate(&snapshot.tax_rates, &request.destination)
        .map(|r| r.rate)
        .unwrap_or(Decimal::ZERO);
    let taxable_amount = taxable_base(&lines, subtotal, discount_amount);
    let tax_amount = round_money(taxable_amount * tax_rate / Decimal::ONE_HUNDRED);

    // 6. total
    let total_amount = round_money(subtotal - discount_amount + tax_amount + shipping_cost);

    Ok(PriceBreakdown {
        lines,
        subtotal,
        discount_amount,
        coupon: applied,
        taxable_amount,
        tax_rate,
        tax_amount,
        shipping_method_id: shipping.id,
        shipping_cost,
        total_amount,
    })
}

/// Validates quantities and folds duplicate medicines into one line,
/// keeping first-seen order.
pub fn merge_line_items(items: &[LineItemInput]) -> Result<Vec<LineItemInput>, ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::ValidationError(
            "at least one line item is required".to_string(),
        ));
    }

    let mut merged: Vec<LineItemInput> = Vec::with_capacity(items.len());
    for item in items {
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for medicine {} must be positive",
                item.medicine_id
            )));
        }
        match merged.iter_mut().find(|m| m.medicine_id == item.medicine_id) {
            Some(existing) => {
                existing.quantity = existing.quantity.checked_add(item.quantity).ok_or_else(|| {
                    ServiceError::ValidationError("quantity out of range".to_string())
                })?;
            }
            None => merged.push(item.clone()),
        }
    }
    Ok(merged)
}

fn coupon_discount(
    coupon: &coupon::Model,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<Decimal, ServiceError> {
    if !coupon.is_within_window(now) {
        return Err(ServiceError::CouponExpired(coupon.code.clone()));
    }
    if coupon.is_exhausted() {
        return Err(ServiceError::CouponExhausted(coupon.code.clone()));
    }
    if let Some(minimum) = coupon.min_purchase_amount {
        if subtotal < minimum {
            return Err(ServiceError::CouponMinimumNotMet(format!(
                "{} requires a subtotal of at least {}, got {}",
                coupon.code, minimum, subtotal
            )));
        }
    }

    let raw = match coupon.discount_type {
        DiscountType::Percentage => subtotal * coupon.discount_value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => coupon.discount_value,
    };
    let capped = match coupon.max_discount_amount {
        Some(cap) => raw.min(cap),
        None => raw,
    };

    Ok(round_money(capped.min(subtotal).max(Decimal::ZERO)))
}

/// Exact `(country, state)` match first, then the country-wide row.
pub fn resolve_tax_rate<'a>(
    rates: &'a [tax_rate::Model],
    destination: &Destination,
) -> Option<&'a tax_rate::Model> {
    let country = destination.country.trim();
    let in_country = || {
        rates
            .iter()
            .filter(move |r| r.is_active && r.country.trim().eq_ignore_ascii_case(country))
    };

    let state_match = destination
        .state
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|state| {
            in_country().find(|r| {
                r.state
                    .as_deref()
                    .is_some_and(|s| s.trim().eq_ignore_ascii_case(state))
            })
        });

    state_match.or_else(|| in_country().find(|r| r.state.is_none()))
}

/// Discounted goods value subject to tax. Tax-exempt lines take their
/// proportional share of the discount with them.
fn taxable_base(lines: &[PricedLine], subtotal: Decimal, discount: Decimal) -> Decimal {
    let discounted = subtotal - discount;
    if subtotal.is_zero() {
        return Decimal::ZERO;
    }
    let taxable_goods: Decimal = lines
        .iter()
        .filter(|l| !l.tax_exempt)
        .map(|l| l.line_total)
        .sum();
    if taxable_goods == subtotal {
        discounted
    } else {
        round_money(discounted * taxable_goods / subtotal)
    }
}
