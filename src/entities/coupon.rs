use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscountType {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "fixed")]
    Fixed,
}

/// `code` is stored upper-cased so lookups are case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub discount_type: DiscountType,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_value: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub min_purchase_amount: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub max_discount_amount: Option<Decimal>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub is_active: bool,
}

impl Model {
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.valid_from <= now && now <= self.valid_until
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.usage_limit, Some(limit) if self.used_count >= limit)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Canonical form used for storage and lookup.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}
