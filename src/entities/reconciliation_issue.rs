use chrono::{DateTime, Utc};
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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueKind {
    #[sea_orm(string_value = "amount_mismatch")]
    AmountMismatch,
    #[sea_orm(string_value = "unknown_reference")]
    UnknownReference,
    #[sea_orm(string_value = "conflicting_event")]
    ConflictingEvent,
    #[sea_orm(string_value = "invalid_signature")]
    InvalidSignature,
    #[sea_orm(string_value = "late_payment")]
    LatePayment,
}

/// Gateway signals that were not applied automatically and need a human.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "reconciliation_issues")]
#[schema(as = ReconciliationIssue)]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub payment_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub external_reference: Option<String>,
    pub kind: IssueKind,
    #[sea_orm(column_type = "Text")]
    pub detail: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub payload: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
