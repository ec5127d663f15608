//! Read-only catalog lookups feeding the pricing engine.

use async_trait::async_trait;
use sea_orm::{
    sea_query::{Expr, Func},
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    entities::{coupon, medicine, shipping_method, tax_rate},
    errors::ServiceError,
    services::pricing::PriceRequest,
};

/// Storage query interface for everything pricing needs.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn medicines(&self, ids: &[Uuid]) -> Result<Vec<medicine::Model>, ServiceError>;
    async fn shipping_method(
        &self,
        id: Uuid,
    ) -> Result<Option<shipping_method::Model>, ServiceError>;
    /// Active rates for a country, any state.
    async fn tax_rates(&self, country: &str) -> Result<Vec<tax_rate::Model>, ServiceError>;
    /// Looks a coupon up by its normalized code.
    async fn coupon(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError>;
}

/// SeaORM-backed reader. Works on a pool connection or inside a transaction.
pub struct DbCatalogReader<'a, C> {
    conn: &'a C,
}

impl<'a, C> DbCatalogReader<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<'a, C> CatalogReader for DbCatalogReader<'a, C>
where
    C: ConnectionTrait + Send + Sync,
{
    async fn medicines(&self, ids: &[Uuid]) -> Result<Vec<medicine::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        medicine::Entity::find()
            .filter(medicine::Column::Id.is_in(ids.iter().copied()))
            .all(self.conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn shipping_method(
        &self,
        id: Uuid,
    ) -> Result<Option<shipping_method::Model>, ServiceError> {
        shipping_method::Entity::find_by_id(id)
            .one(self.conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn tax_rates(&self, country: &str) -> Result<Vec<tax_rate::Model>, ServiceError> {
        tax_rate::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col(tax_rate::Column::Country)))
                    .eq(country.trim().to_lowercase()),
            )
            .filter(tax_rate::Column::IsActive.eq(true))
            .all(self.conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn coupon(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        coupon::Entity::find()
            .filter(coupon::Column::Code.eq(coupon::normalize_code(code)))
            .one(self.conn)
            .await
            .map_err(ServiceError::db_error)
    }
}

/// Point-in-time copy of the catalog rows a single pricing call reads.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub medicines: HashMap<Uuid, medicine::Model>,
    pub shipping_method: Option<shipping_method::Model>,
    pub tax_rates: Vec<tax_rate::Model>,
    pub coupon: Option<coupon::Model>,
}

impl CatalogSnapshot {
    pub async fn load<R>(reader: &R, request: &PriceRequest) -> Result<Self, ServiceError>
    where
        R: CatalogReader + ?Sized,
    {
        let mut ids: Vec<Uuid> = request.items.iter().map(|i| i.medicine_id).collect();
        ids.sort_unstable();
        ids.dedup();

        let medicines = reader
            .medicines(&ids)
            .await?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();
        let shipping_method = reader.shipping_method(request.shipping_method_id).await?;
        let tax_rates = reader.tax_rates(&request.destination.country).await?;
        let coupon = match request.coupon_code() {
            Some(code) => reader.coupon(&code).await?,
            None => None,
        };

        Ok(Self {
            medicines,
            shipping_method,
            tax_rates,
            coupon,
        })
    }
}
