use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::Identity,
    entities::{
        order::{self, OrderStatus},
        order_item, order_status_history,
        payment::{self, PaymentStatus},
        shipment_tracking,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{inventory_ledger, order_state},
};

/// Order with everything a receipt or status page shows.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payments: Vec<payment::Model>,
    pub tracking: Vec<shipment_tracking::Model>,
    pub history: Vec<order_status_history::Model>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    events: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, events: EventSender) -> Self {
        Self { db, events }
    }

    /// Customer cancellation. Only legal while the order awaits payment;
    /// reserved stock is released in the same unit of work.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn cancel(
        &self,
        identity: &Identity,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = load_accessible(&txn, identity, order_id).await?;

        if order.status != OrderStatus::PendingPayment {
            return Err(ServiceError::InvalidStateTransition(format!(
                "order {} is {} and can no longer be cancelled",
                order.id, order.status
            )));
        }

        let order = cancel_in(&txn, &order, reason.as_deref().or(Some("cancelled by customer")))
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("pharmacy.orders.cancelled", 1);
        self.events
            .send_or_log(Event::OrderCancelled { order_id: order.id });
        Ok(order)
    }

    pub async fn get(&self, identity: &Identity, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = load_accessible(db, identity, order_id).await?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        let payments = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        let tracking = shipment_tracking::Entity::find()
            .filter(shipment_tracking::Column::OrderId.eq(order.id))
            .order_by_asc(shipment_tracking::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        let history = order_status_history::Entity::find()
            .filter(order_status_history::Column::OrderId.eq(order.id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(OrderDetails {
            order,
            items,
            payments,
            tracking,
            history,
        })
    }

    /// Admin move along the fulfilment part of the lifecycle.
    ///
    /// Payment-driven statuses are owned by the payment endpoints and are
    /// rejected here. Cancelling is refused once any payment is `paid`.
    #[instrument(skip(self, identity, reason), fields(admin_id = %identity.user_id))]
    pub async fn admin_update_status(
        &self,
        identity: &Identity,
        order_id: Uuid,
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        identity.require_admin()?;

        if !matches!(
            to,
            OrderStatus::Processing | OrderStatus::Completed | OrderStatus::Cancelled
        ) {
            return Err(ServiceError::InvalidStateTransition(format!(
                "{} is set by payment reconciliation, not directly",
                to
            )));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let updated = if to == OrderStatus::Cancelled {
            order_state::validate_transition(order.status, to)?;
            let paid = payment::Entity::find()
                .filter(payment::Column::OrderId.eq(order.id))
                .filter(payment::Column::Status.eq(PaymentStatus::Paid))
                .count(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            if paid > 0 {
                return Err(ServiceError::InvalidStateTransition(format!(
                    "order {} has a paid payment; use the refund flow",
                    order.id
                )));
            }
            cancel_in(&txn, &order, reason.as_deref().or(Some("cancelled by admin"))).await?
        } else {
            order_state::transition(&txn, &order, to, reason.as_deref()).await?
        };
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %updated.id, status = %updated.status, "Admin status update");
        if updated.status == OrderStatus::Cancelled {
            self.events
                .send_or_log(Event::OrderCancelled {
                    order_id: updated.id,
                });
        }
        Ok(updated)
    }
}

/// Cancels open payments, moves the order to `cancelled` and releases its stock.
async fn cancel_in<C>(
    conn: &C,
    order: &order::Model,
    reason: Option<&str>,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait + TransactionTrait,
{
    payment::Entity::update_many()
        .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Cancelled))
        .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(payment::Column::OrderId.eq(order.id))
        .filter(payment::Column::Status.is_in(PaymentStatus::active()))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let cancelled = order_state::transition(conn, order, OrderStatus::Cancelled, reason).await?;
    inventory_ledger::release(conn, order.id).await?;
    Ok(cancelled)
}

async fn load_accessible<C>(
    conn: &C,
    identity: &Identity,
    order_id: Uuid,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .filter(|o| identity.can_access(o.user_id))
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}
