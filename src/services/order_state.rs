use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, OrderStatus},
        order_status_history,
    },
    errors::ServiceError,
};

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Legal edges of the order lifecycle.
    ///
    /// Cancellation is allowed from any non-terminal state here; callers add
    /// the rule that a customer may only cancel from `pending_payment` and
    /// that an order with a paid payment cannot be cancelled.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if self.is_terminal() || self == next {
            return false;
        }
        matches!(
            (self, next),
            (PendingPayment, PaymentSubmitted)
                | (PaymentSubmitted, PaymentApproved)
                | (PaymentSubmitted, PaymentFailed)
                | (PaymentFailed, PendingPayment)
                | (PaymentApproved, Processing)
                | (Processing, Completed)
                | (_, Cancelled)
        )
    }
}

pub fn validate_transition(from: OrderStatus, to: OrderStatus) -> Result<(), ServiceError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ServiceError::InvalidStateTransition(format!(
            "cannot move order from {} to {}",
            from, to
        )))
    }
}

/// Applies one transition with an optimistic version check and records it in
/// the status history. Returns the updated order.
///
/// Nothing is written when the transition is illegal. When another writer
/// bumped the version first the call fails with `ConcurrentModification`.
#[instrument(skip(conn, order), fields(order_id = %order.id, from = %order.status, to = %to))]
pub async fn transition<C>(
    conn: &C,
    order: &order::Model,
    to: OrderStatus,
    reason: Option<&str>,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    validate_transition(order.status, to)?;

    let now = Utc::now();
    let result = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(to))
        .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Version.eq(order.version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        counter!("pharmacy.orders.transition_conflicts", 1);
        let exists = order::Entity::find_by_id(order.id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .is_some();
        if !exists {
            return Err(ServiceError::NotFound(format!("Order {} not found", order.id)));
        }
        error!("Order was modified concurrently");
        return Err(ServiceError::ConcurrentModification(order.id));
    }

    record_history(conn, order.id, Some(order.status), to, reason).await?;
    info!("Order status updated");

    Ok(order::Model {
        status: to,
        version: order.version + 1,
        updated_at: now,
        ..order.clone()
    })
}

/// Applies a chain of transitions, each one version-checked.
pub async fn transition_path<C>(
    conn: &C,
    order: &order::Model,
    path: &[OrderStatus],
    reason: Option<&str>,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let mut current = order.clone();
    for next in path {
        current = transition(conn, &current, *next, reason).await?;
    }
    Ok(current)
}

pub async fn record_history<C>(
    conn: &C,
    order_id: Uuid,
    from: Option<OrderStatus>,
    to: OrderStatus,
    reason: Option<&str>,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    order_status_history::Entity::insert(order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        from_status: Set(from),
        to_status: Set(to),
        reason: Set(reason.map(str::to_string)),
        created_at: Set(Utc::now()),
    })
    .exec_without_returning(conn)
    .await
    .map_err(ServiceError::db_error)?;
    Ok(())
}
