//! Stock reservation and release.
//!
//! All writes to `medicines.stock_quantity` go through this module. A
//! reservation is a guarded decrement (`stock_quantity >= q`) plus a ledger
//! row; a release inserts the matching `release` row first and only credits
//! stock when that insert actually happened, which makes it idempotent.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        inventory_ledger::{self, LedgerDirection},
        medicine,
    },
    errors::ServiceError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationLine {
    pub medicine_id: Uuid,
    pub quantity: i32,
}

/// Decrements stock for every line or for none.
///
/// Runs in its own transaction (a savepoint when `conn` is already a
/// transaction). Lines are applied in medicine-id order so concurrent
/// reservations touching the same rows lock them in the same order.
#[instrument(skip(conn, lines), fields(order_id = %order_id, lines = lines.len()))]
pub async fn reserve<C>(conn: &C, order_id: Uuid, lines: &[ReservationLine]) -> Result<(), ServiceError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let mut ordered = lines.to_vec();
    ordered.sort_by_key(|l| l.medicine_id);

    let txn = conn.begin().await.map_err(ServiceError::db_error)?;

    for line in &ordered {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "reservation quantity for {} must be positive",
                line.medicine_id
            )));
        }

        let result = medicine::Entity::update_many()
            .col_expr(
                medicine::Column::StockQuantity,
                Expr::col(medicine::Column::StockQuantity).sub(line.quantity),
            )
            .col_expr(medicine::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(medicine::Column::Id.eq(line.medicine_id))
            .filter(medicine::Column::IsActive.eq(true))
            .filter(medicine::Column::StockQuantity.gte(line.quantity))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            counter!("pharmacy.inventory.reservation_rejected", 1);
            let current = medicine::Entity::find_by_id(line.medicine_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            return Err(match current {
                Some(m) if m.is_active => ServiceError::OutOfStock(format!(
                    "medicine {} has {} available, {} requested",
                    m.id, m.stock_quantity, line.quantity
                )),
                _ => ServiceError::NotFound(format!("Medicine {} not found", line.medicine_id)),
            });
        }

        inventory_ledger::Entity::insert(inventory_ledger::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            medicine_id: Set(line.medicine_id),
            quantity: Set(line.quantity),
            direction: Set(LedgerDirection::Reserve),
            created_at: Set(Utc::now()),
        })
        .exec_without_returning(&txn)
        .await
        .map_err(ServiceError::db_error)?;
    }

    txn.commit().await.map_err(ServiceError::db_error)?;
    counter!("pharmacy.inventory.reservations", 1);
    debug!("Reserved stock");
    Ok(())
}

/// Restores every reservation of `order_id` that has not been released yet.
/// Returns the number of lines credited back; `0` on a repeated call.
#[instrument(skip(conn), fields(order_id = %order_id))]
pub async fn release<C>(conn: &C, order_id: Uuid) -> Result<usize, ServiceError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = conn.begin().await.map_err(ServiceError::db_error)?;

    let reservations = inventory_ledger::Entity::find()
        .filter(inventory_ledger::Column::OrderId.eq(order_id))
        .filter(inventory_ledger::Column::Direction.eq(LedgerDirection::Reserve))
        .order_by_asc(inventory_ledger::Column::MedicineId)
        .all(&txn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut released = 0;
    for reservation in reservations {
        let inserted = inventory_ledger::Entity::insert(inventory_ledger::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            medicine_id: Set(reservation.medicine_id),
            quantity: Set(reservation.quantity),
            direction: Set(LedgerDirection::Release),
            created_at: Set(Utc::now()),
        })
        .on_conflict(
            OnConflict::columns([
                inventory_ledger::Column::OrderId,
                inventory_ledger::Column::MedicineId,
                inventory_ledger::Column::Direction,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        if inserted == 0 {
            continue;
        }

        let result = medicine::Entity::update_many()
            .col_expr(
                medicine::Column::StockQuantity,
                Expr::col(medicine::Column::StockQuantity).add(reservation.quantity),
            )
            .col_expr(medicine::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(medicine::Column::Id.eq(reservation.medicine_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            warn!(medicine_id = %reservation.medicine_id, "Released stock for a deleted medicine");
        }
        released += 1;
    }

    txn.commit().await.map_err(ServiceError::db_error)?;

    if released > 0 {
        counter!("pharmacy.inventory.releases", 1);
    }
    debug!(released, "Released stock");
    Ok(released)
}

/// Net quantity currently held by an order, per medicine.
pub async fn held_by_order<C>(conn: &C, order_id: Uuid) -> Result<Vec<ReservationLine>, ServiceError>
where
    C: ConnectionTrait,
{
    let rows = inventory_ledger::Entity::find()
        .filter(inventory_ledger::Column::OrderId.eq(order_id))
        .order_by_asc(inventory_ledger::Column::MedicineId)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut held: Vec<ReservationLine> = Vec::new();
    for row in rows {
        let delta = match row.direction {
            LedgerDirection::Reserve => row.quantity,
            LedgerDirection::Release => -row.quantity,
        };
        match held.iter_mut().find(|l| l.medicine_id == row.medicine_id) {
            Some(line) => line.quantity += delta,
            None => held.push(ReservationLine {
                medicine_id: row.medicine_id,
                quantity: delta,
            }),
        }
    }
    held.retain(|l| l.quantity != 0);
    Ok(held)
}
