//! Payment reconciliation.
//!
//! Maps external payment signals (gateway webhook, client poll, admin review
//! of a manual proof) onto payment and order transitions. Every signal is
//! checked against the payment's current status rather than its arrival
//! order, so duplicates and stale events are no-ops and a `failed` arriving
//! after `paid` never regresses an order. Signals that cannot be applied
//! safely are written to `reconciliation_issues` for manual review.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::Identity,
    config::FulfillmentPolicy,
    entities::{
        cart_item,
        order::{self, OrderStatus},
        payment::{self, PaymentStatus},
        reconciliation_issue::{self, IssueKind},
        shipment_tracking,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        gateway::{GatewayOutcome, GatewaySourceStatus, PaymentGateway},
        order_state,
        pricing::round_money,
    },
};

const MAX_APPLY_ATTEMPTS: u32 = 3;

/// A terminal gateway signal for one payment source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event_id: Option<String>,
    pub outcome: GatewayOutcome,
    pub reference_id: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The event moved the payment and order forward.
    Applied {
        payment_id: Uuid,
        order_id: Uuid,
        order_status: OrderStatus,
    },
    /// The payment already carries this outcome.
    Duplicate { payment_id: Uuid },
    /// The event contradicts a terminal payment; recorded, not applied.
    Ignored { payment_id: Uuid },
}

/// Result of a successful apply, with the notifications to send on commit.
pub(crate) struct AppliedPayment {
    pub payment: payment::Model,
    pub order: order::Model,
    pub events: Vec<Event>,
}

enum Step {
    Done(ReconcileOutcome, Vec<Event>),
    /// Issue recorded in the same unit of work; surfaced as an error after commit.
    Flagged(ServiceError),
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VerifyResult {
    pub reference_id: String,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    pub gateway_status: Option<GatewaySourceStatus>,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    events: EventSender,
    policy: FulfillmentPolicy,
}

impl ReconciliationEngine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        events: EventSender,
        policy: FulfillmentPolicy,
    ) -> Self {
        Self {
            db,
            gateway,
            events,
            policy,
        }
    }

    /// Applies a gateway event. Idempotent per payment.
    ///
    /// `raw_payload` is stored with any issue the event raises.
    #[instrument(skip(self, event, raw_payload), fields(reference_id = %event.reference_id, event_id = ?event.event_id, outcome = ?event.outcome))]
    pub async fn on_gateway_event(
        &self,
        event: &GatewayEvent,
        raw_payload: Option<&str>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.apply_event(event, raw_payload, None).await
    }

    /// `known` is a payment row the caller already read; it is used for the
    /// first attempt only and may be stale by then.
    async fn apply_event(
        &self,
        event: &GatewayEvent,
        raw_payload: Option<&str>,
        mut known: Option<payment::Model>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        // A concurrent delivery of the same event can win the guarded update;
        // re-reading then sees the terminal payment and reports a duplicate.
        let mut attempt = 0;
        let step = loop {
            attempt += 1;
            let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
            match self.reconcile_in(&txn, event, raw_payload, known.take()).await {
                Ok(step) => {
                    txn.commit().await.map_err(ServiceError::db_error)?;
                    break step;
                }
                Err(ServiceError::ConcurrentModification(id)) if attempt < MAX_APPLY_ATTEMPTS => {
                    txn.rollback().await.map_err(ServiceError::db_error)?;
                    debug!(%id, attempt, "Retrying gateway event after concurrent update");
                }
                Err(e) => return Err(e),
            }
        };

        match step {
            Step::Done(outcome, events) => {
                let label = match &outcome {
                    ReconcileOutcome::Applied { .. } => "applied",
                    ReconcileOutcome::Duplicate { .. } => "duplicate",
                    ReconcileOutcome::Ignored { .. } => "ignored",
                };
                counter!("pharmacy.reconciliation.events", 1, "result" => label);
                for e in events {
                    self.events.send_or_log(e);
                }
                Ok(outcome)
            }
            Step::Flagged(err) => {
                counter!("pharmacy.reconciliation.events", 1, "result" => "flagged");
                Err(err)
            }
        }
    }

    async fn reconcile_in<C>(
        &self,
        conn: &C,
        event: &GatewayEvent,
        raw_payload: Option<&str>,
        known: Option<payment::Model>,
    ) -> Result<Step, ServiceError>
    where
        C: ConnectionTrait,
    {
        let payment = match known {
            Some(payment) => Some(payment),
            None => payment::Entity::find()
                .filter(payment::Column::ExternalReference.eq(event.reference_id.as_str()))
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?,
        };
        let Some(payment) = payment else {
            warn!("Gateway event for unknown reference");
            record_issue(
                conn,
                NewIssue {
                    kind: IssueKind::UnknownReference,
                    payment_id: None,
                    order_id: None,
                    external_reference: Some(event.reference_id.clone()),
                    detail: format!("no payment with reference {}", event.reference_id),
                    payload: raw_payload.map(str::to_string),
                },
            )
            .await?;
            return Ok(Step::Flagged(ServiceError::NotFound(format!(
                "Payment with reference {} not found",
                event.reference_id
            ))));
        };

        if !amount_matches(&payment, event.amount, &event.currency) {
            let detail = format!(
                "expected {} {}, gateway reported {} {}",
                payment.amount, payment.currency, event.amount, event.currency
            );
            warn!(payment_id = %payment.id, %detail, "Gateway amount mismatch");
            record_issue(
                conn,
                NewIssue {
                    kind: IssueKind::AmountMismatch,
                    payment_id: Some(payment.id),
                    order_id: Some(payment.order_id),
                    external_reference: Some(event.reference_id.clone()),
                    detail: detail.clone(),
                    payload: raw_payload.map(str::to_string),
                },
            )
            .await?;
            return Ok(Step::Flagged(ServiceError::AmountMismatch(detail)));
        }

        if payment.status.is_terminal() {
            return self
                .on_terminal_payment(conn, &payment, event, raw_payload)
                .await;
        }

        let applied = apply_outcome(conn, &payment, event.outcome, self.policy, None).await?;
        Ok(Step::Done(
            ReconcileOutcome::Applied {
                payment_id: applied.payment.id,
                order_id: applied.order.id,
                order_status: applied.order.status,
            },
            applied.events,
        ))
    }

    async fn on_terminal_payment<C>(
        &self,
        conn: &C,
        payment: &payment::Model,
        event: &GatewayEvent,
        raw_payload: Option<&str>,
    ) -> Result<Step, ServiceError>
    where
        C: ConnectionTrait,
    {
        let same = matches!(
            (payment.status, event.outcome),
            (PaymentStatus::Paid, GatewayOutcome::Paid)
                | (PaymentStatus::Failed, GatewayOutcome::Failed)
                | (PaymentStatus::Cancelled, GatewayOutcome::Failed)
        );
        if same {
            info!(payment_id = %payment.id, "Duplicate gateway event ignored");
            return Ok(Step::Done(
                ReconcileOutcome::Duplicate {
                    payment_id: payment.id,
                },
                Vec::new(),
            ));
        }

        // Money captured for a payment we already gave up on needs a refund decision.
        let kind = if event.outcome == GatewayOutcome::Paid {
            IssueKind::LatePayment
        } else {
            IssueKind::ConflictingEvent
        };
        warn!(payment_id = %payment.id, status = %payment.status, ?kind, "Conflicting gateway event");
        record_issue(
            conn,
            NewIssue {
                kind,
                payment_id: Some(payment.id),
                order_id: Some(payment.order_id),
                external_reference: Some(event.reference_id.clone()),
                detail: format!(
                    "payment is {} but gateway reported {:?}",
                    payment.status, event.outcome
                ),
                payload: raw_payload.map(str::to_string),
            },
        )
        .await?;

        Ok(Step::Done(
            ReconcileOutcome::Ignored {
                payment_id: payment.id,
            },
            Vec::new(),
        ))
    }

    /// Client poll. Asks the gateway for the source status and feeds a
    /// terminal answer through the webhook path.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn verify(
        &self,
        identity: &Identity,
        reference_id: &str,
    ) -> Result<VerifyResult, ServiceError> {
        let db = &*self.db;
        let payment = find_by_reference(db, reference_id).await?;
        let order = order::Entity::find_by_id(payment.order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|o| identity.can_access(o.user_id))
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment with reference {} not found", reference_id))
            })?;

        let mut gateway_status = None;
        if !payment.status.is_terminal() {
            let state = self.gateway.retrieve_source(reference_id).await?;
            gateway_status = Some(state.status);
            let outcome = match state.status {
                GatewaySourceStatus::Chargeable
                    if amount_matches(&payment, state.amount, &state.currency) =>
                {
                    self.gateway.capture_source(&state).await?
                }
                // Authorized for a different amount: never captured, flagged below.
                GatewaySourceStatus::Chargeable => Some(GatewayOutcome::Paid),
                other => other.outcome(),
            };
            if let Some(outcome) = outcome {
                let event = GatewayEvent {
                    event_id: None,
                    outcome,
                    reference_id: reference_id.to_string(),
                    amount: state.amount,
                    currency: state.currency,
                };
                self.apply_event(&event, None, Some(payment.clone())).await?;
            }
        }

        let payment = find_by_reference(db, reference_id).await?;
        let order = order::Entity::find_by_id(order.id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))?;

        Ok(VerifyResult {
            reference_id: reference_id.to_string(),
            payment_id: payment.id,
            order_id: order.id,
            payment_status: payment.status,
            order_status: order.status,
            gateway_status,
        })
    }

    pub async fn list_issues(
        &self,
        identity: &Identity,
        include_resolved: bool,
    ) -> Result<Vec<reconciliation_issue::Model>, ServiceError> {
        identity.require_admin()?;
        let mut query = reconciliation_issue::Entity::find()
            .order_by_desc(reconciliation_issue::Column::CreatedAt);
        if !include_resolved {
            query = query.filter(reconciliation_issue::Column::Resolved.eq(false));
        }
        query.all(&*self.db).await.map_err(ServiceError::db_error)
    }

    /// Records an issue outside any unit of work (e.g. bad webhook signature).
    pub async fn flag(&self, issue: NewIssue) -> Result<(), ServiceError> {
        record_issue(&*self.db, issue).await
    }
}

async fn find_by_reference<C>(conn: &C, reference_id: &str) -> Result<payment::Model, ServiceError>
where
    C: ConnectionTrait,
{
    payment::Entity::find()
        .filter(payment::Column::ExternalReference.eq(reference_id))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Payment with reference {} not found", reference_id))
        })
}

/// Gateway-reported money agrees with what the payment expects.
fn amount_matches(payment: &payment::Model, amount: Decimal, currency: &str) -> bool {
    round_money(payment.amount) == round_money(amount)
        && payment.currency.eq_ignore_ascii_case(currency.trim())
}

#[derive(Debug, Clone)]
pub struct NewIssue {
    pub kind: IssueKind,
    pub payment_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub external_reference: Option<String>,
    pub detail: String,
    pub payload: Option<String>,
}

/// Queues an issue for review. An identical unresolved issue for the same
/// payment (or, without one, the same reference) is not queued twice, so
/// repeated polls and redeliveries do not grow the queue.
pub async fn record_issue<C>(conn: &C, issue: NewIssue) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let subject = match (issue.payment_id, issue.external_reference.as_deref()) {
        (Some(payment_id), _) => Some(reconciliation_issue::Column::PaymentId.eq(payment_id)),
        (None, Some(reference)) => {
            Some(reconciliation_issue::Column::ExternalReference.eq(reference))
        }
        (None, None) => None,
    };
    if let Some(subject) = subject {
        let open = reconciliation_issue::Entity::find()
            .filter(subject)
            .filter(reconciliation_issue::Column::Kind.eq(issue.kind))
            .filter(reconciliation_issue::Column::Detail.eq(issue.detail.as_str()))
            .filter(reconciliation_issue::Column::Resolved.eq(false))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if open.is_some() {
            debug!(kind = %issue.kind, "Reconciliation issue already queued");
            return Ok(());
        }
    }

    counter!("pharmacy.reconciliation.issues", 1, "kind" => issue.kind.to_string());
    reconciliation_issue::Entity::insert(reconciliation_issue::ActiveModel {
        id: Set(Uuid::new_v4()),
        payment_id: Set(issue.payment_id),
        order_id: Set(issue.order_id),
        external_reference: Set(issue.external_reference),
        kind: Set(issue.kind),
        detail: Set(issue.detail),
        payload: Set(issue.payload),
        resolved: Set(false),
        created_at: Set(Utc::now()),
    })
    .exec_without_returning(conn)
    .await
    .map_err(ServiceError::db_error)?;
    Ok(())
}

/// Moves a non-terminal payment to `paid` or `failed` and drives its order
/// accordingly, inside the caller's unit of work.
///
/// `paid`: order goes `payment_submitted -> payment_approved -> processing`
/// (and on to `completed` under that fulfillment policy), the cart is cleared
/// and a first tracking entry written.
/// `failed`: order goes `payment_submitted -> payment_failed -> pending_payment`;
/// reserved stock is kept for the retry.
pub(crate) async fn apply_outcome<C>(
    conn: &C,
    payment: &payment::Model,
    outcome: GatewayOutcome,
    policy: FulfillmentPolicy,
    reason: Option<&str>,
) -> Result<AppliedPayment, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let (status, paid_at) = match outcome {
        GatewayOutcome::Paid => (PaymentStatus::Paid, Some(now)),
        GatewayOutcome::Failed => (PaymentStatus::Failed, None),
    };

    let result = payment::Entity::update_many()
        .col_expr(payment::Column::Status, Expr::value(status))
        .col_expr(payment::Column::PaidAt, Expr::value(paid_at))
        .col_expr(
            payment::Column::FailureReason,
            Expr::value(reason.map(str::to_string)),
        )
        .col_expr(payment::Column::UpdatedAt, Expr::value(now))
        .filter(payment::Column::Id.eq(payment.id))
        .filter(payment::Column::Status.is_in(PaymentStatus::active()))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(payment.id));
    }

    let order = order::Entity::find_by_id(payment.order_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", payment.order_id)))?;

    let mut events = Vec::new();
    let order = match outcome {
        GatewayOutcome::Paid => {
            let mut path = vec![OrderStatus::PaymentApproved, OrderStatus::Processing];
            if policy == FulfillmentPolicy::Completed {
                path.push(OrderStatus::Completed);
            }
            let order =
                order_state::transition_path(conn, &order, &path, Some("payment confirmed"))
                    .await?;

            cart_item::Entity::delete_many()
                .filter(cart_item::Column::UserId.eq(order.user_id))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;

            shipment_tracking::Entity::insert(shipment_tracking::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                status: Set("order_confirmed".to_string()),
                description: Set("Payment received, order is being prepared".to_string()),
                created_at: Set(now),
            })
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;

            events.push(Event::PaymentConfirmed {
                order_id: order.id,
                payment_id: payment.id,
                amount: payment.amount,
            });
            events.push(Event::CartCleared {
                user_id: order.user_id,
                order_id: order.id,
            });
            order
        }
        GatewayOutcome::Failed => {
            let order = order_state::transition_path(
                conn,
                &order,
                &[OrderStatus::PaymentFailed, OrderStatus::PendingPayment],
                reason.or(Some("payment failed")),
            )
            .await?;
            events.push(Event::PaymentRejected {
                order_id: order.id,
                payment_id: payment.id,
                reason: reason.map(str::to_string),
            });
            order
        }
    };

    info!(payment_id = %payment.id, order_id = %order.id, status = %order.status, "Payment outcome applied");

    Ok(AppliedPayment {
        payment: payment::Model {
            status,
            paid_at,
            failure_reason: reason.map(str::to_string),
            updated_at: now,
            ..payment.clone()
        },
        order,
        events,
    })
}
