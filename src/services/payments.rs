use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::Identity,
    config::FulfillmentPolicy,
    entities::{
        order::{self, OrderStatus},
        payment::{self, PaymentMethod, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        gateway::{CreateSourceRequest, GatewayOutcome, GatewaySource, PaymentGateway},
        order_state,
        pricing::round_money,
        reconciliation::{self, ReconcileOutcome},
    },
};

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub max_attempts: u32,
    pub fulfillment_policy: FulfillmentPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GatewayPaymentCreated {
    pub payment_id: Uuid,
    pub source_id: String,
    pub checkout_url: String,
}

#[derive(Debug, Clone)]
pub struct ProofSubmission {
    pub order_id: Uuid,
    pub reference_number: String,
    pub proof_url: Option<String>,
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    events: EventSender,
    settings: PaymentSettings,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        events: EventSender,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            events,
            settings,
        }
    }

    /// Opens a gateway payment and returns the redirect for the customer.
    ///
    /// The payment row and the `payment_submitted` transition commit before
    /// the gateway is called. If the gateway call fails the payment is marked
    /// failed and the order returns to `pending_payment`.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn create_gateway_payment(
        &self,
        identity: &Identity,
        order_id: Uuid,
        amount: Decimal,
    ) -> Result<GatewayPaymentCreated, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = self.payable_order(&txn, identity, order_id).await?;
        if round_money(amount) != order.total_amount {
            return Err(ServiceError::ValidationError(format!(
                "amount {} does not match order total {}",
                amount, order.total_amount
            )));
        }
        let payment = insert_payment(&txn, &order, PaymentMethod::Gateway, None, None).await?;
        order_state::transition(
            &txn,
            &order,
            OrderStatus::PaymentSubmitted,
            Some("gateway payment started"),
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        let request = CreateSourceRequest {
            amount: payment.amount,
            currency: payment.currency.clone(),
            order_id: order.id,
            order_number: order.order_number.clone(),
            payment_id: payment.id,
        };

        let source = match self.gateway.create_source(&request).await {
            Ok(source) => source,
            Err(err) => {
                error!(payment_id = %payment.id, error = %err, "Gateway source creation failed");
                counter!("pharmacy.payments.gateway_failures", 1);
                let reason = format!("gateway source creation failed: {}", err);
                self.revert_failed_start(&payment, &reason).await;
                return Err(err);
            }
        };

        // The source exists at the gateway but the payment cannot point at it;
        // without a reference no webhook can settle it, so the start is undone.
        if let Err(err) = record_source(&*self.db, &payment, &source).await {
            error!(payment_id = %payment.id, source_id = %source.source_id, error = %err, "Could not record gateway source");
            let reason = format!("gateway source {} could not be recorded: {}", source.source_id, err);
            self.revert_failed_start(&payment, &reason).await;
            return Err(err);
        }

        counter!("pharmacy.payments.created", 1, "method" => "gateway");
        info!(payment_id = %payment.id, source_id = %source.source_id, "Gateway payment opened");
        self.events
            .send_or_log(Event::PaymentSubmitted {
                order_id: order.id,
                payment_id: payment.id,
            });

        Ok(GatewayPaymentCreated {
            payment_id: payment.id,
            source_id: source.source_id,
            checkout_url: source.checkout_url,
        })
    }

    /// Marks a payment whose start could not complete as failed and returns
    /// the order to `pending_payment`.
    async fn revert_failed_start(&self, payment: &payment::Model, reason: &str) {
        if let Err(err) = self.try_revert_start(payment, reason).await {
            error!(payment_id = %payment.id, error = %err, "Could not revert payment start");
        }
    }

    async fn try_revert_start(
        &self,
        payment: &payment::Model,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        reconciliation::apply_outcome(
            &txn,
            payment,
            GatewayOutcome::Failed,
            self.settings.fulfillment_policy,
            Some(reason),
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Records a manually uploaded proof of payment for admin review.
    #[instrument(skip(self, identity, submission), fields(user_id = %identity.user_id, order_id = %submission.order_id))]
    pub async fn submit_proof(
        &self,
        identity: &Identity,
        submission: ProofSubmission,
    ) -> Result<payment::Model, ServiceError> {
        let reference = submission.reference_number.trim();
        if reference.is_empty() {
            return Err(ServiceError::ValidationError(
                "reference number is required".to_string(),
            ));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let order = self
            .payable_order(&txn, identity, submission.order_id)
            .await?;
        let payment = insert_payment(
            &txn,
            &order,
            PaymentMethod::ManualProof,
            Some(reference.to_string()),
            submission.proof_url.clone(),
        )
        .await?;
        order_state::transition(
            &txn,
            &order,
            OrderStatus::PaymentSubmitted,
            Some("proof of payment submitted"),
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("pharmacy.payments.created", 1, "method" => "manual_proof");
        info!(payment_id = %payment.id, "Proof of payment recorded");
        self.events
            .send_or_log(Event::PaymentSubmitted {
                order_id: order.id,
                payment_id: payment.id,
            });
        Ok(payment)
    }

    /// Admin approval of a manual proof; same effect as a gateway `paid`.
    pub async fn approve(
        &self,
        identity: &Identity,
        payment_id: Uuid,
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.review(identity, payment_id, GatewayOutcome::Paid, None)
            .await
    }

    /// Admin rejection of a manual proof; same effect as a gateway `failed`.
    pub async fn reject(
        &self,
        identity: &Identity,
        payment_id: Uuid,
        reason: Option<String>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        self.review(identity, payment_id, GatewayOutcome::Failed, reason)
            .await
    }

    #[instrument(skip(self, identity, reason), fields(admin_id = %identity.user_id))]
    async fn review(
        &self,
        identity: &Identity,
        payment_id: Uuid,
        outcome: GatewayOutcome,
        reason: Option<String>,
    ) -> Result<ReconcileOutcome, ServiceError> {
        identity.require_admin()?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let payment = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;

        if payment.method != PaymentMethod::ManualProof {
            return Err(ServiceError::ValidationError(
                "gateway payments are settled by the gateway".to_string(),
            ));
        }

        if payment.status.is_terminal() {
            let repeated = matches!(
                (payment.status, outcome),
                (PaymentStatus::Paid, GatewayOutcome::Paid)
                    | (PaymentStatus::Failed, GatewayOutcome::Failed)
            );
            return if repeated {
                Ok(ReconcileOutcome::Duplicate {
                    payment_id: payment.id,
                })
            } else {
                Err(ServiceError::InvalidStateTransition(format!(
                    "payment {} is already {}",
                    payment.id, payment.status
                )))
            };
        }

        let applied = reconciliation::apply_outcome(
            &txn,
            &payment,
            outcome,
            self.settings.fulfillment_policy,
            reason.as_deref(),
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        for event in applied.events {
            self.events.send_or_log(event);
        }
        Ok(ReconcileOutcome::Applied {
            payment_id: applied.payment.id,
            order_id: applied.order.id,
            order_status: applied.order.status,
        })
    }

    /// Loads an order the caller may pay for right now.
    async fn payable_order<C>(
        &self,
        conn: &C,
        identity: &Identity,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError>
    where
        C: ConnectionTrait,
    {
        let order = order::Entity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .filter(|o| identity.can_access(o.user_id))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.status != OrderStatus::PendingPayment {
            return Err(ServiceError::OrderNotPayable(format!(
                "order {} is {}",
                order.id, order.status
            )));
        }

        let active = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.is_in(PaymentStatus::active()))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if active > 0 {
            return Err(ServiceError::OrderNotPayable(format!(
                "order {} already has a payment in progress",
                order.id
            )));
        }

        let attempts = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if attempts >= u64::from(self.settings.max_attempts) {
            warn!(order_id = %order.id, attempts, "Payment attempt limit reached");
            return Err(ServiceError::OrderNotPayable(format!(
                "order {} reached the limit of {} payment attempts",
                order.id, self.settings.max_attempts
            )));
        }

        Ok(order)
    }
}

/// Points a pending gateway payment at its source and moves it to `processing`.
async fn record_source<C>(
    conn: &C,
    payment: &payment::Model,
    source: &GatewaySource,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let result = payment::Entity::update_many()
        .col_expr(
            payment::Column::ExternalReference,
            Expr::value(Some(source.source_id.clone())),
        )
        .col_expr(
            payment::Column::CheckoutUrl,
            Expr::value(Some(source.checkout_url.clone())),
        )
        .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Processing))
        .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(payment::Column::Id.eq(payment.id))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(payment.id));
    }
    Ok(())
}

async fn insert_payment<C>(
    conn: &C,
    order: &order::Model,
    method: PaymentMethod,
    reference_number: Option<String>,
    proof_url: Option<String>,
) -> Result<payment::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let model = payment::Model {
        id: Uuid::new_v4(),
        order_id: order.id,
        amount: order.total_amount,
        currency: order.currency.clone(),
        method,
        external_reference: None,
        reference_number,
        proof_url,
        checkout_url: None,
        status: PaymentStatus::Pending,
        failure_reason: None,
        created_at: now,
        updated_at: now,
        paid_at: None,
    };

    payment::Entity::insert(payment::ActiveModel {
        id: Set(model.id),
        order_id: Set(model.order_id),
        amount: Set(model.amount),
        currency: Set(model.currency.clone()),
        method: Set(model.method),
        external_reference: Set(None),
        reference_number: Set(model.reference_number.clone()),
        proof_url: Set(model.proof_url.clone()),
        checkout_url: Set(None),
        status: Set(model.status),
        failure_reason: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        paid_at: Set(None),
    })
    .exec_without_returning(conn)
    .await
    .map_err(ServiceError::db_error)?;

    Ok(model)
}
