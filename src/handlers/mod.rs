pub mod admin;
pub mod checkout;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    config::AppConfig,
    events::EventSender,
    services::{
        checkout::CheckoutService,
        gateway::PaymentGateway,
        orders::OrderService,
        payments::{PaymentService, PaymentSettings},
        reconciliation::ReconciliationEngine,
    },
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciliation: Arc<ReconciliationEngine>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        events: EventSender,
        config: &AppConfig,
    ) -> Self {
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            events.clone(),
            config.currency.clone(),
        ));
        let orders = Arc::new(OrderService::new(db.clone(), events.clone()));
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            gateway.clone(),
            events.clone(),
            PaymentSettings {
                max_attempts: config.max_payment_attempts,
                fulfillment_policy: config.fulfillment_policy,
            },
        ));
        let reconciliation = Arc::new(ReconciliationEngine::new(
            db,
            gateway,
            events,
            config.fulfillment_policy,
        ));

        Self {
            checkout,
            orders,
            payments,
            reconciliation,
        }
    }
}
