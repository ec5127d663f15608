pub mod catalog;
pub mod checkout;
pub mod gateway;
pub mod inventory_ledger;
pub mod order_state;
pub mod orders;
pub mod payments;
pub mod pricing;
pub mod reconciliation;
