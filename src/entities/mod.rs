pub mod cart_item;
pub mod coupon;
pub mod inventory_ledger;
pub mod medicine;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod reconciliation_issue;
pub mod shipment_tracking;
pub mod shipping_method;
pub mod tax_rate;
