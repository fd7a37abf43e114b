pub mod carts;
pub mod fulfillment;
pub mod marketplace;
pub mod notifications;
pub mod orders;
pub mod webhooks;
