pub mod cart;
pub mod cart_item;
pub mod marketplace_token;
pub mod order;
pub mod order_item;

pub use cart_item::{SellerOffer, SellerOffers};
pub use order::{AddressSnapshot, OrderStatus, PaymentStatus};
pub use order_item::SellerData;
