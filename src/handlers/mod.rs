use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    services::{
        carts::CartService,
        fulfillment::FulfillmentService,
        marketplace::MarketplaceClient,
        notifications::OrderNotifier,
        orders::OrderService,
        webhooks::WebhookService,
    },
};
use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub mod carts;
pub mod common;
pub mod orders;
pub mod payment_webhooks;

pub use crate::AppState;

/// Service container shared by every handler through `AppState`.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub marketplace: Arc<MarketplaceClient>,
    pub fulfillment: Arc<FulfillmentService>,
    pub webhooks: Arc<WebhookService>,
    pub notifier: Arc<dyn OrderNotifier>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        notifier: Arc<dyn OrderNotifier>,
    ) -> Result<Self, ServiceError> {
        let carts = Arc::new(CartService::new(db.clone(), event_sender.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            config.default_currency.clone(),
        ));
        let marketplace = Arc::new(MarketplaceClient::new(db, &config.marketplace)?);
        let fulfillment = Arc::new(FulfillmentService::new(
            marketplace.clone(),
            orders.clone(),
            notifier.clone(),
            event_sender,
        ));
        let webhooks = Arc::new(WebhookService::new(
            orders.clone(),
            fulfillment.clone(),
            config.payment_provider.clone(),
        ));

        Ok(Self {
            carts,
            orders,
            marketplace,
            fulfillment,
            webhooks,
            notifier,
        })
    }
}

/// All v1 API routes, to be nested under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(carts::routes())
        .merge(orders::routes())
        .merge(payment_webhooks::routes())
}
