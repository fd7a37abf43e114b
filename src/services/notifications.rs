use crate::{config::EmailConfig, services::orders::OrderDetail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Email transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Email provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound order notifications. Callers treat delivery as fire-and-forget:
/// failures are logged, never propagated into the order flow.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn send_order_confirmation(&self, order: &OrderDetail) -> Result<(), NotificationError>;
    async fn send_order_cancelled(&self, order: &OrderDetail) -> Result<(), NotificationError>;
    async fn send_order_dispatched(&self, order: &OrderDetail) -> Result<(), NotificationError>;
    async fn send_order_delivered(&self, order: &OrderDetail) -> Result<(), NotificationError>;
}

/// Notifier that POSTs rendered messages to a transactional-email HTTP
/// endpoint.
pub struct EmailNotifier {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    from_address: String,
}

impl EmailNotifier {
    pub fn new(endpoint: String, config: &EmailConfig) -> Result<Self, NotificationError> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
        })
    }

    #[instrument(skip(self, order, subject, body), fields(order_number = %order.order.order_number))]
    async fn deliver(
        &self,
        order: &OrderDetail,
        subject: String,
        body: String,
    ) -> Result<(), NotificationError> {
        let mut request = self.http.post(&self.endpoint).json(&json!({
            "from": self.from_address,
            "to": order.order.shipping_address.email,
            "subject": subject,
            "text": body,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!("Notification delivered");
        Ok(())
    }
}

#[async_trait]
impl OrderNotifier for EmailNotifier {
    async fn send_order_confirmation(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        let subject = format!("Order {} confirmed", order.order.order_number);
        self.deliver(order, subject, render_summary(order, "Thank you for your order!"))
            .await
    }

    async fn send_order_cancelled(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        let subject = format!("Order {} cancelled", order.order.order_number);
        self.deliver(order, subject, render_summary(order, "Your order has been cancelled."))
            .await
    }

    async fn send_order_dispatched(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        let subject = format!("Order {} dispatched", order.order.order_number);
        self.deliver(order, subject, render_summary(order, "Your order is on its way."))
            .await
    }

    async fn send_order_delivered(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        let subject = format!("Order {} delivered", order.order.order_number);
        self.deliver(order, subject, render_summary(order, "Your order has been delivered."))
            .await
    }
}

fn render_summary(order: &OrderDetail, heading: &str) -> String {
    let mut body = format!(
        "{}\n\nOrder {}\n",
        heading, order.order.order_number
    );
    for item in &order.items {
        body.push_str(&format!(
            "  {} x{} @ {} {}\n",
            item.name, item.quantity, item.unit_price, order.order.currency
        ));
    }
    body.push_str(&format!(
        "\nTotal: {} {}\n",
        order.order.total_amount, order.order.currency
    ));
    body
}

/// Notifier used when no email endpoint is configured.
pub struct NoopNotifier;

#[async_trait]
impl OrderNotifier for NoopNotifier {
    async fn send_order_confirmation(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        debug!(order_number = %order.order.order_number, "Email disabled; skipping confirmation");
        Ok(())
    }

    async fn send_order_cancelled(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        debug!(order_number = %order.order.order_number, "Email disabled; skipping cancellation notice");
        Ok(())
    }

    async fn send_order_dispatched(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        debug!(order_number = %order.order.order_number, "Email disabled; skipping dispatch notice");
        Ok(())
    }

    async fn send_order_delivered(&self, order: &OrderDetail) -> Result<(), NotificationError> {
        debug!(order_number = %order.order.order_number, "Email disabled; skipping delivery notice");
        Ok(())
    }
}
