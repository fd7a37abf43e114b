use crate::{
    entities::order::{OrderStatus, PaymentStatus},
    errors::ServiceError,
    services::fulfillment::{FulfillmentError, FulfillmentService},
    services::orders::{OrderService, PaymentUpdate},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Payment gateway event envelope (Stripe wire shape)
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: GatewayEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEventData {
    pub object: GatewayObject,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: GatewayMetadata,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub payment_method_types: Option<Vec<String>>,
    #[serde(default)]
    pub last_payment_error: Option<GatewayErrorDetail>,
}

/// Metadata our checkout flow stamps onto every gateway session
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayMetadata {
    #[serde(default, rename = "orderNumber")]
    pub order_number: Option<String>,
    #[serde(default, rename = "orderId")]
    pub order_id: Option<String>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

/// What a recognized gateway event does to the order
pub(crate) struct Reconciliation {
    pub update: PaymentUpdate,
    pub trigger_fulfillment: bool,
}

/// Maps a gateway event type onto an order update. `None` means the event
/// type is not one we act on.
pub(crate) fn reconcile(
    event_type: &str,
    object: &GatewayObject,
    provider: &str,
) -> Option<Reconciliation> {
    let payment_id = object.payment_intent.clone().or_else(|| object.id.clone());
    // The gateway reports the instrument ("card", "sepa_debit", ...); fall
    // back to the provider name when the event omits it
    let payment_method = object
        .payment_method_types
        .as_ref()
        .and_then(|types| types.first().cloned())
        .unwrap_or_else(|| provider.to_string());
    let failure_note = object
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone())
        .map(|m| format!("Payment failed: {}", m));

    match event_type {
        // The one event that proves the customer paid; kicks off fulfillment
        "checkout.session.completed" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Paid,
                status: Some(OrderStatus::Processing),
                payment_method: Some(payment_method),
                payment_id,
                admin_note: None,
            },
            trigger_fulfillment: true,
        }),
        // Delayed methods (bank transfer and the like) confirm later; the
        // completed event for these sessions already triggered fulfillment
        "checkout.session.async_payment_succeeded" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Paid,
                status: Some(OrderStatus::Processing),
                payment_method: Some(payment_method),
                payment_id,
                admin_note: None,
            },
            trigger_fulfillment: false,
        }),
        "checkout.session.async_payment_failed" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Failed,
                status: Some(OrderStatus::Cancelled),
                payment_method: None,
                payment_id,
                admin_note: failure_note
                    .or_else(|| Some("Delayed payment failed".to_string())),
            },
            trigger_fulfillment: false,
        }),
        "checkout.session.expired" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Expired,
                status: Some(OrderStatus::Cancelled),
                payment_method: None,
                payment_id,
                admin_note: Some("Checkout session expired before payment".to_string()),
            },
            trigger_fulfillment: false,
        }),
        "payment_intent.succeeded" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Paid,
                status: Some(OrderStatus::Processing),
                payment_method: Some(payment_method),
                payment_id,
                admin_note: None,
            },
            trigger_fulfillment: false,
        }),
        "payment_intent.payment_failed" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Failed,
                status: Some(OrderStatus::Cancelled),
                payment_method: None,
                payment_id,
                admin_note: failure_note,
            },
            trigger_fulfillment: false,
        }),
        "charge.succeeded" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Paid,
                status: None,
                payment_method: Some(payment_method),
                payment_id,
                admin_note: None,
            },
            trigger_fulfillment: false,
        }),
        "charge.refunded" => Some(Reconciliation {
            update: PaymentUpdate {
                payment_status: PaymentStatus::Refunded,
                status: Some(OrderStatus::Refunded),
                payment_method: None,
                payment_id,
                admin_note: None,
            },
            trigger_fulfillment: false,
        }),
        _ => None,
    }
}

/// Payment webhook reconciler.
///
/// Applies gateway events onto orders by the order number carried in event
/// metadata. Events for unknown orders or of unhandled types are logged and
/// acknowledged; failing them would only make the gateway redeliver.
pub struct WebhookService {
    orders: Arc<OrderService>,
    fulfillment: Arc<FulfillmentService>,
    provider: String,
}

impl WebhookService {
    pub fn new(
        orders: Arc<OrderService>,
        fulfillment: Arc<FulfillmentService>,
        provider: String,
    ) -> Self {
        Self {
            orders,
            fulfillment,
            provider,
        }
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = ?event.id))]
    pub async fn handle_event(&self, event: GatewayEvent) -> Result<(), ServiceError> {
        let object = &event.data.object;

        let Some(reconciliation) = reconcile(&event.event_type, object, &self.provider) else {
            info!("Ignoring unhandled gateway event type");
            return Ok(());
        };

        let Some(order_number) = object.metadata.order_number.clone() else {
            warn!("Gateway event carries no order number; acknowledging without action");
            return Ok(());
        };

        let trigger_fulfillment = reconciliation.trigger_fulfillment;
        let Some(order) = self
            .orders
            .mark_payment(&order_number, reconciliation.update)
            .await?
        else {
            warn!(%order_number, "Gateway event references an unknown order");
            return Ok(());
        };

        info!(%order_number, status = %order.status, "Gateway event reconciled");

        if trigger_fulfillment {
            // Fulfillment failures must not fail the webhook: the gateway
            // would redeliver, and the order is already marked paid. A
            // stuck `processing` order is the operator's retry signal.
            match self.fulfillment.process_order(order.id).await {
                Ok(report) => {
                    info!(
                        order_id = %order.id,
                        upstream_order_qid = %report.upstream_order_qid,
                        "Fulfillment completed from webhook"
                    );
                }
                Err(
                    FulfillmentError::AlreadyInFlight(_)
                    | FulfillmentError::AlreadyFulfilled { .. },
                ) => {
                    info!(order_id = %order.id, "Fulfillment already done or running; webhook replay ignored");
                }
                Err(e) => {
                    error!(order_id = %order.id, "Fulfillment from webhook failed: {}", e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> GatewayEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_checkout_completed_event() {
        let event = parse(json!({
            "id": "evt_123",
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "payment_intent": "pi_456",
                    "metadata": {
                        "orderNumber": "ORD-20260301-00042",
                        "userId": "a-user"
                    }
                }
            }
        }));

        assert_eq!(event.event_type, "checkout.session.completed");
        assert_eq!(
            event.data.object.metadata.order_number.as_deref(),
            Some("ORD-20260301-00042")
        );
        assert_eq!(event.data.object.payment_intent.as_deref(), Some("pi_456"));
    }

    #[test]
    fn completed_session_marks_paid_and_triggers_fulfillment() {
        let object = GatewayObject {
            id: Some("cs_1".into()),
            payment_intent: Some("pi_1".into()),
            ..Default::default()
        };
        let rec = reconcile("checkout.session.completed", &object, "stripe").unwrap();

        assert!(rec.trigger_fulfillment);
        assert_eq!(rec.update.payment_status, PaymentStatus::Paid);
        assert_eq!(rec.update.status, Some(OrderStatus::Processing));
        assert_eq!(rec.update.payment_method.as_deref(), Some("stripe"));
        assert_eq!(rec.update.payment_id.as_deref(), Some("pi_1"));
    }

    #[test]
    fn expired_session_cancels_order() {
        let rec =
            reconcile("checkout.session.expired", &GatewayObject::default(), "stripe").unwrap();

        assert!(!rec.trigger_fulfillment);
        assert_eq!(rec.update.payment_status, PaymentStatus::Expired);
        assert_eq!(rec.update.status, Some(OrderStatus::Cancelled));
    }

    #[test]
    fn payment_failure_records_gateway_message() {
        let object = GatewayObject {
            last_payment_error: Some(GatewayErrorDetail {
                message: Some("card declined".into()),
            }),
            ..Default::default()
        };
        let rec = reconcile("payment_intent.payment_failed", &object, "stripe").unwrap();

        assert_eq!(rec.update.payment_status, PaymentStatus::Failed);
        assert_eq!(rec.update.status, Some(OrderStatus::Cancelled));
        assert_eq!(
            rec.update.admin_note.as_deref(),
            Some("Payment failed: card declined")
        );
    }

    #[test]
    fn payment_intent_success_moves_order_to_processing() {
        let object = GatewayObject {
            id: Some("pi_9".into()),
            ..Default::default()
        };
        let rec = reconcile("payment_intent.succeeded", &object, "stripe").unwrap();

        assert!(!rec.trigger_fulfillment);
        assert_eq!(rec.update.payment_status, PaymentStatus::Paid);
        assert_eq!(rec.update.status, Some(OrderStatus::Processing));
    }

    #[test]
    fn async_payment_success_marks_paid_without_refulfilling() {
        let object = GatewayObject {
            payment_intent: Some("pi_bank".into()),
            ..Default::default()
        };
        let rec =
            reconcile("checkout.session.async_payment_succeeded", &object, "stripe").unwrap();

        assert!(!rec.trigger_fulfillment);
        assert_eq!(rec.update.payment_status, PaymentStatus::Paid);
        assert_eq!(rec.update.status, Some(OrderStatus::Processing));
        assert_eq!(rec.update.payment_id.as_deref(), Some("pi_bank"));
    }

    #[test]
    fn async_payment_failure_cancels_with_note() {
        let rec = reconcile(
            "checkout.session.async_payment_failed",
            &GatewayObject::default(),
            "stripe",
        )
        .unwrap();

        assert_eq!(rec.update.payment_status, PaymentStatus::Failed);
        assert_eq!(rec.update.status, Some(OrderStatus::Cancelled));
        assert_eq!(rec.update.admin_note.as_deref(), Some("Delayed payment failed"));
    }

    #[test]
    fn charge_success_stores_reference_without_status_change() {
        let object = GatewayObject {
            id: Some("ch_7".into()),
            ..Default::default()
        };
        let rec = reconcile("charge.succeeded", &object, "stripe").unwrap();

        assert_eq!(rec.update.payment_status, PaymentStatus::Paid);
        assert_eq!(rec.update.status, None);
        assert_eq!(rec.update.payment_id.as_deref(), Some("ch_7"));
    }

    #[test]
    fn payment_method_comes_from_gateway_types() {
        let object = GatewayObject {
            payment_method_types: Some(vec!["sepa_debit".into(), "card".into()]),
            ..Default::default()
        };
        let rec = reconcile("checkout.session.completed", &object, "stripe").unwrap();
        assert_eq!(rec.update.payment_method.as_deref(), Some("sepa_debit"));
    }

    #[test]
    fn refund_moves_order_to_refunded() {
        let rec = reconcile("charge.refunded", &GatewayObject::default(), "stripe").unwrap();
        assert_eq!(rec.update.payment_status, PaymentStatus::Refunded);
        assert_eq!(rec.update.status, Some(OrderStatus::Refunded));
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        assert!(reconcile("customer.created", &GatewayObject::default(), "stripe").is_none());
    }

    #[test]
    fn payment_id_falls_back_to_object_id() {
        let object = GatewayObject {
            id: Some("ch_1".into()),
            payment_intent: None,
            ..Default::default()
        };
        let rec = reconcile("charge.refunded", &object, "stripe").unwrap();
        assert_eq!(rec.update.payment_id.as_deref(), Some("ch_1"));
    }
}
