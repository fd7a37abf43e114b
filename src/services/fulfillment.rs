use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    services::marketplace::{MarketplaceClient, MarketplaceError},
    services::notifications::OrderNotifier,
    services::orders::{OrderDetail, OrderService},
};
use dashmap::DashMap;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Order {0} is already being fulfilled")]
    AlreadyInFlight(Uuid),

    #[error("Order {order_id} is already fulfilled as upstream order {upstream_order_qid}")]
    AlreadyFulfilled {
        order_id: Uuid,
        upstream_order_qid: String,
    },

    #[error("{}", partial_summary(lines))]
    PartialFulfillment { lines: Vec<LineResult> },

    #[error("No shipping address is configured on the marketplace account")]
    NoShippingAddress,

    #[error("Marketplace checkout failed: {0}")]
    UpstreamCheckout(String),

    #[error(transparent)]
    Marketplace(#[from] MarketplaceError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<FulfillmentError> for ServiceError {
    fn from(err: FulfillmentError) -> Self {
        match err {
            FulfillmentError::OrderNotFound(_) => ServiceError::NotFound(err.to_string()),
            FulfillmentError::AlreadyInFlight(_) | FulfillmentError::AlreadyFulfilled { .. } => {
                ServiceError::Conflict(err.to_string())
            }
            FulfillmentError::PartialFulfillment { .. }
            | FulfillmentError::NoShippingAddress
            | FulfillmentError::UpstreamCheckout(_) => ServiceError::ExternalApiError(err.to_string()),
            FulfillmentError::Marketplace(e) => e.into(),
            FulfillmentError::Service(e) => e,
        }
    }
}

fn partial_summary(lines: &[LineResult]) -> String {
    let failed = lines
        .iter()
        .filter(|l| matches!(l.outcome, LineOutcome::Failed { .. }))
        .count();
    let skipped = lines
        .iter()
        .filter(|l| matches!(l.outcome, LineOutcome::Skipped { .. }))
        .count();
    format!(
        "Fulfillment aborted: {} of {} lines failed, {} skipped",
        failed,
        lines.len(),
        skipped
    )
}

/// Result of replaying one order line onto the upstream cart
#[derive(Debug, Clone, Serialize)]
pub struct LineResult {
    pub gtin: String,
    pub name: String,
    pub seller: Option<String>,
    pub quantity: i32,
    #[serde(flatten)]
    pub outcome: LineOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LineOutcome {
    Added {
        upstream_line_qid: Option<String>,
    },
    /// Line has no upstream offer to order from
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentReport {
    pub order_id: Uuid,
    pub upstream_order_qid: String,
    pub lines: Vec<LineResult>,
}

/// Checkout orchestrator: replays a paid order onto the upstream wholesale
/// marketplace and records the resulting upstream order on ours.
///
/// Safe to invoke concurrently or repeatedly for the same order: an
/// in-process guard rejects overlapping runs and a persisted
/// `upstream_order_qid` rejects replays, so at most one upstream order is
/// ever placed per local order.
pub struct FulfillmentService {
    marketplace: Arc<MarketplaceClient>,
    orders: Arc<OrderService>,
    notifier: Arc<dyn OrderNotifier>,
    event_sender: Arc<EventSender>,
    in_flight: DashMap<Uuid, ()>,
}

impl FulfillmentService {
    pub fn new(
        marketplace: Arc<MarketplaceClient>,
        orders: Arc<OrderService>,
        notifier: Arc<dyn OrderNotifier>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            marketplace,
            orders,
            notifier,
            event_sender,
            in_flight: DashMap::new(),
        }
    }

    /// Runs the full pipeline for one order. All-or-nothing: if any line
    /// cannot be added to the upstream cart, the cart is emptied and no
    /// checkout happens.
    #[instrument(skip(self))]
    pub async fn process_order(
        &self,
        order_id: Uuid,
    ) -> Result<FulfillmentReport, FulfillmentError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, order_id)
            .ok_or(FulfillmentError::AlreadyInFlight(order_id))?;

        match self.run_pipeline(order_id).await {
            Ok(report) => {
                self.event_sender
                    .send_or_log(Event::OrderFulfilled {
                        order_id,
                        upstream_order_qid: report.upstream_order_qid.clone(),
                    })
                    .await;
                Ok(report)
            }
            Err(err) => {
                if !matches!(err, FulfillmentError::AlreadyFulfilled { .. }) {
                    self.event_sender
                        .send_or_log(Event::FulfillmentFailed {
                            order_id,
                            reason: err.to_string(),
                        })
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, order_id: Uuid) -> Result<FulfillmentReport, FulfillmentError> {
        // Fail fast if no usable marketplace session exists; nothing has
        // been staged upstream yet.
        self.marketplace.valid_access_token().await?;

        let detail = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))?;

        if let Some(qid) = detail.order.upstream_order_qid.clone() {
            return Err(FulfillmentError::AlreadyFulfilled {
                order_id,
                upstream_order_qid: qid,
            });
        }

        let (lines, any_added) = self.stage_lines(&detail).await;

        let all_added = lines
            .iter()
            .all(|l| matches!(l.outcome, LineOutcome::Added { .. }));
        if !all_added {
            self.cleanup_upstream_cart(any_added).await;
            return Err(FulfillmentError::PartialFulfillment { lines });
        }

        let Some(address_qid) = self.first_shipping_address().await else {
            self.cleanup_upstream_cart(any_added).await;
            return Err(FulfillmentError::NoShippingAddress);
        };

        let completion = match self.complete_checkout(&address_qid).await {
            Ok(completion) => completion,
            Err(e) => {
                self.cleanup_upstream_cart(any_added).await;
                return Err(FulfillmentError::UpstreamCheckout(e.to_string()));
            }
        };

        let upstream_order_qid = completion
            .get("qid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                FulfillmentError::UpstreamCheckout(
                    "completion response carries no order qid".to_string(),
                )
            })?;

        let updated = self
            .orders
            .record_fulfillment(order_id, upstream_order_qid.clone(), completion)
            .await?;

        info!(
            %order_id,
            %upstream_order_qid,
            "Order placed on the upstream marketplace"
        );

        // Confirmation delivery must never roll back a completed fulfillment
        if let Err(e) = self.notifier.send_order_confirmation(&updated).await {
            error!(%order_id, "Failed to send order confirmation: {}", e);
        }

        Ok(FulfillmentReport {
            order_id,
            upstream_order_qid,
            lines,
        })
    }

    /// Adds every order line to the upstream cart, continuing on error so
    /// the report covers all lines. Returns the per-line results and
    /// whether anything landed upstream.
    async fn stage_lines(&self, detail: &OrderDetail) -> (Vec<LineResult>, bool) {
        let mut lines = Vec::with_capacity(detail.items.len());
        let mut any_added = false;

        for item in &detail.items {
            let offer_qid = item
                .seller_data
                .as_ref()
                .and_then(|s| s.qid.clone());

            let outcome = match offer_qid {
                None => LineOutcome::Skipped {
                    reason: "no upstream offer on this line".to_string(),
                },
                Some(offer_qid) => {
                    let body = json!({
                        "quantity": item.quantity,
                        "offerQid": offer_qid,
                    });
                    match self
                        .marketplace
                        .request(Method::POST, "carts/active/lines/", Some(&body))
                        .await
                    {
                        Ok(response) => {
                            any_added = true;
                            LineOutcome::Added {
                                upstream_line_qid: response
                                    .get("qid")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                            }
                        }
                        Err(e) => {
                            warn!(gtin = %item.gtin, "Failed to stage line upstream: {}", e);
                            LineOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    }
                }
            };

            lines.push(LineResult {
                gtin: item.gtin.clone(),
                name: item.name.clone(),
                seller: item.seller.clone(),
                quantity: item.quantity,
                outcome,
            });
        }

        (lines, any_added)
    }

    /// First address on the marketplace account. Lookup failures count as
    /// "no address"; the caller aborts either way.
    async fn first_shipping_address(&self) -> Option<String> {
        match self
            .marketplace
            .request(Method::GET, "addresses", None)
            .await
        {
            Ok(response) => response
                .get("results")
                .and_then(Value::as_array)
                .and_then(|results| results.first())
                .and_then(|addr| addr.get("qid"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                warn!("Failed to fetch marketplace addresses: {}", e);
                None
            }
        }
    }

    /// Validate, attach addresses and payment method, then complete.
    async fn complete_checkout(&self, address_qid: &str) -> Result<Value, MarketplaceError> {
        self.marketplace
            .request(Method::POST, "checkouts/active/validate/", None)
            .await?;

        let patch = json!({
            "shippingAddressQid": address_qid,
            "billingAddressQid": address_qid,
            "selectedPaymentMethod": { "code": "BANK_TRANSFER" },
        });
        self.marketplace
            .request(Method::PATCH, "checkouts/active/", Some(&patch))
            .await?;

        self.marketplace
            .request(Method::POST, "checkouts/active/complete/", None)
            .await
    }

    /// Best-effort: failing to empty the upstream cart only warns, the
    /// original error stays the one reported.
    async fn cleanup_upstream_cart(&self, any_added: bool) {
        if !any_added {
            return;
        }
        if let Err(e) = self
            .marketplace
            .request(Method::POST, "carts/active/empty", None)
            .await
        {
            warn!("Failed to empty upstream cart after aborted fulfillment: {}", e);
        }
    }
}

/// Removes the order from the in-flight set on drop, so the guard also
/// releases on early returns and panics.
struct InFlightGuard<'a> {
    map: &'a DashMap<Uuid, ()>,
    order_id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(map: &'a DashMap<Uuid, ()>, order_id: Uuid) -> Option<Self> {
        use dashmap::mapref::entry::Entry;
        match map.entry(order_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(Self { map, order_id })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.order_id);
    }
}
