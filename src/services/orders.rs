use crate::{
    entities::order::{self, AddressSnapshot, Entity as Order, OrderStatus, PaymentStatus},
    entities::order_item::{self, Entity as OrderItem, SellerData},
    errors::ServiceError,
    events::{Event, EventSender},
    services::carts::CartDetail,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// One order line as supplied by callers
#[derive(Debug, Clone, Deserialize)]
pub struct OrderItemInput {
    pub gtin: String,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub seller: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    /// Derived from `unit_price * quantity` when missing
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    #[serde(default)]
    pub seller_data: Option<SellerData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderInput {
    pub user_id: Uuid,
    #[serde(default)]
    pub currency: Option<String>,
    pub items: Vec<OrderItemInput>,
    pub shipping_address: AddressSnapshot,
    /// Trusted when supplied, otherwise derived from the line subtotals
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    #[serde(default)]
    pub tax: Decimal,
    #[serde(default)]
    pub shipping: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub notes: Option<String>,
}

/// An order with its lines, as returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Fields applied when a payment gateway event is reconciled onto an order
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub payment_status: PaymentStatus,
    pub status: Option<OrderStatus>,
    pub payment_method: Option<String>,
    pub payment_id: Option<String>,
    pub admin_note: Option<String>,
}

/// Admin listing page with the per-status breakdown
#[derive(Debug, Clone, Serialize)]
pub struct AdminOrdersPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    /// Zero-filled: every known status appears even when no order has it
    pub status_counts: HashMap<String, u64>,
}

/// Order store.
///
/// Owns order numbering, money arithmetic, and the status machine with its
/// set-once transition timestamps. `total_amount` is always recomputed from
/// its components at write time.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    default_currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        default_currency: String,
    ) -> Self {
        Self {
            db,
            event_sender,
            default_currency,
        }
    }

    /// Creates an order with its lines in one transaction.
    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    pub async fn create_order(&self, input: CreateOrderInput) -> Result<OrderDetail, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot create an order without items".to_string(),
            ));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = generate_order_number(now);
        let (subtotal, total_amount) = derive_totals(
            &input.items,
            input.subtotal,
            input.tax,
            input.shipping,
            input.discount,
        );

        let txn = self.db.begin().await?;

        let order_row = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            user_id: Set(input.user_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Unpaid),
            payment_method: Set(None),
            payment_id: Set(None),
            subtotal: Set(subtotal),
            tax: Set(input.tax),
            shipping: Set(input.shipping),
            discount: Set(input.discount),
            total_amount: Set(total_amount),
            currency: Set(input
                .currency
                .unwrap_or_else(|| self.default_currency.clone())),
            shipping_address: Set(input.shipping_address),
            upstream_order_qid: Set(None),
            upstream_order_payload: Set(None),
            notes: Set(input.notes),
            admin_notes: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            accepted_at: Set(None),
            dispatched_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
        };
        let order_model = order_row.insert(&txn).await?;

        let mut items = Vec::with_capacity(input.items.len());
        for (position, line) in input.items.into_iter().enumerate() {
            let subtotal = line_subtotal(&line);
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position as i32),
                gtin: Set(line.gtin),
                name: Set(line.name),
                image_url: Set(line.image_url),
                brand: Set(line.brand),
                category: Set(line.category),
                seller: Set(line.seller),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                subtotal: Set(subtotal),
                seller_data: Set(line.seller_data),
            };
            items.push(item.insert(&txn).await?);
        }

        txn.commit().await?;

        info!("Created order {} ({})", order_number, order_id);
        self.event_sender.send_or_log(Event::OrderCreated(order_id)).await;

        Ok(OrderDetail {
            order: order_model,
            items,
        })
    }

    /// Creates an order from the user's cart, one line per seller offer.
    /// The cart is left untouched; clearing it is the caller's decision.
    #[instrument(skip(self, cart, shipping_address))]
    pub async fn create_order_from_cart(
        &self,
        user_id: Uuid,
        cart: &CartDetail,
        shipping_address: AddressSnapshot,
        notes: Option<String>,
    ) -> Result<OrderDetail, ServiceError> {
        let mut items = Vec::new();
        for line in &cart.items {
            for offer in line.seller_offers.iter() {
                items.push(OrderItemInput {
                    gtin: line.gtin.clone(),
                    name: line.name.clone(),
                    image_url: line.image_url.clone(),
                    brand: line.brand.clone(),
                    category: line.category.clone(),
                    seller: Some(offer.seller.clone()),
                    quantity: offer.quantity_purchase,
                    unit_price: offer.price,
                    subtotal: None,
                    seller_data: Some(SellerData {
                        qid: offer.qid.clone(),
                        seller_name: Some(offer.seller.clone()),
                        price: Some(offer.price),
                        currency: offer.currency.clone(),
                        mov: offer.mov,
                        mov_currency: offer.mov_currency.clone(),
                        inventory: offer.inventory,
                        is_traceable: None,
                    }),
                });
            }
        }

        if items.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        let currency = items
            .iter()
            .find_map(|i| i.seller_data.as_ref().and_then(|s| s.currency.clone()));

        self.create_order(CreateOrderInput {
            user_id,
            currency,
            items,
            shipping_address,
            subtotal: None,
            tax: Decimal::ZERO,
            shipping: Decimal::ZERO,
            discount: Decimal::ZERO,
            notes,
        })
        .await
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderDetail>, ServiceError> {
        let Some(order_model) = Order::find_by_id(order_id).one(&*self.db).await? else {
            return Ok(None);
        };
        let items = self.load_items(order_id).await?;
        Ok(Some(OrderDetail {
            order: order_model,
            items,
        }))
    }

    /// Like `get_order` but scoped to one user; other users' orders are
    /// indistinguishable from missing ones.
    pub async fn get_order_for_user(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<OrderDetail>, ServiceError> {
        Ok(self
            .get_order(order_id)
            .await?
            .filter(|detail| detail.order.user_id == user_id))
    }

    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let paginator = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    /// Admin listing across all users, with the zero-filled status breakdown.
    pub async fn list_all_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<AdminOrdersPage, ServiceError> {
        let paginator = Order::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        let rows: Vec<(OrderStatus, i64)> = Order::find()
            .select_only()
            .column(order::Column::Status)
            .column_as(order::Column::Id.count(), "count")
            .group_by(order::Column::Status)
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut status_counts: HashMap<String, u64> = OrderStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for (status, count) in rows {
            status_counts.insert(status.as_str().to_string(), count.max(0) as u64);
        }

        Ok(AdminOrdersPage {
            orders,
            total,
            status_counts,
        })
    }

    /// Moves an order to a new status, stamping the matching transition
    /// timestamp the first time that status is reached.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        admin_note: Option<String>,
    ) -> Result<OrderDetail, ServiceError> {
        let order_model = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order_model.status;
        let now = Utc::now();

        let mut active = apply_status(order_model, new_status, now);
        if let Some(note) = admin_note {
            active.admin_notes = Set(Some(note));
        }
        let updated = active.update(&*self.db).await?;

        if old_status != new_status {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    old_status: old_status.as_str().to_string(),
                    new_status: new_status.as_str().to_string(),
                })
                .await;
        }

        let items = self.load_items(order_id).await?;
        Ok(OrderDetail {
            order: updated,
            items,
        })
    }

    /// Reconciles a payment gateway event onto the order carrying this
    /// order number. Returns `Ok(None)` when no such order exists, so the
    /// caller can acknowledge and log instead of failing.
    ///
    /// A `processing` target status is only applied to `pending` orders;
    /// replayed success events must not pull an already-fulfilled order
    /// backwards.
    #[instrument(skip(self, update))]
    pub async fn mark_payment(
        &self,
        order_number: &str,
        update: PaymentUpdate,
    ) -> Result<Option<order::Model>, ServiceError> {
        let Some(order_model) = Order::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        let order_id = order_model.id;
        let old_status = order_model.status;
        let now = Utc::now();

        let target_status = update
            .status
            .filter(|target| *target != OrderStatus::Processing || old_status == OrderStatus::Pending);

        let mut active = match target_status {
            Some(status) => apply_status(order_model, status, now),
            None => {
                let mut active: order::ActiveModel = order_model.into();
                active.updated_at = Set(now);
                active
            }
        };

        active.payment_status = Set(update.payment_status);
        if let Some(method) = update.payment_method {
            active.payment_method = Set(Some(method));
        }
        if let Some(payment_id) = update.payment_id {
            active.payment_id = Set(Some(payment_id));
        }
        if let Some(note) = update.admin_note {
            active.admin_notes = Set(Some(note));
        }

        let updated = active.update(&*self.db).await?;

        if update.payment_status == PaymentStatus::Paid {
            self.event_sender.send_or_log(Event::OrderPaid(order_id)).await;
        }
        if let Some(new_status) = target_status {
            if new_status != old_status {
                self.event_sender
                    .send_or_log(Event::OrderStatusChanged {
                        order_id,
                        old_status: old_status.as_str().to_string(),
                        new_status: new_status.as_str().to_string(),
                    })
                    .await;
            }
        }

        Ok(Some(updated))
    }

    /// Records the upstream marketplace linkage after fulfillment and moves
    /// the order to `accepted`.
    #[instrument(skip(self, payload))]
    pub async fn record_fulfillment(
        &self,
        order_id: Uuid,
        upstream_order_qid: String,
        payload: serde_json::Value,
    ) -> Result<OrderDetail, ServiceError> {
        let order_model = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let now = Utc::now();
        let mut active = apply_status(order_model, OrderStatus::Accepted, now);
        active.upstream_order_qid = Set(Some(upstream_order_qid));
        active.upstream_order_payload = Set(Some(payload));
        let updated = active.update(&*self.db).await?;

        let items = self.load_items(order_id).await?;
        Ok(OrderDetail {
            order: updated,
            items,
        })
    }

    async fn load_items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::Position)
            .all(&*self.db)
            .await?)
    }
}

/// Builds an active model with the new status, `updated_at`, and the
/// set-once transition timestamp for that status.
fn apply_status(
    order_model: order::Model,
    new_status: OrderStatus,
    now: DateTime<Utc>,
) -> order::ActiveModel {
    let accepted_at = order_model.accepted_at;
    let dispatched_at = order_model.dispatched_at;
    let delivered_at = order_model.delivered_at;
    let cancelled_at = order_model.cancelled_at;

    let mut active: order::ActiveModel = order_model.into();
    active.status = Set(new_status);
    active.updated_at = Set(now);

    match new_status {
        OrderStatus::Accepted if accepted_at.is_none() => {
            active.accepted_at = Set(Some(now));
        }
        OrderStatus::Dispatched if dispatched_at.is_none() => {
            active.dispatched_at = Set(Some(now));
        }
        OrderStatus::Delivered if delivered_at.is_none() => {
            active.delivered_at = Set(Some(now));
        }
        OrderStatus::Cancelled if cancelled_at.is_none() => {
            active.cancelled_at = Set(Some(now));
        }
        _ => {}
    }

    active
}

/// `ORD-YYYYMMDD-NNNNN` with a random five-digit suffix.
pub(crate) fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("ORD-{}-{:05}", now.format("%Y%m%d"), suffix)
}

fn line_subtotal(line: &OrderItemInput) -> Decimal {
    line.subtotal
        .unwrap_or_else(|| line.unit_price * Decimal::from(line.quantity))
}

/// Derives `(subtotal, total_amount)`. A caller-supplied subtotal is kept,
/// but the total is always recomputed from its components.
pub(crate) fn derive_totals(
    items: &[OrderItemInput],
    provided_subtotal: Option<Decimal>,
    tax: Decimal,
    shipping: Decimal,
    discount: Decimal,
) -> (Decimal, Decimal) {
    let subtotal =
        provided_subtotal.unwrap_or_else(|| items.iter().map(line_subtotal).sum::<Decimal>());
    let total = subtotal + tax + shipping - discount;
    (subtotal, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(unit_price: Decimal, quantity: i32, subtotal: Option<Decimal>) -> OrderItemInput {
        OrderItemInput {
            gtin: "04000345706564".to_string(),
            name: "Test product".to_string(),
            image_url: None,
            brand: None,
            category: None,
            seller: None,
            quantity,
            unit_price,
            subtotal,
            seller_data: None,
        }
    }

    #[test]
    fn order_number_format() {
        let now = "2026-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let number = generate_order_number(now);

        assert_eq!(number.len(), "ORD-20260301-00000".len());
        assert!(number.starts_with("ORD-20260301-"));
        let suffix = &number["ORD-20260301-".len()..];
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn totals_derived_from_lines_when_subtotal_missing() {
        let items = vec![
            line(dec!(10.00), 2, None),
            line(dec!(5.50), 1, Some(dec!(5.00))),
        ];
        let (subtotal, total) = derive_totals(&items, None, dec!(2.00), dec!(4.00), dec!(1.00));

        // 20.00 from the priced line plus the explicit 5.00 line subtotal
        assert_eq!(subtotal, dec!(25.00));
        assert_eq!(total, dec!(30.00));
    }

    #[test]
    fn supplied_subtotal_is_kept_but_total_recomputed() {
        let items = vec![line(dec!(10.00), 2, None)];
        let (subtotal, total) = derive_totals(
            &items,
            Some(dec!(19.00)),
            dec!(1.00),
            Decimal::ZERO,
            Decimal::ZERO,
        );

        assert_eq!(subtotal, dec!(19.00));
        assert_eq!(total, dec!(20.00));
    }

    #[test]
    fn totals_of_empty_line_list_are_zero() {
        let (subtotal, total) =
            derive_totals(&[], None, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        assert_eq!(subtotal, Decimal::ZERO);
        assert_eq!(total, Decimal::ZERO);
    }
}
