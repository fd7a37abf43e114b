use crate::{
    entities::cart::{self, Entity as Cart},
    entities::cart_item::{self, Entity as CartItem, SellerOffer, SellerOffers},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CartError {
    #[error("Cart item {0} not found")]
    ItemNotFound(Uuid),

    #[error("No offer from seller {seller} on cart item {item_id}")]
    OfferNotFound { item_id: Uuid, seller: String },

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl From<CartError> for ServiceError {
    fn from(err: CartError) -> Self {
        match err {
            CartError::Database(e) => ServiceError::DatabaseError(e),
            other => ServiceError::NotFound(other.to_string()),
        }
    }
}

/// A cart with its lines, as returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct CartDetail {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}

/// Product fields plus the seller offer being added
#[derive(Debug, Clone, Deserialize)]
pub struct CartItemInput {
    pub gtin: String,
    pub name: String,
    pub image_url: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub unit: Option<String>,
    pub offer: SellerOffer,
}

/// Shopping cart service.
///
/// Each user has at most one cart. A cart line is keyed by product GTIN and
/// holds one offer per marketplace seller; adding the same seller's offer
/// again merges quantities instead of duplicating the entry. The cart's
/// `total_items` counter is recomputed inside the same transaction as every
/// mutation.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the user's cart, creating an empty one on first access.
    #[instrument(skip(self))]
    pub async fn get_or_create_cart(&self, user_id: Uuid) -> Result<CartDetail, CartError> {
        let txn = self.db.begin().await?;
        let cart = self.find_or_create(&txn, user_id).await?;
        let detail = self.load_detail(&txn, cart).await?;
        txn.commit().await?;
        Ok(detail)
    }

    /// Adds a seller offer to the cart, merging with an existing line for
    /// the same GTIN and seller.
    #[instrument(skip(self, input), fields(gtin = %input.gtin))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        input: CartItemInput,
    ) -> Result<CartDetail, CartError> {
        let txn = self.db.begin().await?;
        let cart = self.find_or_create(&txn, user_id).await?;
        let now = Utc::now();

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::Gtin.eq(&input.gtin))
            .one(&txn)
            .await?;

        if let Some(item) = existing {
            let mut offers = item.seller_offers.0.clone();
            merge_offer(&mut offers, input.offer);
            let quantity = offers_quantity(&offers);

            let mut item: cart_item::ActiveModel = item.into();
            item.seller_offers = Set(SellerOffers(offers));
            item.quantity = Set(quantity);
            item.updated_at = Set(now);
            item.update(&txn).await?;
        } else {
            let quantity = input.offer.quantity_purchase;
            let item = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                gtin: Set(input.gtin),
                name: Set(input.name),
                image_url: Set(input.image_url),
                brand: Set(input.brand),
                category: Set(input.category),
                unit: Set(input.unit),
                quantity: Set(quantity),
                seller_offers: Set(SellerOffers(vec![input.offer])),
                created_at: Set(now),
                updated_at: Set(now),
            };
            item.insert(&txn).await?;
        }

        let detail = self.recalculate(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartUpdated(cart.id)).await;
        Ok(detail)
    }

    /// Sets the purchase quantity of one seller's offer on a cart line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        seller: &str,
        quantity: i32,
    ) -> Result<CartDetail, CartError> {
        let txn = self.db.begin().await?;
        let cart = self.find_or_create(&txn, user_id).await?;

        let item = self.owned_item(&txn, &cart, item_id).await?;

        let mut offers = item.seller_offers.0.clone();
        let offer = offers
            .iter_mut()
            .find(|o| o.seller == seller)
            .ok_or_else(|| CartError::OfferNotFound {
                item_id,
                seller: seller.to_string(),
            })?;
        offer.quantity_purchase = quantity;
        let total = offers_quantity(&offers);

        let mut item: cart_item::ActiveModel = item.into();
        item.seller_offers = Set(SellerOffers(offers));
        item.quantity = Set(total);
        item.updated_at = Set(Utc::now());
        item.update(&txn).await?;

        let detail = self.recalculate(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartUpdated(cart.id)).await;
        Ok(detail)
    }

    /// Removes one seller's offer from a line, or the whole line when no
    /// seller is given. A line left with no offers is deleted.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        seller: Option<&str>,
    ) -> Result<CartDetail, CartError> {
        let txn = self.db.begin().await?;
        let cart = self.find_or_create(&txn, user_id).await?;

        let item = self.owned_item(&txn, &cart, item_id).await?;

        match seller {
            Some(seller) => {
                let mut offers = item.seller_offers.0.clone();
                offers.retain(|o| o.seller != seller);

                if offers.is_empty() {
                    item.delete(&txn).await?;
                } else {
                    let total = offers_quantity(&offers);
                    let mut item: cart_item::ActiveModel = item.into();
                    item.seller_offers = Set(SellerOffers(offers));
                    item.quantity = Set(total);
                    item.updated_at = Set(Utc::now());
                    item.update(&txn).await?;
                }
            }
            None => {
                item.delete(&txn).await?;
            }
        }

        let detail = self.recalculate(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CartUpdated(cart.id)).await;
        Ok(detail)
    }

    /// Deletes every line from the user's cart.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid) -> Result<CartDetail, CartError> {
        let txn = self.db.begin().await?;
        let cart = self.find_or_create(&txn, user_id).await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;

        let detail = self.recalculate(&txn, cart.id).await?;
        txn.commit().await?;

        info!("Cleared cart {}", cart.id);
        self.event_sender.send_or_log(Event::CartUpdated(cart.id)).await;
        Ok(detail)
    }

    async fn find_or_create<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<cart::Model, CartError> {
        if let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?
        {
            return Ok(cart);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            total_items: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(cart.insert(conn).await?)
    }

    async fn owned_item<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: &cart::Model,
        item_id: Uuid,
    ) -> Result<cart_item::Model, CartError> {
        CartItem::find_by_id(item_id)
            .one(conn)
            .await?
            .filter(|item| item.cart_id == cart.id)
            .ok_or(CartError::ItemNotFound(item_id))
    }

    async fn load_detail<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: cart::Model,
    ) -> Result<CartDetail, CartError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?;
        Ok(CartDetail { cart, items })
    }

    /// Recomputes `total_items` from the surviving lines and returns the
    /// fresh cart state.
    async fn recalculate<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<CartDetail, CartError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?;

        let total_items: i32 = items.iter().map(|i| offers_quantity(&i.seller_offers.0)).sum();

        let cart = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or(CartError::Database(sea_orm::DbErr::RecordNotFound(
                format!("cart {}", cart_id),
            )))?;
        let mut active: cart::ActiveModel = cart.into();
        active.total_items = Set(total_items);
        active.updated_at = Set(Utc::now());
        let cart = active.update(conn).await?;

        Ok(CartDetail { cart, items })
    }
}

/// Merges an incoming offer into the list: same seller sums purchase
/// quantities and takes the newer price/stock fields, a new seller appends.
pub(crate) fn merge_offer(offers: &mut Vec<SellerOffer>, incoming: SellerOffer) {
    if let Some(existing) = offers.iter_mut().find(|o| o.seller == incoming.seller) {
        let merged_quantity = existing.quantity_purchase + incoming.quantity_purchase;
        *existing = SellerOffer {
            quantity_purchase: merged_quantity,
            ..incoming
        };
    } else {
        offers.push(incoming);
    }
}

pub(crate) fn offers_quantity(offers: &[SellerOffer]) -> i32 {
    offers.iter().map(|o| o.quantity_purchase).sum()
}
