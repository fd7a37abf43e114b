use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cart line entity, one per product (GTIN) with offers from one or more
/// marketplace sellers
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cart_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub cart_id: Uuid,
    pub gtin: String,
    pub name: String,
    #[sea_orm(nullable)]
    pub image_url: Option<String>,
    #[sea_orm(nullable)]
    pub brand: Option<String>,
    #[sea_orm(nullable)]
    pub category: Option<String>,
    #[sea_orm(nullable)]
    pub unit: Option<String>,
    /// Sum of `quantity_purchase` across `seller_offers`; recomputed on
    /// every mutation
    pub quantity: i32,
    #[sea_orm(column_type = "Json")]
    pub seller_offers: SellerOffers,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cart::Entity",
        from = "Column::CartId",
        to = "super::cart::Column::Id"
    )]
    Cart,
}

impl Related<super::cart::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cart.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// One seller's offer for a cart line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerOffer {
    /// Upstream offer identifier
    #[serde(default)]
    pub qid: Option<String>,
    pub seller: String,
    pub price: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    /// How many units the customer buys from this seller
    pub quantity_purchase: i32,
    /// Seller stock at the time the offer was added
    #[serde(default)]
    pub inventory: Option<i32>,
    /// Seller minimum order value
    #[serde(default)]
    pub mov: Option<Decimal>,
    #[serde(default)]
    pub mov_currency: Option<String>,
}

/// JSON column wrapper for the per-line offer list
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct SellerOffers(pub Vec<SellerOffer>);

impl SellerOffers {
    pub fn iter(&self) -> std::slice::Iter<'_, SellerOffer> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
