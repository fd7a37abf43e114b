use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order line item entity
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    /// Preserves the original line ordering for fulfillment and display
    pub position: i32,
    pub gtin: String,
    pub name: String,
    #[sea_orm(nullable)]
    pub image_url: Option<String>,
    #[sea_orm(nullable)]
    pub brand: Option<String>,
    #[sea_orm(nullable)]
    pub category: Option<String>,
    #[sea_orm(nullable)]
    pub seller: Option<String>,
    pub quantity: i32,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    /// Marketplace offer details captured at order time; `qid` is what the
    /// fulfillment pipeline replays onto the upstream cart
    #[sea_orm(column_type = "Json", nullable)]
    pub seller_data: Option<SellerData>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Upstream offer snapshot for one order line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct SellerData {
    /// Upstream offer identifier; a line without one cannot be fulfilled
    #[serde(default)]
    pub qid: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Seller minimum order value, as quoted when the offer was captured
    #[serde(default)]
    pub mov: Option<Decimal>,
    #[serde(default)]
    pub mov_currency: Option<String>,
    #[serde(default)]
    pub inventory: Option<i32>,
    #[serde(default)]
    pub is_traceable: Option<bool>,
}
