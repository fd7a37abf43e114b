use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted marketplace bearer token. Login appends a row, refresh
/// overwrites the newest one; readers always take the newest row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "marketplace_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub access_token: String,
    /// Expiry as a unix timestamp (seconds), as reported by the marketplace
    pub access_expiry: i64,
    #[sea_orm(nullable)]
    pub signature: Option<String>,
    /// Opaque account payload returned at login; kept for diagnostics
    #[sea_orm(column_type = "Json", nullable)]
    pub account_info: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
