//! API key entity. Only the SHA-256 digest of the key is stored.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_key")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub name: String,

    pub account_id: Option<String>,

    pub org_id: Option<String>,

    pub app_id: Option<String>,

    pub display_prefix: String,

    #[sea_orm(unique)]
    pub key_hash: String,

    pub is_active: bool,

    pub expires_at: Option<ChronoDateTimeUtc>,

    pub last_used_at: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
