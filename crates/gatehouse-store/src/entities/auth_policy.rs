//! Auth policy entity, keyed by owner ("app" | "org", owner id)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "auth_policy")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_kind: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_id: String,

    pub policy_type: String,

    pub allow_api_key: bool,

    /// JSON array of {username, password_hash}
    #[sea_orm(column_type = "Text")]
    pub basic_users: String,

    /// JSON object, NULL when OIDC is not configured
    #[sea_orm(column_type = "Text", nullable)]
    pub oidc: Option<String>,

    pub session_ttl_secs: i64,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
