//! Tunnel lifetime record

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_record")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub subdomain: String,

    /// websocket | tcp
    pub transport: String,

    pub account_id: Option<String>,

    pub org_id: Option<String>,

    pub app_id: Option<String>,

    pub client_addr: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    /// NULL while the tunnel is connected
    pub closed_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
