//! Plan entity. A limit of -1 means unlimited.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "plan")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub name: String,

    pub bandwidth_bytes: i64,

    pub tunnel_hours: i64,

    pub concurrent_tunnels: i64,

    pub requests: i64,

    pub overage_percent: i32,

    pub grace_period_hours: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
