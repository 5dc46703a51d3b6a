//! Usage snapshot entity (hourly, daily and monthly rows share the table)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "usage_snapshot")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub org_id: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub granularity: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub period_start: ChronoDateTimeUtc,

    pub bandwidth_bytes: i64,

    pub tunnel_seconds: i64,

    pub requests: i64,

    pub peak_concurrent: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
