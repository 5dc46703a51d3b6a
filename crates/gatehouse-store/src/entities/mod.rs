//! Database entities

pub mod account;
pub mod api_key;
pub mod application;
pub mod auth_policy;
pub mod organization;
pub mod plan;
pub mod session;
pub mod tunnel_record;
pub mod usage_snapshot;

pub mod prelude {
    pub use super::account::Entity as Account;
    pub use super::api_key::Entity as ApiKey;
    pub use super::application::Entity as Application;
    pub use super::auth_policy::Entity as AuthPolicy;
    pub use super::organization::Entity as Organization;
    pub use super::plan::Entity as Plan;
    pub use super::session::Entity as Session;
    pub use super::tunnel_record::Entity as TunnelRecord;
    pub use super::usage_snapshot::Entity as UsageSnapshot;
}
