//! Subdomain routing for live tunnels

pub mod registry;

pub use registry::{RegistryError, RouteClaim, SubdomainRegistry, TunnelOwner, TunnelRoute, TunnelSummary};
