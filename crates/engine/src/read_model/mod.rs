//! Rebuildable read-model storage, keyed per tenant.

pub mod tenant_store;

pub use tenant_store::{InMemoryTenantStore, TenantStore};
