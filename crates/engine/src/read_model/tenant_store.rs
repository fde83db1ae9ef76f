use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use marketpay_core::TenantId;

/// Tenant-isolated key/value storage for read models.
///
/// Everything behind this trait is disposable: read models are folds over
/// the event streams and can always be rebuilt, so implementations trade
/// durability for simplicity.
pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V>;
    fn upsert(&self, tenant_id: TenantId, key: K, value: V);
    fn list(&self, tenant_id: TenantId) -> Vec<V>;
    /// Drop every record for a tenant, ahead of a rebuild.
    fn clear_tenant(&self, tenant_id: TenantId);
}

/// Map-of-maps store: one inner map per tenant, so cross-tenant reads
/// cannot happen by construction and clearing a tenant is one removal.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    tenants: RwLock<HashMap<TenantId, HashMap<K, V>>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        self.tenants.read().ok()?.get(&tenant_id)?.get(key).cloned()
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.entry(tenant_id).or_default().insert(key, value);
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        match self.tenants.read() {
            Ok(tenants) => tenants
                .get(&tenant_id)
                .map(|records| records.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.remove(&tenant_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_stay_inside_their_tenant() {
        let store: InMemoryTenantStore<u32, &'static str> = InMemoryTenantStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        store.upsert(tenant_a, 1, "a");
        store.upsert(tenant_b, 1, "b");

        assert_eq!(store.get(tenant_a, &1), Some("a"));
        assert_eq!(store.get(tenant_b, &1), Some("b"));
        assert_eq!(store.list(tenant_a), vec!["a"]);
    }

    #[test]
    fn clearing_one_tenant_leaves_the_rest() {
        let store: InMemoryTenantStore<u32, &'static str> = InMemoryTenantStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        store.upsert(tenant_a, 1, "a");
        store.upsert(tenant_b, 1, "b");
        store.clear_tenant(tenant_a);

        assert_eq!(store.get(tenant_a, &1), None);
        assert_eq!(store.get(tenant_b, &1), Some("b"));
    }
}
