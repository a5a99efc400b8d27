//! Prepared-statement ownership registry
//!
//! The upstream node issues opaque prepared-statement ids with no notion
//! of tenancy; a tenant that learns another tenant's id could execute it
//! inside the foreign namespace. The registry maps every id the upstream
//! has ever issued to the internal token of the tenant that prepared it,
//! and EXECUTE packets are checked against it before anything is
//! forwarded. Ids must be visible across sessions (a tenant may reconnect,
//! and a hostile tenant connects separately by definition), so the
//! listener owns one registry and hands it to every session.

use std::sync::Arc;

use cassgate_common::TenantToken;
use dashmap::DashMap;

/// Process-wide map of prepared id to owning tenant
#[derive(Debug, Clone, Default)]
pub struct PreparedRegistry {
    inner: Arc<DashMap<Vec<u8>, TenantToken>>,
}

impl PreparedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ownership of a freshly prepared id. Re-preparing the same
    /// statement yields the same id; the upstream only hands it to the
    /// session that sent the PREPARE, so last-writer-wins is safe.
    pub fn record(&self, id: Vec<u8>, owner: TenantToken) {
        self.inner.insert(id, owner);
    }

    /// Whether `token` may execute the statement behind `id`.
    pub fn is_owned_by(&self, id: &[u8], token: &TenantToken) -> bool {
        self.inner.get(id).map(|owner| *owner == *token).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(fill: char) -> TenantToken {
        TenantToken::new(fill.to_string().repeat(20), 20).unwrap()
    }

    #[test]
    fn test_owner_may_execute() {
        let registry = PreparedRegistry::new();
        let alice = token('a');
        registry.record(vec![1, 2, 3], alice.clone());
        assert!(registry.is_owned_by(&[1, 2, 3], &alice));
    }

    #[test]
    fn test_foreign_tenant_denied() {
        let registry = PreparedRegistry::new();
        registry.record(vec![1, 2, 3], token('a'));
        assert!(!registry.is_owned_by(&[1, 2, 3], &token('b')));
    }

    #[test]
    fn test_unknown_id_denied() {
        let registry = PreparedRegistry::new();
        assert!(!registry.is_owned_by(&[9, 9, 9], &token('a')));
    }

    #[test]
    fn test_registry_shared_between_clones() {
        let registry = PreparedRegistry::new();
        let other_handle = registry.clone();
        registry.record(vec![5], token('a'));
        assert!(other_handle.is_owned_by(&[5], &token('a')));
    }
}
