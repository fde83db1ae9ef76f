//! Gap-free sequence allocation for invoice and credit-note numbers.

use std::collections::HashMap;
use std::sync::Mutex;

use marketpay_core::TenantId;

/// Which numbering series a document draws from. Invoices and credit
/// notes run their own gap-free sequences; a credit note must never punch
/// a hole into the invoice series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Invoice,
    CreditNote,
}

/// Sequential number allocator, scoped per tenant, document kind, and
/// calendar year.
///
/// Numbers must be gap-free even under failure: the counter is held under
/// a lock for the whole allocation, and only advances when the commit
/// closure succeeds. A failed issue never burns a number, and two
/// concurrent issues can never observe the same one.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: Mutex<HashMap<(TenantId, DocumentKind, i32), u32>>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the next number for (tenant, kind, year) to `commit`; advance
    /// the counter only if `commit` returns Ok.
    pub fn allocate<T, E>(
        &self,
        tenant_id: TenantId,
        kind: DocumentKind,
        year: i32,
        commit: impl FnOnce(u32) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = counters.entry((tenant_id, kind, year)).or_insert(0);
        let candidate = *counter + 1;

        let result = commit(candidate)?;
        *counter = candidate;
        Ok(result)
    }

    /// Last number handed out for (tenant, kind, year); 0 if none yet.
    pub fn current(&self, tenant_id: TenantId, kind: DocumentKind, year: i32) -> u32 {
        match self.counters.lock() {
            Ok(counters) => counters.get(&(tenant_id, kind, year)).copied().unwrap_or(0),
            Err(poisoned) => poisoned
                .into_inner()
                .get(&(tenant_id, kind, year))
                .copied()
                .unwrap_or(0),
        }
    }
}
