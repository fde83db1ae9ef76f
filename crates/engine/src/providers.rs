//! External money-movement providers.
//!
//! The engine never talks to a PSP or bank directly; it goes through
//! these seams so tests can script success, failure, and flakiness.

use marketpay_core::{Currency, StoreId, TenantId};
use marketpay_payouts::SellerPayoutId;
use marketpay_refunds::RefundRequestId;

/// A provider-side failure. Retryability is decided by the engine's
/// attempt counters, not by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl core::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Instruction to return money to a buyer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundInstruction {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub amount: i64,
    pub currency: Currency,
}

/// Instruction to transfer a payout to a seller's bank account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutInstruction {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub store_id: StoreId,
    pub amount: i64,
    pub currency: Currency,
}

/// Executes buyer refunds. Returns the provider's transaction reference.
pub trait PaymentProvider: Send + Sync {
    fn refund(&self, instruction: &RefundInstruction) -> Result<String, ProviderError>;
}

/// Executes seller payouts. Returns the provider's transfer reference.
pub trait PayoutProvider: Send + Sync {
    fn transfer(&self, instruction: &PayoutInstruction) -> Result<String, ProviderError>;
}

#[cfg(test)]
pub(crate) mod test_providers {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Always succeeds, numbering its references.
    #[derive(Debug, Default)]
    pub struct AlwaysSucceeds {
        counter: AtomicU32,
    }

    impl AlwaysSucceeds {
        pub fn new() -> Self {
            Self::default()
        }

        fn next_reference(&self, prefix: &str) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("{prefix}-{n}")
        }
    }

    impl PaymentProvider for AlwaysSucceeds {
        fn refund(&self, _instruction: &RefundInstruction) -> Result<String, ProviderError> {
            Ok(self.next_reference("refund"))
        }
    }

    impl PayoutProvider for AlwaysSucceeds {
        fn transfer(&self, _instruction: &PayoutInstruction) -> Result<String, ProviderError> {
            Ok(self.next_reference("transfer"))
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    #[derive(Debug)]
    pub struct FailsThenSucceeds {
        failures: u32,
        calls: AtomicU32,
    }

    impl FailsThenSucceeds {
        pub fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl PaymentProvider for FailsThenSucceeds {
        fn refund(&self, _instruction: &RefundInstruction) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProviderError::new("provider timeout"))
            } else {
                Ok(format!("refund-after-{call}"))
            }
        }
    }

    impl PayoutProvider for FailsThenSucceeds {
        fn transfer(&self, _instruction: &PayoutInstruction) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProviderError::new("bank rejected transfer"))
            } else {
                Ok(format!("transfer-after-{call}"))
            }
        }
    }
}
