//! The payout cycle: bundle eligible balances per store, enforce the
//! minimum threshold with roll-over, execute transfers with retry backoff,
//! and release the escrow allocations a paid transfer covers.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use marketpay_core::{AggregateId, DomainError, StoreId, TenantId, UserId};
use marketpay_escrow::{EscrowPayment, EscrowPaymentId};
use marketpay_escrow::payment::{EscrowCommand, ReleaseAllocation};
use marketpay_events::{EventBus, EventEnvelope};
use marketpay_payouts::{PayoutCommand, SellerPayout, SellerPayoutId};
use marketpay_payouts::payout::{
    MarkPayoutFailed, MarkPayoutPaid, SchedulePayout, StartPayout,
};

use crate::event_store::EventStore;
use crate::projections::PayoutReadModel;
use crate::providers::{PayoutInstruction, PayoutProvider};

use super::{ESCROW_AGGREGATE, Engine, EngineError, PAYOUT_AGGREGATE};

/// What a payout run decided for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled {
        payout_id: SellerPayoutId,
        amount: i64,
    },
    /// The eligible balance stayed in escrow and rolls into the next cycle.
    BelowThreshold { balance: i64 },
    NothingEligible,
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Bundle a store's unclaimed eligible allocations into one payout.
    /// Allocations already claimed by a live payout are skipped; a total
    /// below the configured threshold is left to roll over.
    pub fn schedule_payout(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, EngineError> {
        let eligible = self.projections.escrow.eligible_for_store(tenant_id, store_id);

        let mut currency = None;
        let mut shipments = Vec::new();
        let mut total = 0i64;
        for (payment_id, allocation) in eligible {
            if self
                .projections
                .payouts
                .claim_for_shipment(tenant_id, allocation.shipment_id)
                .is_some()
            {
                continue;
            }
            let payable = allocation.payable_amount();
            if payable == 0 {
                continue;
            }
            let payment = self
                .projections
                .escrow
                .get(tenant_id, &payment_id)
                .ok_or_else(DomainError::not_found)?;
            // One currency per payout; a store selling in several
            // currencies gets one bundle per cycle per currency.
            match &currency {
                None => currency = Some(payment.currency.clone()),
                Some(c) if *c != payment.currency => continue,
                Some(_) => {}
            }
            shipments.push(allocation.shipment_id);
            total += payable;
        }

        let Some(currency) = currency else {
            return Ok(ScheduleOutcome::NothingEligible);
        };
        if total < self.config.payout_threshold {
            info!(%tenant_id, %store_id, balance = total, "payout below threshold, rolling over");
            return Ok(ScheduleOutcome::BelowThreshold { balance: total });
        }

        let payout_id = SellerPayoutId::new(AggregateId::new());
        let scheduled_for = self.config.payout_frequency.next_payout_date(now.date_naive());
        self.execute::<SellerPayout>(
            tenant_id,
            payout_id.0,
            PAYOUT_AGGREGATE,
            PayoutCommand::SchedulePayout(SchedulePayout {
                tenant_id,
                payout_id,
                store_id,
                currency,
                amount: total,
                shipments,
                scheduled_for,
                max_retries: self.config.payout_max_retries,
                occurred_at: now,
            }),
            |id| SellerPayout::empty(SellerPayoutId::new(id)),
        )?;

        info!(%tenant_id, %payout_id, %store_id, amount = total, %scheduled_for, "payout scheduled");
        Ok(ScheduleOutcome::Scheduled {
            payout_id,
            amount: total,
        })
    }

    /// Execute one transfer attempt. Success releases every covered escrow
    /// allocation under the provider's transfer reference; failure records
    /// the attempt with the next retry time, or terminally once retries
    /// are exhausted.
    pub fn process_payout(
        &self,
        tenant_id: TenantId,
        payout_id: SellerPayoutId,
        provider: &dyn PayoutProvider,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<SellerPayout>(
            tenant_id,
            payout_id.0,
            PAYOUT_AGGREGATE,
            PayoutCommand::StartPayout(StartPayout {
                tenant_id,
                payout_id,
                occurred_at: now,
            }),
            |id| SellerPayout::empty(SellerPayoutId::new(id)),
        )?;

        let payout = self
            .projections
            .payouts
            .get(tenant_id, &payout_id)
            .ok_or_else(DomainError::not_found)?;

        let instruction = PayoutInstruction {
            tenant_id,
            payout_id,
            store_id: payout.store_id,
            amount: payout.amount,
            currency: payout.currency.clone(),
        };

        match provider.transfer(&instruction) {
            Ok(reference) => {
                self.execute::<SellerPayout>(
                    tenant_id,
                    payout_id.0,
                    PAYOUT_AGGREGATE,
                    PayoutCommand::MarkPayoutPaid(MarkPayoutPaid {
                        tenant_id,
                        payout_id,
                        provider_reference: reference.clone(),
                        marked_by: None,
                        occurred_at: now,
                    }),
                    |id| SellerPayout::empty(SellerPayoutId::new(id)),
                )?;
                self.release_covered_allocations(tenant_id, &payout, &reference, now)?;
                info!(%tenant_id, %payout_id, amount = payout.amount, "payout paid");
                Ok(())
            }
            Err(e) => {
                let next_retry_at = self
                    .config
                    .payout_backoff
                    .next_retry_at(payout.attempts, now);
                self.execute::<SellerPayout>(
                    tenant_id,
                    payout_id.0,
                    PAYOUT_AGGREGATE,
                    PayoutCommand::MarkPayoutFailed(MarkPayoutFailed {
                        tenant_id,
                        payout_id,
                        error: e.message.clone(),
                        next_retry_at,
                        occurred_at: now,
                    }),
                    |id| SellerPayout::empty(SellerPayoutId::new(id)),
                )?;
                let failed = self.projections.payouts.get(tenant_id, &payout_id);
                if failed.as_ref().is_some_and(|p| p.terminal) {
                    warn!(%tenant_id, %payout_id, error = %e.message, "payout failed terminally, manual resolution required");
                } else {
                    warn!(%tenant_id, %payout_id, error = %e.message, %next_retry_at, "payout transfer failed, retry scheduled");
                }
                Ok(())
            }
        }
    }

    /// Run every failed payout whose backoff has elapsed.
    pub fn retry_due_payouts(
        &self,
        tenant_id: TenantId,
        provider: &dyn PayoutProvider,
        now: DateTime<Utc>,
    ) -> Result<Vec<SellerPayoutId>, EngineError> {
        let due = self.projections.payouts.retry_due(tenant_id, now);
        let mut processed = Vec::with_capacity(due.len());
        for payout in due {
            self.process_payout(tenant_id, payout.payout_id, provider, now)?;
            processed.push(payout.payout_id);
        }
        Ok(processed)
    }

    /// Operator override: a terminally failed payout that was settled out
    /// of band is marked paid, releasing its escrow allocations.
    pub fn resolve_payout_manually(
        &self,
        tenant_id: TenantId,
        payout_id: SellerPayoutId,
        resolved_by: UserId,
        provider_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<SellerPayout>(
            tenant_id,
            payout_id.0,
            PAYOUT_AGGREGATE,
            PayoutCommand::MarkPayoutPaid(MarkPayoutPaid {
                tenant_id,
                payout_id,
                provider_reference: provider_reference.to_string(),
                marked_by: Some(resolved_by),
                occurred_at: now,
            }),
            |id| SellerPayout::empty(SellerPayoutId::new(id)),
        )?;

        let payout = self
            .projections
            .payouts
            .get(tenant_id, &payout_id)
            .ok_or_else(DomainError::not_found)?;
        self.release_covered_allocations(tenant_id, &payout, provider_reference, now)?;
        info!(%tenant_id, %payout_id, %resolved_by, "payout resolved manually");
        Ok(())
    }

    pub fn payout(
        &self,
        tenant_id: TenantId,
        payout_id: &SellerPayoutId,
    ) -> Option<PayoutReadModel> {
        self.projections.payouts.get(tenant_id, payout_id)
    }

    fn release_covered_allocations(
        &self,
        tenant_id: TenantId,
        payout: &PayoutReadModel,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        for shipment_id in &payout.shipments {
            let payment_id = self
                .projections
                .escrow
                .by_shipment(tenant_id, *shipment_id)
                .ok_or_else(DomainError::not_found)?;
            self.execute::<EscrowPayment>(
                tenant_id,
                payment_id.0,
                ESCROW_AGGREGATE,
                EscrowCommand::ReleaseAllocation(ReleaseAllocation {
                    tenant_id,
                    payment_id,
                    shipment_id: *shipment_id,
                    payout_reference: reference.to_string(),
                    occurred_at: now,
                }),
                |id| EscrowPayment::empty(EscrowPaymentId::new(id)),
            )?;
        }
        Ok(())
    }
}
