//! Escrow lifecycle: creation with commission resolution, hold-period
//! eligibility, and ledger reconciliation.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use marketpay_core::{
    AggregateId, BuyerId, CategoryId, Currency, DomainError, OrderId, ShipmentId, StoreId,
    TenantId,
};
use marketpay_escrow::{
    AllocationSpec, EscrowCommand, EscrowEvent, EscrowPayment, EscrowPaymentId, LedgerEntry,
    ledger_entries, replay,
};
use marketpay_escrow::payment::{CreateEscrow, MarkAllocationEligible};
use marketpay_events::{EventBus, EventEnvelope};

use crate::event_store::EventStore;
use crate::projections::EscrowPaymentReadModel;

use super::{ESCROW_AGGREGATE, Engine, EngineError};

/// One shipment's slice of an incoming payment, before commission has been
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowAllocationRequest {
    pub shipment_id: ShipmentId,
    pub store_id: StoreId,
    pub category_id: Option<CategoryId>,
    pub seller_amount: i64,
    pub shipping_amount: i64,
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Capture a paid order into escrow: one allocation per shipment, with
    /// the commission rate resolved per allocation at capture time and the
    /// commission amount frozen into the ledger.
    pub fn create_escrow(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        buyer_id: BuyerId,
        currency: Currency,
        requests: Vec<EscrowAllocationRequest>,
        now: DateTime<Utc>,
    ) -> Result<EscrowPaymentId, EngineError> {
        if self.projections.escrow.by_order(tenant_id, order_id).is_some() {
            return Err(DomainError::already_exists(format!(
                "order {order_id} is already held in escrow"
            ))
            .into());
        }

        let as_of = now.date_naive();
        let mut allocations = Vec::with_capacity(requests.len());
        for request in requests {
            let rate = self.resolve_commission_rate(
                tenant_id,
                request.store_id,
                request.category_id,
                as_of,
            )?;
            let commission_amount = self.config.rounding.apply_rate(request.seller_amount, rate)?;
            allocations.push(AllocationSpec {
                shipment_id: request.shipment_id,
                store_id: request.store_id,
                seller_amount: request.seller_amount,
                shipping_amount: request.shipping_amount,
                commission_rate: rate,
                commission_amount,
            });
        }

        let payment_id = EscrowPaymentId::new(AggregateId::new());
        self.execute::<EscrowPayment>(
            tenant_id,
            payment_id.0,
            ESCROW_AGGREGATE,
            EscrowCommand::CreateEscrow(CreateEscrow {
                tenant_id,
                payment_id,
                order_id,
                buyer_id,
                currency,
                allocations,
                occurred_at: now,
            }),
            |id| EscrowPayment::empty(EscrowPaymentId::new(id)),
        )?;

        info!(%tenant_id, %payment_id, %order_id, "escrow created");
        Ok(payment_id)
    }

    /// Promote a delivered shipment's allocation to payable once the
    /// configured hold period has elapsed.
    pub fn mark_allocation_eligible(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
        delivered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let payment_id = self
            .projections
            .escrow
            .by_shipment(tenant_id, shipment_id)
            .ok_or_else(DomainError::not_found)?;

        let hold_until = delivered_at + Duration::days(self.config.escrow_hold_days);
        if now < hold_until {
            return Err(DomainError::invalid_state(format!(
                "hold period has not elapsed; shipment {shipment_id} is held until {hold_until}"
            ))
            .into());
        }

        self.execute::<EscrowPayment>(
            tenant_id,
            payment_id.0,
            ESCROW_AGGREGATE,
            EscrowCommand::MarkAllocationEligible(MarkAllocationEligible {
                tenant_id,
                payment_id,
                shipment_id,
                occurred_at: now,
            }),
            |id| EscrowPayment::empty(EscrowPaymentId::new(id)),
        )?;
        Ok(())
    }

    pub fn escrow_payment(
        &self,
        tenant_id: TenantId,
        payment_id: &EscrowPaymentId,
    ) -> Option<EscrowPaymentReadModel> {
        self.projections.escrow.get(tenant_id, payment_id)
    }

    /// The full audit ledger of a payment, derived from its event stream.
    pub fn ledger(
        &self,
        tenant_id: TenantId,
        payment_id: EscrowPaymentId,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(ledger_entries(&self.escrow_events(tenant_id, payment_id)?))
    }

    /// Replay the stream and cross-check the aggregate totals against the
    /// derived ledger. Any mismatch is a broken invariant, not a user error.
    pub fn reconcile(
        &self,
        tenant_id: TenantId,
        payment_id: EscrowPaymentId,
    ) -> Result<(), EngineError> {
        let events = self.escrow_events(tenant_id, payment_id)?;
        if events.is_empty() {
            return Err(DomainError::not_found().into());
        }

        let payment = replay(payment_id, &events);
        let entries = ledger_entries(&events);
        let disbursed = marketpay_escrow::disbursed_total(&entries);
        let expected = payment.released_amount() + payment.refunded_amount();
        if disbursed != expected {
            return Err(DomainError::invariant(format!(
                "ledger disbursed total {disbursed} does not match aggregate total {expected}"
            ))
            .into());
        }
        Ok(())
    }

    fn escrow_events(
        &self,
        tenant_id: TenantId,
        payment_id: EscrowPaymentId,
    ) -> Result<Vec<EscrowEvent>, EngineError> {
        let stream = self
            .dispatcher
            .store()
            .load_stream(tenant_id, payment_id.0)
            .map_err(crate::command_dispatcher::DispatchError::from)?;
        stream
            .iter()
            .map(|stored| {
                serde_json::from_value(stored.payload.clone())
                    .map_err(|e| EngineError::Projection(e.to_string()))
            })
            .collect()
    }
}
