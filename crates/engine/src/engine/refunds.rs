//! Refund orchestration: authority checks, idempotency, provider calls,
//! ledger reversal, and post-payout carry-over corrections.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use marketpay_core::{AggregateId, DomainError, TenantId};
use marketpay_escrow::{AllocationStatus, EscrowEvent, EscrowPayment, EscrowPaymentId};
use marketpay_escrow::payment::{
    EscrowCommand, RefundAllocation, RefundOrder,
};
use marketpay_events::{EventBus, EventEnvelope};
use marketpay_invoicing::{CreditNoteKind, InvoiceStatus};
use marketpay_refunds::{
    RefundCommand, RefundRequest, RefundRequestId, RefundTarget, Requester,
};
use marketpay_refunds::request::{
    CompleteRefund, FailRefund, InitiateRefund, StartProcessing,
};

use crate::event_store::EventStore;
use crate::projections::RefundReadModel;
use crate::providers::{PaymentProvider, RefundInstruction};

use super::{CarryOverAdjustment, ESCROW_AGGREGATE, Engine, EngineError, REFUND_AGGREGATE};

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Open a refund request. A repeated idempotency key returns the
    /// original request id without dispatching anything; authority rules
    /// (buyer: whole order only, seller: own shipment up to the cap,
    /// admin: unrestricted) are enforced by the aggregate, and seller
    /// ownership of the shipment is checked here against the ledger.
    pub fn initiate_refund(
        &self,
        tenant_id: TenantId,
        target: RefundTarget,
        requester: Requester,
        amount: Option<i64>,
        reason: &str,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundRequestId, EngineError> {
        if let Some(existing) = self
            .projections
            .refunds
            .by_idempotency_key(tenant_id, idempotency_key)
        {
            info!(%tenant_id, %existing, "duplicate refund idempotency key, returning original");
            return Ok(existing);
        }

        let payment_id = match target {
            RefundTarget::Order(order_id) => self.projections.escrow.by_order(tenant_id, order_id),
            RefundTarget::Shipment(shipment_id) => {
                self.projections.escrow.by_shipment(tenant_id, shipment_id)
            }
        }
        .ok_or_else(DomainError::not_found)?;

        if let (Requester::Seller(store_id), RefundTarget::Shipment(shipment_id)) =
            (&requester, &target)
        {
            let owns = self
                .projections
                .escrow
                .get(tenant_id, &payment_id)
                .and_then(|p| p.allocation(*shipment_id).map(|a| a.store_id == *store_id))
                .unwrap_or(false);
            if !owns {
                return Err(DomainError::Unauthorized.into());
            }
        }

        let refund_id = RefundRequestId::new(AggregateId::new());
        self.execute::<RefundRequest>(
            tenant_id,
            refund_id.0,
            REFUND_AGGREGATE,
            RefundCommand::InitiateRefund(InitiateRefund {
                tenant_id,
                refund_id,
                payment_id,
                target,
                requester,
                amount,
                reason: reason.to_string(),
                idempotency_key: idempotency_key.to_string(),
                seller_cap: self.config.seller_refund_cap,
                max_attempts: self.config.refund_max_attempts,
                occurred_at: now,
            }),
            |id| RefundRequest::empty(RefundRequestId::new(id)),
        )?;

        info!(%tenant_id, %refund_id, "refund initiated");
        Ok(refund_id)
    }

    /// Execute one attempt of a pending (or retryable failed) request:
    /// claim it, move the money at the provider, then reverse the escrow
    /// ledger and pro-rata commission. A provider failure is recorded on
    /// the request (terminal once attempts are exhausted) and is not an
    /// engine error.
    pub fn process_refund(
        &self,
        tenant_id: TenantId,
        refund_id: RefundRequestId,
        provider: &dyn PaymentProvider,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<RefundRequest>(
            tenant_id,
            refund_id.0,
            REFUND_AGGREGATE,
            RefundCommand::StartProcessing(StartProcessing {
                tenant_id,
                refund_id,
                occurred_at: now,
            }),
            |id| RefundRequest::empty(RefundRequestId::new(id)),
        )?;

        let request = self
            .projections
            .refunds
            .get(tenant_id, &refund_id)
            .ok_or_else(DomainError::not_found)?;
        let payment = self
            .projections
            .escrow
            .get(tenant_id, &request.payment_id)
            .ok_or_else(DomainError::not_found)?;

        let amount = match request.target {
            RefundTarget::Order(_) => request.amount.unwrap_or(
                payment.total_amount - payment.released_amount - payment.refunded_amount,
            ),
            RefundTarget::Shipment(shipment_id) => {
                let allocation = payment
                    .allocation(shipment_id)
                    .ok_or_else(DomainError::not_found)?;
                request.amount.unwrap_or(
                    (allocation.seller_amount + allocation.shipping_amount
                        - allocation.refunded_amount)
                        .max(0),
                )
            }
        };

        let instruction = RefundInstruction {
            tenant_id,
            refund_id,
            amount,
            currency: payment.currency.clone(),
        };

        let reference = match provider.refund(&instruction) {
            Ok(reference) => reference,
            Err(e) => {
                self.execute::<RefundRequest>(
                    tenant_id,
                    refund_id.0,
                    REFUND_AGGREGATE,
                    RefundCommand::FailRefund(FailRefund {
                        tenant_id,
                        refund_id,
                        error: e.message.clone(),
                        occurred_at: now,
                    }),
                    |id| RefundRequest::empty(RefundRequestId::new(id)),
                )?;
                let failed = self.projections.refunds.get(tenant_id, &refund_id);
                if failed.as_ref().is_some_and(|r| r.terminal) {
                    warn!(%tenant_id, %refund_id, error = %e.message, "refund failed terminally, manual resolution required");
                } else {
                    warn!(%tenant_id, %refund_id, error = %e.message, "refund attempt failed, will retry");
                }
                return Ok(());
            }
        };

        let (amount_refunded, commission_reversed) = self.reverse_in_ledger(
            tenant_id,
            &request,
            request.payment_id,
            amount,
            &reference,
            now,
        )?;

        self.execute::<RefundRequest>(
            tenant_id,
            refund_id.0,
            REFUND_AGGREGATE,
            RefundCommand::CompleteRefund(CompleteRefund {
                tenant_id,
                refund_id,
                provider_reference: reference,
                amount_refunded,
                commission_reversed,
                occurred_at: now,
            }),
            |id| RefundRequest::empty(RefundRequestId::new(id)),
        )?;

        info!(%tenant_id, %refund_id, amount_refunded, commission_reversed, "refund completed");
        Ok(())
    }

    pub fn refund(
        &self,
        tenant_id: TenantId,
        refund_id: &RefundRequestId,
    ) -> Option<RefundReadModel> {
        self.projections.refunds.get(tenant_id, refund_id)
    }

    /// Reverse the refunded money in the escrow ledger. A shipment whose
    /// allocation was already released (the seller has been paid) cannot
    /// be reversed in escrow; the correction becomes a negative adjustment
    /// on the store's next settlement, plus a credit note when the
    /// commission was already invoiced.
    fn reverse_in_ledger(
        &self,
        tenant_id: TenantId,
        request: &RefundReadModel,
        payment_id: EscrowPaymentId,
        amount: i64,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, i64), EngineError> {
        if let RefundTarget::Shipment(shipment_id) = request.target {
            let payment = self
                .projections
                .escrow
                .get(tenant_id, &payment_id)
                .ok_or_else(DomainError::not_found)?;
            let allocation = payment
                .allocation(shipment_id)
                .ok_or_else(DomainError::not_found)?;
            if allocation.status == AllocationStatus::Released {
                let allocation = allocation.clone();
                return self.carry_over_refund(tenant_id, request, &allocation, amount, reference, now);
            }
        }

        let command = match request.target {
            RefundTarget::Order(_) if request.amount.is_none() => {
                EscrowCommand::RefundOrder(RefundOrder {
                    tenant_id,
                    payment_id,
                    reference: reference.to_string(),
                    rounding: self.config.rounding,
                    occurred_at: now,
                })
            }
            RefundTarget::Order(_) => {
                // InitiateRefund rejects order targets carrying a partial
                // amount, so a request can never reach this point.
                return Err(DomainError::invariant(
                    "order refund with a partial amount reached the ledger",
                )
                .into());
            }
            RefundTarget::Shipment(shipment_id) => {
                EscrowCommand::RefundAllocation(RefundAllocation {
                    tenant_id,
                    payment_id,
                    shipment_id,
                    amount: request.amount,
                    reference: reference.to_string(),
                    rounding: self.config.rounding,
                    occurred_at: now,
                })
            }
        };

        let committed = self.execute::<EscrowPayment>(
            tenant_id,
            payment_id.0,
            ESCROW_AGGREGATE,
            command,
            |id| EscrowPayment::empty(EscrowPaymentId::new(id)),
        )?;

        let mut amount_refunded = 0i64;
        let mut commission_reversed = 0i64;
        for stored in &committed {
            let ev: EscrowEvent = serde_json::from_value(stored.payload.clone())
                .map_err(|e| EngineError::Projection(e.to_string()))?;
            if let EscrowEvent::AllocationRefunded(e) = ev {
                amount_refunded += e.amount;
                commission_reversed += e.commission_reversed;
            }
        }
        Ok((amount_refunded, commission_reversed))
    }

    /// Post-payout correction path: the money already left escrow, so the
    /// refund is clawed back from the store's next settlement instead.
    fn carry_over_refund(
        &self,
        tenant_id: TenantId,
        request: &RefundReadModel,
        allocation: &crate::projections::AllocationView,
        amount: i64,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, i64), EngineError> {
        let seller_part = amount.min(allocation.seller_amount);
        let commission_reversed = self.config.rounding.prorate(
            seller_part,
            allocation.seller_amount,
            allocation.commission_amount,
        )?;

        let corrects_period = allocation.released_at.and_then(|released_at| {
            self.projections
                .settlements
                .for_store(tenant_id, allocation.store_id)
                .into_iter()
                .find(|s| !s.superseded && s.period.contains(released_at.date_naive()))
                .map(|s| s.period)
        });

        self.record_carry_over(
            tenant_id,
            allocation.store_id,
            CarryOverAdjustment {
                amount: -(amount - commission_reversed),
                reason: format!("refund {} of shipment {}", request.refund_id, allocation.shipment_id),
                corrects_period,
            },
        );

        // If the reversed commission was already invoiced, the invoice is
        // never edited; a credit note carries the correction.
        if commission_reversed > 0 {
            if let Some(period) = corrects_period {
                let invoiced = self
                    .projections
                    .settlements
                    .live_for_period(tenant_id, allocation.store_id, period)
                    .and_then(|s| {
                        self.projections
                            .invoices
                            .by_settlement(tenant_id, s.settlement_id)
                    })
                    .filter(|i| matches!(i.status, InvoiceStatus::Issued | InvoiceStatus::Paid));
                if let Some(invoice) = invoiced {
                    self.issue_credit_note(
                        tenant_id,
                        invoice.invoice_id,
                        CreditNoteKind::Partial,
                        commission_reversed,
                        &format!("commission reversal for refund {}", request.refund_id),
                        Some(reference.to_string()),
                        now,
                    )?;
                }
            }
        }

        info!(
            %tenant_id,
            refund_id = %request.refund_id,
            amount,
            commission_reversed,
            "post-payout refund carried over to next settlement"
        );
        Ok((amount, commission_reversed))
    }
}
