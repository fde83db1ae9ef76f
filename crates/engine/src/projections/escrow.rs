use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use marketpay_core::{Currency, OrderId, ShipmentId, StoreId, TenantId};
use marketpay_escrow::{
    AllocationStatus, EscrowEvent, EscrowPaymentId, EscrowPaymentStatus,
};
use marketpay_events::EventEnvelope;
use marketpay_settlement::SettlementPeriod;
use rust_decimal::Decimal;

use crate::read_model::{InMemoryTenantStore, TenantStore};

use super::{CursorCheck, ProjectionError, StreamCursors};

pub const AGGREGATE_TYPE: &str = "escrow.payment";

/// Per-allocation view, including the columns settlement generation reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationView {
    pub shipment_id: ShipmentId,
    pub store_id: StoreId,
    pub seller_amount: i64,
    pub shipping_amount: i64,
    pub commission_rate: Decimal,
    pub commission_amount: i64,
    pub refunded_amount: i64,
    pub refunded_commission: i64,
    pub status: AllocationStatus,
    pub eligible_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    /// Time of the refund that emptied the allocation.
    pub refunded_at: Option<DateTime<Utc>>,
    pub released_amount: i64,
    pub payout_reference: Option<String>,
}

impl AllocationView {
    /// What a payout of this allocation would transfer right now.
    pub fn payable_amount(&self) -> i64 {
        (self.seller_amount + self.shipping_amount
            - self.commission_amount
            - self.refunded_amount)
            .max(0)
    }

    fn remaining_refundable(&self) -> i64 {
        (self.seller_amount + self.shipping_amount - self.refunded_amount).max(0)
    }
}

/// Queryable escrow payment read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowPaymentReadModel {
    pub payment_id: EscrowPaymentId,
    pub order_id: OrderId,
    pub currency: Currency,
    pub status: EscrowPaymentStatus,
    pub total_amount: i64,
    pub released_amount: i64,
    pub refunded_amount: i64,
    pub allocations: Vec<AllocationView>,
}

impl EscrowPaymentReadModel {
    pub fn allocation(&self, shipment_id: ShipmentId) -> Option<&AllocationView> {
        self.allocations
            .iter()
            .find(|a| a.shipment_id == shipment_id)
    }

    fn derive_status(&self) -> EscrowPaymentStatus {
        let disbursed = self.released_amount + self.refunded_amount;
        if disbursed >= self.total_amount {
            if self.released_amount == 0 {
                EscrowPaymentStatus::Refunded
            } else {
                EscrowPaymentStatus::Released
            }
        } else if self.released_amount > 0 {
            EscrowPaymentStatus::PartiallyReleased
        } else if self.refunded_amount > 0 {
            EscrowPaymentStatus::PartiallyRefunded
        } else {
            EscrowPaymentStatus::Held
        }
    }
}

/// Escrow read models plus the order and shipment routing indexes.
#[derive(Debug, Default)]
pub struct EscrowProjection {
    store: InMemoryTenantStore<EscrowPaymentId, EscrowPaymentReadModel>,
    cursors: StreamCursors,
    orders: RwLock<HashMap<(TenantId, OrderId), EscrowPaymentId>>,
    shipments: RwLock<HashMap<(TenantId, ShipmentId), EscrowPaymentId>>,
}

impl EscrowProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        payment_id: &EscrowPaymentId,
    ) -> Option<EscrowPaymentReadModel> {
        self.store.get(tenant_id, payment_id)
    }

    pub fn by_order(&self, tenant_id: TenantId, order_id: OrderId) -> Option<EscrowPaymentId> {
        self.orders
            .read()
            .ok()?
            .get(&(tenant_id, order_id))
            .copied()
    }

    pub fn by_shipment(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
    ) -> Option<EscrowPaymentId> {
        self.shipments
            .read()
            .ok()?
            .get(&(tenant_id, shipment_id))
            .copied()
    }

    /// Allocations of a store that are payable right now.
    pub fn eligible_for_store(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
    ) -> Vec<(EscrowPaymentId, AllocationView)> {
        self.store
            .list(tenant_id)
            .into_iter()
            .flat_map(|payment| {
                let payment_id = payment.payment_id;
                payment
                    .allocations
                    .into_iter()
                    .filter(|a| {
                        a.store_id == store_id && a.status == AllocationStatus::EligibleForPayout
                    })
                    .map(move |a| (payment_id, a))
            })
            .collect()
    }

    /// Allocations of a store settled within a period: released (paid out)
    /// ones anchored by their release time, fully refunded ones by the
    /// refund that emptied them. Both appear on the statement; a refunded
    /// allocation nets to zero but keeps the refund visible.
    pub fn settled_in_period(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        period: SettlementPeriod,
    ) -> Vec<(OrderId, AllocationView)> {
        self.store
            .list(tenant_id)
            .into_iter()
            .flat_map(|payment| {
                let order_id = payment.order_id;
                payment
                    .allocations
                    .into_iter()
                    .filter(|a| {
                        let settled_at = match a.status {
                            AllocationStatus::Released => a.released_at,
                            AllocationStatus::Refunded => a.refunded_at,
                            _ => None,
                        };
                        a.store_id == store_id
                            && settled_at.is_some_and(|at| period.contains(at.date_naive()))
                    })
                    .map(move |a| (order_id, a))
            })
            .collect()
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let CursorCheck::Duplicate = self.cursors.check(tenant_id, aggregate_id, seq)? {
            return Ok(());
        }

        let ev: EscrowEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, payment_id) = match &ev {
            EscrowEvent::EscrowCreated(e) => (e.tenant_id, e.payment_id),
            EscrowEvent::AllocationMarkedEligible(e) => (e.tenant_id, e.payment_id),
            EscrowEvent::AllocationReleased(e) => (e.tenant_id, e.payment_id),
            EscrowEvent::AllocationRefunded(e) => (e.tenant_id, e.payment_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if payment_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event payment_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            EscrowEvent::EscrowCreated(e) => {
                let allocations = e
                    .allocations
                    .iter()
                    .map(|spec| AllocationView {
                        shipment_id: spec.shipment_id,
                        store_id: spec.store_id,
                        seller_amount: spec.seller_amount,
                        shipping_amount: spec.shipping_amount,
                        commission_rate: spec.commission_rate,
                        commission_amount: spec.commission_amount,
                        refunded_amount: 0,
                        refunded_commission: 0,
                        status: AllocationStatus::Held,
                        eligible_at: None,
                        released_at: None,
                        refunded_at: None,
                        released_amount: 0,
                        payout_reference: None,
                    })
                    .collect::<Vec<_>>();

                if let Ok(mut orders) = self.orders.write() {
                    orders.insert((tenant_id, e.order_id), e.payment_id);
                }
                if let Ok(mut shipments) = self.shipments.write() {
                    for a in &allocations {
                        shipments.insert((tenant_id, a.shipment_id), e.payment_id);
                    }
                }

                self.store.upsert(
                    tenant_id,
                    e.payment_id,
                    EscrowPaymentReadModel {
                        payment_id: e.payment_id,
                        order_id: e.order_id,
                        currency: e.currency,
                        status: EscrowPaymentStatus::Held,
                        total_amount: e.total_amount,
                        released_amount: 0,
                        refunded_amount: 0,
                        allocations,
                    },
                );
            }
            EscrowEvent::AllocationMarkedEligible(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.payment_id) {
                    if let Some(a) = rm
                        .allocations
                        .iter_mut()
                        .find(|a| a.shipment_id == e.shipment_id)
                    {
                        a.status = AllocationStatus::EligibleForPayout;
                        a.eligible_at = Some(e.occurred_at);
                    }
                    self.store.upsert(tenant_id, e.payment_id, rm);
                }
            }
            EscrowEvent::AllocationReleased(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.payment_id) {
                    if let Some(a) = rm
                        .allocations
                        .iter_mut()
                        .find(|a| a.shipment_id == e.shipment_id)
                    {
                        a.status = AllocationStatus::Released;
                        a.released_at = Some(e.occurred_at);
                        a.released_amount = e.amount;
                        a.payout_reference = Some(e.payout_reference.clone());
                    }
                    rm.released_amount = e.new_released_total;
                    rm.status = rm.derive_status();
                    self.store.upsert(tenant_id, e.payment_id, rm);
                }
            }
            EscrowEvent::AllocationRefunded(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.payment_id) {
                    if let Some(a) = rm
                        .allocations
                        .iter_mut()
                        .find(|a| a.shipment_id == e.shipment_id)
                    {
                        a.refunded_amount = e.allocation_refunded_total;
                        a.refunded_commission = e.allocation_commission_reversed_total;
                        a.refunded_at = Some(e.occurred_at);
                        if a.remaining_refundable() == 0 {
                            a.status = AllocationStatus::Refunded;
                        } else if a.status == AllocationStatus::Held {
                            a.status = AllocationStatus::PartiallyRefunded;
                        }
                    }
                    rm.refunded_amount = e.new_refunded_total;
                    rm.status = rm.derive_status();
                    self.store.upsert(tenant_id, e.payment_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
