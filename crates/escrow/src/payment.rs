use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use marketpay_core::money::ensure_rate;
use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, BuyerId, Currency, DomainError, OrderId, RoundingPolicy,
    ShipmentId, StoreId, TenantId,
};
use marketpay_events::Event;

/// Escrow payment identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscrowPaymentId(pub AggregateId);

impl EscrowPaymentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for EscrowPaymentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate payment status, derived from its allocations' balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowPaymentStatus {
    Held,
    PartiallyReleased,
    Released,
    PartiallyRefunded,
    Refunded,
}

/// Per-allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Held,
    EligibleForPayout,
    Released,
    Refunded,
    PartiallyRefunded,
}

/// One seller shipment's share of a buyer payment.
///
/// Commission rate and amount are snapshotted at creation and never
/// recomputed: later rule changes must not alter historical allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAllocation {
    pub shipment_id: ShipmentId,
    pub store_id: StoreId,
    /// Goods portion, minor units.
    pub seller_amount: i64,
    /// Shipping portion, minor units.
    pub shipping_amount: i64,
    /// Snapshotted commission rate (e.g. 0.10).
    pub commission_rate: Decimal,
    /// Snapshotted commission, minor units.
    pub commission_amount: i64,
    pub status: AllocationStatus,
    /// Total refunded to the buyer from this allocation so far.
    pub refunded_amount: i64,
    /// Commission reversed pro rata with refunds (fed to credit notes).
    pub refunded_commission: i64,
    /// Set when the allocation became eligible for payout.
    pub eligible_at: Option<DateTime<Utc>>,
}

impl EscrowAllocation {
    /// Seller goods + shipping: this allocation's share of the buyer payment.
    pub fn total_amount(&self) -> i64 {
        self.seller_amount + self.shipping_amount
    }

    /// Goods payout component: seller portion net of commission and refunds.
    pub fn payout_amount(&self) -> i64 {
        (self.seller_amount - self.commission_amount - self.refunded_amount).max(0)
    }

    /// Everything still payable to the seller from this allocation:
    /// goods + shipping − commission − refunds.
    pub fn payable_amount(&self) -> i64 {
        (self.total_amount() - self.commission_amount - self.refunded_amount).max(0)
    }

    /// Funds still held in escrow for this allocation.
    pub fn remaining_refundable(&self) -> i64 {
        self.total_amount() - self.refunded_amount
    }

    pub fn is_refundable(&self) -> bool {
        !matches!(
            self.status,
            AllocationStatus::Released | AllocationStatus::Refunded
        ) && self.remaining_refundable() > 0
    }
}

/// Aggregate root: EscrowPayment.
///
/// Money conservation invariant, maintained by every transition:
/// `released + refunded + held == total`, with `held` derived. The sum of
/// allocation totals equals the payment total from creation on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowPayment {
    id: EscrowPaymentId,
    tenant_id: Option<TenantId>,
    order_id: Option<OrderId>,
    buyer_id: Option<BuyerId>,
    currency: Option<Currency>,
    total: i64,
    released: i64,
    refunded: i64,
    status: EscrowPaymentStatus,
    allocations: Vec<EscrowAllocation>,
    version: u64,
    created: bool,
}

impl EscrowPayment {
    /// Empty aggregate for rehydration.
    pub fn empty(id: EscrowPaymentId) -> Self {
        Self {
            id,
            tenant_id: None,
            order_id: None,
            buyer_id: None,
            currency: None,
            total: 0,
            released: 0,
            refunded: 0,
            status: EscrowPaymentStatus::Held,
            allocations: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> EscrowPaymentId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    pub fn currency(&self) -> Option<&Currency> {
        self.currency.as_ref()
    }

    pub fn status(&self) -> EscrowPaymentStatus {
        self.status
    }

    pub fn total_amount(&self) -> i64 {
        self.total
    }

    pub fn released_amount(&self) -> i64 {
        self.released
    }

    pub fn refunded_amount(&self) -> i64 {
        self.refunded
    }

    /// `total − released − refunded`; non-negative by construction.
    pub fn held_amount(&self) -> i64 {
        self.total - self.released - self.refunded
    }

    pub fn allocations(&self) -> &[EscrowAllocation] {
        &self.allocations
    }

    pub fn allocation(&self, shipment_id: ShipmentId) -> Option<&EscrowAllocation> {
        self.allocations
            .iter()
            .find(|a| a.shipment_id == shipment_id)
    }

    fn derive_status(&self) -> EscrowPaymentStatus {
        let held = self.held_amount();
        if held > 0 {
            if self.released > 0 {
                EscrowPaymentStatus::PartiallyReleased
            } else if self.refunded > 0 {
                EscrowPaymentStatus::PartiallyRefunded
            } else {
                EscrowPaymentStatus::Held
            }
        } else if self.released > 0 {
            EscrowPaymentStatus::Released
        } else {
            EscrowPaymentStatus::Refunded
        }
    }
}

impl AggregateRoot for EscrowPayment {
    type Id = EscrowPaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Per-shipment input to escrow creation. Commission is resolved and
/// computed by the caller (engine) before the command is dispatched; the
/// aggregate only checks shape and conservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSpec {
    pub shipment_id: ShipmentId,
    pub store_id: StoreId,
    pub seller_amount: i64,
    pub shipping_amount: i64,
    pub commission_rate: Decimal,
    pub commission_amount: i64,
}

/// Command: CreateEscrow — at most once per order (the engine checks the
/// order index; the aggregate rejects double creation of its own stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEscrow {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub order_id: OrderId,
    pub buyer_id: BuyerId,
    pub currency: Currency,
    pub allocations: Vec<AllocationSpec>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkAllocationEligible — idempotent (no-op when already
/// eligible or beyond).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAllocationEligible {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseAllocation — EligibleForPayout only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAllocation {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub shipment_id: ShipmentId,
    pub payout_reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundAllocation — full (amount omitted) or partial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundAllocation {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub shipment_id: ShipmentId,
    /// Minor units; `None` refunds the full remaining balance.
    pub amount: Option<i64>,
    pub reference: String,
    pub rounding: RoundingPolicy,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundOrder — refunds every allocation as one atomic unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOrder {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub reference: String,
    pub rounding: RoundingPolicy,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowCommand {
    CreateEscrow(CreateEscrow),
    MarkAllocationEligible(MarkAllocationEligible),
    ReleaseAllocation(ReleaseAllocation),
    RefundAllocation(RefundAllocation),
    RefundOrder(RefundOrder),
}

/// Event: EscrowCreated — the "Created" ledger entries for all allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowCreated {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub order_id: OrderId,
    pub buyer_id: BuyerId,
    pub currency: Currency,
    pub total_amount: i64,
    pub allocations: Vec<AllocationSpec>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationMarkedEligible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationMarkedEligible {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReleased {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub shipment_id: ShipmentId,
    /// Funds leaving escrow: allocation total minus prior refunds.
    pub amount: i64,
    pub payout_reference: String,
    /// Payment-level running total after this release.
    pub new_released_total: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationRefunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRefunded {
    pub tenant_id: TenantId,
    pub payment_id: EscrowPaymentId,
    pub shipment_id: ShipmentId,
    pub amount: i64,
    /// Commission reversed pro rata for this refund slice.
    pub commission_reversed: i64,
    pub reference: String,
    /// Allocation-level refunded total after this refund.
    pub allocation_refunded_total: i64,
    /// Allocation-level reversed-commission total after this refund.
    pub allocation_commission_reversed_total: i64,
    /// Payment-level running total after this refund.
    pub new_refunded_total: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowEvent {
    EscrowCreated(EscrowCreated),
    AllocationMarkedEligible(AllocationMarkedEligible),
    AllocationReleased(AllocationReleased),
    AllocationRefunded(AllocationRefunded),
}

impl Event for EscrowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            EscrowEvent::EscrowCreated(_) => "escrow.payment.created",
            EscrowEvent::AllocationMarkedEligible(_) => "escrow.allocation.marked_eligible",
            EscrowEvent::AllocationReleased(_) => "escrow.allocation.released",
            EscrowEvent::AllocationRefunded(_) => "escrow.allocation.refunded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            EscrowEvent::EscrowCreated(e) => e.occurred_at,
            EscrowEvent::AllocationMarkedEligible(e) => e.occurred_at,
            EscrowEvent::AllocationReleased(e) => e.occurred_at,
            EscrowEvent::AllocationRefunded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for EscrowPayment {
    type Command = EscrowCommand;
    type Event = EscrowEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            EscrowEvent::EscrowCreated(e) => {
                self.id = e.payment_id;
                self.tenant_id = Some(e.tenant_id);
                self.order_id = Some(e.order_id);
                self.buyer_id = Some(e.buyer_id);
                self.currency = Some(e.currency.clone());
                self.total = e.total_amount;
                self.released = 0;
                self.refunded = 0;
                self.status = EscrowPaymentStatus::Held;
                self.allocations = e
                    .allocations
                    .iter()
                    .map(|spec| EscrowAllocation {
                        shipment_id: spec.shipment_id,
                        store_id: spec.store_id,
                        seller_amount: spec.seller_amount,
                        shipping_amount: spec.shipping_amount,
                        commission_rate: spec.commission_rate,
                        commission_amount: spec.commission_amount,
                        status: AllocationStatus::Held,
                        refunded_amount: 0,
                        refunded_commission: 0,
                        eligible_at: None,
                    })
                    .collect();
                self.created = true;
            }
            EscrowEvent::AllocationMarkedEligible(e) => {
                if let Some(a) = self
                    .allocations
                    .iter_mut()
                    .find(|a| a.shipment_id == e.shipment_id)
                {
                    a.status = AllocationStatus::EligibleForPayout;
                    a.eligible_at = Some(e.occurred_at);
                }
            }
            EscrowEvent::AllocationReleased(e) => {
                if let Some(a) = self
                    .allocations
                    .iter_mut()
                    .find(|a| a.shipment_id == e.shipment_id)
                {
                    a.status = AllocationStatus::Released;
                }
                self.released = e.new_released_total;
                self.status = self.derive_status();
            }
            EscrowEvent::AllocationRefunded(e) => {
                if let Some(a) = self
                    .allocations
                    .iter_mut()
                    .find(|a| a.shipment_id == e.shipment_id)
                {
                    a.refunded_amount = e.allocation_refunded_total;
                    a.refunded_commission = e.allocation_commission_reversed_total;
                    if a.remaining_refundable() == 0 {
                        a.status = AllocationStatus::Refunded;
                    } else if a.status == AllocationStatus::Held {
                        a.status = AllocationStatus::PartiallyRefunded;
                    }
                }
                self.refunded = e.new_refunded_total;
                self.status = self.derive_status();
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            EscrowCommand::CreateEscrow(cmd) => self.handle_create(cmd),
            EscrowCommand::MarkAllocationEligible(cmd) => self.handle_mark_eligible(cmd),
            EscrowCommand::ReleaseAllocation(cmd) => self.handle_release(cmd),
            EscrowCommand::RefundAllocation(cmd) => self.handle_refund_allocation(cmd),
            EscrowCommand::RefundOrder(cmd) => self.handle_refund_order(cmd),
        }
    }
}

impl EscrowPayment {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn allocation_or_not_found(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<&EscrowAllocation, DomainError> {
        self.allocation(shipment_id).ok_or(DomainError::NotFound)
    }

    fn handle_create(&self, cmd: &CreateEscrow) -> Result<Vec<EscrowEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists(format!(
                "escrow for order {} already exists",
                cmd.order_id
            )));
        }
        if cmd.allocations.is_empty() {
            return Err(DomainError::validation(
                "escrow requires at least one allocation",
            ));
        }

        let mut total: i64 = 0;
        for (idx, spec) in cmd.allocations.iter().enumerate() {
            if spec.seller_amount <= 0 {
                return Err(DomainError::validation(format!(
                    "allocation {idx}: seller amount must be positive"
                )));
            }
            if spec.shipping_amount < 0 {
                return Err(DomainError::validation(format!(
                    "allocation {idx}: shipping amount must not be negative"
                )));
            }
            ensure_rate(spec.commission_rate)?;
            if spec.commission_amount < 0 || spec.commission_amount > spec.seller_amount {
                return Err(DomainError::invariant(format!(
                    "allocation {idx}: commission must be within [0, seller amount]"
                )));
            }
            if cmd.allocations[..idx]
                .iter()
                .any(|other| other.shipment_id == spec.shipment_id)
            {
                return Err(DomainError::validation(format!(
                    "duplicate shipment {} in escrow creation",
                    spec.shipment_id
                )));
            }
            total = total
                .checked_add(spec.seller_amount)
                .and_then(|t| t.checked_add(spec.shipping_amount))
                .ok_or_else(|| DomainError::invariant("escrow total overflow"))?;
        }

        Ok(vec![EscrowEvent::EscrowCreated(EscrowCreated {
            tenant_id: cmd.tenant_id,
            payment_id: cmd.payment_id,
            order_id: cmd.order_id,
            buyer_id: cmd.buyer_id,
            currency: cmd.currency.clone(),
            total_amount: total,
            allocations: cmd.allocations.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_eligible(
        &self,
        cmd: &MarkAllocationEligible,
    ) -> Result<Vec<EscrowEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_tenant(cmd.tenant_id)?;
        let allocation = self.allocation_or_not_found(cmd.shipment_id)?;

        match allocation.status {
            AllocationStatus::Held | AllocationStatus::PartiallyRefunded => {
                Ok(vec![EscrowEvent::AllocationMarkedEligible(
                    AllocationMarkedEligible {
                        tenant_id: cmd.tenant_id,
                        payment_id: cmd.payment_id,
                        shipment_id: cmd.shipment_id,
                        occurred_at: cmd.occurred_at,
                    },
                )])
            }
            // Already eligible or beyond: idempotent no-op.
            AllocationStatus::EligibleForPayout
            | AllocationStatus::Released
            | AllocationStatus::Refunded => Ok(vec![]),
        }
    }

    fn handle_release(&self, cmd: &ReleaseAllocation) -> Result<Vec<EscrowEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_tenant(cmd.tenant_id)?;
        let allocation = self.allocation_or_not_found(cmd.shipment_id)?;

        if allocation.status != AllocationStatus::EligibleForPayout {
            return Err(DomainError::invalid_state(format!(
                "allocation {} is {:?}, only EligibleForPayout can be released",
                cmd.shipment_id, allocation.status
            )));
        }

        let amount = allocation.remaining_refundable();
        let new_released_total = self
            .released
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("released total overflow"))?;

        Ok(vec![EscrowEvent::AllocationReleased(AllocationReleased {
            tenant_id: cmd.tenant_id,
            payment_id: cmd.payment_id,
            shipment_id: cmd.shipment_id,
            amount,
            payout_reference: cmd.payout_reference.clone(),
            new_released_total,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Build the refund event for one allocation, reversing commission pro
    /// rata over the seller-portion slice of the refund.
    fn refund_event(
        &self,
        allocation: &EscrowAllocation,
        amount: Option<i64>,
        reference: &str,
        rounding: RoundingPolicy,
        new_refunded_total: i64,
        cmd_tenant: TenantId,
        occurred_at: DateTime<Utc>,
    ) -> Result<EscrowEvent, DomainError> {
        let remaining = allocation.remaining_refundable();
        let amount = amount.unwrap_or(remaining);
        if amount <= 0 {
            return Err(DomainError::validation("refund amount must be positive"));
        }
        if amount > remaining {
            return Err(DomainError::insufficient_balance(format!(
                "refund of {amount} exceeds remaining balance {remaining} on shipment {}",
                allocation.shipment_id
            )));
        }

        // Refunds consume the seller portion first; only that slice carries
        // commission to reverse.
        let seller_refunded_before = allocation.refunded_amount.min(allocation.seller_amount);
        let seller_refunded_after =
            (allocation.refunded_amount + amount).min(allocation.seller_amount);
        let seller_slice = seller_refunded_after - seller_refunded_before;
        let commission_reversed = if seller_slice > 0 {
            rounding.prorate(
                seller_slice,
                allocation.seller_amount,
                allocation.commission_amount,
            )?
        } else {
            0
        };

        let new_total = new_refunded_total
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("refunded total overflow"))?;

        Ok(EscrowEvent::AllocationRefunded(AllocationRefunded {
            tenant_id: cmd_tenant,
            payment_id: self.id,
            shipment_id: allocation.shipment_id,
            amount,
            commission_reversed,
            reference: reference.to_string(),
            allocation_refunded_total: allocation.refunded_amount + amount,
            allocation_commission_reversed_total: allocation.refunded_commission
                + commission_reversed,
            new_refunded_total: new_total,
            occurred_at,
        }))
    }

    fn handle_refund_allocation(
        &self,
        cmd: &RefundAllocation,
    ) -> Result<Vec<EscrowEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_tenant(cmd.tenant_id)?;
        let allocation = self.allocation_or_not_found(cmd.shipment_id)?;

        if matches!(
            allocation.status,
            AllocationStatus::Released | AllocationStatus::Refunded
        ) {
            return Err(DomainError::invalid_state(format!(
                "allocation {} is {:?} and can no longer be refunded",
                cmd.shipment_id, allocation.status
            )));
        }

        Ok(vec![self.refund_event(
            allocation,
            cmd.amount,
            &cmd.reference,
            cmd.rounding,
            self.refunded,
            cmd.tenant_id,
            cmd.occurred_at,
        )?])
    }

    fn handle_refund_order(&self, cmd: &RefundOrder) -> Result<Vec<EscrowEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_tenant(cmd.tenant_id)?;

        // All shipments refund or none: a released allocation makes the whole
        // order refund impossible.
        if let Some(released) = self
            .allocations
            .iter()
            .find(|a| a.status == AllocationStatus::Released)
        {
            return Err(DomainError::invalid_state(format!(
                "allocation {} was already released; full order refund is not possible",
                released.shipment_id
            )));
        }

        let refundable: Vec<&EscrowAllocation> = self
            .allocations
            .iter()
            .filter(|a| a.remaining_refundable() > 0)
            .collect();
        if refundable.is_empty() {
            return Err(DomainError::invalid_state(
                "order is already fully refunded",
            ));
        }

        let mut events = Vec::with_capacity(refundable.len());
        let mut running_total = self.refunded;
        for allocation in refundable {
            let event = self.refund_event(
                allocation,
                None,
                &cmd.reference,
                cmd.rounding,
                running_total,
                cmd.tenant_id,
                cmd.occurred_at,
            )?;
            if let EscrowEvent::AllocationRefunded(e) = &event {
                running_total = e.new_refunded_total;
            }
            events.push(event);
        }

        Ok(events)
    }
}
