use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, Currency, DomainError, ShipmentId, StoreId, TenantId,
    UserId,
};
use marketpay_events::Event;

/// Seller payout identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SellerPayoutId(pub AggregateId);

impl SellerPayoutId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SellerPayoutId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Payout lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Scheduled,
    Processing,
    Paid,
    Failed,
}

/// Aggregate root: SellerPayout.
///
/// One payout bundles the payable balances of a store's eligible escrow
/// allocations for a payout cycle. The covered shipments are recorded so
/// the corresponding escrow releases can reference this payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellerPayout {
    id: SellerPayoutId,
    tenant_id: Option<TenantId>,
    store_id: Option<StoreId>,
    currency: Option<Currency>,
    amount: i64,
    shipments: Vec<ShipmentId>,
    scheduled_for: Option<NaiveDate>,
    status: PayoutStatus,
    attempts: u32,
    max_retries: u32,
    next_retry_at: Option<DateTime<Utc>>,
    terminal: bool,
    provider_reference: Option<String>,
    last_error: Option<String>,
    version: u64,
    created: bool,
}

impl SellerPayout {
    pub fn empty(id: SellerPayoutId) -> Self {
        Self {
            id,
            tenant_id: None,
            store_id: None,
            currency: None,
            amount: 0,
            shipments: Vec::new(),
            scheduled_for: None,
            status: PayoutStatus::Scheduled,
            attempts: 0,
            max_retries: 0,
            next_retry_at: None,
            terminal: false,
            provider_reference: None,
            last_error: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SellerPayoutId {
        self.id
    }

    pub fn store_id(&self) -> Option<StoreId> {
        self.store_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn shipments(&self) -> &[ShipmentId] {
        &self.shipments
    }

    pub fn status(&self) -> PayoutStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn is_terminal_failure(&self) -> bool {
        self.status == PayoutStatus::Failed && self.terminal
    }

    /// Retryable failures are picked up by the scheduler once
    /// `next_retry_at` passes.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PayoutStatus::Failed
            && !self.terminal
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn provider_reference(&self) -> Option<&str> {
        self.provider_reference.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

impl AggregateRoot for SellerPayout {
    type Id = SellerPayoutId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: SchedulePayout. The engine has already verified the amount
/// clears the payout threshold and claimed the covered shipments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePayout {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub store_id: StoreId,
    pub currency: Currency,
    pub amount: i64,
    pub shipments: Vec<ShipmentId>,
    pub scheduled_for: NaiveDate,
    pub max_retries: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartPayout — claims the payout for a transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPayout {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkPayoutPaid. Besides the normal Processing → Paid
/// transition, an operator may force a terminally failed payout to Paid
/// after settling it out of band; `marked_by` records who did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayoutPaid {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub provider_reference: String,
    pub marked_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkPayoutFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayoutFailed {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub error: String,
    /// When the scheduler may try again; ignored once retries are exhausted.
    pub next_retry_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutCommand {
    SchedulePayout(SchedulePayout),
    StartPayout(StartPayout),
    MarkPayoutPaid(MarkPayoutPaid),
    MarkPayoutFailed(MarkPayoutFailed),
}

/// Event: PayoutScheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutScheduled {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub store_id: StoreId,
    pub currency: Currency,
    pub amount: i64,
    pub shipments: Vec<ShipmentId>,
    pub scheduled_for: NaiveDate,
    pub max_retries: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PayoutProcessingStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutProcessingStarted {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PayoutPaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPaid {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub provider_reference: String,
    pub marked_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PayoutFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutFailed {
    pub tenant_id: TenantId,
    pub payout_id: SellerPayoutId,
    pub error: String,
    pub attempts: u32,
    pub terminal: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutEvent {
    PayoutScheduled(PayoutScheduled),
    PayoutProcessingStarted(PayoutProcessingStarted),
    PayoutPaid(PayoutPaid),
    PayoutFailed(PayoutFailed),
}

impl Event for PayoutEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PayoutEvent::PayoutScheduled(_) => "payouts.payout.scheduled",
            PayoutEvent::PayoutProcessingStarted(_) => "payouts.payout.processing_started",
            PayoutEvent::PayoutPaid(_) => "payouts.payout.paid",
            PayoutEvent::PayoutFailed(_) => "payouts.payout.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PayoutEvent::PayoutScheduled(e) => e.occurred_at,
            PayoutEvent::PayoutProcessingStarted(e) => e.occurred_at,
            PayoutEvent::PayoutPaid(e) => e.occurred_at,
            PayoutEvent::PayoutFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SellerPayout {
    type Command = PayoutCommand;
    type Event = PayoutEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PayoutEvent::PayoutScheduled(e) => {
                self.id = e.payout_id;
                self.tenant_id = Some(e.tenant_id);
                self.store_id = Some(e.store_id);
                self.currency = Some(e.currency.clone());
                self.amount = e.amount;
                self.shipments = e.shipments.clone();
                self.scheduled_for = Some(e.scheduled_for);
                self.max_retries = e.max_retries;
                self.status = PayoutStatus::Scheduled;
                self.created = true;
            }
            PayoutEvent::PayoutProcessingStarted(_) => {
                self.status = PayoutStatus::Processing;
                self.next_retry_at = None;
            }
            PayoutEvent::PayoutPaid(e) => {
                self.status = PayoutStatus::Paid;
                self.provider_reference = Some(e.provider_reference.clone());
            }
            PayoutEvent::PayoutFailed(e) => {
                self.status = PayoutStatus::Failed;
                self.attempts = e.attempts;
                self.terminal = e.terminal;
                self.next_retry_at = e.next_retry_at;
                self.last_error = Some(e.error.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PayoutCommand::SchedulePayout(cmd) => self.handle_schedule(cmd),
            PayoutCommand::StartPayout(cmd) => self.handle_start(cmd),
            PayoutCommand::MarkPayoutPaid(cmd) => self.handle_paid(cmd),
            PayoutCommand::MarkPayoutFailed(cmd) => self.handle_failed(cmd),
        }
    }
}

impl SellerPayout {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_schedule(&self, cmd: &SchedulePayout) -> Result<Vec<PayoutEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists(format!(
                "payout {} already exists",
                cmd.payout_id
            )));
        }
        if cmd.amount <= 0 {
            return Err(DomainError::validation("payout amount must be positive"));
        }
        if cmd.shipments.is_empty() {
            return Err(DomainError::validation(
                "payout must cover at least one shipment",
            ));
        }

        Ok(vec![PayoutEvent::PayoutScheduled(PayoutScheduled {
            tenant_id: cmd.tenant_id,
            payout_id: cmd.payout_id,
            store_id: cmd.store_id,
            currency: cmd.currency.clone(),
            amount: cmd.amount,
            shipments: cmd.shipments.clone(),
            scheduled_for: cmd.scheduled_for,
            max_retries: cmd.max_retries,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start(&self, cmd: &StartPayout) -> Result<Vec<PayoutEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        match self.status {
            PayoutStatus::Scheduled => {}
            PayoutStatus::Failed if !self.terminal => {}
            PayoutStatus::Failed => {
                return Err(DomainError::invalid_state(
                    "payout retries exhausted; manual resolution required",
                ));
            }
            other => {
                return Err(DomainError::invalid_state(format!(
                    "payout is {other:?}, only Scheduled or retryable Failed can start"
                )));
            }
        }

        Ok(vec![PayoutEvent::PayoutProcessingStarted(
            PayoutProcessingStarted {
                tenant_id: cmd.tenant_id,
                payout_id: cmd.payout_id,
                attempt: self.attempts + 1,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_paid(&self, cmd: &MarkPayoutPaid) -> Result<Vec<PayoutEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        match self.status {
            PayoutStatus::Processing => {}
            // Operator override for an out-of-band transfer.
            PayoutStatus::Failed if cmd.marked_by.is_some() => {}
            other => {
                return Err(DomainError::invalid_state(format!(
                    "payout is {other:?}, cannot be marked paid"
                )));
            }
        }
        if cmd.provider_reference.is_empty() {
            return Err(DomainError::validation("provider reference is required"));
        }

        Ok(vec![PayoutEvent::PayoutPaid(PayoutPaid {
            tenant_id: cmd.tenant_id,
            payout_id: cmd.payout_id,
            provider_reference: cmd.provider_reference.clone(),
            marked_by: cmd.marked_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_failed(&self, cmd: &MarkPayoutFailed) -> Result<Vec<PayoutEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status != PayoutStatus::Processing {
            return Err(DomainError::invalid_state(format!(
                "payout is {:?}, only Processing can fail",
                self.status
            )));
        }

        let attempts = self.attempts + 1;
        // First attempt plus max_retries retries.
        let terminal = attempts > self.max_retries;
        Ok(vec![PayoutEvent::PayoutFailed(PayoutFailed {
            tenant_id: cmd.tenant_id,
            payout_id: cmd.payout_id,
            error: cmd.error.clone(),
            attempts,
            terminal,
            next_retry_at: (!terminal).then_some(cmd.next_retry_at),
            occurred_at: cmd.occurred_at,
        })])
    }
}
