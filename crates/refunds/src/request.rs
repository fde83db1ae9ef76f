use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, BuyerId, DomainError, OrderId, ShipmentId, StoreId,
    TenantId, UserId,
};
use marketpay_escrow::EscrowPaymentId;
use marketpay_events::Event;

/// Refund request identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefundRequestId(pub AggregateId);

impl RefundRequestId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for RefundRequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What the refund targets: the whole order or one shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum RefundTarget {
    Order(OrderId),
    Shipment(ShipmentId),
}

/// Who asked for the refund. Authority rules differ per requester:
/// buyers may only cancel whole orders, sellers only their own shipment
/// up to a configured cap, admins are unrestricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role", content = "id")]
pub enum Requester {
    Buyer(BuyerId),
    Seller(StoreId),
    Admin(UserId),
}

/// Refund request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Aggregate root: RefundRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    id: RefundRequestId,
    tenant_id: Option<TenantId>,
    payment_id: Option<EscrowPaymentId>,
    target: Option<RefundTarget>,
    requester: Option<Requester>,
    /// Minor units; `None` means "full remaining balance".
    amount: Option<i64>,
    reason: String,
    idempotency_key: String,
    status: RefundStatus,
    attempts: u32,
    max_attempts: u32,
    terminal: bool,
    last_error: Option<String>,
    provider_reference: Option<String>,
    version: u64,
    created: bool,
}

impl RefundRequest {
    /// Empty aggregate for rehydration.
    pub fn empty(id: RefundRequestId) -> Self {
        Self {
            id,
            tenant_id: None,
            payment_id: None,
            target: None,
            requester: None,
            amount: None,
            reason: String::new(),
            idempotency_key: String::new(),
            status: RefundStatus::Pending,
            attempts: 0,
            max_attempts: 0,
            terminal: false,
            last_error: None,
            provider_reference: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RefundRequestId {
        self.id
    }

    pub fn status(&self) -> RefundStatus {
        self.status
    }

    pub fn payment_id(&self) -> Option<EscrowPaymentId> {
        self.payment_id
    }

    pub fn target(&self) -> Option<RefundTarget> {
        self.target
    }

    pub fn amount(&self) -> Option<i64> {
        self.amount
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Terminally failed requests need operator intervention; they are
    /// excluded from automatic retry.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == RefundStatus::Failed && self.terminal
    }

    pub fn can_retry(&self) -> bool {
        self.status == RefundStatus::Failed && !self.terminal
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn provider_reference(&self) -> Option<&str> {
        self.provider_reference.as_deref()
    }
}

impl AggregateRoot for RefundRequest {
    type Id = RefundRequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: InitiateRefund.
///
/// `seller_cap` is the configured per-shipment ceiling for seller-initiated
/// refunds, injected by the engine. Ownership of the shipment (seller may
/// only refund their own) is validated by the engine against the escrow
/// allocation before this command is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateRefund {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub payment_id: EscrowPaymentId,
    pub target: RefundTarget,
    pub requester: Requester,
    pub amount: Option<i64>,
    pub reason: String,
    pub idempotency_key: String,
    pub seller_cap: i64,
    pub max_attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartProcessing — the atomic claim. Only a Pending or
/// retryable-Failed request may be claimed; the optimistic append makes the
/// claim race-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessing {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteRefund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRefund {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub provider_reference: String,
    /// Minor units actually reversed in the escrow ledger.
    pub amount_refunded: i64,
    pub commission_reversed: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailRefund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailRefund {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundCommand {
    InitiateRefund(InitiateRefund),
    StartProcessing(StartProcessing),
    CompleteRefund(CompleteRefund),
    FailRefund(FailRefund),
}

/// Event: RefundInitiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundInitiated {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub payment_id: EscrowPaymentId,
    pub target: RefundTarget,
    pub requester: Requester,
    pub amount: Option<i64>,
    pub reason: String,
    pub idempotency_key: String,
    pub max_attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundProcessingStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundProcessingStarted {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    /// 1-based attempt number this claim starts.
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCompleted {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub provider_reference: String,
    pub amount_refunded: i64,
    pub commission_reversed: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundFailed {
    pub tenant_id: TenantId,
    pub refund_id: RefundRequestId,
    pub error: String,
    pub attempts: u32,
    /// True once attempts have exhausted `max_attempts`; the request then
    /// requires manual resolution and is never silently dropped.
    pub terminal: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundEvent {
    RefundInitiated(RefundInitiated),
    RefundProcessingStarted(RefundProcessingStarted),
    RefundCompleted(RefundCompleted),
    RefundFailed(RefundFailed),
}

impl Event for RefundEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RefundEvent::RefundInitiated(_) => "refunds.request.initiated",
            RefundEvent::RefundProcessingStarted(_) => "refunds.request.processing_started",
            RefundEvent::RefundCompleted(_) => "refunds.request.completed",
            RefundEvent::RefundFailed(_) => "refunds.request.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RefundEvent::RefundInitiated(e) => e.occurred_at,
            RefundEvent::RefundProcessingStarted(e) => e.occurred_at,
            RefundEvent::RefundCompleted(e) => e.occurred_at,
            RefundEvent::RefundFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for RefundRequest {
    type Command = RefundCommand;
    type Event = RefundEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RefundEvent::RefundInitiated(e) => {
                self.id = e.refund_id;
                self.tenant_id = Some(e.tenant_id);
                self.payment_id = Some(e.payment_id);
                self.target = Some(e.target);
                self.requester = Some(e.requester);
                self.amount = e.amount;
                self.reason = e.reason.clone();
                self.idempotency_key = e.idempotency_key.clone();
                self.status = RefundStatus::Pending;
                self.max_attempts = e.max_attempts;
                self.created = true;
            }
            RefundEvent::RefundProcessingStarted(_) => {
                self.status = RefundStatus::Processing;
            }
            RefundEvent::RefundCompleted(e) => {
                self.status = RefundStatus::Completed;
                self.provider_reference = Some(e.provider_reference.clone());
            }
            RefundEvent::RefundFailed(e) => {
                self.status = RefundStatus::Failed;
                self.attempts = e.attempts;
                self.terminal = e.terminal;
                self.last_error = Some(e.error.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RefundCommand::InitiateRefund(cmd) => self.handle_initiate(cmd),
            RefundCommand::StartProcessing(cmd) => self.handle_start(cmd),
            RefundCommand::CompleteRefund(cmd) => self.handle_complete(cmd),
            RefundCommand::FailRefund(cmd) => self.handle_fail(cmd),
        }
    }
}

impl RefundRequest {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn check_authority(cmd: &InitiateRefund) -> Result<(), DomainError> {
        match (&cmd.requester, &cmd.target) {
            // Buyers may only cancel the whole order, full amount.
            (Requester::Buyer(_), RefundTarget::Order(_)) => {
                if cmd.amount.is_some() {
                    return Err(DomainError::Unauthorized);
                }
                Ok(())
            }
            (Requester::Buyer(_), RefundTarget::Shipment(_)) => Err(DomainError::Unauthorized),
            // Sellers may refund their own shipment, up to the cap.
            (Requester::Seller(_), RefundTarget::Shipment(_)) => match cmd.amount {
                Some(amount) if amount <= cmd.seller_cap => Ok(()),
                Some(_) => Err(DomainError::Unauthorized),
                None => Err(DomainError::Unauthorized),
            },
            (Requester::Seller(_), RefundTarget::Order(_)) => Err(DomainError::Unauthorized),
            (Requester::Admin(_), _) => Ok(()),
        }
    }

    fn handle_initiate(&self, cmd: &InitiateRefund) -> Result<Vec<RefundEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists(format!(
                "refund request {} already exists",
                cmd.refund_id
            )));
        }
        if cmd.idempotency_key.is_empty() {
            return Err(DomainError::validation("idempotency key is required"));
        }
        if let Some(amount) = cmd.amount {
            if amount <= 0 {
                return Err(DomainError::validation("refund amount must be positive"));
            }
        }
        if cmd.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        Self::check_authority(cmd)?;
        // An order-level refund is always the full remaining balance; a
        // partial amount must name the shipment it comes out of. Rejected
        // here so an invalid request never reaches the payment provider.
        if matches!(cmd.target, RefundTarget::Order(_)) && cmd.amount.is_some() {
            return Err(DomainError::validation(
                "partial order refunds must target a shipment",
            ));
        }

        Ok(vec![RefundEvent::RefundInitiated(RefundInitiated {
            tenant_id: cmd.tenant_id,
            refund_id: cmd.refund_id,
            payment_id: cmd.payment_id,
            target: cmd.target,
            requester: cmd.requester,
            amount: cmd.amount,
            reason: cmd.reason.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            max_attempts: cmd.max_attempts,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start(&self, cmd: &StartProcessing) -> Result<Vec<RefundEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        match self.status {
            RefundStatus::Pending => {}
            RefundStatus::Failed if !self.terminal => {}
            RefundStatus::Failed => {
                return Err(DomainError::invalid_state(
                    "refund failed terminally; manual resolution required",
                ));
            }
            other => {
                return Err(DomainError::invalid_state(format!(
                    "refund is {other:?}, only Pending or retryable Failed can be claimed"
                )));
            }
        }

        Ok(vec![RefundEvent::RefundProcessingStarted(
            RefundProcessingStarted {
                tenant_id: cmd.tenant_id,
                refund_id: cmd.refund_id,
                attempt: self.attempts + 1,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_complete(&self, cmd: &CompleteRefund) -> Result<Vec<RefundEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status != RefundStatus::Processing {
            return Err(DomainError::invalid_state(format!(
                "refund is {:?}, only Processing can complete",
                self.status
            )));
        }

        Ok(vec![RefundEvent::RefundCompleted(RefundCompleted {
            tenant_id: cmd.tenant_id,
            refund_id: cmd.refund_id,
            provider_reference: cmd.provider_reference.clone(),
            amount_refunded: cmd.amount_refunded,
            commission_reversed: cmd.commission_reversed,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail(&self, cmd: &FailRefund) -> Result<Vec<RefundEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status != RefundStatus::Processing {
            return Err(DomainError::invalid_state(format!(
                "refund is {:?}, only Processing can fail",
                self.status
            )));
        }

        let attempts = self.attempts + 1;
        Ok(vec![RefundEvent::RefundFailed(RefundFailed {
            tenant_id: cmd.tenant_id,
            refund_id: cmd.refund_id,
            error: cmd.error.clone(),
            attempts,
            terminal: attempts >= self.max_attempts,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> RefundRequestId {
        RefundRequestId::new(AggregateId::new())
    }

    fn initiate_cmd(requester: Requester, target: RefundTarget, amount: Option<i64>) -> InitiateRefund {
        InitiateRefund {
            tenant_id: TenantId::new(),
            refund_id: test_id(),
            payment_id: EscrowPaymentId::new(AggregateId::new()),
            target,
            requester,
            amount,
            reason: "damaged item".to_string(),
            idempotency_key: "key-1".to_string(),
            seller_cap: 5_000,
            max_attempts: 3,
            occurred_at: Utc::now(),
        }
    }

    fn run(request: &mut RefundRequest, cmd: RefundCommand) -> Result<Vec<RefundEvent>, DomainError> {
        let events = request.handle(&cmd)?;
        for e in &events {
            request.apply(e);
        }
        Ok(events)
    }

    #[test]
    fn buyer_may_only_request_full_order_refunds() {
        let request = RefundRequest::empty(test_id());
        let buyer = Requester::Buyer(BuyerId::new());

        let full_order = initiate_cmd(buyer, RefundTarget::Order(OrderId::new()), None);
        assert!(request
            .handle(&RefundCommand::InitiateRefund(full_order))
            .is_ok());

        let partial = initiate_cmd(buyer, RefundTarget::Order(OrderId::new()), Some(1_000));
        assert_eq!(
            request
                .handle(&RefundCommand::InitiateRefund(partial))
                .unwrap_err(),
            DomainError::Unauthorized
        );

        let shipment = initiate_cmd(buyer, RefundTarget::Shipment(ShipmentId::new()), None);
        assert_eq!(
            request
                .handle(&RefundCommand::InitiateRefund(shipment))
                .unwrap_err(),
            DomainError::Unauthorized
        );
    }

    #[test]
    fn seller_refunds_are_capped() {
        let request = RefundRequest::empty(test_id());
        let seller = Requester::Seller(StoreId::new());
        let shipment = RefundTarget::Shipment(ShipmentId::new());

        assert!(request
            .handle(&RefundCommand::InitiateRefund(initiate_cmd(
                seller,
                shipment,
                Some(5_000)
            )))
            .is_ok());
        assert_eq!(
            request
                .handle(&RefundCommand::InitiateRefund(initiate_cmd(
                    seller,
                    shipment,
                    Some(5_001)
                )))
                .unwrap_err(),
            DomainError::Unauthorized
        );
        assert_eq!(
            request
                .handle(&RefundCommand::InitiateRefund(initiate_cmd(
                    seller,
                    RefundTarget::Order(OrderId::new()),
                    Some(100)
                )))
                .unwrap_err(),
            DomainError::Unauthorized
        );
    }

    #[test]
    fn admin_is_unrestricted() {
        let request = RefundRequest::empty(test_id());
        let admin = Requester::Admin(UserId::new());
        assert!(request
            .handle(&RefundCommand::InitiateRefund(initiate_cmd(
                admin,
                RefundTarget::Shipment(ShipmentId::new()),
                Some(1_000_000)
            )))
            .is_ok());
    }

    #[test]
    fn partial_order_refunds_are_rejected_for_everyone() {
        let request = RefundRequest::empty(test_id());

        // Admins clear the authority check, but the shape is still invalid:
        // a partial amount has to name a shipment.
        let err = request
            .handle(&RefundCommand::InitiateRefund(initiate_cmd(
                Requester::Admin(UserId::new()),
                RefundTarget::Order(OrderId::new()),
                Some(3_000),
            )))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        // The full-order form stays available to admins.
        assert!(request
            .handle(&RefundCommand::InitiateRefund(initiate_cmd(
                Requester::Admin(UserId::new()),
                RefundTarget::Order(OrderId::new()),
                None,
            )))
            .is_ok());
    }

    #[test]
    fn completes_after_processing_claim() {
        let mut request = RefundRequest::empty(test_id());
        let cmd = initiate_cmd(
            Requester::Admin(UserId::new()),
            RefundTarget::Shipment(ShipmentId::new()),
            Some(2_000),
        );
        let tenant_id = cmd.tenant_id;
        let refund_id = cmd.refund_id;
        run(&mut request, RefundCommand::InitiateRefund(cmd)).unwrap();

        // Completing without a claim is an invalid transition.
        let complete = CompleteRefund {
            tenant_id,
            refund_id,
            provider_reference: "prov-1".to_string(),
            amount_refunded: 2_000,
            commission_reversed: 200,
            occurred_at: Utc::now(),
        };
        assert!(matches!(
            request
                .handle(&RefundCommand::CompleteRefund(complete.clone()))
                .unwrap_err(),
            DomainError::InvalidState(_)
        ));

        run(
            &mut request,
            RefundCommand::StartProcessing(StartProcessing {
                tenant_id,
                refund_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(request.status(), RefundStatus::Processing);

        run(&mut request, RefundCommand::CompleteRefund(complete)).unwrap();
        assert_eq!(request.status(), RefundStatus::Completed);
        assert_eq!(request.provider_reference(), Some("prov-1"));
    }

    #[test]
    fn exhausting_attempts_makes_the_failure_terminal() {
        let mut request = RefundRequest::empty(test_id());
        let mut cmd = initiate_cmd(
            Requester::Admin(UserId::new()),
            RefundTarget::Shipment(ShipmentId::new()),
            Some(2_000),
        );
        cmd.max_attempts = 2;
        let tenant_id = cmd.tenant_id;
        let refund_id = cmd.refund_id;
        run(&mut request, RefundCommand::InitiateRefund(cmd)).unwrap();

        for attempt in 1..=2u32 {
            run(
                &mut request,
                RefundCommand::StartProcessing(StartProcessing {
                    tenant_id,
                    refund_id,
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap();
            run(
                &mut request,
                RefundCommand::FailRefund(FailRefund {
                    tenant_id,
                    refund_id,
                    error: "provider timeout".to_string(),
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap();
            assert_eq!(request.attempts(), attempt);
        }

        assert!(request.is_terminal_failure());
        assert!(!request.can_retry());

        // A terminal failure cannot be claimed again.
        let err = request
            .handle(&RefundCommand::StartProcessing(StartProcessing {
                tenant_id,
                refund_id,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn failed_request_can_be_retried_until_terminal() {
        let mut request = RefundRequest::empty(test_id());
        let cmd = initiate_cmd(
            Requester::Admin(UserId::new()),
            RefundTarget::Shipment(ShipmentId::new()),
            Some(2_000),
        );
        let tenant_id = cmd.tenant_id;
        let refund_id = cmd.refund_id;
        run(&mut request, RefundCommand::InitiateRefund(cmd)).unwrap();

        run(
            &mut request,
            RefundCommand::StartProcessing(StartProcessing {
                tenant_id,
                refund_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        run(
            &mut request,
            RefundCommand::FailRefund(FailRefund {
                tenant_id,
                refund_id,
                error: "connection reset".to_string(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert!(request.can_retry());

        // Retry claim succeeds and the next attempt completes.
        run(
            &mut request,
            RefundCommand::StartProcessing(StartProcessing {
                tenant_id,
                refund_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        run(
            &mut request,
            RefundCommand::CompleteRefund(CompleteRefund {
                tenant_id,
                refund_id,
                provider_reference: "prov-2".to_string(),
                amount_refunded: 2_000,
                commission_reversed: 200,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(request.status(), RefundStatus::Completed);
    }
}
