//! End-to-end scenarios across the whole pipeline: escrow capture,
//! eligibility, payouts, settlement, invoicing, refunds, and the
//! carry-over path, all on in-memory infrastructure.

use std::sync::Arc;
use std::thread;

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

use marketpay_core::{BuyerId, CategoryId, Currency, DomainError, OrderId, ShipmentId, StoreId, UserId};
use marketpay_escrow::{AllocationStatus, EscrowPaymentStatus};
use marketpay_invoicing::{CreditNoteKind, CreditNoteStatus, InvoiceStatus};
use marketpay_payouts::PayoutStatus;
use marketpay_rates::{CommissionScope, CountryCode, EffectiveWindow, VatScope};
use marketpay_refunds::{RefundStatus, RefundTarget, Requester};
use marketpay_settlement::{SettlementPeriod, SettlementStatus};

use crate::config::EngineConfig;
use crate::engine::{EngineError, EscrowAllocationRequest, InMemoryEngine, ScheduleOutcome};
use crate::providers::test_providers::{AlwaysSucceeds, FailsThenSucceeds};

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
}

fn period_for(date: NaiveDate) -> SettlementPeriod {
    let start = date.with_day(1).unwrap();
    let end = start + Duration::days(27);
    SettlementPeriod::new(start, end).unwrap()
}

fn engine_with_global_rate(tenant_id: marketpay_core::TenantId, rate: &str) -> InMemoryEngine {
    let engine = InMemoryEngine::in_memory(EngineConfig::default());
    engine
        .add_commission_rule(
            tenant_id,
            CommissionScope::Global,
            rate.parse::<Decimal>().unwrap(),
            EffectiveWindow::unbounded(),
            now(),
        )
        .unwrap();
    engine
}

struct Order {
    payment_id: marketpay_escrow::EscrowPaymentId,
    shipment_id: ShipmentId,
    store_id: StoreId,
}

/// One order, one shipment: seller 8_000, shipping 2_000.
fn capture_order(engine: &InMemoryEngine, tenant_id: marketpay_core::TenantId) -> Order {
    let shipment_id = ShipmentId::new();
    let store_id = StoreId::new();
    let payment_id = engine
        .create_escrow(
            tenant_id,
            OrderId::new(),
            BuyerId::new(),
            Currency::usd(),
            vec![EscrowAllocationRequest {
                shipment_id,
                store_id,
                category_id: None,
                seller_amount: 8_000,
                shipping_amount: 2_000,
            }],
            now(),
        )
        .unwrap();
    Order {
        payment_id,
        shipment_id,
        store_id,
    }
}

fn deliver_and_wait(engine: &InMemoryEngine, tenant_id: marketpay_core::TenantId, order: &Order) {
    let delivered_at = now();
    let after_hold = delivered_at + Duration::days(8);
    engine
        .mark_allocation_eligible(tenant_id, order.shipment_id, delivered_at, after_hold)
        .unwrap();
}

#[test]
fn commission_is_resolved_and_frozen_at_capture() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(payment.status, EscrowPaymentStatus::Held);
    assert_eq!(payment.total_amount, 10_000);
    let allocation = payment.allocation(order.shipment_id).unwrap();
    assert_eq!(allocation.commission_amount, 800);
    assert_eq!(allocation.payable_amount(), 9_200);

    // A second capture of the same order is rejected by the order index.
    let payment_view = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    let err = engine
        .create_escrow(
            tenant_id,
            payment_view.order_id,
            BuyerId::new(),
            Currency::usd(),
            vec![EscrowAllocationRequest {
                shipment_id: ShipmentId::new(),
                store_id: order.store_id,
                category_id: None,
                seller_amount: 100,
                shipping_amount: 0,
            }],
            now(),
        )
        .unwrap_err();
    assert!(matches!(
        err.as_domain(),
        Some(DomainError::AlreadyExists(_))
    ));
}

#[test]
fn seller_specific_rate_beats_category_and_global() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let store_id = StoreId::new();
    let category_id = CategoryId::new();
    engine
        .add_commission_rule(
            tenant_id,
            CommissionScope::Category(category_id),
            "0.15".parse().unwrap(),
            EffectiveWindow::unbounded(),
            now(),
        )
        .unwrap();
    engine
        .add_commission_rule(
            tenant_id,
            CommissionScope::Seller(store_id),
            "0.05".parse().unwrap(),
            EffectiveWindow::unbounded(),
            now(),
        )
        .unwrap();

    let rate = engine
        .resolve_commission_rate(tenant_id, store_id, Some(category_id), now().date_naive())
        .unwrap();
    assert_eq!(rate, "0.05".parse::<Decimal>().unwrap());

    let rate = engine
        .resolve_commission_rate(tenant_id, StoreId::new(), Some(category_id), now().date_naive())
        .unwrap();
    assert_eq!(rate, "0.15".parse::<Decimal>().unwrap());

    let rate = engine
        .resolve_commission_rate(tenant_id, StoreId::new(), None, now().date_naive())
        .unwrap();
    assert_eq!(rate, "0.10".parse::<Decimal>().unwrap());
}

#[test]
fn hold_period_gates_eligibility() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let delivered_at = now();
    let too_early = delivered_at + Duration::days(3);
    let err = engine
        .mark_allocation_eligible(tenant_id, order.shipment_id, delivered_at, too_early)
        .unwrap_err();
    assert!(matches!(
        err.as_domain(),
        Some(DomainError::InvalidState(_))
    ));

    deliver_and_wait(&engine, tenant_id, &order);
    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(
        payment.allocation(order.shipment_id).unwrap().status,
        AllocationStatus::EligibleForPayout
    );
}

#[test]
fn full_cycle_payout_settlement_invoice() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    engine
        .add_vat_rule(
            tenant_id,
            VatScope::CountryWide {
                country: CountryCode::new("DE").unwrap(),
            },
            "0.20".parse().unwrap(),
            EffectiveWindow::unbounded(),
            now(),
        )
        .unwrap();

    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let provider = AlwaysSucceeds::new();
    let run_at = now() + Duration::days(8);
    let outcome = engine.schedule_payout(tenant_id, order.store_id, run_at).unwrap();
    let ScheduleOutcome::Scheduled { payout_id, amount } = outcome else {
        panic!("expected a scheduled payout, got {outcome:?}");
    };
    assert_eq!(amount, 9_200);

    engine
        .process_payout(tenant_id, payout_id, &provider, run_at)
        .unwrap();
    let payout = engine.payout(tenant_id, &payout_id).unwrap();
    assert_eq!(payout.status, PayoutStatus::Paid);

    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(payment.status, EscrowPaymentStatus::PartiallyReleased);
    let allocation = payment.allocation(order.shipment_id).unwrap();
    assert_eq!(allocation.status, AllocationStatus::Released);
    assert_eq!(allocation.released_amount, 9_200);
    assert!(allocation.payout_reference.is_some());

    // Settlement over the period containing the release.
    let period = period_for(run_at.date_naive());
    let settlement_id = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), false, run_at)
        .unwrap();
    let settlement = engine.settlement(tenant_id, &settlement_id).unwrap();
    assert_eq!(settlement.status, SettlementStatus::Draft);
    assert_eq!(settlement.totals.gross, 8_000);
    assert_eq!(settlement.totals.shipping, 2_000);
    assert_eq!(settlement.totals.commission, 800);
    assert_eq!(settlement.totals.net, 9_200);

    engine.finalize_settlement(tenant_id, settlement_id, run_at).unwrap();
    engine
        .approve_settlement(tenant_id, settlement_id, UserId::new(), run_at)
        .unwrap();
    engine
        .export_settlement(tenant_id, settlement_id, "sepa-batch-7", run_at)
        .unwrap();

    // Invoice the commission: 800 net, 20% VAT.
    let country = CountryCode::new("DE").unwrap();
    let invoice_id = engine
        .generate_invoice(tenant_id, settlement_id, &country, None, run_at)
        .unwrap();
    let number = engine.issue_invoice(tenant_id, invoice_id, run_at).unwrap();
    assert_eq!(number.sequence, 1);

    let invoice = engine.invoice(tenant_id, &invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Issued);
    assert_eq!(invoice.net_amount, 800);
    assert_eq!(invoice.tax_amount, 160);
    assert_eq!(invoice.gross_amount, 960);
    assert_eq!(
        invoice.due_on.unwrap(),
        run_at.date_naive() + Duration::days(14)
    );

    engine
        .mark_invoice_paid(tenant_id, invoice_id, run_at.date_naive(), "wire-1", run_at)
        .unwrap();
    assert_eq!(
        engine.invoice(tenant_id, &invoice_id).unwrap().status,
        InvoiceStatus::Paid
    );
}

#[test]
fn partial_refund_reverses_commission_pro_rata() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(3_000),
            "damaged on arrival",
            "key-partial-1",
            now(),
        )
        .unwrap();
    let provider = AlwaysSucceeds::new();
    engine
        .process_refund(tenant_id, refund_id, &provider, now())
        .unwrap();

    let refund = engine.refund(tenant_id, &refund_id).unwrap();
    assert_eq!(refund.status, RefundStatus::Completed);
    assert_eq!(refund.amount_refunded, Some(3_000));
    assert_eq!(refund.commission_reversed, Some(300));

    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    let allocation = payment.allocation(order.shipment_id).unwrap();
    assert_eq!(allocation.refunded_amount, 3_000);
    assert_eq!(allocation.refunded_commission, 300);
    assert_eq!(allocation.status, AllocationStatus::PartiallyRefunded);
    // 8_000 + 2_000 - 800 - 3_000
    assert_eq!(allocation.payable_amount(), 6_200);

    engine.reconcile(tenant_id, order.payment_id).unwrap();
    let ledger = engine.ledger(tenant_id, order.payment_id).unwrap();
    assert_eq!(ledger.len(), 2); // Created + Refunded
}

#[test]
fn duplicate_idempotency_key_returns_the_original_request() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let first = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(1_000),
            "first",
            "key-dup",
            now(),
        )
        .unwrap();
    let second = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(9_999),
            "second",
            "key-dup",
            now(),
        )
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn admin_partial_order_refund_is_rejected_at_initiation() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    let order_id = engine
        .escrow_payment(tenant_id, &order.payment_id)
        .unwrap()
        .order_id;

    // A partial amount against the whole order never becomes a request,
    // so no provider is ever asked to move money for it.
    let err = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Order(order_id),
            Requester::Admin(UserId::new()),
            Some(3_000),
            "partial cancellation",
            "key-admin-partial-order",
            now(),
        )
        .unwrap_err();
    assert!(matches!(err.as_domain(), Some(DomainError::Validation(_))));

    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(payment.status, EscrowPaymentStatus::Held);
    assert_eq!(payment.refunded_amount, 0);

    // The rejected attempt did not consume the idempotency key; a
    // well-formed request under the same key completes normally.
    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(3_000),
            "partial cancellation",
            "key-admin-partial-order",
            now(),
        )
        .unwrap();
    engine
        .process_refund(tenant_id, refund_id, &AlwaysSucceeds::new(), now())
        .unwrap();
    assert_eq!(
        engine.refund(tenant_id, &refund_id).unwrap().status,
        RefundStatus::Completed
    );
}

#[test]
fn buyer_cannot_refund_a_single_shipment() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let err = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Buyer(BuyerId::new()),
            None,
            "changed my mind",
            "key-buyer-shipment",
            now(),
        )
        .unwrap_err();
    assert!(matches!(err.as_domain(), Some(DomainError::Unauthorized)));
}

#[test]
fn seller_cannot_refund_someone_elses_shipment() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let err = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Seller(StoreId::new()),
            Some(500),
            "not mine",
            "key-foreign-seller",
            now(),
        )
        .unwrap_err();
    assert!(matches!(err.as_domain(), Some(DomainError::Unauthorized)));
}

#[test]
fn buyer_full_order_refund_empties_the_escrow() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Order(
                engine
                    .escrow_payment(tenant_id, &order.payment_id)
                    .unwrap()
                    .order_id,
            ),
            Requester::Buyer(BuyerId::new()),
            None,
            "order cancelled",
            "key-full-order",
            now(),
        )
        .unwrap();
    engine
        .process_refund(tenant_id, refund_id, &AlwaysSucceeds::new(), now())
        .unwrap();

    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(payment.status, EscrowPaymentStatus::Refunded);
    assert_eq!(payment.refunded_amount, 10_000);
    assert_eq!(
        payment.allocation(order.shipment_id).unwrap().status,
        AllocationStatus::Refunded
    );
    engine.reconcile(tenant_id, order.payment_id).unwrap();
}

#[test]
fn refund_attempts_exhaust_into_a_terminal_failure() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(1_000),
            "flaky provider",
            "key-exhaust",
            now(),
        )
        .unwrap();

    // Default config allows 3 attempts; the provider never recovers.
    let provider = FailsThenSucceeds::new(10);
    for _ in 0..3 {
        engine
            .process_refund(tenant_id, refund_id, &provider, now())
            .unwrap();
    }

    let refund = engine.refund(tenant_id, &refund_id).unwrap();
    assert_eq!(refund.status, RefundStatus::Failed);
    assert!(refund.terminal);
    assert_eq!(refund.attempts, 3);
    assert_eq!(
        engine
            .projections()
            .refunds
            .needing_manual_resolution(tenant_id)
            .len(),
        1
    );

    // A terminal failure cannot be claimed again.
    let err = engine
        .process_refund(tenant_id, refund_id, &provider, now())
        .unwrap_err();
    assert!(matches!(
        err.as_domain(),
        Some(DomainError::InvalidState(_))
    ));

    // The escrow was never touched by the failed attempts.
    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(payment.refunded_amount, 0);
}

#[test]
fn failed_refund_succeeds_on_retry() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(1_000),
            "transient failure",
            "key-retry",
            now(),
        )
        .unwrap();

    let provider = FailsThenSucceeds::new(1);
    engine
        .process_refund(tenant_id, refund_id, &provider, now())
        .unwrap();
    assert_eq!(
        engine.refund(tenant_id, &refund_id).unwrap().status,
        RefundStatus::Failed
    );

    engine
        .process_refund(tenant_id, refund_id, &provider, now())
        .unwrap();
    assert_eq!(
        engine.refund(tenant_id, &refund_id).unwrap().status,
        RefundStatus::Completed
    );
}

#[test]
fn payout_below_threshold_rolls_over_until_it_clears() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let store_id = StoreId::new();

    let capture_small = |key: u8| {
        let shipment_id = ShipmentId::new();
        engine
            .create_escrow(
                tenant_id,
                OrderId::new(),
                BuyerId::new(),
                Currency::usd(),
                vec![EscrowAllocationRequest {
                    shipment_id,
                    store_id,
                    category_id: None,
                    seller_amount: 1_500,
                    shipping_amount: 0,
                }],
                now() + Duration::seconds(key as i64),
            )
            .unwrap();
        engine
            .mark_allocation_eligible(tenant_id, shipment_id, now(), now() + Duration::days(8))
            .unwrap();
        shipment_id
    };

    // 1_500 - 150 = 1_350 payable, below the 2_500 threshold.
    capture_small(1);
    let run_at = now() + Duration::days(8);
    let outcome = engine.schedule_payout(tenant_id, store_id, run_at).unwrap();
    assert_eq!(outcome, ScheduleOutcome::BelowThreshold { balance: 1_350 });

    // A second shipment pushes the rolled-over balance past the threshold.
    capture_small(2);
    let outcome = engine.schedule_payout(tenant_id, store_id, run_at).unwrap();
    assert!(matches!(
        outcome,
        ScheduleOutcome::Scheduled { amount: 2_700, .. }
    ));
}

#[test]
fn nothing_eligible_schedules_nothing() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);

    // Held but not yet eligible.
    let outcome = engine
        .schedule_payout(tenant_id, order.store_id, now())
        .unwrap();
    assert_eq!(outcome, ScheduleOutcome::NothingEligible);
}

#[test]
fn scheduled_shipments_are_not_claimed_twice() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let run_at = now() + Duration::days(8);
    let first = engine.schedule_payout(tenant_id, order.store_id, run_at).unwrap();
    assert!(matches!(first, ScheduleOutcome::Scheduled { .. }));

    // The allocation is still EligibleForPayout until the transfer lands,
    // but the claim index keeps it out of the next run.
    let second = engine.schedule_payout(tenant_id, order.store_id, run_at).unwrap();
    assert_eq!(second, ScheduleOutcome::NothingEligible);
}

#[test]
fn failed_payout_retries_with_backoff_and_recovers() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, order.store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };

    let provider = FailsThenSucceeds::new(1);
    engine
        .process_payout(tenant_id, payout_id, &provider, run_at)
        .unwrap();

    let payout = engine.payout(tenant_id, &payout_id).unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert!(!payout.terminal);
    // First failure backs off by the base delay.
    assert_eq!(payout.next_retry_at.unwrap(), run_at + Duration::seconds(60));

    // Not due yet.
    assert!(
        engine
            .retry_due_payouts(tenant_id, &provider, run_at + Duration::seconds(30))
            .unwrap()
            .is_empty()
    );

    let retried = engine
        .retry_due_payouts(tenant_id, &provider, run_at + Duration::seconds(61))
        .unwrap();
    assert_eq!(retried, vec![payout_id]);
    assert_eq!(
        engine.payout(tenant_id, &payout_id).unwrap().status,
        PayoutStatus::Paid
    );
}

#[test]
fn exhausted_payout_requires_manual_resolution() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, order.store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };

    // max_retries = 2 ⇒ 3 attempts in total.
    let provider = FailsThenSucceeds::new(10);
    let mut at = run_at;
    for _ in 0..3 {
        engine
            .process_payout(tenant_id, payout_id, &provider, at)
            .unwrap();
        at += Duration::hours(2);
    }

    let payout = engine.payout(tenant_id, &payout_id).unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert!(payout.terminal);
    assert_eq!(
        engine
            .projections()
            .payouts
            .needing_manual_resolution(tenant_id)
            .len(),
        1
    );

    // Operator settles out of band and marks it paid; escrow releases.
    engine
        .resolve_payout_manually(tenant_id, payout_id, UserId::new(), "manual-wire-9", at)
        .unwrap();
    assert_eq!(
        engine.payout(tenant_id, &payout_id).unwrap().status,
        PayoutStatus::Paid
    );
    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(
        payment.allocation(order.shipment_id).unwrap().status,
        AllocationStatus::Released
    );
}

#[test]
fn regeneration_supersedes_until_approval_locks_the_period() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, order.store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };
    engine
        .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
        .unwrap();

    let period = period_for(run_at.date_naive());
    let v1 = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), false, run_at)
        .unwrap();
    let v2 = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), true, run_at)
        .unwrap();
    assert_ne!(v1, v2);

    let old = engine.settlement(tenant_id, &v1).unwrap();
    assert!(old.superseded);
    assert_eq!(old.superseded_by, Some(v2));
    let new = engine.settlement(tenant_id, &v2).unwrap();
    assert_eq!(new.version_no, 2);
    assert!(!new.superseded);

    engine.finalize_settlement(tenant_id, v2, run_at).unwrap();
    engine
        .approve_settlement(tenant_id, v2, UserId::new(), run_at)
        .unwrap();
    let err = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), true, run_at)
        .unwrap_err();
    assert!(matches!(
        err.as_domain(),
        Some(DomainError::AlreadyExists(_))
    ));
}

#[test]
fn repeated_generation_must_ask_for_regeneration() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, order.store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };
    engine
        .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
        .unwrap();

    let period = period_for(run_at.date_naive());
    let v1 = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), false, run_at)
        .unwrap();

    // An accidental second call must not destroy the live statement.
    let err = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), false, run_at)
        .unwrap_err();
    assert!(matches!(
        err.as_domain(),
        Some(DomainError::AlreadyExists(_))
    ));
    let live = engine.settlement(tenant_id, &v1).unwrap();
    assert!(!live.superseded);
    assert_eq!(live.version_no, 1);
}

#[test]
fn overlapping_settlement_periods_are_rejected() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);

    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, order.store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };
    engine
        .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
        .unwrap();

    let period = period_for(run_at.date_naive());
    engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), false, run_at)
        .unwrap();

    // A shifted window sharing days with the live statement would count
    // the same allocations twice.
    let shifted = SettlementPeriod::new(
        period.start + Duration::days(14),
        period.end + Duration::days(14),
    )
    .unwrap();
    let err = engine
        .generate_settlement(tenant_id, order.store_id, shifted, Currency::usd(), false, run_at)
        .unwrap_err();
    assert!(matches!(err.as_domain(), Some(DomainError::Validation(_))));
}

#[test]
fn fully_refunded_shipments_appear_on_the_statement() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let store_id = StoreId::new();

    let capture = || {
        let shipment_id = ShipmentId::new();
        engine
            .create_escrow(
                tenant_id,
                OrderId::new(),
                BuyerId::new(),
                Currency::usd(),
                vec![EscrowAllocationRequest {
                    shipment_id,
                    store_id,
                    category_id: None,
                    seller_amount: 8_000,
                    shipping_amount: 2_000,
                }],
                now(),
            )
            .unwrap();
        shipment_id
    };
    let kept = capture();
    let returned = capture();

    // The second shipment is refunded in full before it ever pays out.
    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(returned),
            Requester::Admin(UserId::new()),
            None,
            "order returned",
            "key-returned",
            now(),
        )
        .unwrap();
    engine
        .process_refund(tenant_id, refund_id, &AlwaysSucceeds::new(), now())
        .unwrap();

    engine
        .mark_allocation_eligible(tenant_id, kept, now(), now() + Duration::days(8))
        .unwrap();
    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };
    engine
        .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
        .unwrap();

    // The refunded shipment shows on the statement and nets to zero;
    // only the paid-out shipment contributes to the total.
    let settlement_id = engine
        .generate_settlement(
            tenant_id,
            store_id,
            period_for(run_at.date_naive()),
            Currency::usd(),
            false,
            run_at,
        )
        .unwrap();
    let settlement = engine.settlement(tenant_id, &settlement_id).unwrap();
    assert_eq!(settlement.items.len(), 2);
    assert_eq!(settlement.totals.gross, 16_000);
    assert_eq!(settlement.totals.shipping, 4_000);
    assert_eq!(settlement.totals.commission, 1_600);
    assert_eq!(settlement.totals.refunds, 10_000);
    assert_eq!(settlement.totals.refunded_commission, 800);
    assert_eq!(settlement.totals.net, 9_200);
}

#[test]
fn empty_period_yields_no_settlement() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let store_id = StoreId::new();

    let err = engine
        .generate_settlement(
            tenant_id,
            store_id,
            period_for(now().date_naive()),
            Currency::usd(),
            false,
            now(),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSettlementData { .. }));
}

#[test]
fn invoice_numbers_are_gap_free_per_tenant_year() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let country = CountryCode::new("DE").unwrap();

    let mut invoice_ids = Vec::new();
    for _ in 0..2 {
        let order = capture_order(&engine, tenant_id);
        deliver_and_wait(&engine, tenant_id, &order);
        let run_at = now() + Duration::days(8);
        let ScheduleOutcome::Scheduled { payout_id, .. } = engine
            .schedule_payout(tenant_id, order.store_id, run_at)
            .unwrap()
        else {
            panic!("expected a scheduled payout");
        };
        engine
            .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
            .unwrap();
        let settlement_id = engine
            .generate_settlement(
                tenant_id,
                order.store_id,
                period_for(run_at.date_naive()),
                Currency::usd(),
                false,
                run_at,
            )
            .unwrap();
        engine.finalize_settlement(tenant_id, settlement_id, run_at).unwrap();
        engine
            .approve_settlement(tenant_id, settlement_id, UserId::new(), run_at)
            .unwrap();
        invoice_ids.push(
            engine
                .generate_invoice(tenant_id, settlement_id, &country, None, run_at)
                .unwrap(),
        );
    }

    let issue_at = now() + Duration::days(9);
    let first = engine.issue_invoice(tenant_id, invoice_ids[0], issue_at).unwrap();
    assert_eq!((first.year, first.sequence), (2026, 1));

    // A rejected issue must not burn a number.
    let err = engine
        .issue_invoice(tenant_id, invoice_ids[0], issue_at)
        .unwrap_err();
    assert!(matches!(
        err.as_domain(),
        Some(DomainError::InvalidState(_))
    ));

    let second = engine.issue_invoice(tenant_id, invoice_ids[1], issue_at).unwrap();
    assert_eq!((second.year, second.sequence), (2026, 2));
}

#[test]
fn credit_notes_keep_the_invoice_series_gap_free() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let country = CountryCode::new("DE").unwrap();

    let mut invoice_ids = Vec::new();
    for _ in 0..2 {
        let order = capture_order(&engine, tenant_id);
        deliver_and_wait(&engine, tenant_id, &order);
        let run_at = now() + Duration::days(8);
        let ScheduleOutcome::Scheduled { payout_id, .. } = engine
            .schedule_payout(tenant_id, order.store_id, run_at)
            .unwrap()
        else {
            panic!("expected a scheduled payout");
        };
        engine
            .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
            .unwrap();
        let settlement_id = engine
            .generate_settlement(
                tenant_id,
                order.store_id,
                period_for(run_at.date_naive()),
                Currency::usd(),
                false,
                run_at,
            )
            .unwrap();
        engine.finalize_settlement(tenant_id, settlement_id, run_at).unwrap();
        engine
            .approve_settlement(tenant_id, settlement_id, UserId::new(), run_at)
            .unwrap();
        invoice_ids.push(
            engine
                .generate_invoice(tenant_id, settlement_id, &country, None, run_at)
                .unwrap(),
        );
    }

    let issue_at = now() + Duration::days(9);
    let first = engine.issue_invoice(tenant_id, invoice_ids[0], issue_at).unwrap();
    assert_eq!(first.sequence, 1);

    // A credit note in between draws from its own series.
    let note_id = engine
        .issue_credit_note(
            tenant_id,
            invoice_ids[0],
            CreditNoteKind::Partial,
            300,
            "goodwill commission reversal",
            None,
            issue_at,
        )
        .unwrap();
    let note = engine.credit_note(tenant_id, &note_id).unwrap();
    assert_eq!(note.note_number.unwrap().sequence, 1);

    let second = engine.issue_invoice(tenant_id, invoice_ids[1], issue_at).unwrap();
    assert_eq!(second.sequence, 2);
}

#[test]
fn concurrent_issuance_yields_contiguous_invoice_numbers() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = Arc::new(engine_with_global_rate(tenant_id, "0.10"));
    let country = CountryCode::new("DE").unwrap();

    let mut invoice_ids = Vec::new();
    for _ in 0..4 {
        let order = capture_order(&engine, tenant_id);
        deliver_and_wait(&engine, tenant_id, &order);
        let run_at = now() + Duration::days(8);
        let ScheduleOutcome::Scheduled { payout_id, .. } = engine
            .schedule_payout(tenant_id, order.store_id, run_at)
            .unwrap()
        else {
            panic!("expected a scheduled payout");
        };
        engine
            .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
            .unwrap();
        let settlement_id = engine
            .generate_settlement(
                tenant_id,
                order.store_id,
                period_for(run_at.date_naive()),
                Currency::usd(),
                false,
                run_at,
            )
            .unwrap();
        engine.finalize_settlement(tenant_id, settlement_id, run_at).unwrap();
        engine
            .approve_settlement(tenant_id, settlement_id, UserId::new(), run_at)
            .unwrap();
        invoice_ids.push(
            engine
                .generate_invoice(tenant_id, settlement_id, &country, None, run_at)
                .unwrap(),
        );
    }

    let issue_at = now() + Duration::days(9);
    let handles: Vec<_> = invoice_ids
        .into_iter()
        .map(|invoice_id| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .issue_invoice(tenant_id, invoice_id, issue_at)
                    .unwrap()
                    .sequence
            })
        })
        .collect();

    let mut sequences: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[test]
fn post_payout_refund_becomes_a_carry_over_and_credit_note() {
    let tenant_id = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_id, "0.10");
    let country = CountryCode::new("DE").unwrap();
    engine
        .add_vat_rule(
            tenant_id,
            VatScope::CountryWide {
                country: country.clone(),
            },
            "0.20".parse().unwrap(),
            EffectiveWindow::unbounded(),
            now(),
        )
        .unwrap();

    let order = capture_order(&engine, tenant_id);
    deliver_and_wait(&engine, tenant_id, &order);
    let run_at = now() + Duration::days(8);
    let ScheduleOutcome::Scheduled { payout_id, .. } = engine
        .schedule_payout(tenant_id, order.store_id, run_at)
        .unwrap()
    else {
        panic!("expected a scheduled payout");
    };
    engine
        .process_payout(tenant_id, payout_id, &AlwaysSucceeds::new(), run_at)
        .unwrap();

    let period = period_for(run_at.date_naive());
    let settlement_id = engine
        .generate_settlement(tenant_id, order.store_id, period, Currency::usd(), false, run_at)
        .unwrap();
    engine.finalize_settlement(tenant_id, settlement_id, run_at).unwrap();
    engine
        .approve_settlement(tenant_id, settlement_id, UserId::new(), run_at)
        .unwrap();
    let invoice_id = engine
        .generate_invoice(tenant_id, settlement_id, &country, None, run_at)
        .unwrap();
    engine.issue_invoice(tenant_id, invoice_id, run_at).unwrap();

    // The seller was already paid; a refund now must not touch escrow.
    let refund_at = run_at + Duration::days(40);
    let refund_id = engine
        .initiate_refund(
            tenant_id,
            RefundTarget::Shipment(order.shipment_id),
            Requester::Admin(UserId::new()),
            Some(3_000),
            "late warranty claim",
            "key-carryover",
            refund_at,
        )
        .unwrap();
    engine
        .process_refund(tenant_id, refund_id, &AlwaysSucceeds::new(), refund_at)
        .unwrap();

    let refund = engine.refund(tenant_id, &refund_id).unwrap();
    assert_eq!(refund.status, RefundStatus::Completed);
    assert_eq!(refund.commission_reversed, Some(300));

    let payment = engine.escrow_payment(tenant_id, &order.payment_id).unwrap();
    assert_eq!(payment.refunded_amount, 0);

    // The reversed commission was invoiced, so a credit note was issued.
    let notes = engine
        .projections()
        .invoices
        .credit_notes_for_invoice(tenant_id, invoice_id);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].net_amount, 300);
    assert_eq!(notes[0].tax_amount, 60);
    assert_eq!(notes[0].status, CreditNoteStatus::Issued);

    // The claw-back lands as a negative adjustment on the next settlement.
    let next_period = SettlementPeriod::new(
        period.end + Duration::days(1),
        period.end + Duration::days(28),
    )
    .unwrap();
    let next_id = engine
        .generate_settlement(
            tenant_id,
            order.store_id,
            next_period,
            Currency::usd(),
            false,
            refund_at,
        )
        .unwrap();
    let next = engine.settlement(tenant_id, &next_id).unwrap();
    assert_eq!(next.adjustments.len(), 1);
    assert_eq!(next.adjustments[0].amount, -2_700);
    assert_eq!(next.adjustments[0].corrects_period, Some(period));
    assert_eq!(next.totals.net, -2_700);
}

#[test]
fn tenants_are_fully_isolated() {
    let tenant_a = marketpay_core::TenantId::new();
    let tenant_b = marketpay_core::TenantId::new();
    let engine = engine_with_global_rate(tenant_a, "0.10");
    let order = capture_order(&engine, tenant_a);

    assert!(engine.escrow_payment(tenant_b, &order.payment_id).is_none());
    assert!(
        engine
            .projections()
            .escrow
            .by_shipment(tenant_b, order.shipment_id)
            .is_none()
    );
}
