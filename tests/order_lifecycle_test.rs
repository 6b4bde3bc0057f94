//! End-to-end tests for the order lifecycle.
//!
//! Covers drafting and the financial roll-up, confirmation with all-or-nothing
//! reservations, payment, cancellation and refunds, plus the guards around
//! illegal transitions and stale versions.

mod common;

use assert_matches::assert_matches;
use common::{discounted_line, line, unit_line, TestContext};
use retail_core::{
    entities::installment_plan::PlanStatus,
    entities::payment::PaymentStatus,
    entities::sales_order::{OrderStatus, PaymentMethod},
    entities::serial_unit::SerialUnitStatus,
    entities::stock_movement::{MovementReason, MovementType},
    errors::ServiceError,
    services::installments::CreatePlanRequest,
    services::orders::{UpdateDetailsRequest, UpdateLineRequest},
    services::reservation_coordinator::{paid_amount, TransitionRequest},
    services::stock_ledger::SALES_ORDER_REF,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

// ==================== Drafting ====================

#[tokio::test]
async fn draft_rolls_up_line_totals() {
    let ctx = TestContext::new().await;
    ctx.add_sku("PHONE-A", dec!(500));
    ctx.add_sku("TABLET-B", dec!(1000));

    let created = ctx
        .draft(vec![
            line("PHONE-A", 2),
            discounted_line("TABLET-B", 1, dec!(50)),
        ])
        .await;

    let order = &created.order;
    assert_eq!(order.status, OrderStatus::Draft);
    assert_eq!(order.subtotal, dec!(1950));
    assert_eq!(order.tax_amount, dec!(195));
    assert_eq!(order.total, dec!(2145));
    assert!(order.order_number.starts_with("SO"));
    assert_eq!(order.order_number.len(), "SO20240315000001".len());
    assert_eq!(created.lines.len(), 2);
    assert_eq!(created.lines[1].line_total, dec!(950));
}

#[tokio::test]
async fn order_numbers_increase_within_a_day() {
    let ctx = TestContext::new().await;
    ctx.add_sku("CASE", dec!(15));

    let first = ctx.draft(vec![line("CASE", 1)]).await.order;
    let second = ctx.draft(vec![line("CASE", 1)]).await.order;

    assert_ne!(first.order_number, second.order_number);
    assert!(second.order_number > first.order_number);
    let found = ctx
        .services
        .orders
        .get_by_number(&second.order_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, second.id);
}

#[tokio::test]
async fn unit_price_is_snapshotted_when_line_is_added() {
    let ctx = TestContext::new().await;
    ctx.add_sku("CASE", dec!(15));
    let created = ctx.draft(vec![line("CASE", 2)]).await;

    ctx.add_sku("CASE", dec!(20));
    let updated = ctx
        .services
        .orders
        .update_line(
            created.order.id,
            created.lines[0].id,
            UpdateLineRequest {
                quantity: Some(3),
                discount_amount: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.lines[0].unit_price, dec!(15));
    assert_eq!(updated.order.subtotal, dec!(45));
}

#[tokio::test]
async fn unknown_customer_and_sku_are_rejected() {
    let ctx = TestContext::new().await;
    ctx.add_sku("CASE", dec!(15));

    let mut request = ctx.order_request(vec![line("CASE", 1)]);
    request.customer_id = Uuid::new_v4();
    let err = ctx.services.orders.create_draft(request).await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    let err = ctx
        .services
        .orders
        .create_draft(ctx.order_request(vec![line("NOPE", 1)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn line_edits_recompute_totals() {
    let ctx = TestContext::new().await;
    ctx.add_sku("CASE", dec!(15));
    ctx.add_sku("CABLE", dec!(10));
    let created = ctx.draft(vec![line("CASE", 2)]).await;
    let order_id = created.order.id;

    let with_cable = ctx
        .services
        .orders
        .add_line(order_id, line("CABLE", 3))
        .await
        .unwrap();
    assert_eq!(with_cable.order.subtotal, dec!(60));
    assert_eq!(with_cable.order.total, dec!(66));

    let cable_line = with_cable
        .lines
        .iter()
        .find(|l| l.sku_id == "CABLE")
        .unwrap()
        .id;
    let without = ctx
        .services
        .orders
        .remove_line(order_id, cable_line)
        .await
        .unwrap();
    assert_eq!(without.lines.len(), 1);
    assert_eq!(without.order.subtotal, dec!(30));
    assert_eq!(without.order.tax_amount, dec!(3));
    assert_eq!(without.order.total, dec!(33));
}

#[tokio::test]
async fn order_discount_is_applied_and_clamped() {
    let ctx = TestContext::new().await;
    ctx.add_sku("CASE", dec!(15));
    let created = ctx.draft(vec![line("CASE", 2)]).await;

    let updated = ctx
        .services
        .orders
        .update_details(
            created.order.id,
            UpdateDetailsRequest {
                discount: Some(dec!(3)),
                payment_method: Some(PaymentMethod::Cash),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.total, dec!(30));
    assert_eq!(updated.payment_method, PaymentMethod::Cash);

    let clamped = ctx
        .services
        .orders
        .update_details(
            created.order.id,
            UpdateDetailsRequest {
                discount: Some(dec!(500)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(clamped.total, dec!(0));
}

#[tokio::test]
async fn empty_order_cannot_be_submitted() {
    let ctx = TestContext::new().await;
    let created = ctx.draft(vec![]).await;

    let err = ctx.services.orders.submit(created.order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let err = ctx
        .services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

// ==================== Confirm / pay ====================

#[tokio::test]
async fn happy_path_reserves_then_commits_stock() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 2)]).await;
    let order_id = created.order.id;

    let submitted = ctx.services.orders.submit(order_id).await.unwrap();
    assert_eq!(submitted.status, OrderStatus::Pending);

    let confirmed = ctx.services.coordinator.confirm_order(order_id).await.unwrap();
    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    assert!(confirmed.confirmed_at.is_some());
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 2));

    let paid = ctx.services.coordinator.pay_order(order_id).await.unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert!(paid.paid_at.is_some());
    assert_eq!(ctx.on_hand("PHONE-A").await, (3, 0));

    let payments = ctx.services.coordinator.payments_for_order(order_id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Completed);
    assert_eq!(paid_amount(&payments), dec!(1100));

    let movements = ctx
        .services
        .stock
        .movements_for_reference(SALES_ORDER_REF, order_id)
        .await
        .unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].movement_type, MovementType::Out);
    assert_eq!(movements[0].reason, MovementReason::Sale);
    assert_eq!(movements[0].quantity, 2);
    assert_eq!(movements[0].created_by, Some(ctx.clerk));
}

#[tokio::test]
async fn failed_confirmation_leaves_no_partial_reservation() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("A-CASE", dec!(15), 10).await;
    ctx.stock_sku("B-PHONE", dec!(500), 1).await;
    let created = ctx
        .draft(vec![line("B-PHONE", 2), line("A-CASE", 3)])
        .await;

    let err = ctx
        .services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock { ref sku_id, requested: 2, available: 1 } if sku_id == "B-PHONE"
    );

    assert_eq!(ctx.on_hand("A-CASE").await, (10, 0));
    assert_eq!(ctx.on_hand("B-PHONE").await, (1, 0));

    let order = ctx
        .services
        .orders
        .get_order(created.order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Draft);
    assert_eq!(order.version, created.order.version);
}

#[tokio::test]
async fn availability_preview_reports_shortfall() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("A-CASE", dec!(15), 10).await;
    ctx.stock_sku("B-PHONE", dec!(500), 1).await;
    let created = ctx
        .draft(vec![line("A-CASE", 3), line("B-PHONE", 2)])
        .await;

    let report = ctx
        .services
        .coordinator
        .check_availability(created.order.id)
        .await
        .unwrap();
    assert!(!report.all_available());
    let shortfall = report.first_shortfall().unwrap();
    assert_eq!(shortfall.sku_id, "B-PHONE");
    assert_eq!(shortfall.available, 1);
    assert_eq!(ctx.on_hand("A-CASE").await, (10, 0));
}

#[tokio::test]
async fn repeated_confirm_is_a_no_op() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 2)]).await;

    let first = ctx
        .services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap();
    let second = ctx
        .services
        .coordinator
        .confirm(TransitionRequest::new(created.order.id).at_version(created.order.version))
        .await
        .unwrap();

    assert_eq!(second.status, OrderStatus::Confirmed);
    assert_eq!(second.version, first.version);
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 2));
}

#[tokio::test]
async fn lines_are_frozen_once_confirmed() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 1)]).await;
    ctx.services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap();

    let err = ctx
        .services
        .orders
        .add_line(created.order.id, line("PHONE-A", 1))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let updated = ctx
        .services
        .orders
        .update_details(
            created.order.id,
            UpdateDetailsRequest {
                notes: Some("gift wrap".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.notes.as_deref(), Some("gift wrap"));
}

// ==================== State machine guards ====================

#[tokio::test]
async fn illegal_transitions_leave_order_untouched() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 1)]).await;
    let order_id = created.order.id;

    let err = ctx.services.coordinator.pay_order(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStateTransition { .. });
    let err = ctx.services.coordinator.refund_order(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStateTransition { .. });

    ctx.services.coordinator.confirm_order(order_id).await.unwrap();
    ctx.services.coordinator.pay_order(order_id).await.unwrap();
    let paid = ctx.services.orders.get_order(order_id).await.unwrap().unwrap();

    let err = ctx.services.coordinator.cancel_order(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStateTransition { .. });
    let err = ctx.services.orders.submit(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStateTransition { .. });

    let after = ctx.services.orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(after, paid);
    assert_eq!(ctx.on_hand("PHONE-A").await, (4, 0));
}

#[tokio::test]
async fn stale_version_is_rejected() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 1)]).await;
    let order_id = created.order.id;
    let seen_version = created.order.version;

    ctx.services
        .orders
        .update_details(
            order_id,
            UpdateDetailsRequest {
                notes: Some("call before delivery".to_string()),
                expected_version: Some(seen_version),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = ctx
        .services
        .orders
        .update_details(
            order_id,
            UpdateDetailsRequest {
                notes: Some("leave at door".to_string()),
                expected_version: Some(seen_version),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ConcurrentModification(id) if id == order_id);

    let err = ctx
        .services
        .coordinator
        .confirm(TransitionRequest::new(order_id).at_version(seen_version))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ConcurrentModification(_));
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 0));
}

// ==================== Cancel ====================

#[tokio::test]
async fn cancelling_confirmed_order_releases_stock() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 3)]).await;
    ctx.services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap();

    let cancelled = ctx
        .services
        .coordinator
        .cancel_order(created.order.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 0));

    let again = ctx
        .services
        .coordinator
        .cancel_order(created.order.id)
        .await
        .unwrap();
    assert_eq!(again.version, cancelled.version);
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 0));
}

#[tokio::test]
async fn cancelling_order_cancels_its_installment_plan() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 1)]).await;
    let plan = ctx
        .services
        .installments
        .create_plan(CreatePlanRequest {
            order_id: created.order.id,
            provider: Some("in-house".to_string()),
            principal: dec!(550),
            down_payment: dec!(0),
            months: 6,
            annual_rate: dec!(0),
        })
        .await
        .unwrap();

    ctx.services
        .coordinator
        .cancel_order(created.order.id)
        .await
        .unwrap();

    let plan = ctx.services.installments.get_plan(plan.id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert_eq!(plan.next_payment_date, None);
}

// ==================== Refund ====================

#[tokio::test]
async fn refund_restocks_plain_inventory() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 2)]).await;
    let order_id = created.order.id;
    ctx.services.coordinator.confirm_order(order_id).await.unwrap();
    ctx.services.coordinator.pay_order(order_id).await.unwrap();

    let refunded = ctx.services.coordinator.refund_order(order_id).await.unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert!(refunded.refunded_at.is_some());
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 0));

    let payments = ctx.services.coordinator.payments_for_order(order_id).await.unwrap();
    assert_eq!(payments[0].status, PaymentStatus::Refunded);
    assert_eq!(paid_amount(&payments), dec!(0));

    let returns: Vec<_> = ctx
        .services
        .stock
        .movements_for_reference(SALES_ORDER_REF, order_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.reason == MovementReason::Return)
        .collect();
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].quantity, 2);
    assert!(ctx.services.stock.reconcile("PHONE-A").await.unwrap().is_consistent());
}

#[tokio::test]
async fn refund_without_restock_keeps_stock_out() {
    let ctx = TestContext::with_config(|cfg| cfg.refund_restocks_inventory = false).await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let created = ctx.draft(vec![line("PHONE-A", 2)]).await;
    let order_id = created.order.id;
    ctx.services.coordinator.confirm_order(order_id).await.unwrap();
    ctx.services.coordinator.pay_order(order_id).await.unwrap();

    ctx.services.coordinator.refund_order(order_id).await.unwrap();
    assert_eq!(ctx.on_hand("PHONE-A").await, (3, 0));
}

// ==================== Serialized SKUs ====================

#[tokio::test]
async fn chosen_serial_unit_follows_the_order() {
    let ctx = TestContext::new().await;
    let units = ctx
        .stock_serialized("IPH15-128", dec!(799), &["IMEI-1", "IMEI-2"])
        .await;
    let chosen = units[1].id;
    let created = ctx.draft(vec![unit_line("IPH15-128", chosen)]).await;
    let order_id = created.order.id;
    let line_id = created.lines[0].id;

    ctx.services.coordinator.confirm_order(order_id).await.unwrap();
    let unit = ctx.services.serial_units.get_unit(chosen).await.unwrap().unwrap();
    assert_eq!(unit.status, SerialUnitStatus::Reserved);
    assert_eq!(unit.order_line_id, Some(line_id));
    assert_eq!(ctx.on_hand("IPH15-128").await, (2, 1));

    ctx.services.coordinator.pay_order(order_id).await.unwrap();
    let unit = ctx.services.serial_units.get_unit(chosen).await.unwrap().unwrap();
    assert_eq!(unit.status, SerialUnitStatus::Sold);
    let other = ctx.services.serial_units.get_unit(units[0].id).await.unwrap().unwrap();
    assert_eq!(other.status, SerialUnitStatus::InStock);

    let sale = ctx
        .services
        .stock
        .movements_for_reference(SALES_ORDER_REF, order_id)
        .await
        .unwrap();
    assert_eq!(sale.len(), 1);
    assert_eq!(sale[0].serial_unit_id, Some(chosen));

    ctx.services.coordinator.refund_order(order_id).await.unwrap();
    let unit = ctx.services.serial_units.get_unit(chosen).await.unwrap().unwrap();
    assert_eq!(unit.status, SerialUnitStatus::Returned);
    assert_eq!(ctx.on_hand("IPH15-128").await, (1, 0));
}

#[tokio::test]
async fn serialized_line_without_choice_gets_units_assigned() {
    let ctx = TestContext::new().await;
    ctx.stock_serialized("IPH15-128", dec!(799), &["IMEI-1", "IMEI-2", "IMEI-3"])
        .await;
    let created = ctx.draft(vec![line("IPH15-128", 2)]).await;
    let line_id = created.lines[0].id;

    ctx.services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap();
    let held = ctx.services.serial_units.units_for_line(line_id).await.unwrap();
    assert_eq!(held.len(), 2);

    ctx.services
        .coordinator
        .cancel_order(created.order.id)
        .await
        .unwrap();
    let held = ctx.services.serial_units.units_for_line(line_id).await.unwrap();
    assert!(held.is_empty());
    assert!(ctx
        .services
        .serial_units
        .check_invariant("IPH15-128")
        .await
        .unwrap()
        .is_consistent());
}

#[tokio::test]
async fn unavailable_chosen_unit_rolls_back_confirmation() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("A-CASE", dec!(15), 10).await;
    let units = ctx
        .stock_serialized("IPH15-128", dec!(799), &["IMEI-1", "IMEI-2"])
        .await;
    ctx.services
        .serial_units
        .mark_defective(units[0].id, None)
        .await
        .unwrap();

    let created = ctx
        .draft(vec![line("A-CASE", 1), unit_line("IPH15-128", units[0].id)])
        .await;
    let err = ctx
        .services
        .coordinator
        .confirm_order(created.order.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    assert_eq!(ctx.on_hand("A-CASE").await, (10, 0));
    assert_eq!(ctx.on_hand("IPH15-128").await, (1, 0));
}

#[tokio::test]
async fn serial_choice_rules_are_enforced() {
    let ctx = TestContext::new().await;
    ctx.add_sku("CASE", dec!(15));
    let units = ctx.stock_serialized("IPH15-128", dec!(799), &["IMEI-1"]).await;

    let err = ctx
        .services
        .orders
        .create_draft(ctx.order_request(vec![unit_line("CASE", units[0].id)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let mut two = unit_line("IPH15-128", units[0].id);
    two.quantity = 2;
    let err = ctx
        .services
        .orders
        .create_draft(ctx.order_request(vec![two]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = ctx
        .services
        .orders
        .create_draft(ctx.order_request(vec![
            unit_line("IPH15-128", units[0].id),
            unit_line("IPH15-128", units[0].id),
        ]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

// ==================== Queries ====================

#[tokio::test]
async fn orders_are_listed_by_status() {
    let ctx = TestContext::new().await;
    ctx.stock_sku("CASE", dec!(15), 10).await;
    let first = ctx.draft(vec![line("CASE", 1)]).await.order;
    ctx.draft(vec![line("CASE", 1)]).await;
    ctx.services.coordinator.confirm_order(first.id).await.unwrap();

    let drafts = ctx
        .services
        .orders
        .list_orders(Some(OrderStatus::Draft), 1, 10)
        .await
        .unwrap();
    assert_eq!(drafts.total, 1);

    let all = ctx.services.orders.list_orders(None, 1, 10).await.unwrap();
    assert_eq!(all.total, 2);

    let err = ctx.services.orders.list_orders(None, 0, 10).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let for_customer = ctx
        .services
        .orders
        .list_for_customer(first.customer_id)
        .await
        .unwrap();
    assert_eq!(for_customer.len(), 1);
}
