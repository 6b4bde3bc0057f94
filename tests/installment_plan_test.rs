mod common;

use assert_matches::assert_matches;
use chrono::{Months, Utc};
use common::{line, TestContext};
use retail_core::{
    entities::installment_plan::PlanStatus,
    errors::ServiceError,
    services::installments::CreatePlanRequest,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

async fn paid_order(ctx: &TestContext) -> Uuid {
    ctx.stock_sku("LAPTOP", dec!(1200), 3).await;
    let order_id = ctx.draft(vec![line("LAPTOP", 1)]).await.order.id;
    ctx.services.coordinator.confirm_order(order_id).await.unwrap();
    ctx.services.coordinator.pay_order(order_id).await.unwrap();
    order_id
}

fn plan_request(order_id: Uuid, principal: Decimal, months: i32, rate: Decimal) -> CreatePlanRequest {
    CreatePlanRequest {
        order_id,
        provider: Some("in-house".to_string()),
        principal,
        down_payment: dec!(120),
        months,
        annual_rate: rate,
    }
}

#[tokio::test]
async fn plan_starts_with_full_balance_and_first_due_date() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;

    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(1200), 12, dec!(0)))
        .await
        .unwrap();

    assert_eq!(plan.status, PlanStatus::Active);
    assert_eq!(plan.monthly_payment, dec!(100));
    assert_eq!(plan.remaining_balance, dec!(1200));
    let today = Utc::now().date_naive();
    assert_eq!(plan.start_date, today);
    assert_eq!(plan.next_payment_date, today.checked_add_months(Months::new(1)));
}

#[tokio::test]
async fn interest_bearing_plan_uses_amortized_payment() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;

    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(10000), 12, dec!(12)))
        .await
        .unwrap();
    assert_eq!(plan.monthly_payment, dec!(888.49));
}

#[tokio::test]
async fn one_plan_per_order() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    ctx.services
        .installments
        .create_plan(plan_request(order_id, dec!(1200), 12, dec!(0)))
        .await
        .unwrap();

    let err = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(600), 6, dec!(0)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::DuplicatePlan(id) if id == order_id);
}

#[tokio::test]
async fn plan_requires_a_live_order() {
    let ctx = TestContext::new().await;

    let err = ctx
        .services
        .installments
        .create_plan(plan_request(Uuid::new_v4(), dec!(1200), 12, dec!(0)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    ctx.add_sku("CASE", dec!(15));
    let order_id = ctx.draft(vec![line("CASE", 1)]).await.order.id;
    ctx.services.coordinator.cancel_order(order_id).await.unwrap();
    let err = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(15), 3, dec!(0)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn invalid_terms_are_rejected() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    let plans = &ctx.services.installments;

    let err = plans
        .create_plan(plan_request(order_id, dec!(1200), 0, dec!(0)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = plans
        .create_plan(plan_request(order_id, dec!(0), 12, dec!(0)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = plans
        .create_plan(plan_request(order_id, dec!(1200), 12, dec!(-1)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn payments_reduce_balance_and_advance_due_date() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(300), 3, dec!(0)))
        .await
        .unwrap();
    let first_due = plan.next_payment_date.unwrap();

    let plan = ctx
        .services
        .installments
        .apply_payment(plan.id, dec!(100))
        .await
        .unwrap();
    assert_eq!(plan.remaining_balance, dec!(200));
    assert_eq!(plan.status, PlanStatus::Active);
    assert_eq!(
        plan.next_payment_date,
        first_due.checked_add_months(Months::new(1))
    );

    let plan = ctx
        .services
        .installments
        .apply_payment(plan.id, dec!(250))
        .await
        .unwrap();
    assert_eq!(plan.remaining_balance, dec!(0));
    assert_eq!(plan.status, PlanStatus::Completed);
    assert!(plan.end_date.is_some());

    let err = ctx
        .services
        .installments
        .apply_payment(plan.id, dec!(10))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn non_positive_payment_is_rejected() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(300), 3, dec!(0)))
        .await
        .unwrap();

    let err = ctx
        .services
        .installments
        .apply_payment(plan.id, dec!(0))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn defaulted_plan_keeps_outstanding_balance() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(300), 3, dec!(0)))
        .await
        .unwrap();
    ctx.services
        .installments
        .apply_payment(plan.id, dec!(100))
        .await
        .unwrap();

    let defaulted = ctx.services.installments.mark_defaulted(plan.id).await.unwrap();
    assert_eq!(defaulted.status, PlanStatus::Defaulted);
    assert_eq!(defaulted.remaining_balance, dec!(200));

    let err = ctx.services.installments.settle(plan.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let stats = ctx.services.installments.statistics().await.unwrap();
    assert_eq!(stats.total_plans, 1);
    assert_eq!(stats.defaulted_plans, 1);
    assert_eq!(stats.total_outstanding, dec!(200));
}

#[tokio::test]
async fn settle_closes_plan_early() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(300), 3, dec!(0)))
        .await
        .unwrap();

    let settled = ctx.services.installments.settle(plan.id).await.unwrap();
    assert_eq!(settled.status, PlanStatus::Completed);
    assert_eq!(settled.remaining_balance, dec!(0));
    assert_eq!(settled.next_payment_date, None);

    let completed = ctx
        .services
        .installments
        .list_by_status(PlanStatus::Completed)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        ctx.services
            .installments
            .plan_for_order(order_id)
            .await
            .unwrap()
            .map(|p| p.id),
        Some(plan.id)
    );
}

#[tokio::test]
async fn refund_cancels_active_plan() {
    let ctx = TestContext::new().await;
    let order_id = paid_order(&ctx).await;
    let plan = ctx
        .services
        .installments
        .create_plan(plan_request(order_id, dec!(1200), 12, dec!(0)))
        .await
        .unwrap();

    ctx.services.coordinator.refund_order(order_id).await.unwrap();

    let plan = ctx.services.installments.get_plan(plan.id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(ctx
        .services
        .installments
        .cancel_for_order(order_id)
        .await
        .unwrap()
        .is_none());
}
