mod common;

use common::{line, TestContext};
use futures::future::join_all;
use retail_core::{
    entities::sales_order::OrderStatus, errors::ServiceError,
    services::stock_ledger::ReserveOutcome,
};
use rust_decimal_macros::dec;

const POOL_SIZE: u32 = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let ctx = TestContext::file_backed(POOL_SIZE).await;
    ctx.stock_sku("CHARGER", dec!(25), 10).await;

    let mut tasks = vec![];
    for _ in 0..20 {
        let stock = ctx.services.stock.clone();
        tasks.push(tokio::spawn(async move { stock.reserve("CHARGER", 1).await }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(ReserveOutcome::Reserved { .. }) => successes += 1,
            Ok(ReserveOutcome::Insufficient { .. }) => {}
            Err(e) => panic!("reservation failed outright: {e}"),
        }
    }

    assert_eq!(successes, 10);
    assert_eq!(ctx.on_hand("CHARGER").await, (10, 10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_releases_hand_back_exactly_what_was_held() {
    let ctx = TestContext::file_backed(POOL_SIZE).await;
    ctx.stock_sku("CASE-01", dec!(15), 12).await;
    ctx.services.stock.reserve("CASE-01", 10).await.unwrap();

    let mut tasks = vec![];
    for _ in 0..15 {
        let stock = ctx.services.stock.clone();
        tasks.push(tokio::spawn(async move { stock.release("CASE-01", 1).await }));
    }

    let mut released = 0;
    let mut clamped = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        released += outcome.released;
        if outcome.over_released() {
            clamped += 1;
        }
    }

    assert_eq!(released, 10);
    assert_eq!(clamped, 5);
    assert_eq!(ctx.on_hand("CASE-01").await, (12, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirms_succeed_for_exactly_the_affordable_orders() {
    let ctx = TestContext::file_backed(POOL_SIZE).await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;

    let mut order_ids = Vec::new();
    for _ in 0..8 {
        order_ids.push(ctx.draft(vec![line("PHONE-A", 1)]).await.order.id);
    }

    let results = join_all(order_ids.iter().map(|&id| {
        let coordinator = ctx.services.coordinator.clone();
        async move { coordinator.confirm_order(id).await }
    }))
    .await;

    let confirmed = results.iter().filter(|r| r.is_ok()).count();
    let short = results
        .iter()
        .filter(|r| matches!(r, Err(ServiceError::InsufficientStock { .. })))
        .count();
    assert_eq!(confirmed, 5);
    assert_eq!(short, 3);
    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 5));

    let drafts = ctx
        .services
        .orders
        .list_orders(Some(OrderStatus::Draft), 1, 100)
        .await
        .unwrap();
    assert_eq!(drafts.total, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_confirms_of_one_order_reserve_once() {
    let ctx = TestContext::file_backed(POOL_SIZE).await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let order_id = ctx.draft(vec![line("PHONE-A", 2)]).await.order.id;

    let mut tasks = vec![];
    for _ in 0..6 {
        let coordinator = ctx.services.coordinator.clone();
        tasks.push(tokio::spawn(
            async move { coordinator.confirm_order(order_id).await },
        ));
    }
    // later callers queue on the order and find it already confirmed
    for task in tasks {
        let order = task.await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
    }

    assert_eq!(ctx.on_hand("PHONE-A").await, (5, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_pay_leaves_consistent_stock() {
    let ctx = TestContext::file_backed(POOL_SIZE).await;
    ctx.stock_sku("PHONE-A", dec!(500), 5).await;
    let order_id = ctx.draft(vec![line("PHONE-A", 2)]).await.order.id;
    ctx.services.coordinator.confirm_order(order_id).await.unwrap();

    let pay = {
        let coordinator = ctx.services.coordinator.clone();
        tokio::spawn(async move { coordinator.pay_order(order_id).await })
    };
    let cancel = {
        let coordinator = ctx.services.coordinator.clone();
        tokio::spawn(async move { coordinator.cancel_order(order_id).await })
    };
    let paid = pay.await.unwrap();
    let cancelled = cancel.await.unwrap();

    // exactly one of the two wins
    assert!(paid.is_ok() ^ cancelled.is_ok());

    let order = ctx.services.orders.get_order(order_id).await.unwrap().unwrap();
    match order.status {
        OrderStatus::Paid => assert_eq!(ctx.on_hand("PHONE-A").await, (3, 0)),
        OrderStatus::Cancelled => assert_eq!(ctx.on_hand("PHONE-A").await, (5, 0)),
        other => panic!("unexpected status {other}"),
    }
    assert!(ctx.services.stock.reconcile("PHONE-A").await.unwrap().is_consistent());
}
