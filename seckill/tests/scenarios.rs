//! End-to-end scenarios over in-memory collaborators.
//!
//! Every scenario assembles the full engine with [`FlashsaleApp::from_parts`]
//! so admission, purchase, order creation, compensation and reconciliation
//! run exactly as in production, minus the network.

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code uses expect for clear failure messages

use chrono::Duration as ChronoDuration;
use flashsale_core::activity::{Activity, ActivityStatus};
use flashsale_core::environment::Clock;
use flashsale_core::inventory::SyncStockRequest;
use flashsale_core::message::{InboundMessage, OrderCreatedMessage, DEFAULT_ORDER_TOPIC};
use flashsale_core::message_bus::MessageBus;
use flashsale_core::order::FailureStatus;
use flashsale_core::purchase::{PurchaseOutcome, PurchaseRequest, PurchaseStatus, SeckillCode};
use flashsale_core::store::{FastStore, InventoryStore, OrderStore};
use flashsale_runtime::State;
use flashsale_seckill::{AppParts, Config, FlashsaleApp, OrderHandled, SECKILL_BREAKER};
use flashsale_testing::{
    test_epoch, InMemoryFastStore, InMemoryInventoryStore, InMemoryLockBackend,
    InMemoryMessageBus, InMemoryOrderStore, ManualClock,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const PRODUCT: i64 = 1001;

struct Harness {
    clock: ManualClock,
    fast: Arc<InMemoryFastStore>,
    orders: Arc<InMemoryOrderStore>,
    inventory: Arc<InMemoryInventoryStore>,
    bus: Arc<InMemoryMessageBus>,
    app: FlashsaleApp,
}

/// Engine with background tasks switched off; scenarios drive them by hand.
fn quiet_config() -> Config {
    let mut config = Config::default();
    config.compensation.enabled = false;
    config.reconcile.enabled = false;
    config
}

fn harness(config: Config) -> Harness {
    let clock = ManualClock::new(test_epoch());
    let fast = Arc::new(InMemoryFastStore::new());
    let orders = Arc::new(InMemoryOrderStore::with_clock(Arc::new(clock.clone())));
    let inventory = Arc::new(InMemoryInventoryStore::with_clock(Arc::new(clock.clone())));
    let bus = Arc::new(InMemoryMessageBus::new());

    let app = FlashsaleApp::from_parts(
        config,
        AppParts {
            fast: fast.clone(),
            locks: Arc::new(InMemoryLockBackend::new()),
            orders: orders.clone(),
            inventory: inventory.clone(),
            bus: bus.clone(),
            clock: Arc::new(clock.clone()),
        },
    );
    Harness {
        clock,
        fast,
        orders,
        inventory,
        bus,
        app,
    }
}

fn activity(stock: i64) -> Activity {
    Activity {
        product_id: PRODUCT,
        product_name: "limited sneaker".into(),
        price: 199.0,
        stock,
        start_time: test_epoch() - ChronoDuration::minutes(5),
        end_time: test_epoch() + ChronoDuration::days(2),
        status: ActivityStatus::Active,
    }
}

/// The order message emitted for the n-th successful purchase.
fn order_message(bus: &InMemoryMessageBus, n: usize) -> OrderCreatedMessage {
    bus.published_to(DEFAULT_ORDER_TOPIC)
        .iter()
        .filter_map(|envelope| match envelope.decode().unwrap() {
            InboundMessage::Order(message) => Some(message),
            InboundMessage::StockUpdate(_) => None,
        })
        .nth(n)
        .expect("order message was published")
}

async fn durable_stock(h: &Harness) -> i64 {
    h.inventory.get_inventory(PRODUCT).await.unwrap().unwrap().stock
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_oversell_under_concurrent_demand() {
    let h = harness(quiet_config());
    let coordinator = h.app.coordinator().clone();
    coordinator.preload_activity(&activity(10)).await.unwrap();

    let handles: Vec<_> = (1..=20)
        .map(|user_id| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .process_seckill(PurchaseRequest::new(PRODUCT, user_id, 1))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut sold_out = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        match response.kind() {
            Some(SeckillCode::Success) => succeeded += 1,
            Some(SeckillCode::InsufficientStock) => sold_out += 1,
            other => assert_eq!(other, Some(SeckillCode::Success)),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(sold_out, 10);
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(0));
    assert_eq!(h.fast.buyers(PRODUCT).len(), 10);
    assert_eq!(h.bus.published_to(DEFAULT_ORDER_TOPIC).len(), 10);
}

#[tokio::test]
async fn one_purchase_per_user() {
    let h = harness(quiet_config());
    let coordinator = h.app.coordinator();
    coordinator.preload_activity(&activity(10)).await.unwrap();

    let first = coordinator
        .process_seckill(PurchaseRequest::new(PRODUCT, 42, 1))
        .await;
    let second = coordinator
        .process_seckill(PurchaseRequest::new(PRODUCT, 42, 1))
        .await;

    assert_eq!(first.kind(), Some(SeckillCode::Success));
    assert_eq!(second.kind(), Some(SeckillCode::AlreadyBought));
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(9));
    assert!(coordinator.is_user_purchased(PRODUCT, 42).await.unwrap());
    assert_eq!(
        coordinator.users_purchased(PRODUCT, &[42, 43]).await.unwrap(),
        vec![true, false]
    );
}

#[tokio::test]
async fn rollback_is_symmetric_and_idempotent() {
    let h = harness(quiet_config());
    h.app.coordinator().preload_activity(&activity(5)).await.unwrap();

    let outcome = h
        .fast
        .purchase(&PurchaseRequest::new(PRODUCT, 42, 2), h.clock.now())
        .await
        .unwrap();
    assert_eq!(outcome, PurchaseOutcome::Success { remaining_stock: 3 });

    assert_eq!(h.fast.rollback(PRODUCT, 42, 2).await.unwrap(), Some(5));
    assert!(h.fast.buyers(PRODUCT).is_empty());
    assert_eq!(h.fast.rollback(PRODUCT, 42, 2).await.unwrap(), None);
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(5));
}

#[tokio::test]
async fn consumer_creates_each_order_once() {
    let mut h = harness(quiet_config());
    h.app.coordinator().preload_activity(&activity(5)).await.unwrap();
    h.app.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = h
        .app
        .coordinator()
        .process_seckill(PurchaseRequest::new(PRODUCT, 42, 1))
        .await;
    assert!(response.success);

    for _ in 0..100 {
        if durable_stock(&h).await == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.orders.order_count(), 1);
    assert_eq!(durable_stock(&h).await, 4);

    // Redelivery of the same message
    let envelope = h.bus.published_to(DEFAULT_ORDER_TOPIC)[0].clone();
    h.bus.publish(DEFAULT_ORDER_TOPIC, &envelope).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.orders.order_count(), 1);
    assert_eq!(h.orders.idempotency_count(), 1);
    assert_eq!(durable_stock(&h).await, 4);
    let order = h
        .orders
        .find_order(response.order_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.user_id, 42);

    h.app.shutdown().await;
}

#[tokio::test]
async fn failed_order_write_is_compensated() {
    let h = harness(quiet_config());
    let coordinator = h.app.coordinator();
    coordinator.preload_activity(&activity(5)).await.unwrap();
    coordinator
        .process_seckill(PurchaseRequest::new(PRODUCT, 42, 1))
        .await;
    h.orders.fail_next_creates(1);

    let message = order_message(&h.bus, 0);
    let handled = h.app.compensator().handle_order_message(&message).await.unwrap();
    assert_eq!(handled, OrderHandled::Deferred { failure_id: 1 });
    assert_eq!(h.orders.order_count(), 0);

    h.clock.advance(ChronoDuration::seconds(1));
    assert_eq!(h.app.compensator().run_due_retries().await.unwrap(), 1);

    assert_eq!(h.orders.order_count(), 1);
    let failure = h.orders.get_failure(1).await.unwrap().unwrap();
    assert_eq!(failure.status, FailureStatus::Success);
    let pending = coordinator.pending_purchase(PRODUCT, 42).await.unwrap().unwrap();
    assert_eq!(pending.status, PurchaseStatus::Success);
    assert_eq!(durable_stock(&h).await, 4);
}

#[tokio::test]
async fn abandoned_order_releases_stock() {
    let mut config = quiet_config();
    config.compensation.max_attempts = 1;
    let h = harness(config);
    let coordinator = h.app.coordinator();
    coordinator.preload_activity(&activity(1)).await.unwrap();
    coordinator
        .process_seckill(PurchaseRequest::new(PRODUCT, 42, 1))
        .await;
    h.orders.fail_next_creates(5);

    let message = order_message(&h.bus, 0);
    h.app.compensator().handle_order_message(&message).await.unwrap();
    h.clock.advance(ChronoDuration::seconds(1));
    h.app.compensator().run_due_retries().await.unwrap();

    let failure = h.orders.get_failure(1).await.unwrap().unwrap();
    assert_eq!(failure.status, FailureStatus::Failed);
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(1));
    assert!(!coordinator.is_user_purchased(PRODUCT, 42).await.unwrap());

    // The released unit is for sale again
    let retry = coordinator
        .process_seckill(PurchaseRequest::new(PRODUCT, 7, 1))
        .await;
    assert_eq!(retry.kind(), Some(SeckillCode::Success));
}

#[tokio::test]
async fn async_submission_resolves_every_request() {
    let h = harness(quiet_config());
    let coordinator = h.app.coordinator();
    coordinator.preload_activity(&activity(3)).await.unwrap();

    let pending: Vec<_> = (1..=5)
        .map(|user_id| {
            coordinator
                .process_seckill_async(PurchaseRequest::new(PRODUCT, user_id, 1))
                .unwrap()
        })
        .collect();
    let responses = futures::future::join_all(pending).await;

    let succeeded = responses.iter().filter(|r| r.success).count();
    assert_eq!(succeeded, 3);
    assert!(responses
        .iter()
        .filter(|r| !r.success)
        .all(|r| r.kind() == Some(SeckillCode::InsufficientStock)));
    assert_eq!(coordinator.queue_stats().processed, 5);
    assert_eq!(coordinator.service_stats().total_requests, 5);
    assert_eq!(
        h.app.breakers().states(),
        vec![(SECKILL_BREAKER.to_string(), State::Closed)]
    );
}

#[tokio::test]
async fn reconciler_heals_lost_deduction() {
    let h = harness(quiet_config());
    h.app.coordinator().preload_activity(&activity(10)).await.unwrap();
    // Two sales settled durably but never deducted on the fast path
    h.inventory
        .sync_stock(&SyncStockRequest {
            product_id: PRODUCT,
            delta: -2,
            order_id: Some("SK-lost".into()),
            reason: "seckill order".into(),
            trace_id: "trace_lost".into(),
        })
        .await
        .unwrap();

    let report = h.app.reconciler().run_cycle().await.unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(report[0].diff, 2);
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(8));
    assert_eq!(h.app.reconciler().stats().auto_fixed, 1);
}

#[tokio::test]
async fn reconciling_mid_sale_leaves_settlement_intact() {
    let h = harness(quiet_config());
    let coordinator = h.app.coordinator();
    coordinator.preload_activity(&activity(10)).await.unwrap();
    let response = coordinator
        .process_seckill(PurchaseRequest::new(PRODUCT, 42, 1))
        .await;
    assert!(response.success);

    // Deducted on the fast path, not yet on the durable side
    let report = h.app.reconciler().run_cycle().await.unwrap();
    assert!(report[0].is_consistent());
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(9));
    assert_eq!(durable_stock(&h).await, 10);

    let message = order_message(&h.bus, 0);
    let handled = h.app.compensator().handle_order_message(&message).await.unwrap();
    assert!(matches!(handled, OrderHandled::Created { .. }));
    let report = h.app.reconciler().run_cycle().await.unwrap();

    assert!(report[0].is_consistent());
    assert_eq!(durable_stock(&h).await, 9);
    assert_eq!(h.fast.stock(PRODUCT).await.unwrap(), Some(9));
    assert!(h.app.reconciler().pending_diffs(10).await.unwrap().is_empty());
    assert_eq!(h.app.reconciler().stats().diffs_found, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reconciliation_converges(durable in 0i64..500, drift in -100i64..=100) {
        let fast_stock = durable + drift;
        prop_assume!(fast_stock >= 0);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (fast_after, durable_after) = runtime.block_on(async {
            let h = harness(quiet_config());
            h.inventory.init_inventory(PRODUCT, "limited sneaker", durable, 0).await.unwrap();
            h.fast.overwrite_stock(PRODUCT, fast_stock).await.unwrap();

            h.app.reconciler().run_cycle().await.unwrap();

            (
                h.fast.stock(PRODUCT).await.unwrap().unwrap(),
                durable_stock(&h).await,
            )
        });

        let tolerance = Config::default().reconcile.tolerance;
        prop_assert!((fast_after - durable_after).abs() <= tolerance);
        if drift.abs() > tolerance {
            prop_assert_eq!(fast_after, durable_after);
        }
    }
}
