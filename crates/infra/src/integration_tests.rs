//! End-to-end engine scenarios over the in-memory store.
//!
//! Verifies:
//! - reservations never over-commit a row under concurrent callers
//! - the reserve / fulfill / cancel / expire lifecycle and its movements
//! - transfers, replays, lock timeouts and reconciliation

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use stockledger_core::{OrderId, ProductId, StockId, WarehouseId};
use stockledger_inventory::{MovementKind, ReferenceType, ReservationStatus, WarehouseDetails};

use crate::config::EngineConfig;
use crate::engine::InventoryEngine;
use crate::error::EngineError;
use crate::reservations::{CreateReservation, Finalization};
use crate::store::InMemoryInventoryStore;

type Engine = InventoryEngine<Arc<InMemoryInventoryStore>>;

fn engine_with(config: EngineConfig) -> Engine {
    InventoryEngine::new(Arc::new(InMemoryInventoryStore::new()), config)
}

fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

fn warehouse(engine: &Engine, code: &str) -> WarehouseId {
    engine
        .warehouses()
        .register(
            WarehouseDetails {
                name: format!("Warehouse {code}"),
                code: code.to_string(),
                address: None,
            },
            Utc::now(),
        )
        .unwrap()
        .id_typed()
}

/// Open a row in a fresh warehouse and receive `on_hand` units.
fn stocked(engine: &Engine, on_hand: i64) -> (ProductId, WarehouseId, StockId) {
    let warehouse_id = warehouse(engine, "MAIN");
    let product_id = ProductId::new();
    let stock_id = engine
        .ledger()
        .open_stock(product_id, warehouse_id)
        .unwrap()
        .id_typed();
    if on_hand > 0 {
        engine.ledger().receive(stock_id, on_hand, None).unwrap();
    }
    (product_id, warehouse_id, stock_id)
}

fn request(product_id: ProductId, warehouse_id: WarehouseId, qty: i64) -> CreateReservation {
    CreateReservation {
        product_id,
        warehouse_id,
        order_id: OrderId::new(),
        quantity: qty,
        ttl: None,
    }
}

fn assert_consistent(engine: &Engine, stock_id: StockId) {
    let recon = engine.movements().reconcile(stock_id).unwrap();
    assert!(recon.consistent, "inconsistent row: {recon:?}");
    assert!(0 <= recon.recorded_reserved && recon.recorded_reserved <= recon.recorded_quantity);
}

#[test]
fn concurrent_reservations_never_exceed_available() {
    const CALLERS: usize = 16;
    const AVAILABLE: i64 = 5;

    let engine = engine();
    let (product_id, warehouse_id, stock_id) = stocked(&engine, AVAILABLE);
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .reservations()
                    .create_reservation(request(product_id, warehouse_id, 1), Utc::now())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let granted = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_insufficient_stock()))
        .count();

    assert_eq!(granted, AVAILABLE as usize);
    assert_eq!(refused, CALLERS - AVAILABLE as usize);

    let stock = engine.ledger().stock(stock_id).unwrap();
    assert_eq!(stock.reserved(), AVAILABLE);
    assert_eq!(stock.available(), 0);
    assert_eq!(
        engine.reservations().active_for_stock(stock_id).unwrap().len(),
        AVAILABLE as usize
    );
    assert_consistent(&engine, stock_id);
}

#[test]
fn reserve_then_fulfill_records_reserve_and_out() {
    let engine = engine();
    let (product_id, warehouse_id, stock_id) = stocked(&engine, 10);

    let r = engine
        .reservations()
        .create_reservation(request(product_id, warehouse_id, 3), Utc::now())
        .unwrap();
    let stock = engine.ledger().stock(stock_id).unwrap();
    assert_eq!((stock.reserved(), stock.available()), (3, 7));

    engine.reservations().fulfill(r.id_typed(), Utc::now()).unwrap();
    let stock = engine.ledger().stock(stock_id).unwrap();
    assert_eq!((stock.quantity(), stock.reserved()), (7, 0));

    // Everything after the initial receipt.
    let movements = engine.movements().list_by_stock(stock_id, 1).unwrap();
    let summary: Vec<_> = movements.iter().map(|m| (m.kind, m.quantity)).collect();
    assert_eq!(summary, vec![(MovementKind::Reserve, 3), (MovementKind::Out, -3)]);
    assert!(movements
        .iter()
        .all(|m| m.reference.is_some_and(|r| r.kind == ReferenceType::Reservation)));
    assert_consistent(&engine, stock_id);
}

#[test]
fn sweep_expires_reservation_after_ttl() {
    let engine = engine();
    let (product_id, warehouse_id, stock_id) = stocked(&engine, 5);
    let now = Utc::now();

    let r = engine
        .reservations()
        .create_reservation(
            CreateReservation {
                ttl: Some(Duration::from_secs(1)),
                ..request(product_id, warehouse_id, 5)
            },
            now,
        )
        .unwrap();
    assert_eq!(engine.ledger().stock(stock_id).unwrap().reserved(), 5);

    let report = engine
        .sweeper()
        .sweep_once(now + chrono::Duration::seconds(2))
        .unwrap();
    assert_eq!(report.expired, 1);

    let r = engine.reservations().reservation(r.id_typed()).unwrap();
    assert_eq!(r.status(), ReservationStatus::Expired);
    let stock = engine.ledger().stock(stock_id).unwrap();
    assert_eq!((stock.quantity(), stock.reserved()), (5, 0));
    assert_consistent(&engine, stock_id);
}

#[test]
fn transfer_moves_units_with_correlated_movements() {
    let engine = engine();
    let product_id = ProductId::new();
    let a = warehouse(&engine, "A");
    let b = warehouse(&engine, "B");
    let from = engine.ledger().open_stock(product_id, a).unwrap().id_typed();
    let to = engine.ledger().open_stock(product_id, b).unwrap().id_typed();
    engine.ledger().receive(from, 20, None).unwrap();

    let receipt = engine
        .ledger()
        .transfer(from, to, 5, Some("rebalance".into()))
        .unwrap();
    assert_eq!(receipt.source.quantity(), 15);
    assert_eq!(receipt.destination.quantity(), 5);
    assert_eq!(receipt.movements.len(), 2);

    for (movement, (stock_id, delta)) in receipt.movements.iter().zip([(from, -5), (to, 5)]) {
        assert_eq!(movement.stock_id, stock_id);
        assert_eq!(movement.kind, MovementKind::Transfer);
        assert_eq!(movement.quantity, delta);
        let reference = movement.reference.unwrap();
        assert_eq!(reference.kind, ReferenceType::Transfer);
        assert_eq!(reference.id, receipt.correlation_id);
    }
    assert_consistent(&engine, from);
    assert_consistent(&engine, to);
}

#[test]
fn reserve_then_cancel_restores_available() {
    let engine = engine();
    let (product_id, warehouse_id, stock_id) = stocked(&engine, 8);
    let before = engine.ledger().stock(stock_id).unwrap().available();

    let r = engine
        .reservations()
        .create_reservation(request(product_id, warehouse_id, 6), Utc::now())
        .unwrap();
    let outcome = engine.reservations().cancel(r.id_typed(), Utc::now()).unwrap();
    assert!(outcome.is_finalized());
    assert_eq!(outcome.reservation().status(), ReservationStatus::Cancelled);

    assert_eq!(engine.ledger().stock(stock_id).unwrap().available(), before);
    let again = engine.reservations().cancel(r.id_typed(), Utc::now()).unwrap();
    assert!(matches!(again, Finalization::AlreadyFinalized(_)));
    assert_consistent(&engine, stock_id);
}

#[test]
fn replayed_expiry_does_not_release_twice() {
    let engine = engine();
    let (product_id, warehouse_id, stock_id) = stocked(&engine, 6);
    let now = Utc::now();

    let expiring = engine
        .reservations()
        .create_reservation(
            CreateReservation {
                ttl: Some(Duration::from_secs(1)),
                ..request(product_id, warehouse_id, 2)
            },
            now,
        )
        .unwrap();
    engine
        .reservations()
        .create_reservation(request(product_id, warehouse_id, 3), now)
        .unwrap();

    let later = now + chrono::Duration::seconds(5);
    for _ in 0..3 {
        engine
            .reservations()
            .expire_if_due(expiring.id_typed(), later)
            .unwrap();
    }
    assert_eq!(engine.ledger().stock(stock_id).unwrap().reserved(), 3);
    assert_consistent(&engine, stock_id);
}

#[test]
fn competing_fulfill_and_cancel_have_one_winner() {
    for _ in 0..20 {
        let engine = engine();
        let (product_id, warehouse_id, stock_id) = stocked(&engine, 4);
        let r = engine
            .reservations()
            .create_reservation(request(product_id, warehouse_id, 4), Utc::now())
            .unwrap();
        let id = r.id_typed();
        let barrier = Arc::new(Barrier::new(2));

        let fulfil = {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.reservations().fulfill(id, Utc::now())
            })
        };
        let cancel = {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.reservations().cancel(id, Utc::now())
            })
        };
        let fulfilled = fulfil.join().unwrap();
        let cancelled = cancel.join().unwrap().unwrap();

        let status = engine.reservations().reservation(id).unwrap().status();
        let stock = engine.ledger().stock(stock_id).unwrap();
        match status {
            ReservationStatus::Fulfilled => {
                assert!(fulfilled.is_ok());
                assert!(matches!(cancelled, Finalization::AlreadyFinalized(_)));
                assert_eq!((stock.quantity(), stock.reserved()), (0, 0));
            }
            ReservationStatus::Cancelled => {
                assert!(cancelled.is_finalized());
                assert!(matches!(
                    fulfilled,
                    Err(EngineError::Stock(stockledger_inventory::StockError::ReservationNotActive { .. }))
                ));
                assert_eq!((stock.quantity(), stock.reserved()), (4, 0));
            }
            other => panic!("unexpected status {other}"),
        }
        assert_consistent(&engine, stock_id);
    }
}

#[test]
fn held_row_times_out_as_retryable() {
    let engine = engine_with(EngineConfig::default().with_lock_timeout(Duration::from_millis(30)));
    let (_, _, stock_id) = stocked(&engine, 1);

    let held = engine
        .locks()
        .acquire([stock_id], Duration::from_millis(30))
        .unwrap();
    let err = engine.ledger().receive(stock_id, 1, None).unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout { stock_id: s, .. } if s == stock_id));
    assert!(err.is_retryable());

    drop(held);
    assert_eq!(engine.ledger().receive(stock_id, 1, None).unwrap().stock.quantity(), 2);
}

#[derive(Debug, Clone)]
enum Step {
    Receive(i64),
    Consume(i64),
    Adjust(i64),
    Reserve(i64),
    Fulfil(usize),
    Cancel(usize),
    Expire(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1i64..20).prop_map(Step::Receive),
        (1i64..20).prop_map(Step::Consume),
        (-20i64..20).prop_map(Step::Adjust),
        (1i64..10).prop_map(Step::Reserve),
        any::<usize>().prop_map(Step::Fulfil),
        any::<usize>().prop_map(Step::Cancel),
        any::<usize>().prop_map(Step::Expire),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: whatever the callers do, the row matches its movement history
    /// and its active reservations, and `0 <= reserved <= quantity` holds.
    #[test]
    fn any_operation_sequence_reconciles(steps in proptest::collection::vec(step(), 1..40)) {
        let engine = engine();
        let (product_id, warehouse_id, stock_id) = stocked(&engine, 0);
        let mut reservations = Vec::new();
        let now = Utc::now();
        let later = now + chrono::Duration::hours(1);

        for step in steps {
            // Domain refusals are expected; anything else is a bug.
            let outcome = match step {
                Step::Receive(n) => engine.ledger().receive(stock_id, n, None).map(|_| ()),
                Step::Consume(n) => engine.ledger().consume(stock_id, n, None).map(|_| ()),
                Step::Adjust(n) => engine.ledger().adjust(stock_id, n, None).map(|_| ()),
                Step::Reserve(n) => engine
                    .reservations()
                    .create_reservation(request(product_id, warehouse_id, n), now)
                    .map(|r| reservations.push(r.id_typed())),
                Step::Fulfil(i) if !reservations.is_empty() => engine
                    .reservations()
                    .fulfill(reservations[i % reservations.len()], now)
                    .map(|_| ()),
                Step::Cancel(i) if !reservations.is_empty() => engine
                    .reservations()
                    .cancel(reservations[i % reservations.len()], now)
                    .map(|_| ()),
                Step::Expire(i) if !reservations.is_empty() => engine
                    .reservations()
                    .expire_if_due(reservations[i % reservations.len()], later)
                    .map(|_| ()),
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                prop_assert!(matches!(err, EngineError::Stock(_)), "unexpected error {err:?}");
            }

            let recon = engine.movements().reconcile(stock_id).unwrap();
            prop_assert!(recon.consistent, "{recon:?}");
            prop_assert!(0 <= recon.recorded_reserved);
            prop_assert!(recon.recorded_reserved <= recon.recorded_quantity);
        }
    }
}
