use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{Entity, ProductId, Quantity, StockId, WarehouseId};

use crate::error::{StockError, StockResult};
use crate::movement::{MovementKind, Posting};

/// Parse a unit count that must be strictly positive.
pub fn quantity(units: i64) -> StockResult<Quantity> {
    Quantity::new(units).map_err(|_| StockError::InvalidQuantity(units))
}

/// On-hand and reserved units of one product in one warehouse.
///
/// Invariant: `0 <= reserved <= quantity`. Every mutator checks the invariant
/// before touching state, bumps `version`, and returns the [`Posting`] the
/// ledger records for it. A failed mutator leaves the row unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    id: StockId,
    product_id: ProductId,
    warehouse_id: WarehouseId,
    quantity: i64,
    reserved: i64,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Stock {
    /// A fresh, empty row for a product first stocked in a warehouse.
    pub fn open(
        id: StockId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            warehouse_id,
            quantity: 0,
            reserved: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a row from persisted columns, re-checking the invariant.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: StockId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        quantity: i64,
        reserved: i64,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> StockResult<Self> {
        let stock = Self {
            id,
            product_id,
            warehouse_id,
            quantity,
            reserved,
            version,
            created_at,
            updated_at,
        };
        stock.ensure_invariant(quantity, reserved)?;
        Ok(stock)
    }

    pub fn id_typed(&self) -> StockId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.warehouse_id
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn reserved(&self) -> i64 {
        self.reserved
    }

    /// Units offerable to new reservations.
    pub fn available(&self) -> i64 {
        self.quantity - self.reserved
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Goods received into the warehouse.
    pub fn receive(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        let quantity = self
            .quantity
            .checked_add(qty.get())
            .ok_or_else(|| StockError::invariant("quantity overflow"))?;
        self.commit(quantity, self.reserved, now);
        Ok(Posting {
            kind: MovementKind::In,
            delta: qty.get(),
        })
    }

    /// Units leaving from the unreserved portion.
    pub fn consume(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        let quantity = self.quantity - qty.get();
        if quantity < 0 {
            return Err(self.insufficient(qty.get(), self.quantity));
        }
        if quantity < self.reserved {
            return Err(StockError::OverReserved {
                stock_id: self.id,
                quantity,
                reserved: self.reserved,
            });
        }
        self.commit(quantity, self.reserved, now);
        Ok(Posting {
            kind: MovementKind::Out,
            delta: -qty.get(),
        })
    }

    /// Units leaving that were held by a reservation: lowers both counters.
    pub fn consume_reserved(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        let reserved = self.reserved - qty.get();
        if reserved < 0 {
            return Err(StockError::invariant(format!(
                "stock {} holds {} reserved units, cannot consume {} from reservation",
                self.id,
                self.reserved,
                qty.get()
            )));
        }
        let quantity = self.quantity - qty.get();
        if quantity < 0 {
            return Err(self.insufficient(qty.get(), self.quantity));
        }
        self.ensure_invariant(quantity, reserved)?;
        self.commit(quantity, reserved, now);
        Ok(Posting {
            kind: MovementKind::Out,
            delta: -qty.get(),
        })
    }

    /// Signed correction of on-hand units (stocktake, damage, found goods).
    pub fn adjust(&mut self, delta: i64, now: DateTime<Utc>) -> StockResult<Posting> {
        if delta == 0 {
            return Err(StockError::InvalidQuantity(0));
        }
        let quantity = self
            .quantity
            .checked_add(delta)
            .ok_or_else(|| StockError::invariant("quantity overflow"))?;
        if quantity < 0 {
            return Err(StockError::invariant(format!(
                "adjusting stock {} by {} would leave {} units on hand",
                self.id, delta, quantity
            )));
        }
        if quantity < self.reserved {
            return Err(StockError::OverReserved {
                stock_id: self.id,
                quantity,
                reserved: self.reserved,
            });
        }
        self.commit(quantity, self.reserved, now);
        Ok(Posting {
            kind: MovementKind::Adjust,
            delta,
        })
    }

    /// Source leg of a transfer; only unreserved units may leave.
    pub fn transfer_out(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        if self.available() < qty.get() {
            return Err(self.insufficient(qty.get(), self.available()));
        }
        self.commit(self.quantity - qty.get(), self.reserved, now);
        Ok(Posting {
            kind: MovementKind::Transfer,
            delta: -qty.get(),
        })
    }

    /// Destination leg of a transfer.
    pub fn transfer_in(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        let quantity = self
            .quantity
            .checked_add(qty.get())
            .ok_or_else(|| StockError::invariant("quantity overflow"))?;
        self.commit(quantity, self.reserved, now);
        Ok(Posting {
            kind: MovementKind::Transfer,
            delta: qty.get(),
        })
    }

    /// Hold units for a reservation; `quantity` is unchanged.
    pub fn reserve(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        if self.available() < qty.get() {
            return Err(self.insufficient(qty.get(), self.available()));
        }
        self.commit(self.quantity, self.reserved + qty.get(), now);
        Ok(Posting {
            kind: MovementKind::Reserve,
            delta: qty.get(),
        })
    }

    /// Return held units to the available pool.
    pub fn release(&mut self, qty: Quantity, now: DateTime<Utc>) -> StockResult<Posting> {
        let reserved = self.reserved - qty.get();
        if reserved < 0 {
            return Err(StockError::invariant(format!(
                "releasing {} units from stock {} would make reserved negative ({})",
                qty.get(),
                self.id,
                reserved
            )));
        }
        self.commit(self.quantity, reserved, now);
        Ok(Posting {
            kind: MovementKind::Release,
            delta: -qty.get(),
        })
    }

    fn insufficient(&self, requested: i64, available: i64) -> StockError {
        StockError::InsufficientStock {
            stock_id: self.id,
            requested,
            available,
        }
    }

    fn ensure_invariant(&self, quantity: i64, reserved: i64) -> StockResult<()> {
        if reserved < 0 || quantity < 0 || reserved > quantity {
            return Err(StockError::invariant(format!(
                "stock {}: expected 0 <= reserved <= quantity, got reserved {} quantity {}",
                self.id, reserved, quantity
            )));
        }
        Ok(())
    }

    fn commit(&mut self, quantity: i64, reserved: i64, now: DateTime<Utc>) {
        self.quantity = quantity;
        self.reserved = reserved;
        self.version += 1;
        self.updated_at = now;
    }
}

impl Entity for Stock {
    type Id = StockId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stock_with(quantity: i64, reserved: i64) -> Stock {
        Stock::restore(
            StockId::new(),
            ProductId::new(),
            WarehouseId::new(),
            quantity,
            reserved,
            0,
            Utc::now(),
            Utc::now(),
        )
        .unwrap()
    }

    fn q(units: i64) -> Quantity {
        quantity(units).unwrap()
    }

    #[test]
    fn non_positive_quantity_is_invalid() {
        assert_eq!(quantity(0), Err(StockError::InvalidQuantity(0)));
        assert_eq!(quantity(-4), Err(StockError::InvalidQuantity(-4)));
    }

    #[test]
    fn reserve_then_consume_reserved() {
        let mut stock = stock_with(10, 0);

        let posting = stock.reserve(q(3), Utc::now()).unwrap();
        assert_eq!(posting.kind, MovementKind::Reserve);
        assert_eq!(posting.delta, 3);
        assert_eq!((stock.reserved(), stock.available()), (3, 7));

        let posting = stock.consume_reserved(q(3), Utc::now()).unwrap();
        assert_eq!(posting.delta, -3);
        assert_eq!((stock.quantity(), stock.reserved()), (7, 0));
        assert_eq!(stock.version(), 2);
    }

    #[test]
    fn reserve_beyond_available_fails_without_change() {
        let mut stock = stock_with(5, 4);
        let err = stock.reserve(q(2), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            StockError::InsufficientStock {
                stock_id: stock.id_typed(),
                requested: 2,
                available: 1,
            }
        );
        assert_eq!((stock.quantity(), stock.reserved(), stock.version()), (5, 4, 0));
    }

    #[test]
    fn consume_distinguishes_negative_from_over_reserved() {
        let mut stock = stock_with(5, 3);
        assert!(matches!(
            stock.consume(q(6), Utc::now()),
            Err(StockError::InsufficientStock { .. })
        ));
        assert!(matches!(
            stock.consume(q(3), Utc::now()),
            Err(StockError::OverReserved { quantity: 2, reserved: 3, .. })
        ));
        stock.consume(q(2), Utc::now()).unwrap();
        assert_eq!(stock.quantity(), 3);
    }

    #[test]
    fn adjust_rules() {
        let mut stock = stock_with(5, 2);
        assert_eq!(stock.adjust(0, Utc::now()), Err(StockError::InvalidQuantity(0)));
        assert!(matches!(
            stock.adjust(-6, Utc::now()),
            Err(StockError::InvariantViolation(_))
        ));
        assert!(matches!(
            stock.adjust(-4, Utc::now()),
            Err(StockError::OverReserved { .. })
        ));
        stock.adjust(-3, Utc::now()).unwrap();
        assert_eq!(stock.quantity(), 2);
    }

    #[test]
    fn release_below_zero_is_invariant_violation() {
        let mut stock = stock_with(5, 1);
        assert!(matches!(
            stock.release(q(2), Utc::now()),
            Err(StockError::InvariantViolation(_))
        ));
    }

    #[test]
    fn transfer_out_only_moves_unreserved_units() {
        let mut stock = stock_with(10, 8);
        assert!(matches!(
            stock.transfer_out(q(3), Utc::now()),
            Err(StockError::InsufficientStock { available: 2, .. })
        ));
        let posting = stock.transfer_out(q(2), Utc::now()).unwrap();
        assert_eq!(posting.delta, -2);
        assert_eq!(stock.quantity(), 8);
    }

    #[test]
    fn restore_rejects_broken_rows() {
        let err = Stock::restore(
            StockId::new(),
            ProductId::new(),
            WarehouseId::new(),
            2,
            3,
            0,
            Utc::now(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StockError::InvariantViolation(_)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(i64),
        Consume(i64),
        Adjust(i64),
        Reserve(i64),
        Release(i64),
        ConsumeReserved(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50).prop_map(Op::Receive),
            (1i64..50).prop_map(Op::Consume),
            (-50i64..50).prop_map(Op::Adjust),
            (1i64..50).prop_map(Op::Reserve),
            (1i64..50).prop_map(Op::Release),
            (1i64..50).prop_map(Op::ConsumeReserved),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 500,
            ..ProptestConfig::default()
        })]

        /// Property: no sequence of operations can break `0 <= reserved <= quantity`,
        /// and the sum of successful postings reproduces the row.
        #[test]
        fn invariant_holds_for_any_sequence(ops in proptest::collection::vec(op(), 0..60)) {
            let mut stock = stock_with(0, 0);
            let mut quantity_total = 0i64;
            let mut reserved_total = 0i64;

            for op in ops {
                let before = stock.clone();
                let now = Utc::now();
                let result = match op {
                    Op::Receive(n) => stock.receive(q(n), now),
                    Op::Consume(n) => stock.consume(q(n), now),
                    Op::Adjust(n) => stock.adjust(n, now),
                    Op::Reserve(n) => stock.reserve(q(n), now),
                    Op::Release(n) => stock.release(q(n), now),
                    Op::ConsumeReserved(n) => stock.consume_reserved(q(n), now),
                };
                match result {
                    Ok(posting) => {
                        if posting.kind.affects_reserved() {
                            reserved_total += posting.delta;
                        } else {
                            quantity_total += posting.delta;
                        }
                        if matches!(op, Op::ConsumeReserved(_)) {
                            reserved_total += posting.delta;
                        }
                    }
                    Err(_) => prop_assert_eq!(&stock, &before),
                }
                prop_assert!(0 <= stock.reserved());
                prop_assert!(stock.reserved() <= stock.quantity());
            }

            prop_assert_eq!(stock.quantity(), quantity_total);
            prop_assert_eq!(stock.reserved(), reserved_total);
        }
    }
}
