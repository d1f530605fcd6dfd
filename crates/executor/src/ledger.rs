use crate::error::ExecutorError;
use crate::validator::FillRows;
use chrono::Utc;
use core_types::{AccountId, InstrumentId, Order, OrderSide, Position};
use database::{DbError, LedgerCommit, Repository};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// The ledger effect of one order: who, what, which way, how many, at what price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub size: i64,
    pub price: Decimal,
}

impl Fill {
    /// `size * price`, or `None` when it does not fit a `Decimal`.
    pub fn notional(&self) -> Option<Decimal> {
        Decimal::from(self.size).checked_mul(self.price)
    }
}

fn overflow(fill: &Fill) -> ExecutorError {
    ExecutorError::InvalidRequest(format!(
        "{} of {} at {} overflows the ledger of account {}",
        fill.side, fill.size, fill.price, fill.account_id
    ))
}

impl From<&Order> for Fill {
    fn from(order: &Order) -> Self {
        Self {
            account_id: order.account_id,
            instrument_id: order.instrument_id,
            side: order.side,
            size: order.size,
            price: order.price,
        }
    }
}

/// One async mutex per account. Fills for the same account run one at a
/// time; different accounts proceed in parallel.
#[derive(Debug, Default)]
pub struct AccountLocks {
    inner: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `account_id`. Released when the guard drops.
    pub async fn acquire(&self, account_id: AccountId) -> OwnedMutexGuard<()> {
        let lock = {
            // A poisoned map is still structurally valid.
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(account_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Maintains quantity and average cost per (account, instrument), with cash
/// held as an ordinary row of the cash instrument.
pub struct PositionLedger {
    repo: Arc<dyn Repository>,
    cash_instrument_id: InstrumentId,
}

impl PositionLedger {
    pub fn new(repo: Arc<dyn Repository>, cash_instrument_id: InstrumentId) -> Self {
        Self {
            repo,
            cash_instrument_id,
        }
    }

    /// Reads the rows `fill` touches, substituting empty unsaved rows for
    /// the ones that do not exist yet. Callers must hold the account lock.
    pub async fn load_rows(&self, fill: &Fill) -> Result<FillRows, DbError> {
        let cash = self
            .repo
            .position(fill.account_id, self.cash_instrument_id)
            .await?
            .unwrap_or_else(|| Position::empty_cash(fill.account_id, self.cash_instrument_id));

        let holding = if fill.side.is_trade() {
            let row = self
                .repo
                .position(fill.account_id, fill.instrument_id)
                .await?
                .unwrap_or_else(|| Position::empty(fill.account_id, fill.instrument_id));
            Some(row)
        } else {
            None
        };

        Ok(FillRows { holding, cash })
    }

    /// Computes the rows after `fill`. The returned rows keep the versions
    /// they were read with so the store can detect concurrent writers.
    /// Arithmetic that leaves the `Decimal` range is an `InvalidRequest`.
    pub fn apply_fill(&self, rows: FillRows, fill: &Fill) -> Result<Vec<Position>, ExecutorError> {
        let now = Utc::now();
        let size = Decimal::from(fill.size);
        let notional = fill.notional().ok_or_else(|| overflow(fill))?;
        let mut cash = rows.cash;

        let (holding, cash_quantity) = match fill.side {
            OrderSide::Buy => {
                let mut holding = rows
                    .holding
                    .unwrap_or_else(|| Position::empty(fill.account_id, fill.instrument_id));
                let new_quantity = holding
                    .quantity
                    .checked_add(size)
                    .ok_or_else(|| overflow(fill))?;
                if !new_quantity.is_zero() {
                    let cost = holding
                        .quantity
                        .checked_mul(holding.average_price)
                        .and_then(|held| held.checked_add(notional))
                        .ok_or_else(|| overflow(fill))?;
                    holding.average_price =
                        cost.checked_div(new_quantity).ok_or_else(|| overflow(fill))?;
                }
                holding.quantity = new_quantity;
                holding.updated_at = now;
                (Some(holding), cash.quantity.checked_sub(notional))
            }
            OrderSide::Sell => {
                let mut holding = rows
                    .holding
                    .unwrap_or_else(|| Position::empty(fill.account_id, fill.instrument_id));
                holding.quantity = holding
                    .quantity
                    .checked_sub(size)
                    .ok_or_else(|| overflow(fill))?;
                holding.updated_at = now;
                (Some(holding), cash.quantity.checked_add(notional))
            }
            OrderSide::CashIn => (None, cash.quantity.checked_add(size)),
            OrderSide::CashOut => (None, cash.quantity.checked_sub(size)),
        };

        cash.quantity = cash_quantity.ok_or_else(|| overflow(fill))?;
        cash.updated_at = now;
        Ok(holding.into_iter().chain(std::iter::once(cash)).collect())
    }

    pub async fn commit(&self, commit: &LedgerCommit) -> Result<(), DbError> {
        self.repo.commit(commit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::MemoryRepository;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn ledger() -> PositionLedger {
        PositionLedger::new(Arc::new(MemoryRepository::new()), 66)
    }

    fn fill(side: OrderSide, size: i64, price: Decimal) -> Fill {
        Fill {
            account_id: 1,
            instrument_id: 47,
            side,
            size,
            price,
        }
    }

    fn rows(cash: Decimal, held: Decimal, avg: Decimal) -> FillRows {
        let mut cash_row = Position::empty_cash(1, 66);
        cash_row.quantity = cash;
        let mut holding = Position::empty(1, 47);
        holding.quantity = held;
        holding.average_price = avg;
        FillRows {
            holding: Some(holding),
            cash: cash_row,
        }
    }

    #[test]
    fn buy_re_averages_and_debits_cash() {
        let ledger = ledger();
        let first = ledger.apply_fill(rows(dec!(5000), dec!(0), dec!(0)), &fill(OrderSide::Buy, 10, dec!(100))).unwrap();
        assert_eq!(first[0].quantity, dec!(10));
        assert_eq!(first[0].average_price, dec!(100));
        assert_eq!(first[1].quantity, dec!(4000));

        let second = ledger.apply_fill(
            FillRows {
                holding: Some(first[0].clone()),
                cash: first[1].clone(),
            },
            &fill(OrderSide::Buy, 10, dec!(200)),
        )
        .unwrap();
        assert_eq!(second[0].quantity, dec!(20));
        assert_eq!(second[0].average_price, dec!(150));
        assert_eq!(second[1].quantity, dec!(2000));
    }

    #[test]
    fn sell_keeps_average_and_credits_cash() {
        let out = ledger().apply_fill(rows(dec!(0), dec!(20), dec!(150)), &fill(OrderSide::Sell, 5, dec!(300))).unwrap();
        assert_eq!(out[0].quantity, dec!(15));
        assert_eq!(out[0].average_price, dec!(150));
        assert_eq!(out[1].quantity, dec!(1500));
    }

    #[test]
    fn cash_moves_touch_only_the_cash_row() {
        let ledger = ledger();
        let mut r = rows(dec!(100), dec!(0), dec!(0));
        r.holding = None;
        let out = ledger.apply_fill(r.clone(), &fill(OrderSide::CashIn, 50, Decimal::ONE)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].quantity, dec!(150));
        assert_eq!(out[0].average_price, Decimal::ONE);

        let out = ledger.apply_fill(r, &fill(OrderSide::CashOut, 30, Decimal::ONE)).unwrap();
        assert_eq!(out[0].quantity, dec!(70));
    }

    #[test]
    fn applied_rows_keep_their_read_versions() {
        let mut r = rows(dec!(1000), dec!(0), dec!(0));
        r.cash.version = 4;
        let out = ledger().apply_fill(r, &fill(OrderSide::Buy, 1, dec!(10))).unwrap();
        assert_eq!(out[0].version, 0);
        assert_eq!(out[1].version, 4);
    }

    #[test]
    fn overflowing_fills_are_refused_not_panicking() {
        let ledger = ledger();
        let huge = ledger.apply_fill(
            rows(dec!(1000), dec!(0), dec!(0)),
            &fill(OrderSide::Buy, i64::MAX, dec!(100000000000)),
        );
        assert!(matches!(huge, Err(ExecutorError::InvalidRequest(_))));

        let mut r = rows(Decimal::MAX, dec!(0), dec!(0));
        r.holding = None;
        let deposit = ledger.apply_fill(r, &fill(OrderSide::CashIn, 1, Decimal::ONE));
        assert!(matches!(deposit, Err(ExecutorError::InvalidRequest(_))));

        let sale = ledger.apply_fill(rows(Decimal::MAX, dec!(10), dec!(1)), &fill(OrderSide::Sell, 1, dec!(5)));
        assert!(matches!(sale, Err(ExecutorError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn missing_rows_load_as_empty() {
        let rows = ledger().load_rows(&fill(OrderSide::Buy, 1, dec!(1))).await.unwrap();
        assert_eq!(rows.cash.average_price, Decimal::ONE);
        assert!(!rows.cash.is_persisted());
        assert_eq!(rows.holding.unwrap().quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn same_account_waits_other_accounts_do_not() {
        let locks = AccountLocks::new();
        let held = locks.acquire(1).await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(2)).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.acquire(1)).await;
        assert!(same.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire(1)).await;
        assert!(again.is_ok());
    }
}
