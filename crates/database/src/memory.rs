use crate::repository::{
    AccountDirectory, CachedValuation, CommitMode, InstrumentDirectory, LedgerCommit, OrderStore,
    PositionStore, QuoteSource,
};
use crate::DbError;
use async_trait::async_trait;
use core_types::{
    Account, AccountId, Instrument, InstrumentId, Order, OrderId, OrderStatus, Position, Quote,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    instruments: HashMap<InstrumentId, Instrument>,
    quotes: HashMap<InstrumentId, Vec<Quote>>,
    // Insertion order doubles as the tie-breaker for equal timestamps.
    orders: Vec<Order>,
    positions: BTreeMap<(AccountId, InstrumentId), Position>,
}

/// An in-process repository with the same commit semantics as the Postgres
/// one. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, account: Account) {
        self.state.write().await.accounts.insert(account.id, account);
    }

    pub async fn add_instrument(&self, instrument: Instrument) {
        self.state
            .write()
            .await
            .instruments
            .insert(instrument.id, instrument);
    }

    pub async fn add_quote(&self, quote: Quote) {
        self.state
            .write()
            .await
            .quotes
            .entry(quote.instrument_id)
            .or_default()
            .push(quote);
    }

    /// Stores a holding directly, bypassing the ledger. Used to load opening
    /// balances. The stored row is given version 1 if it had none.
    pub async fn seed_position(&self, mut position: Position) {
        position.version = position.version.max(1);
        self.state
            .write()
            .await
            .positions
            .insert(position.key(), position);
    }
}

#[async_trait]
impl AccountDirectory for MemoryRepository {
    async fn account(&self, id: AccountId) -> Result<Option<Account>, DbError> {
        Ok(self.state.read().await.accounts.get(&id).cloned())
    }
}

#[async_trait]
impl InstrumentDirectory for MemoryRepository {
    async fn instrument(&self, id: InstrumentId) -> Result<Option<Instrument>, DbError> {
        Ok(self.state.read().await.instruments.get(&id).cloned())
    }
}

#[async_trait]
impl QuoteSource for MemoryRepository {
    async fn latest_quote(&self, instrument_id: InstrumentId) -> Result<Option<Quote>, DbError> {
        let state = self.state.read().await;
        Ok(state
            .quotes
            .get(&instrument_id)
            .and_then(|quotes| quotes.iter().max_by_key(|q| q.date))
            .cloned())
    }
}

#[async_trait]
impl OrderStore for MemoryRepository {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, DbError> {
        let state = self.state.read().await;
        Ok(state.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn orders_for_account(
        &self,
        account_id: AccountId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, DbError> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .iter()
            .filter(|o| o.account_id == account_id)
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        // Newest first; reversing before a stable sort keeps later inserts
        // ahead of earlier ones with the same timestamp.
        orders.reverse();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn pending_orders(&self) -> Result<Vec<Order>, DbError> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::New)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, DbError> {
        let mut state = self.state.write().await;
        match state.orders.iter_mut().find(|o| o.id == id) {
            Some(order) if order.status == from => {
                order.status = to;
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl PositionStore for MemoryRepository {
    async fn position(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Position>, DbError> {
        let state = self.state.read().await;
        Ok(state.positions.get(&(account_id, instrument_id)).cloned())
    }

    async fn positions_for_account(&self, account_id: AccountId) -> Result<Vec<Position>, DbError> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .range((account_id, InstrumentId::MIN)..=(account_id, InstrumentId::MAX))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn commit(&self, commit: &LedgerCommit) -> Result<(), DbError> {
        let mut state = self.state.write().await;

        // Check every precondition before touching anything.
        let order_index = match commit.mode {
            CommitMode::Insert => {
                if state.orders.iter().any(|o| o.id == commit.order.id) {
                    return Err(DbError::Conflict(format!(
                        "order {} already exists",
                        commit.order.id
                    )));
                }
                None
            }
            CommitMode::Promote { from } => {
                let index = state
                    .orders
                    .iter()
                    .position(|o| o.id == commit.order.id && o.status == from)
                    .ok_or_else(|| {
                        DbError::Conflict(format!(
                            "order {} is no longer in the expected state",
                            commit.order.id
                        ))
                    })?;
                Some(index)
            }
        };

        for position in &commit.positions {
            let stored_version = state
                .positions
                .get(&position.key())
                .map(|p| p.version)
                .unwrap_or(0);
            if stored_version != position.version {
                return Err(DbError::Conflict(format!(
                    "position ({}, {}) changed since version {}",
                    position.account_id, position.instrument_id, position.version
                )));
            }
        }

        match order_index {
            Some(index) => {
                let stored = &mut state.orders[index];
                stored.status = commit.order.status;
                stored.price = commit.order.price;
            }
            None => state.orders.push(commit.order.clone()),
        }

        // Cached valuation columns belong to `update_valuation`; an existing
        // row keeps its own.
        for position in &commit.positions {
            match state.positions.get_mut(&position.key()) {
                Some(stored) => {
                    stored.quantity = position.quantity;
                    stored.average_price = position.average_price;
                    stored.updated_at = position.updated_at;
                    stored.version += 1;
                }
                None => {
                    let mut stored = position.clone();
                    stored.version = 1;
                    state.positions.insert(stored.key(), stored);
                }
            }
        }

        Ok(())
    }

    async fn update_valuation(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        valuation: CachedValuation,
    ) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(&(account_id, instrument_id))
            .ok_or(DbError::NotFound)?;
        position.market_value = valuation.market_value;
        position.daily_return = valuation.daily_return;
        position.total_return = valuation.total_return;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};
    use core_types::{OrderSide, OrderType};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn order(account_id: AccountId, status: OrderStatus, age_secs: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            account_id,
            instrument_id: 47,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            size: 1,
            price: dec!(100),
            status,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn latest_quote_is_the_most_recent_date() {
        let repo = MemoryRepository::new();
        for (day, close) in [(12, dec!(930)), (13, dec!(941.5)), (11, dec!(900))] {
            repo.add_quote(Quote {
                instrument_id: 47,
                date: NaiveDate::from_ymd_opt(2023, 7, day).unwrap(),
                open: None,
                high: None,
                low: None,
                close,
                previous_close: None,
            })
            .await;
        }
        let quote = repo.latest_quote(47).await.unwrap().unwrap();
        assert_eq!(quote.close, dec!(941.5));
        assert!(repo.latest_quote(48).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn account_orders_are_newest_first_and_filterable() {
        let repo = MemoryRepository::new();
        let old = order(1, OrderStatus::Filled, 60);
        let mid = order(1, OrderStatus::New, 30);
        let new = order(1, OrderStatus::New, 0);
        let other = order(2, OrderStatus::New, 10);
        for o in [&mid, &old, &new, &other] {
            repo.commit(&LedgerCommit::order_only(o.clone())).await.unwrap();
        }

        let all = repo.orders_for_account(1, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![new.id, mid.id, old.id]);

        let pending = repo.orders_for_account(1, Some(OrderStatus::New)).await.unwrap();
        assert_eq!(pending.len(), 2);

        let sweep = repo.pending_orders().await.unwrap();
        let ids: Vec<_> = sweep.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![mid.id, other.id, new.id]);
    }

    #[tokio::test]
    async fn stale_version_rejects_the_whole_commit() {
        let repo = MemoryRepository::new();
        let mut cash = Position::empty_cash(1, 66);
        cash.quantity = dec!(1000);
        repo.seed_position(cash.clone()).await;

        // Built from a read that predates the seed.
        let mut stale = Position::empty_cash(1, 66);
        stale.quantity = dec!(500);
        let holding = Position::empty(1, 47);
        let commit = LedgerCommit {
            order: order(1, OrderStatus::Filled, 0),
            mode: CommitMode::Insert,
            positions: vec![holding, stale],
        };

        let err = repo.commit(&commit).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(repo.orders_for_account(1, None).await.unwrap().is_empty());
        assert!(repo.position(1, 47).await.unwrap().is_none());
        assert_eq!(repo.position(1, 66).await.unwrap().unwrap().quantity, dec!(1000));
    }

    #[tokio::test]
    async fn commit_bumps_versions() {
        let repo = MemoryRepository::new();
        let mut holding = Position::empty(1, 47);
        holding.quantity = dec!(10);
        repo.commit(&LedgerCommit {
            order: order(1, OrderStatus::Filled, 0),
            mode: CommitMode::Insert,
            positions: vec![holding],
        })
        .await
        .unwrap();

        let stored = repo.position(1, 47).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.quantity, dec!(10));
    }

    #[tokio::test]
    async fn commit_keeps_valuations_written_after_the_read() {
        let repo = MemoryRepository::new();
        let mut holding = Position::empty(1, 47);
        holding.quantity = dec!(10);
        holding.average_price = dec!(100);
        repo.seed_position(holding).await;

        let read = repo.position(1, 47).await.unwrap().unwrap();
        repo.update_valuation(
            1,
            47,
            CachedValuation {
                market_value: dec!(1200),
                daily_return: dec!(30),
                total_return: dec!(200),
            },
        )
        .await
        .unwrap();

        let mut sold = read.clone();
        sold.quantity = dec!(4);
        repo.commit(&LedgerCommit {
            order: order(1, OrderStatus::Filled, 0),
            mode: CommitMode::Insert,
            positions: vec![sold],
        })
        .await
        .unwrap();

        let stored = repo.position(1, 47).await.unwrap().unwrap();
        assert_eq!(stored.quantity, dec!(4));
        assert_eq!(stored.average_price, dec!(100));
        assert_eq!(stored.version, 2);
        assert_eq!(stored.market_value, dec!(1200));
        assert_eq!(stored.daily_return, dec!(30));
        assert_eq!(stored.total_return, dec!(200));
    }

    #[tokio::test]
    async fn transition_requires_the_expected_status() {
        let repo = MemoryRepository::new();
        let pending = order(1, OrderStatus::New, 0);
        repo.commit(&LedgerCommit::order_only(pending.clone())).await.unwrap();

        let cancelled = repo
            .transition_order(pending.id, OrderStatus::New, OrderStatus::Cancelled)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        let again = repo
            .transition_order(pending.id, OrderStatus::New, OrderStatus::Cancelled)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn valuation_update_leaves_ledger_fields_alone() {
        let repo = MemoryRepository::new();
        let mut holding = Position::empty(1, 47);
        holding.quantity = dec!(10);
        holding.average_price = dec!(100);
        repo.seed_position(holding).await;

        repo.update_valuation(
            1,
            47,
            CachedValuation {
                market_value: dec!(1100),
                daily_return: dec!(20),
                total_return: dec!(100),
            },
        )
        .await
        .unwrap();

        let stored = repo.position(1, 47).await.unwrap().unwrap();
        assert_eq!(stored.market_value, dec!(1100));
        assert_eq!(stored.quantity, dec!(10));
        assert_eq!(stored.version, 1);

        let missing = repo.update_valuation(1, 48, CachedValuation::default()).await;
        assert!(matches!(missing, Err(DbError::NotFound)));
    }
}
