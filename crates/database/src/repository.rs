//! Repository interfaces consumed by the execution engine and the valuator.
//!
//! The directory and quote traits describe external collaborators that are
//! read-only to this core. `OrderStore` and `PositionStore` hold the state the
//! core owns.

use crate::DbError;
use async_trait::async_trait;
use core_types::{
    Account, AccountId, Instrument, InstrumentId, Order, OrderId, OrderStatus, Position, Quote,
};
use rust_decimal::Decimal;

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account(&self, id: AccountId) -> Result<Option<Account>, DbError>;

    async fn account_exists(&self, id: AccountId) -> Result<bool, DbError> {
        Ok(self.account(id).await?.is_some())
    }
}

#[async_trait]
pub trait InstrumentDirectory: Send + Sync {
    async fn instrument(&self, id: InstrumentId) -> Result<Option<Instrument>, DbError>;

    async fn instrument_exists(&self, id: InstrumentId) -> Result<bool, DbError> {
        Ok(self.instrument(id).await?.is_some())
    }
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// The most recent quote by date, if any.
    async fn latest_quote(&self, instrument_id: InstrumentId) -> Result<Option<Quote>, DbError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, DbError>;

    /// Orders for one account, most recent first, optionally filtered by status.
    async fn orders_for_account(
        &self,
        account_id: AccountId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, DbError>;

    /// Every `New` order across all accounts, oldest first.
    async fn pending_orders(&self) -> Result<Vec<Order>, DbError>;

    /// Sets the status of `id` to `to` only if it is currently `from`.
    /// Returns the updated order, or `None` when the precondition failed or
    /// the order does not exist.
    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, DbError>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn position(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Position>, DbError>;

    /// All holdings of an account ordered by instrument id.
    async fn positions_for_account(&self, account_id: AccountId) -> Result<Vec<Position>, DbError>;

    /// Writes the order and the position rows of a [`LedgerCommit`] in a
    /// single transaction. Either everything is written or nothing is.
    ///
    /// Each position is written only if the stored row still carries the
    /// `version` it was read with (a version of zero means the row must not
    /// exist yet); the stored version is then incremented. A failed check
    /// returns [`DbError::Conflict`].
    async fn commit(&self, commit: &LedgerCommit) -> Result<(), DbError>;

    /// Overwrites the cached valuation columns of one row. Quantity, average
    /// price and version are left untouched.
    async fn update_valuation(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        valuation: CachedValuation,
    ) -> Result<(), DbError>;
}

/// Everything the execution engine and the valuator need from storage.
pub trait Repository:
    AccountDirectory + InstrumentDirectory + QuoteSource + OrderStore + PositionStore
{
}

impl<T> Repository for T where
    T: AccountDirectory + InstrumentDirectory + QuoteSource + OrderStore + PositionStore
{
}

/// How the order record of a commit is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// The order is new and is inserted as given.
    Insert,
    /// The order already exists with status `from` and is moved to the
    /// status carried by the commit's order.
    Promote { from: OrderStatus },
}

/// One atomic unit of work: an order record plus the ledger rows it touches.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerCommit {
    pub order: Order,
    pub mode: CommitMode,
    pub positions: Vec<Position>,
}

impl LedgerCommit {
    /// A commit that only records an order (pending or rejected).
    pub fn order_only(order: Order) -> Self {
        Self {
            order,
            mode: CommitMode::Insert,
            positions: Vec::new(),
        }
    }
}

/// The denormalized valuation fields stored next to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachedValuation {
    pub market_value: Decimal,
    pub daily_return: Decimal,
    pub total_return: Decimal,
}
