use crate::repository::{
    AccountDirectory, CachedValuation, CommitMode, InstrumentDirectory, LedgerCommit, OrderStore,
    PositionStore, QuoteSource,
};
use crate::DbError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use core_types::{
    Account, AccountId, CoreError, Instrument, InstrumentId, Order, OrderId, OrderStatus, Position,
    Quote,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, Transaction};
use uuid::Uuid;

/// The `DbRepository` provides the PostgreSQL-backed implementation of every
/// repository trait. It encapsulates all SQL queries and data access logic.
#[derive(Debug, Clone)]
pub struct DbRepository {
    pool: PgPool,
}

// Row shapes as stored. Enums are kept as text and parsed on the way out.

#[derive(Debug, FromRow)]
struct DbAccount {
    id: i64,
    email: String,
    account_number: String,
}

#[derive(Debug, FromRow)]
struct DbInstrument {
    id: i64,
    ticker: String,
    name: String,
    asset_class: String,
}

#[derive(Debug, FromRow)]
struct DbQuote {
    instrument_id: i64,
    date: NaiveDate,
    open: Option<Decimal>,
    high: Option<Decimal>,
    low: Option<Decimal>,
    close: Decimal,
    previous_close: Option<Decimal>,
}

#[derive(Debug, FromRow)]
struct DbOrder {
    id: Uuid,
    account_id: i64,
    instrument_id: i64,
    side: String,
    order_type: String,
    size: i64,
    price: Decimal,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DbPosition {
    account_id: i64,
    instrument_id: i64,
    quantity: Decimal,
    average_price: Decimal,
    market_value: Decimal,
    daily_return: Decimal,
    total_return: Decimal,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl From<DbAccount> for Account {
    fn from(row: DbAccount) -> Self {
        Account {
            id: row.id,
            email: row.email,
            account_number: row.account_number,
        }
    }
}

impl TryFrom<DbInstrument> for Instrument {
    type Error = CoreError;

    fn try_from(row: DbInstrument) -> Result<Self, Self::Error> {
        Ok(Instrument {
            id: row.id,
            ticker: row.ticker,
            name: row.name,
            asset_class: row.asset_class.parse()?,
        })
    }
}

impl From<DbQuote> for Quote {
    fn from(row: DbQuote) -> Self {
        Quote {
            instrument_id: row.instrument_id,
            date: row.date,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            previous_close: row.previous_close,
        }
    }
}

impl TryFrom<DbOrder> for Order {
    type Error = CoreError;

    fn try_from(row: DbOrder) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            account_id: row.account_id,
            instrument_id: row.instrument_id,
            side: row.side.parse()?,
            order_type: row.order_type.parse()?,
            size: row.size,
            price: row.price,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

impl From<DbPosition> for Position {
    fn from(row: DbPosition) -> Self {
        Position {
            account_id: row.account_id,
            instrument_id: row.instrument_id,
            quantity: row.quantity,
            average_price: row.average_price,
            market_value: row.market_value,
            daily_return: row.daily_return,
            total_return: row.total_return,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

const ORDER_COLUMNS: &str =
    "id, account_id, instrument_id, side, order_type, size, price, status, created_at";

const POSITION_COLUMNS: &str = "account_id, instrument_id, quantity, average_price, market_value, \
     daily_return, total_return, version, updated_at";

impl DbRepository {
    /// Creates a new `DbRepository` with a shared database connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_order(
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        mode: CommitMode,
    ) -> Result<(), DbError> {
        let affected = match mode {
            CommitMode::Insert => sqlx::query(
                r#"
                INSERT INTO orders (id, account_id, instrument_id, side, order_type, size, price, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(order.id)
            .bind(order.account_id)
            .bind(order.instrument_id)
            .bind(order.side.as_str())
            .bind(order.order_type.as_str())
            .bind(order.size)
            .bind(order.price)
            .bind(order.status.as_str())
            .bind(order.created_at)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
            CommitMode::Promote { from } => {
                sqlx::query("UPDATE orders SET status = $1, price = $2 WHERE id = $3 AND status = $4")
                    .bind(order.status.as_str())
                    .bind(order.price)
                    .bind(order.id)
                    .bind(from.as_str())
                    .execute(&mut **tx)
                    .await?
                    .rows_affected()
            }
        };

        if affected != 1 {
            return Err(DbError::Conflict(format!(
                "order {} is no longer in the expected state",
                order.id
            )));
        }
        Ok(())
    }

    async fn write_position(
        tx: &mut Transaction<'_, Postgres>,
        position: &Position,
    ) -> Result<(), DbError> {
        let affected = if position.is_persisted() {
            sqlx::query(
                r#"
                UPDATE positions
                SET quantity = $3, average_price = $4, version = version + 1, updated_at = $5
                WHERE account_id = $1 AND instrument_id = $2 AND version = $6
                "#,
            )
            .bind(position.account_id)
            .bind(position.instrument_id)
            .bind(position.quantity)
            .bind(position.average_price)
            .bind(position.updated_at)
            .bind(position.version)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        } else {
            // `ON CONFLICT DO NOTHING` turns a concurrent first insert into a
            // zero-row result instead of a unique violation.
            sqlx::query(
                r#"
                INSERT INTO positions (account_id, instrument_id, quantity, average_price, market_value,
                                       daily_return, total_return, version, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8)
                ON CONFLICT (account_id, instrument_id) DO NOTHING
                "#,
            )
            .bind(position.account_id)
            .bind(position.instrument_id)
            .bind(position.quantity)
            .bind(position.average_price)
            .bind(position.market_value)
            .bind(position.daily_return)
            .bind(position.total_return)
            .bind(position.updated_at)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        };

        if affected != 1 {
            return Err(DbError::Conflict(format!(
                "position ({}, {}) changed since version {}",
                position.account_id, position.instrument_id, position.version
            )));
        }
        Ok(())
    }
}

/// The error a failed commit reports. A rollback failure is only logged so
/// the caller still sees the original error, e.g. a retryable `Conflict`.
fn after_rollback(original: DbError, rollback: Result<(), sqlx::Error>) -> DbError {
    if let Err(rollback) = rollback {
        tracing::error!(error = %rollback, original = %original, "Failed to roll back ledger commit.");
    }
    original
}

#[async_trait]
impl AccountDirectory for DbRepository {
    async fn account(&self, id: AccountId) -> Result<Option<Account>, DbError> {
        let row = sqlx::query_as::<_, DbAccount>(
            "SELECT id, email, account_number FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }
}

#[async_trait]
impl InstrumentDirectory for DbRepository {
    async fn instrument(&self, id: InstrumentId) -> Result<Option<Instrument>, DbError> {
        let row = sqlx::query_as::<_, DbInstrument>(
            "SELECT id, ticker, name, asset_class FROM instruments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Instrument::try_from).transpose()?)
    }
}

#[async_trait]
impl QuoteSource for DbRepository {
    async fn latest_quote(&self, instrument_id: InstrumentId) -> Result<Option<Quote>, DbError> {
        let row = sqlx::query_as::<_, DbQuote>(
            r#"
            SELECT instrument_id, date, open, high, low, close, previous_close
            FROM quotes
            WHERE instrument_id = $1
            ORDER BY date DESC
            LIMIT 1
            "#,
        )
        .bind(instrument_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Quote::from))
    }
}

#[async_trait]
impl OrderStore for DbRepository {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, DbError> {
        let row = sqlx::query_as::<_, DbOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Order::try_from).transpose()?)
    }

    async fn orders_for_account(
        &self,
        account_id: AccountId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query_as::<_, DbOrder>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE account_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC, seq DESC
            "#
        ))
        .bind(account_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let orders = rows
            .into_iter()
            .map(Order::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    async fn pending_orders(&self) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query_as::<_, DbOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = 'NEW' ORDER BY created_at ASC, seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let orders = rows
            .into_iter()
            .map(Order::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, DbError> {
        let row = sqlx::query_as::<_, DbOrder>(&format!(
            "UPDATE orders SET status = $1 WHERE id = $2 AND status = $3 RETURNING {ORDER_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Order::try_from).transpose()?)
    }
}

#[async_trait]
impl PositionStore for DbRepository {
    async fn position(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Position>, DbError> {
        let row = sqlx::query_as::<_, DbPosition>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE account_id = $1 AND instrument_id = $2"
        ))
        .bind(account_id)
        .bind(instrument_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Position::from))
    }

    async fn positions_for_account(&self, account_id: AccountId) -> Result<Vec<Position>, DbError> {
        let rows = sqlx::query_as::<_, DbPosition>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE account_id = $1 ORDER BY instrument_id ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Position::from).collect())
    }

    async fn commit(&self, commit: &LedgerCommit) -> Result<(), DbError> {
        let mut tx: Transaction<Postgres> = self.pool.begin().await?;

        let result = async {
            Self::write_order(&mut tx, &commit.order, commit.mode).await?;
            for position in &commit.positions {
                Self::write_position(&mut tx, position).await?;
            }
            Ok::<(), DbError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => Err(after_rollback(e, tx.rollback().await)),
        }
    }

    async fn update_valuation(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        valuation: CachedValuation,
    ) -> Result<(), DbError> {
        let affected = sqlx::query(
            r#"
            UPDATE positions
            SET market_value = $3, daily_return = $4, total_return = $5
            WHERE account_id = $1 AND instrument_id = $2
            "#,
        )
        .bind(account_id)
        .bind(instrument_id)
        .bind(valuation.market_value)
        .bind(valuation.daily_return)
        .bind(valuation.total_return)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}
