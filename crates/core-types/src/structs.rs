use crate::enums::{AssetClass, OrderSide, OrderStatus, OrderType};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AccountId = i64;
pub type InstrumentId = i64;
pub type OrderId = Uuid;

/// A brokerage account. Owned by the user directory, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub account_number: String,
}

/// A tradable instrument from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub ticker: String,
    pub name: String,
    pub asset_class: AssetClass,
}

/// A daily OHLC snapshot for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument_id: InstrumentId,
    pub date: NaiveDate,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Decimal,
    pub previous_close: Option<Decimal>,
}

impl Quote {
    /// `close - previous_close`, when a usable previous close exists.
    pub fn daily_change(&self) -> Option<Decimal> {
        self.usable_previous_close().map(|prev| self.close - prev)
    }

    /// A previous close of zero cannot be used as a denominator and counts as missing.
    pub fn usable_previous_close(&self) -> Option<Decimal> {
        self.previous_close.filter(|prev| !prev.is_zero())
    }
}

/// An inbound request to place an order.
///
/// `size` wins over `amount` when both are present. `price` is only
/// meaningful for limit orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: Option<i64>,
    pub amount: Option<Decimal>,
    pub price: Option<Decimal>,
}

/// A persisted order with its resolved size and price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: i64,
    pub price: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// An account's holding in one instrument, including the cash instrument.
///
/// `quantity` and `average_price` are authoritative. `market_value`,
/// `daily_return` and `total_return` are a cache written by the valuator and
/// may be stale. `version` is zero for a row that has never been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub market_value: Decimal,
    pub daily_return: Decimal,
    pub total_return: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A fresh, not yet persisted holding.
    pub fn empty(account_id: AccountId, instrument_id: InstrumentId) -> Self {
        Self {
            account_id,
            instrument_id,
            quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
            market_value: Decimal::ZERO,
            daily_return: Decimal::ZERO,
            total_return: Decimal::ZERO,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// A fresh cash holding. Cash is always carried at a unit price of 1.
    pub fn empty_cash(account_id: AccountId, cash_instrument_id: InstrumentId) -> Self {
        Self {
            average_price: Decimal::ONE,
            ..Self::empty(account_id, cash_instrument_id)
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn key(&self) -> (AccountId, InstrumentId) {
        (self.account_id, self.instrument_id)
    }
}
