use chrono::NaiveDate;
use core_types::{AccountId, AssetClass, InstrumentId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One holding valued at the latest available price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub instrument_id: InstrumentId,
    pub ticker: String,
    pub name: String,
    pub asset_class: AssetClass,
    pub quantity: Decimal,
    pub average_price: Decimal,
    /// The latest close, or the average price when no quote exists.
    pub current_price: Decimal,
    /// Date of the quote `current_price` came from.
    pub as_of: Option<NaiveDate>,
    pub market_value: Decimal,
    pub invested_value: Decimal,
    pub unrealized_return: Decimal,
    pub unrealized_return_pct: Decimal,
    pub daily_return: Decimal,
    pub daily_return_pct: Decimal,
}

/// Aggregates over the non-cash holdings plus the cash balance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioTotals {
    pub total_invested: Decimal,
    pub total_market_value: Decimal,
    pub total_return: Decimal,
    pub total_return_pct: Decimal,
    pub available_cash: Decimal,
    /// `total_market_value + available_cash`.
    pub total_portfolio_value: Decimal,
}

/// The full valuation of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub account_id: AccountId,
    pub email: String,
    pub account_number: String,
    #[serde(flatten)]
    pub totals: PortfolioTotals,
    pub positions: Vec<PortfolioPosition>,
}

/// `PortfolioSummary` with the position list replaced by its length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioOverview {
    pub account_id: AccountId,
    pub email: String,
    pub account_number: String,
    #[serde(flatten)]
    pub totals: PortfolioTotals,
    pub positions_count: usize,
}

impl From<PortfolioSummary> for PortfolioOverview {
    fn from(summary: PortfolioSummary) -> Self {
        Self {
            account_id: summary.account_id,
            email: summary.email,
            account_number: summary.account_number,
            totals: summary.totals,
            positions_count: summary.positions.len(),
        }
    }
}
