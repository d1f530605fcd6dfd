use crate::error::AnalyticsError;
use crate::report::{PortfolioOverview, PortfolioPosition, PortfolioSummary, PortfolioTotals};
use core_types::{Account, AccountId, Instrument, InstrumentId, Position, Quote};
use database::{CachedValuation, Repository};
use rust_decimal::Decimal;
use std::sync::Arc;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// `part / whole * 100`, or zero when `whole` is not positive.
fn percentage(part: Decimal, whole: Decimal) -> Decimal {
    if whole > Decimal::ZERO {
        part / whole * HUNDRED
    } else {
        Decimal::ZERO
    }
}

/// Values a single holding. Pure; used by every read path below.
pub fn value_position(
    position: &Position,
    instrument: &Instrument,
    quote: Option<&Quote>,
) -> PortfolioPosition {
    let quantity = position.quantity;
    let current_price = quote.map(|q| q.close).unwrap_or(position.average_price);
    let market_value = quantity * current_price;
    let invested_value = quantity * position.average_price;
    let unrealized_return = market_value - invested_value;

    let (daily_return, daily_return_pct) = match quote {
        Some(q) => match (q.daily_change(), q.usable_previous_close()) {
            (Some(change), Some(previous)) => (change * quantity, percentage(change, previous)),
            _ => (Decimal::ZERO, Decimal::ZERO),
        },
        None => (Decimal::ZERO, Decimal::ZERO),
    };

    PortfolioPosition {
        instrument_id: position.instrument_id,
        ticker: instrument.ticker.clone(),
        name: instrument.name.clone(),
        asset_class: instrument.asset_class,
        quantity,
        average_price: position.average_price,
        current_price,
        as_of: quote.map(|q| q.date),
        market_value,
        invested_value,
        unrealized_return,
        unrealized_return_pct: percentage(unrealized_return, invested_value),
        daily_return,
        daily_return_pct,
    }
}

/// Read-side valuation of accounts against the latest quotes.
///
/// Reads are not isolated from fills in flight; a summary may mix rows from
/// before and after a concurrent commit.
pub struct PortfolioValuator {
    repo: Arc<dyn Repository>,
    cash_instrument_id: InstrumentId,
}

impl PortfolioValuator {
    pub fn new(repo: Arc<dyn Repository>, cash_instrument_id: InstrumentId) -> Self {
        Self {
            repo,
            cash_instrument_id,
        }
    }

    /// Values every open non-cash holding of the account and totals them.
    pub async fn valuate(&self, account_id: AccountId) -> Result<PortfolioSummary, AnalyticsError> {
        let account = self.account(account_id).await?;
        let rows = self.repo.positions_for_account(account_id).await?;

        let mut totals = PortfolioTotals::default();
        let mut positions = Vec::new();
        for row in &rows {
            if row.instrument_id == self.cash_instrument_id {
                totals.available_cash = row.quantity;
                continue;
            }
            if row.quantity <= Decimal::ZERO {
                continue;
            }
            let valued = self.value(row).await?;
            totals.total_invested += valued.invested_value;
            totals.total_market_value += valued.market_value;
            totals.total_return += valued.unrealized_return;
            positions.push(valued);
        }

        totals.total_return_pct = percentage(totals.total_return, totals.total_invested);
        totals.total_portfolio_value = totals.total_market_value + totals.available_cash;

        tracing::debug!(account_id, positions = positions.len(), total = %totals.total_portfolio_value, "Portfolio valued.");

        Ok(PortfolioSummary {
            account_id: account.id,
            email: account.email,
            account_number: account.account_number,
            totals,
            positions,
        })
    }

    pub async fn summarize(&self, account_id: AccountId) -> Result<PortfolioOverview, AnalyticsError> {
        Ok(self.valuate(account_id).await?.into())
    }

    /// The valuation of one holding, or `None` when the account holds none of it.
    pub async fn position_details(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<PortfolioPosition>, AnalyticsError> {
        match self.repo.position(account_id, instrument_id).await? {
            Some(row) if !row.quantity.is_zero() => Ok(Some(self.value(&row).await?)),
            _ => Ok(None),
        }
    }

    /// Writes current market value, daily return and unrealized return into
    /// the cached columns of each open non-cash holding. Returns the number of
    /// rows written.
    pub async fn refresh_valuations(&self, account_id: AccountId) -> Result<usize, AnalyticsError> {
        let summary = self.valuate(account_id).await?;
        for position in &summary.positions {
            self.repo
                .update_valuation(
                    account_id,
                    position.instrument_id,
                    CachedValuation {
                        market_value: position.market_value,
                        daily_return: position.daily_return,
                        total_return: position.unrealized_return,
                    },
                )
                .await?;
        }
        tracing::info!(account_id, rows = summary.positions.len(), "Cached valuations refreshed.");
        Ok(summary.positions.len())
    }

    async fn account(&self, account_id: AccountId) -> Result<Account, AnalyticsError> {
        self.repo
            .account(account_id)
            .await?
            .ok_or_else(|| AnalyticsError::NotFound(format!("account {account_id}")))
    }

    async fn value(&self, row: &Position) -> Result<PortfolioPosition, AnalyticsError> {
        let instrument = self
            .repo
            .instrument(row.instrument_id)
            .await?
            .ok_or_else(|| AnalyticsError::NotFound(format!("instrument {}", row.instrument_id)))?;
        let quote = self.repo.latest_quote(row.instrument_id).await?;
        Ok(value_position(row, &instrument, quote.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use core_types::AssetClass;
    use database::{MemoryRepository, PositionStore};
    use rust_decimal_macros::dec;

    const CASH: InstrumentId = 66;

    fn instrument(id: InstrumentId, ticker: &str) -> Instrument {
        Instrument {
            id,
            ticker: ticker.to_string(),
            name: ticker.to_string(),
            asset_class: if id == CASH { AssetClass::Cash } else { AssetClass::Equity },
        }
    }

    fn quote(instrument_id: InstrumentId, close: Decimal, previous_close: Option<Decimal>) -> Quote {
        Quote {
            instrument_id,
            date: NaiveDate::from_ymd_opt(2023, 7, 13).unwrap(),
            open: None,
            high: None,
            low: None,
            close,
            previous_close,
        }
    }

    fn holding(instrument_id: InstrumentId, quantity: Decimal, average_price: Decimal) -> Position {
        let mut p = Position::empty(1, instrument_id);
        p.quantity = quantity;
        p.average_price = average_price;
        p
    }

    async fn seeded() -> (MemoryRepository, PortfolioValuator) {
        let repo = MemoryRepository::new();
        repo.add_account(Account {
            id: 1,
            email: "jose@test.com".to_string(),
            account_number: "10002".to_string(),
        })
        .await;
        for (id, ticker) in [(47, "PAMP"), (50, "YPFD"), (31, "BMA"), (CASH, "ARS")] {
            repo.add_instrument(instrument(id, ticker)).await;
        }
        repo.add_quote(quote(47, dec!(110), Some(dec!(100)))).await;
        repo.add_quote(quote(50, dec!(90), None)).await;

        let mut cash = Position::empty_cash(1, CASH);
        cash.quantity = dec!(2500);
        repo.seed_position(cash).await;
        repo.seed_position(holding(47, dec!(10), dec!(100))).await;
        repo.seed_position(holding(50, dec!(4), dec!(100))).await;
        repo.seed_position(holding(31, dec!(2), dec!(50))).await;

        let valuator = PortfolioValuator::new(Arc::new(repo.clone()), CASH);
        (repo, valuator)
    }

    #[test]
    fn gains_and_daily_moves() {
        let p = value_position(
            &holding(47, dec!(10), dec!(100)),
            &instrument(47, "PAMP"),
            Some(&quote(47, dec!(110), Some(dec!(100)))),
        );
        assert_eq!(p.market_value, dec!(1100));
        assert_eq!(p.invested_value, dec!(1000));
        assert_eq!(p.unrealized_return, dec!(100));
        assert_eq!(p.unrealized_return_pct, dec!(10));
        assert_eq!(p.daily_return, dec!(100));
        assert_eq!(p.daily_return_pct, dec!(10));
    }

    #[test]
    fn zero_previous_close_gives_no_daily_return() {
        let p = value_position(
            &holding(47, dec!(10), dec!(100)),
            &instrument(47, "PAMP"),
            Some(&quote(47, dec!(110), Some(Decimal::ZERO))),
        );
        assert_eq!(p.daily_return, Decimal::ZERO);
        assert_eq!(p.daily_return_pct, Decimal::ZERO);
    }

    #[test]
    fn no_quote_falls_back_to_average_price() {
        let p = value_position(&holding(31, dec!(2), dec!(50)), &instrument(31, "BMA"), None);
        assert_eq!(p.current_price, dec!(50));
        assert_eq!(p.market_value, dec!(100));
        assert_eq!(p.unrealized_return, Decimal::ZERO);
        assert_eq!(p.unrealized_return_pct, Decimal::ZERO);
        assert_eq!(p.as_of, None);
    }

    #[tokio::test]
    async fn summary_totals_exclude_cash_from_holdings() {
        let (_, valuator) = seeded().await;
        let summary = valuator.valuate(1).await.unwrap();

        assert_eq!(summary.email, "jose@test.com");
        let tickers: Vec<_> = summary.positions.iter().map(|p| p.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["BMA", "PAMP", "YPFD"]);

        let t = &summary.totals;
        assert_eq!(t.total_invested, dec!(1500));
        assert_eq!(t.total_market_value, dec!(100) + dec!(1100) + dec!(360));
        assert_eq!(t.total_return, dec!(60));
        assert_eq!(t.total_return_pct, dec!(4));
        assert_eq!(t.available_cash, dec!(2500));
        assert_eq!(t.total_portfolio_value, dec!(4060));
    }

    #[tokio::test]
    async fn overview_counts_positions() {
        let (_, valuator) = seeded().await;
        let overview = valuator.summarize(1).await.unwrap();
        assert_eq!(overview.positions_count, 3);
        assert_eq!(overview.account_number, "10002");
        assert_eq!(overview.totals.available_cash, dec!(2500));
    }

    #[tokio::test]
    async fn closed_or_missing_positions_have_no_details() {
        let (repo, valuator) = seeded().await;
        repo.seed_position(holding(50, Decimal::ZERO, dec!(100))).await;

        assert!(valuator.position_details(1, 50).await.unwrap().is_none());
        assert!(valuator.position_details(1, 12).await.unwrap().is_none());
        let pamp = valuator.position_details(1, 47).await.unwrap().unwrap();
        assert_eq!(pamp.market_value, dec!(1100));

        let summary = valuator.valuate(1).await.unwrap();
        assert_eq!(summary.positions.len(), 2);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let (_, valuator) = seeded().await;
        assert!(matches!(valuator.valuate(9).await, Err(AnalyticsError::NotFound(_))));
    }

    #[tokio::test]
    async fn refresh_writes_the_cache_only() {
        let (repo, valuator) = seeded().await;
        assert_eq!(valuator.refresh_valuations(1).await.unwrap(), 3);

        let pamp = repo.position(1, 47).await.unwrap().unwrap();
        assert_eq!(pamp.market_value, dec!(1100));
        assert_eq!(pamp.daily_return, dec!(100));
        assert_eq!(pamp.total_return, dec!(100));
        assert_eq!(pamp.quantity, dec!(10));
        assert_eq!(pamp.version, 1);

        let cash = repo.position(1, CASH).await.unwrap().unwrap();
        assert_eq!(cash.market_value, Decimal::ZERO);
    }
}
