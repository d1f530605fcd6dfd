use crate::error::ExecutorError;
use crate::ledger::{AccountLocks, Fill, PositionLedger};
use crate::validator::{OrderValidator, Shortfall};
use chrono::Utc;
use configuration::LedgerSettings;
use core_types::{
    AccountId, InstrumentId, Order, OrderId, OrderRequest, OrderSide, OrderStatus, OrderType,
    Position, Quote,
};
use database::{CommitMode, LedgerCommit, Repository};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Size, price and starting status worked out from a request and a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOrder {
    pub size: i64,
    pub price: Decimal,
    pub status: OrderStatus,
}

/// The result of one pass over the pending limit orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub filled: usize,
    pub skipped: usize,
}

// Column bounds of the orders and positions tables.
const MAX_PRICE_SCALE: u32 = 4;
const MAX_PRICE: i64 = 100_000_000_000_000;
const MAX_NOTIONAL: i64 = 10_000_000_000_000_000;

enum Settlement {
    Filled(Order),
    Declined(Shortfall),
}

/// Works out size, price and initial status for `request`.
///
/// `quote` is the instrument's latest quote and is required for BUY and SELL.
pub fn resolve_order(
    request: &OrderRequest,
    quote: Option<&Quote>,
    cash_instrument_id: InstrumentId,
) -> Result<ResolvedOrder, ExecutorError> {
    if request.side.is_cash_transfer() {
        if request.instrument_id != cash_instrument_id {
            return Err(ExecutorError::InvalidRequest(format!(
                "{} must target the cash instrument {}",
                request.side, cash_instrument_id
            )));
        }
        let size = match (request.size, request.amount) {
            (Some(size), _) => size,
            (None, Some(amount)) => whole_units(amount)?,
            (None, None) => {
                return Err(ExecutorError::InvalidRequest(
                    "either size or amount is required".to_string(),
                ))
            }
        };
        let size = positive(size)?;
        if size >= MAX_NOTIONAL {
            return Err(ExecutorError::InvalidRequest(format!(
                "{} of {size} exceeds the ledger limit",
                request.side
            )));
        }
        return Ok(ResolvedOrder {
            size,
            price: Decimal::ONE,
            status: OrderStatus::Filled,
        });
    }

    if request.instrument_id == cash_instrument_id {
        return Err(ExecutorError::InvalidRequest(
            "the cash instrument cannot be bought or sold, use CASH_IN or CASH_OUT".to_string(),
        ));
    }

    let quote = quote.ok_or_else(|| {
        ExecutorError::InvalidRequest(format!(
            "no quote available for instrument {}",
            request.instrument_id
        ))
    })?;

    let (price, status) = match request.order_type {
        OrderType::Market => (quote.close, OrderStatus::Filled),
        OrderType::Limit => match request.price {
            Some(price) if price > Decimal::ZERO => (limit_price(price)?, OrderStatus::New),
            Some(price) => {
                return Err(ExecutorError::InvalidRequest(format!(
                    "limit price must be positive, got {price}"
                )))
            }
            None => {
                return Err(ExecutorError::InvalidRequest(
                    "limit orders require a price".to_string(),
                ))
            }
        },
    };

    let size = match (request.size, request.amount) {
        (Some(size), _) => size,
        (None, Some(amount)) => {
            let units = amount.checked_div(price).ok_or_else(|| {
                ExecutorError::InvalidRequest(format!(
                    "cannot size an order at price {price}"
                ))
            })?;
            whole_units(units)?
        }
        (None, None) => {
            return Err(ExecutorError::InvalidRequest(
                "either size or amount is required".to_string(),
            ))
        }
    };

    let size = positive(size)?;
    let fits = Decimal::from(size)
        .checked_mul(price)
        .is_some_and(|notional| notional < Decimal::from(MAX_NOTIONAL));
    if !fits {
        return Err(ExecutorError::InvalidRequest(format!(
            "{} of {size} at {price} exceeds the ledger limit",
            request.side
        )));
    }

    Ok(ResolvedOrder {
        size,
        price,
        status,
    })
}

/// Trailing zeros do not count towards the scale.
fn limit_price(price: Decimal) -> Result<Decimal, ExecutorError> {
    if price.normalize().scale() > MAX_PRICE_SCALE {
        return Err(ExecutorError::InvalidRequest(format!(
            "limit price {price} has more than {MAX_PRICE_SCALE} decimal places"
        )));
    }
    if price >= Decimal::from(MAX_PRICE) {
        return Err(ExecutorError::InvalidRequest(format!(
            "limit price {price} is out of range"
        )));
    }
    Ok(price)
}

fn whole_units(value: Decimal) -> Result<i64, ExecutorError> {
    value.floor().to_i64().ok_or_else(|| {
        ExecutorError::InvalidRequest(format!("{value} does not fit an order size"))
    })
}

fn positive(size: i64) -> Result<i64, ExecutorError> {
    if size > 0 {
        Ok(size)
    } else {
        Err(ExecutorError::InvalidRequest(format!(
            "order size must be a positive whole number, got {size}"
        )))
    }
}

/// Whether the latest close has reached a limit order's price.
pub fn is_crossed(order: &Order, quote: &Quote) -> bool {
    match order.side {
        OrderSide::Buy => quote.close <= order.price,
        OrderSide::Sell => quote.close >= order.price,
        OrderSide::CashIn | OrderSide::CashOut => false,
    }
}

/// Accepts orders, decides their outcome and commits fills to the ledger.
pub struct ExecutionEngine {
    repo: Arc<dyn Repository>,
    ledger: PositionLedger,
    validator: OrderValidator,
    locks: AccountLocks,
    settings: LedgerSettings,
}

impl ExecutionEngine {
    pub fn new(repo: Arc<dyn Repository>, settings: LedgerSettings) -> Self {
        let ledger = PositionLedger::new(repo.clone(), settings.cash_instrument_id);
        Self {
            repo,
            ledger,
            validator: OrderValidator,
            locks: AccountLocks::new(),
            settings,
        }
    }

    /// Places an order and returns it as persisted.
    ///
    /// Limit orders are stored as NEW. Market orders and cash moves are
    /// filled before returning; a market order the account cannot cover is
    /// stored as REJECTED.
    pub async fn create_order(&self, request: OrderRequest) -> Result<Order, ExecutorError> {
        self.require_account(request.account_id).await?;
        if self.repo.instrument(request.instrument_id).await?.is_none() {
            return Err(ExecutorError::NotFound(format!(
                "instrument {}",
                request.instrument_id
            )));
        }

        let quote = if request.side.is_trade() {
            self.repo.latest_quote(request.instrument_id).await?
        } else {
            None
        };
        let resolved = resolve_order(&request, quote.as_ref(), self.settings.cash_instrument_id)?;

        let order = Order {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            instrument_id: request.instrument_id,
            side: request.side,
            order_type: request.order_type,
            size: resolved.size,
            price: resolved.price,
            status: resolved.status,
            created_at: Utc::now(),
        };

        if order.status == OrderStatus::New {
            self.repo.commit(&LedgerCommit::order_only(order.clone())).await?;
            tracing::info!(order_id = %order.id, account_id = order.account_id, size = order.size, price = %order.price, "Limit order accepted.");
            return Ok(order);
        }

        let _guard = self.locks.acquire(order.account_id).await;
        match self.settle(&order, CommitMode::Insert).await? {
            Settlement::Filled(filled) => {
                tracing::info!(
                    order_id = %filled.id,
                    account_id = filled.account_id,
                    side = %filled.side,
                    size = filled.size,
                    price = %filled.price,
                    "Order filled."
                );
                Ok(filled)
            }
            Settlement::Declined(shortfall) => {
                let rejected = Order {
                    status: OrderStatus::Rejected,
                    ..order
                };
                self.repo.commit(&LedgerCommit::order_only(rejected.clone())).await?;
                tracing::info!(order_id = %rejected.id, account_id = rejected.account_id, reason = %shortfall, "Order rejected.");
                Ok(rejected)
            }
        }
    }

    /// Cancels a NEW order belonging to `account_id`.
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        account_id: AccountId,
    ) -> Result<Order, ExecutorError> {
        let order = self
            .repo
            .order(order_id)
            .await?
            .filter(|o| o.account_id == account_id)
            .ok_or_else(|| {
                ExecutorError::NotFound(format!("order {order_id} for account {account_id}"))
            })?;

        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(ExecutorError::InvalidRequest(format!(
                "order {} is {} and cannot be cancelled",
                order.id, order.status
            )));
        }

        match self
            .repo
            .transition_order(order_id, OrderStatus::New, OrderStatus::Cancelled)
            .await?
        {
            Some(cancelled) => {
                tracing::info!(order_id = %cancelled.id, account_id, "Order cancelled.");
                Ok(cancelled)
            }
            None => Err(ExecutorError::InvalidRequest(format!(
                "order {order_id} is no longer pending"
            ))),
        }
    }

    /// An account's orders, most recent first. Filtering on NEW gives the
    /// pending queue instead, oldest first.
    pub async fn list_orders(
        &self,
        account_id: AccountId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, ExecutorError> {
        self.require_account(account_id).await?;
        let mut orders = self.repo.orders_for_account(account_id, status).await?;
        if status == Some(OrderStatus::New) {
            orders.reverse();
        }
        Ok(orders)
    }

    /// Raw ledger rows for an account, ordered by instrument id.
    pub async fn list_positions(&self, account_id: AccountId) -> Result<Vec<Position>, ExecutorError> {
        self.require_account(account_id).await?;
        Ok(self.repo.positions_for_account(account_id).await?)
    }

    /// Fills every pending limit order whose price has been reached.
    ///
    /// Orders are visited oldest first and fill at their limit price. An
    /// order without a quote, not yet crossed, or not affordable stays NEW.
    pub async fn execute_limit_orders(&self) -> Result<SweepReport, ExecutorError> {
        let pending = self.repo.pending_orders().await?;
        let mut report = SweepReport::default();

        for order in pending {
            report.examined += 1;

            let Some(quote) = self.repo.latest_quote(order.instrument_id).await? else {
                tracing::debug!(order_id = %order.id, "No quote for pending order.");
                report.skipped += 1;
                continue;
            };
            if !is_crossed(&order, &quote) {
                report.skipped += 1;
                continue;
            }

            let _guard = self.locks.acquire(order.account_id).await;
            // A cancel may have landed while we waited for the lock.
            let still_pending = self
                .repo
                .order(order.id)
                .await?
                .is_some_and(|o| o.status == OrderStatus::New);
            if !still_pending {
                report.skipped += 1;
                continue;
            }

            match self.settle(&order, CommitMode::Promote { from: OrderStatus::New }).await {
                Ok(Settlement::Filled(filled)) => {
                    tracing::info!(order_id = %filled.id, account_id = filled.account_id, close = %quote.close, "Limit order filled.");
                    report.filled += 1;
                }
                Ok(Settlement::Declined(shortfall)) => {
                    tracing::debug!(order_id = %order.id, reason = %shortfall, "Limit order left pending.");
                    report.skipped += 1;
                }
                Err(ExecutorError::Conflict { attempts }) => {
                    tracing::warn!(order_id = %order.id, attempts, "Limit order left pending after repeated conflicts.");
                    report.skipped += 1;
                }
                Err(ExecutorError::InvalidRequest(reason)) => {
                    tracing::warn!(order_id = %order.id, %reason, "Limit order cannot be applied to the ledger.");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            examined = report.examined,
            filled = report.filled,
            skipped = report.skipped,
            "Limit order sweep complete."
        );
        Ok(report)
    }

    async fn require_account(&self, account_id: AccountId) -> Result<(), ExecutorError> {
        if self.repo.account_exists(account_id).await? {
            Ok(())
        } else {
            Err(ExecutorError::NotFound(format!("account {account_id}")))
        }
    }

    /// Validates and commits the fill of `order`. The caller holds the
    /// account lock. Conflicting commits are retried against fresh rows.
    async fn settle(&self, order: &Order, mode: CommitMode) -> Result<Settlement, ExecutorError> {
        let fill = Fill::from(order);
        let filled = Order {
            status: OrderStatus::Filled,
            ..order.clone()
        };
        let max_attempts = self.settings.max_commit_retries.saturating_add(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let rows = self.ledger.load_rows(&fill).await?;
            if let Err(shortfall) = self.validator.check(&rows, &fill) {
                return Ok(Settlement::Declined(shortfall));
            }

            let commit = LedgerCommit {
                order: filled.clone(),
                mode,
                positions: self.ledger.apply_fill(rows, &fill)?,
            };
            match self.ledger.commit(&commit).await {
                Ok(()) => return Ok(Settlement::Filled(filled)),
                Err(e) if e.is_conflict() && attempts < max_attempts => {
                    tracing::warn!(order_id = %order.id, attempt = attempts, error = %e, "Ledger commit conflicted, retrying.");
                }
                Err(e) if e.is_conflict() => return Err(ExecutorError::Conflict { attempts }),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn quote(close: Decimal) -> Quote {
        Quote {
            instrument_id: 47,
            date: NaiveDate::from_ymd_opt(2023, 7, 13).unwrap(),
            open: None,
            high: None,
            low: None,
            close,
            previous_close: None,
        }
    }

    fn request(side: OrderSide, order_type: OrderType) -> OrderRequest {
        OrderRequest {
            account_id: 1,
            instrument_id: 47,
            side,
            order_type,
            size: None,
            amount: None,
            price: None,
        }
    }

    #[test]
    fn amount_is_floored_at_the_close() {
        let mut req = request(OrderSide::Buy, OrderType::Market);
        req.amount = Some(dec!(10000));
        let resolved = resolve_order(&req, Some(&quote(dec!(1063.25))), 66).unwrap();
        assert_eq!(resolved.size, 9);
        assert_eq!(resolved.price, dec!(1063.25));
        assert_eq!(resolved.status, OrderStatus::Filled);
    }

    #[test]
    fn amount_below_one_share_is_invalid() {
        let mut req = request(OrderSide::Buy, OrderType::Market);
        req.amount = Some(dec!(100));
        let err = resolve_order(&req, Some(&quote(dec!(1063.25))), 66).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
    }

    #[test]
    fn market_ignores_the_supplied_price() {
        let mut req = request(OrderSide::Sell, OrderType::Market);
        req.size = Some(3);
        req.price = Some(dec!(1));
        let resolved = resolve_order(&req, Some(&quote(dec!(941.5))), 66).unwrap();
        assert_eq!(resolved.price, dec!(941.5));
    }

    #[test]
    fn size_wins_over_amount() {
        let mut req = request(OrderSide::Buy, OrderType::Market);
        req.size = Some(2);
        req.amount = Some(dec!(1_000_000));
        assert_eq!(resolve_order(&req, Some(&quote(dec!(10))), 66).unwrap().size, 2);
    }

    #[test]
    fn limit_sizes_from_its_own_price_and_starts_new() {
        let mut req = request(OrderSide::Buy, OrderType::Limit);
        req.amount = Some(dec!(1000));
        req.price = Some(dec!(300));
        let resolved = resolve_order(&req, Some(&quote(dec!(10))), 66).unwrap();
        assert_eq!(resolved.size, 3);
        assert_eq!(resolved.price, dec!(300));
        assert_eq!(resolved.status, OrderStatus::New);
    }

    #[test]
    fn limit_needs_a_positive_price() {
        let mut req = request(OrderSide::Buy, OrderType::Limit);
        req.size = Some(1);
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_err());
        req.price = Some(Decimal::ZERO);
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_err());
    }

    #[test]
    fn limit_price_must_fit_four_decimal_places() {
        let mut req = request(OrderSide::Buy, OrderType::Limit);
        req.size = Some(1);
        req.price = Some(dec!(100.12345));
        assert!(matches!(
            resolve_order(&req, Some(&quote(dec!(10))), 66),
            Err(ExecutorError::InvalidRequest(_))
        ));

        req.price = Some(dec!(100.1234));
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_ok());
        req.price = Some(dec!(100.12340));
        assert_eq!(
            resolve_order(&req, Some(&quote(dec!(10))), 66).unwrap().price,
            dec!(100.1234)
        );
    }

    #[test]
    fn limit_price_must_fit_the_price_column() {
        let mut req = request(OrderSide::Sell, OrderType::Limit);
        req.size = Some(1);
        req.price = Some(dec!(100000000000000));
        assert!(matches!(
            resolve_order(&req, Some(&quote(dec!(10))), 66),
            Err(ExecutorError::InvalidRequest(_))
        ));
        req.price = Some(dec!(99999999999999.9999));
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_ok());
    }

    #[test]
    fn oversized_notionals_are_invalid_for_both_order_types() {
        let mut limit = request(OrderSide::Buy, OrderType::Limit);
        limit.size = Some(i64::MAX);
        limit.price = Some(dec!(100000000000));
        assert!(matches!(
            resolve_order(&limit, Some(&quote(dec!(10))), 66),
            Err(ExecutorError::InvalidRequest(_))
        ));

        let mut market = request(OrderSide::Sell, OrderType::Market);
        market.size = Some(i64::MAX);
        assert!(matches!(
            resolve_order(&market, Some(&quote(dec!(10000000000))), 66),
            Err(ExecutorError::InvalidRequest(_))
        ));

        market.size = Some(1_000_000);
        assert!(resolve_order(&market, Some(&quote(dec!(10000000000))), 66).is_err());
        market.size = Some(999_999);
        assert!(resolve_order(&market, Some(&quote(dec!(10000000000))), 66).is_ok());
    }

    #[test]
    fn cash_moves_must_fit_the_ledger() {
        let mut req = request(OrderSide::CashIn, OrderType::Market);
        req.instrument_id = 66;
        req.size = Some(i64::MAX);
        assert!(matches!(
            resolve_order(&req, None, 66),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn trades_need_a_quote() {
        let mut req = request(OrderSide::Buy, OrderType::Market);
        req.size = Some(1);
        assert!(matches!(
            resolve_order(&req, None, 66),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn non_positive_sizes_are_invalid() {
        let mut req = request(OrderSide::Buy, OrderType::Market);
        req.size = Some(0);
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_err());
        req.size = Some(-5);
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_err());
        req.size = None;
        assert!(resolve_order(&req, Some(&quote(dec!(10))), 66).is_err());
    }

    #[test]
    fn cash_moves_run_at_unit_price_on_the_cash_instrument() {
        let mut req = request(OrderSide::CashIn, OrderType::Limit);
        req.instrument_id = 66;
        req.amount = Some(dec!(2500.75));
        let resolved = resolve_order(&req, None, 66).unwrap();
        assert_eq!(resolved.size, 2500);
        assert_eq!(resolved.price, Decimal::ONE);
        assert_eq!(resolved.status, OrderStatus::Filled);

        req.instrument_id = 47;
        assert!(resolve_order(&req, None, 66).is_err());
    }

    #[test]
    fn the_cash_instrument_is_not_tradable() {
        let mut req = request(OrderSide::Buy, OrderType::Market);
        req.instrument_id = 66;
        req.size = Some(1);
        assert!(resolve_order(&req, Some(&quote(dec!(1))), 66).is_err());
    }

    #[test]
    fn crossing_depends_on_side() {
        let order = |side, price| Order {
            id: Uuid::new_v4(),
            account_id: 1,
            instrument_id: 47,
            side,
            order_type: OrderType::Limit,
            size: 1,
            price,
            status: OrderStatus::New,
            created_at: Utc::now(),
        };
        let q = quote(dec!(100));
        assert!(is_crossed(&order(OrderSide::Buy, dec!(100)), &q));
        assert!(!is_crossed(&order(OrderSide::Buy, dec!(99)), &q));
        assert!(is_crossed(&order(OrderSide::Sell, dec!(95)), &q));
        assert!(!is_crossed(&order(OrderSide::Sell, dec!(101)), &q));
    }
}
