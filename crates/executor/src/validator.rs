use core_types::{OrderSide, Position};
use rust_decimal::Decimal;
use std::fmt;

use crate::ledger::Fill;

/// The ledger rows a fill reads and writes, loaded inside the account's
/// critical section.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRows {
    /// The traded instrument's row. `None` for cash moves.
    pub holding: Option<Position>,
    pub cash: Position,
}

/// Why a fill cannot go through against the current ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Shortfall {
    InsufficientCash { required: Decimal, available: Decimal },
    InsufficientShares { requested: Decimal, available: Decimal },
    /// `size * price` does not fit a `Decimal`; no balance can cover it.
    NotionalOverflow,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::InsufficientCash { required, available } => write!(
                f,
                "insufficient cash: required {required}, available {available}"
            ),
            Shortfall::InsufficientShares { requested, available } => write!(
                f,
                "insufficient shares: requested {requested}, available {available}"
            ),
            Shortfall::NotionalOverflow => f.write_str("order notional is out of range"),
        }
    }
}

/// Decides whether an account can afford a fill.
///
/// Only quantities are consulted; cached valuation columns are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderValidator;

impl OrderValidator {
    pub fn check(&self, rows: &FillRows, fill: &Fill) -> Result<(), Shortfall> {
        match fill.side {
            OrderSide::Buy => {
                let required = fill.notional().ok_or(Shortfall::NotionalOverflow)?;
                let available = rows.cash.quantity;
                if available >= required {
                    Ok(())
                } else {
                    Err(Shortfall::InsufficientCash { required, available })
                }
            }
            OrderSide::Sell => {
                let requested = Decimal::from(fill.size);
                let available = rows
                    .holding
                    .as_ref()
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO);
                if available >= requested {
                    Ok(())
                } else {
                    Err(Shortfall::InsufficientShares { requested, available })
                }
            }
            OrderSide::CashIn | OrderSide::CashOut => Ok(()),
        }
    }

    pub fn can_fill(&self, rows: &FillRows, fill: &Fill) -> bool {
        self.check(rows, fill).is_ok()
    }
}
