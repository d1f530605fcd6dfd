//! # Analytics Crate
//!
//! Portfolio valuation for brokerage accounts.
//!
//! ## Architectural Principles
//!
//! - **Read side only:** The valuator never changes quantities or average
//!   prices. The only write it performs is `refresh_valuations`, which
//!   overwrites the cached valuation columns of a position.
//! - **Stateless Calculation:** `value_position` is a pure function of a
//!   ledger row, its instrument and its latest quote.
//!
//! ## Public API
//!
//! - `PortfolioValuator`: account-level valuation against a repository.
//! - `PortfolioSummary` / `PortfolioOverview` / `PortfolioPosition`: the report shapes.
//! - `AnalyticsError`: the specific error types that can be returned from this crate.

pub mod error;
pub mod report;
pub mod valuator;

pub use error::AnalyticsError;
pub use report::{PortfolioOverview, PortfolioPosition, PortfolioSummary, PortfolioTotals};
pub use valuator::{value_position, PortfolioValuator};
