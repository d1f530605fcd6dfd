//! # Executor Crate
//!
//! Order execution and position bookkeeping for brokerage accounts.
//!
//! ## Architectural Principles
//!
//! - **Decide, then apply:** `resolve_order` and the `OrderValidator` are pure
//!   functions over a request, a quote and the ledger rows. The
//!   `PositionLedger` turns an accepted fill into new rows, and the store
//!   writes those rows together with the order record in one commit.
//! - **One writer per account:** every fill for an account runs under that
//!   account's lock, from reading the rows to committing them. Store-level
//!   version checks catch writers in other processes; such conflicts are
//!   retried a bounded number of times.
//!
//! ## Public API
//!
//! - `ExecutionEngine`: places, cancels and lists orders, and sweeps pending limits.
//! - `OrderValidator`: the cash and share sufficiency checks.
//! - `PositionLedger`: quantity and average-cost bookkeeping.
//! - `ExecutorError`: the error taxonomy with its HTTP status mapping.

pub mod engine;
pub mod error;
pub mod ledger;
pub mod validator;

pub use engine::{is_crossed, resolve_order, ExecutionEngine, ResolvedOrder, SweepReport};
pub use error::ExecutorError;
pub use ledger::{AccountLocks, Fill, PositionLedger};
pub use validator::{FillRows, OrderValidator, Shortfall};
