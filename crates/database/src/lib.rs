//! # Database Crate
//!
//! This crate is the storage boundary of the order execution core. It
//! defines the repository traits the engine and the valuator are written
//! against, and provides two implementations of them.
//!
//! ## Architectural Principles
//!
//! - **Injected, not ambient:** Components receive an `Arc<dyn Repository>`;
//!   there is no global connection or session object.
//! - **One commit per fill:** An order record and the ledger rows it moves
//!   are written by a single `PositionStore::commit`, guarded by per-row
//!   version checks.
//! - **Asynchronous & Pooled:** The Postgres implementation uses a `PgPool`
//!   shared across tasks.
//!
//! ## Public API
//!
//! - `connect` / `run_migrations`: pool setup and schema migrations.
//! - `DbRepository`: the PostgreSQL implementation.
//! - `MemoryRepository`: an in-process implementation with identical commit semantics.
//! - `DbError`: the specific error types that can be returned from this crate.

pub mod connection;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, run_migrations};
pub use error::DbError;
pub use memory::MemoryRepository;
pub use postgres::DbRepository;
pub use repository::{
    AccountDirectory, CachedValuation, CommitMode, InstrumentDirectory, LedgerCommit, OrderStore,
    PositionStore, QuoteSource, Repository,
};
