//! Shared vocabulary for the order execution core: identifiers, the closed
//! enums for side, type and status, and the records that move between the
//! directory, the ledger and the valuator.

pub mod enums;
pub mod error;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{AssetClass, OrderSide, OrderStatus, OrderType};
pub use error::CoreError;
pub use structs::{
    Account, AccountId, Instrument, InstrumentId, Order, OrderId, OrderRequest, Position, Quote,
};
