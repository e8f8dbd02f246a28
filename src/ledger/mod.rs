//! Coin ledger: the authoritative record of every balance-affecting event.
//!
//! The materialized [`Balance`] is a cache over the append-only transaction
//! log and can always be recomputed with [`Balance::replay`].

pub mod balance;
pub mod error;
pub mod memory;
pub mod projection;
pub mod store;
pub mod types;

pub use error::{LedgerError, LedgerResult};
pub use memory::InMemoryLedgerStore;
pub use projection::{InMemoryProjectionStore, PointsProjection, ProjectionStore};
pub use store::LedgerStore;
pub use types::{
    ApplyOutcome, Balance, Direction, LedgerSnapshot, LedgerTransaction, MinorUnits, NewTransaction,
    TransactionSource, TransactionStatus,
};
