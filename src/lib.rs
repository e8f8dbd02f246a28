//! RezPay backend: coin ledger, reward ingestion, reconciliation and the
//! payment orchestration that sits on top of them.

pub mod api;
pub mod app;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod verification;
pub mod workers;
