//! paygate - multi-network subscription billing gateway
//!
//! One provider contract, three network adapters (stripe, payme, click),
//! and a transaction ledger that makes at-least-once webhook delivery
//! idempotent.

pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod providers;
pub mod util;
