//! Escrow bank and metering proxy for pay-per-byte storage retrieval.
//!
//! Clients deposit FIL with a bank, authorize a storage provider's proxy to
//! draw against an escrowed amount, and the proxy redeems what the retrieval
//! actually cost once the bytes have gone out.

pub mod address;
pub mod api;
pub mod auth;
pub mod bank;
pub mod chain;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod fil;
pub mod jsend;
pub mod ledger;
pub mod models;
pub mod proxy;
pub mod rpc;
pub mod signature;
