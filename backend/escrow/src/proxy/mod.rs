//! The metering proxy.
//!
//! Sits in front of a storage provider's retrieval endpoint, checks each
//! request's authorization with a trusted bank, meters the bytes it streams
//! back and redeems the authorization for what was delivered.

pub mod api;
pub mod client;
pub mod metering;

pub use api::{router, ProxyState};
pub use client::{EscrowBank, LocalBank, RemoteBank};
pub use metering::{retrieval_cost, MeteredBody};
