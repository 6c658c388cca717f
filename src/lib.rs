//! Tempo Sync
//!
//! Versioned, batched synchronization of focus-timer and music data between
//! a local replica and a remote authoritative store.
//!
//! # Modules
//!
//! - `codec`: CBOR envelopes, reversible key transforms and format detection
//! - `transport`: request shaping, content negotiation and the HTTP adapter
//! - `sync`: version ledger, conflict resolution, batch orchestration,
//!   the client and the server-side store
//! - `routes`: axum endpoints of the remote store

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
pub mod transport;
