//! kobo-sync-rs: A lightweight Kobo-compatible library sync server.
//!
//! This crate implements the incremental library sync protocol spoken by
//! Kobo e-readers: devices carry an opaque cursor between exchanges and the
//! server delivers only the catalog and reading-state changes made since,
//! in bounded pages.
//!
//! # Features
//!
//! - Incremental sync with per-channel watermarks and stable pagination
//! - Per-user delivery ledger (new vs changed classification, resync on wipe)
//! - Shelves-only sync mode with shelf membership triggers
//! - Archive propagation (removals reach the device)
//! - Reading progress synchronization
//! - Token-based device authentication

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Device authentication.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// HTTP server.
pub mod server;
/// Incremental sync engine.
pub mod sync;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
pub use sync::{SyncContext, SyncToken};
