//! # Collections Sync Library
//!
//! QuickBooks Online connection management, incremental invoice sync into a local
//! store, and A/R aging views, served over an axum API.

pub mod aging;
pub mod auth;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod keyed_lock;
pub mod models;
pub mod oauth;
pub mod repositories;
pub mod server;
pub mod sync_executor;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
