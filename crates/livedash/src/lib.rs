//! Live dashboard client.
//!
//! Orchestrates the livedash components around one active dashboard:
//! - Subscription multiplexer feeding widget data
//! - Ring buffer store with the memory governor
//! - Dashboard sync (local files or a shared replicated store)
//! - TOML configuration and the `livedash` CLI

pub mod client;
pub mod config;
pub mod error;

pub use client::{ClientDeps, DashboardClient};
pub use config::{AppConfig, ClientConfig};
pub use error::{AppError, AppResult};
