//! Dashboard persistence for livedash.
//!
//! Provides:
//! - `SyncEngine`: the active dashboard with local (synchronous) and shared
//!   (compare-and-swap) persistence, conflict watch, reload and overwrite
//! - `LocalRepository` over a pluggable `LocalStorage` (`FileStorage`, `MemoryStorage`)
//! - Shared key construction from folders and slugs
//! - Bulk import/export of local dashboards

pub mod config;
pub mod engine;
pub mod error;
pub mod import;
pub mod local;
pub mod slug;
pub mod storage;

pub use config::SyncConfig;
pub use engine::{DashboardRef, SharedEntry, SyncEngine, SyncEvent, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use import::{export_bundle, parse_entries, ExportBundle, ImportMode, ImportReport};
pub use local::{DashboardSummary, LocalRepository};
pub use slug::{generate_slug, normalize_folder, shared_key, slugify, split_key};
pub use storage::{FileStorage, LocalStorage, MemoryStorage};
