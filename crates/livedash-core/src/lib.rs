//! Core domain types for the livedash dashboard engine.
//!
//! This crate provides the types shared by every other livedash crate:
//! - `WidgetId`, `DashboardId`: identifiers
//! - `DataSource`, `SubscriptionKey`: widget data sources and their canonical form
//! - `DashboardDocument`, `WidgetConfig`: the persisted dashboard model
//! - `BufferedMessage`, `MessageSink`: the unit of data flowing into widget buffers
//! - Subject/KV-key validation, `${var}` template resolution, value extraction

pub mod document;
pub mod error;
pub mod extract;
pub mod ids;
pub mod message;
pub mod source;
pub mod subject;
pub mod template;

pub use document::{
    BufferSettings, DashboardDocument, StorageKind, VariableDefinition, WidgetConfig,
};
pub use error::{CoreError, Result};
pub use extract::{extract, PathExpr};
pub use ids::{DashboardId, WidgetId};
pub use message::{BufferItem, BufferedMessage, MessageSink};
pub use source::{parse_window, DataSource, DeliverPolicy, Delivery, DeliveryMode, SubscriptionKey};
pub use subject::{subject_matches, validate_kv_key, validate_kv_pattern, validate_subject};
pub use template::{resolve_template, VariableBindings};
