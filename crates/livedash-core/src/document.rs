//! Dashboard document model.
//!
//! A dashboard is an ordered list of widget configurations plus variable
//! definitions. Local documents are authoritative in memory; shared documents
//! are authoritative in the replicated store and additionally carry the key
//! and revision last read or written. Those replication-only fields are never
//! part of the serialized document body.

use crate::ids::{DashboardId, WidgetId};
use crate::source::DataSource;
use crate::template::VariableBindings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a dashboard document is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Private, per-device storage.
    #[default]
    Local,
    /// Shared, multi-writer replicated store.
    Shared,
}

/// Per-widget history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Requested capacity; clamped by the buffer store.
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    /// Entries older than this are evicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

fn default_max_count() -> usize {
    100
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_age_secs: None,
        }
    }
}

/// One widget in a dashboard.
///
/// `layout` and `options` belong to the presentation layer and are carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfig {
    pub id: WidgetId,
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DataSource>,
    /// Extraction path applied to every decoded payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<String>,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub layout: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl WidgetConfig {
    pub fn new(kind: impl Into<String>, source: Option<DataSource>) -> Self {
        Self {
            id: WidgetId::generate(),
            kind: kind.into(),
            title: String::new(),
            source,
            extraction: None,
            buffer: BufferSettings::default(),
            layout: Value::Null,
            options: Value::Null,
        }
    }

    pub fn with_extraction(mut self, path: impl Into<String>) -> Self {
        self.extraction = Some(path.into());
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.buffer.max_count = max_count;
        self
    }
}

/// A dashboard variable usable as `${name}` in subjects and KV keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// The dashboard document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardDocument {
    pub id: DashboardId,
    pub name: String,
    #[serde(default)]
    pub widgets: Vec<WidgetConfig>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Replicated-store key (shared only).
    #[serde(skip)]
    pub shared_key: Option<String>,
    /// Last revision read or written (shared only).
    #[serde(skip)]
    pub revision: Option<u64>,
}

impl DashboardDocument {
    pub fn new(name: impl Into<String>, storage: StorageKind) -> Self {
        let now = Utc::now();
        Self {
            id: DashboardId::generate(),
            name: name.into(),
            widgets: Vec::new(),
            variables: Vec::new(),
            locked: false,
            storage,
            created_at: now,
            updated_at: now,
            shared_key: None,
            revision: None,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.storage == StorageKind::Shared
    }

    /// Current variable values.
    pub fn bindings(&self) -> VariableBindings {
        self.variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    pub fn widget(&self, id: &WidgetId) -> Option<&WidgetConfig> {
        self.widgets.iter().find(|w| &w.id == id)
    }

    pub fn widget_mut(&mut self, id: &WidgetId) -> Option<&mut WidgetConfig> {
        self.widgets.iter_mut().find(|w| &w.id == id)
    }

    /// Remove a widget, returning it if it existed.
    pub fn remove_widget(&mut self, id: &WidgetId) -> Option<WidgetConfig> {
        let pos = self.widgets.iter().position(|w| &w.id == id)?;
        Some(self.widgets.remove(pos))
    }

    /// Set a variable's value, defining it if needed.
    ///
    /// Returns `true` if the stored value changed.
    pub fn set_variable(&mut self, name: &str, value: &str) -> bool {
        match self.variables.iter_mut().find(|v| v.name == name) {
            Some(var) if var.value == value => false,
            Some(var) => {
                var.value = value.to_string();
                true
            }
            None => {
                self.variables.push(VariableDefinition {
                    name: name.to_string(),
                    value: value.to_string(),
                    options: Vec::new(),
                });
                true
            }
        }
    }

    /// Bump the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Serialize the document body (replication-only fields excluded).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
