//! Bulk import and export of local dashboards.

use crate::error::SyncResult;
use livedash_core::DashboardDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How imported documents combine with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Keep existing documents; imported ones get fresh ids.
    #[default]
    Merge,
    /// Clear the local set first.
    Replace,
}

/// Per-document outcome counts of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    /// Valid documents rejected by the document limit.
    pub skipped: usize,
    /// Malformed entries.
    pub errors: usize,
    /// One message per malformed entry.
    pub failures: Vec<String>,
}

impl ImportReport {
    pub(crate) fn record_error(&mut self, index: usize, reason: impl std::fmt::Display) {
        self.errors += 1;
        self.failures.push(format!("entry {index}: {reason}"));
    }
}

/// Export bundle shape; also accepted on import.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportBundle {
    pub dashboards: Vec<Value>,
}

/// Split an import payload into raw entries.
///
/// Accepts a JSON array of documents or `{"dashboards": [...]}`. Only a
/// payload that is neither fails as a whole.
pub fn parse_entries(json: &str) -> SyncResult<Vec<Value>> {
    let value: Value = serde_json::from_str(json)?;
    match value {
        Value::Array(entries) => Ok(entries),
        other => Ok(serde_json::from_value::<ExportBundle>(other)?.dashboards),
    }
}

/// Decode one entry.
pub fn parse_document(entry: Value) -> SyncResult<DashboardDocument> {
    Ok(serde_json::from_value(entry)?)
}

/// Serialize documents as an export bundle.
pub fn export_bundle(docs: &[DashboardDocument]) -> SyncResult<String> {
    let dashboards = docs
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serde_json::to_string_pretty(&ExportBundle { dashboards })?)
}
