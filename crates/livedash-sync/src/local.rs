//! Local dashboard repository.
//!
//! Layout inside a [`LocalStorage`]:
//! - `index`: ordered JSON array of dashboard ids
//! - `dashboard.<id>`: one serialized document per dashboard

use crate::error::{SyncError, SyncResult};
use crate::storage::LocalStorage;
use livedash_core::{DashboardDocument, DashboardId, StorageKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const INDEX_KEY: &str = "index";

fn doc_key(id: &DashboardId) -> String {
    format!("dashboard.{id}")
}

/// Listing entry for a local dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub id: DashboardId,
    pub name: String,
    pub widget_count: usize,
    pub locked: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&DashboardDocument> for DashboardSummary {
    fn from(doc: &DashboardDocument) -> Self {
        Self {
            id: doc.id.clone(),
            name: doc.name.clone(),
            widget_count: doc.widgets.len(),
            locked: doc.locked,
            updated_at: doc.updated_at,
        }
    }
}

pub struct LocalRepository {
    storage: Arc<dyn LocalStorage>,
}

impl LocalRepository {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    /// Ordered ids. A missing index is empty; an unreadable one is logged and
    /// treated as empty.
    pub fn index(&self) -> SyncResult<Vec<DashboardId>> {
        let Some(text) = self.storage.read(INDEX_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&text) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                warn!(error = %e, "Local dashboard index is corrupt, starting empty");
                Ok(Vec::new())
            }
        }
    }

    fn write_index(&self, ids: &[DashboardId]) -> SyncResult<()> {
        self.storage.write(INDEX_KEY, &serde_json::to_string(ids)?)
    }

    pub fn count(&self) -> SyncResult<usize> {
        Ok(self.index()?.len())
    }

    pub fn contains(&self, id: &DashboardId) -> SyncResult<bool> {
        Ok(self.index()?.contains(id))
    }

    /// Write the full document and make sure it is listed in the index.
    pub fn save(&self, doc: &DashboardDocument) -> SyncResult<()> {
        let mut body = doc.clone();
        body.storage = StorageKind::Local;
        self.storage.write(&doc_key(&doc.id), &body.to_json()?)?;

        let mut ids = self.index()?;
        if !ids.contains(&doc.id) {
            ids.push(doc.id.clone());
            self.write_index(&ids)?;
        }
        debug!(dashboard_id = %doc.id, widgets = doc.widgets.len(), "Saved local dashboard");
        Ok(())
    }

    pub fn load(&self, id: &DashboardId) -> SyncResult<DashboardDocument> {
        let text = self
            .storage
            .read(&doc_key(id))?
            .ok_or_else(|| SyncError::NotFound(format!("local dashboard '{id}'")))?;
        let mut doc = DashboardDocument::from_json(&text)?;
        doc.storage = StorageKind::Local;
        doc.shared_key = None;
        doc.revision = None;
        Ok(doc)
    }

    /// Remove a dashboard. Returns `false` if it was not listed.
    pub fn remove(&self, id: &DashboardId) -> SyncResult<bool> {
        let mut ids = self.index()?;
        let before = ids.len();
        ids.retain(|existing| existing != id);
        self.storage.remove(&doc_key(id))?;
        if ids.len() == before {
            return Ok(false);
        }
        self.write_index(&ids)?;
        Ok(true)
    }

    /// Remove every dashboard.
    pub fn clear(&self) -> SyncResult<usize> {
        let ids = self.index()?;
        for id in &ids {
            self.storage.remove(&doc_key(id))?;
        }
        self.write_index(&[])?;
        Ok(ids.len())
    }

    /// All readable documents in index order. Unreadable entries are skipped.
    pub fn load_all(&self) -> SyncResult<Vec<DashboardDocument>> {
        let mut docs = Vec::new();
        for id in self.index()? {
            match self.load(&id) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(dashboard_id = %id, error = %e, "Skipping unreadable dashboard"),
            }
        }
        Ok(docs)
    }

    pub fn list(&self) -> SyncResult<Vec<DashboardSummary>> {
        Ok(self
            .load_all()?
            .iter()
            .map(DashboardSummary::from)
            .collect())
    }
}
