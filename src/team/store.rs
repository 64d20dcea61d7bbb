//! Whole-document JSON persistence of team ledgers and attachments.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<team_id>/ledger.json              entire ledger, rewritten on every append
//! <root>/<team_id>/attachments.json         repo -> node map, rewritten on every change
//! <root>/<team_id>/agent.capabilities.json  this node's descriptor, written at join
//! ```
//!
//! Each write goes to a temporary file in the team directory that is then
//! renamed over the target, so readers never observe a half-written document.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use super::models::LedgerEntry;
use crate::{AppError, Result};

/// Ledger document name.
pub const LEDGER_FILE: &str = "ledger.json";
/// Attachment document name.
pub const ATTACHMENTS_FILE: &str = "attachments.json";
/// Capability descriptor name.
pub const CAPABILITIES_FILE: &str = "agent.capabilities.json";

/// Descriptor this node writes into its team directory at join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CapabilityRecord {
    /// Local node id.
    pub node_id: String,
    /// Local node name.
    pub name: String,
    /// Local host name.
    pub host: String,
    /// Advertised capabilities.
    pub capabilities: Map<String, Value>,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
}

/// Per-team document store rooted at an explicit directory.
#[derive(Debug, Clone)]
pub struct TeamStore {
    root: PathBuf,
}

impl TeamStore {
    /// Open the store, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            AppError::Persistence(format!("failed to create team root {}: {err}", root.display()))
        })?;
        Ok(Self { root })
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `team_id`.
    #[must_use]
    pub fn team_dir(&self, team_id: &str) -> PathBuf {
        self.root.join(team_id)
    }

    /// Rewrite both the ledger and the attachment documents of `team_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if either document cannot be written.
    pub async fn persist(
        &self,
        team_id: &str,
        ledger: &[LedgerEntry],
        attachments: &BTreeMap<String, String>,
    ) -> Result<()> {
        let ledger_doc = to_document(ledger)?;
        let attachments_doc = to_document(attachments)?;
        let dir = self.team_dir(team_id);
        run_blocking(move || {
            write_document(&dir, LEDGER_FILE, &ledger_doc)?;
            write_document(&dir, ATTACHMENTS_FILE, &attachments_doc)
        })
        .await
    }

    /// Write this node's capability descriptor for `team_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the document cannot be written.
    pub async fn write_capabilities(&self, team_id: &str, record: &CapabilityRecord) -> Result<()> {
        let doc = to_document(record)?;
        let dir = self.team_dir(team_id);
        run_blocking(move || write_document(&dir, CAPABILITIES_FILE, &doc)).await
    }

    /// Read the persisted ledger of `team_id`; empty when never written.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the document exists but is unreadable.
    pub async fn load_ledger(&self, team_id: &str) -> Result<Vec<LedgerEntry>> {
        let path = self.team_dir(team_id).join(LEDGER_FILE);
        run_blocking(move || read_document(&path)).await
    }

    /// Read the persisted attachment map of `team_id`; empty when never written.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the document exists but is unreadable.
    pub async fn load_attachments(&self, team_id: &str) -> Result<BTreeMap<String, String>> {
        let path = self.team_dir(team_id).join(ATTACHMENTS_FILE);
        run_blocking(move || read_document(&path)).await
    }
}

fn to_document<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Persistence(format!("failed to serialise document: {err}")))
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| AppError::Persistence(format!("persistence task panicked: {err}")))?
}

fn write_document(dir: &Path, name: &str, contents: &str) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| {
        AppError::Persistence(format!("failed to create {}: {err}", dir.display()))
    })?;
    let target = dir.join(name);
    let mut staged = NamedTempFile::new_in(dir).map_err(|err| {
        AppError::Persistence(format!("failed to stage {}: {err}", target.display()))
    })?;
    staged
        .write_all(contents.as_bytes())
        .map_err(|err| AppError::Persistence(format!("failed to write {}: {err}", target.display())))?;
    staged
        .persist(&target)
        .map_err(|err| AppError::Persistence(format!("failed to replace {}: {err}", target.display())))?;
    Ok(())
}

fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::Persistence(format!("failed to read {}: {err}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|err| AppError::Persistence(format!("invalid document {}: {err}", path.display())))
}
