//! Source file stores and input staging
//!
//! A [`FileStore`] lists and transfers exported spreadsheets. Staging
//! classifies every listed file and downloads the accepted ones into the work
//! directory, producing a validated [`StagedFiles`] hand-off.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::classify::{Classification, FilenameClassifier};
use crate::config::{PipelineConfig, SourceKind};
use crate::tables::TableRegistry;

#[cfg(feature = "drive")]
pub mod drive;
pub mod local;

#[cfg(feature = "drive")]
pub use drive::DriveStore;
pub use local::LocalFolderStore;

/// Error type for file store and staging operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io(e.to_string())
    }
}

/// A file as listed by a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

/// File store collaborator
#[async_trait(?Send)]
pub trait FileStore: Send + Sync {
    /// Short name for logs ("local", "drive")
    fn kind(&self) -> &'static str;

    /// Files directly inside `folder`
    async fn list_files(&self, folder: &str) -> Result<Vec<RemoteFile>, SourceError>;

    /// Copy the file identified by `id` to `local_path`
    async fn download(&self, id: &str, local_path: &Path) -> Result<(), SourceError>;

    /// Upload `local_path` as `name` into `parent_folder`, overwriting
    /// `existing_id` when given. Returns the id of the stored file.
    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        mime_type: &str,
        parent_folder: &str,
        existing_id: Option<&str>,
    ) -> Result<String, SourceError>;
}

/// Open the store selected by `[source] kind`
pub fn open_file_store(
    config: &PipelineConfig,
    config_dir: &Path,
) -> Result<Box<dyn FileStore>, SourceError> {
    match config.source.kind {
        SourceKind::Local => Ok(Box::new(LocalFolderStore::new(config_dir))),
        #[cfg(feature = "drive")]
        SourceKind::Drive => Ok(Box::new(DriveStore::from_config(&config.drive)?)),
        #[cfg(not(feature = "drive"))]
        SourceKind::Drive => Err(SourceError::InvalidStage(
            "Drive source requires the 'drive' feature".to_string(),
        )),
    }
}

/// Validated `{table -> staged file}` hand-off between staging and extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedFiles {
    files: BTreeMap<String, PathBuf>,
}

impl StagedFiles {
    /// Every table must be configured and every file must exist
    pub fn new(
        files: BTreeMap<String, PathBuf>,
        registry: &TableRegistry,
    ) -> Result<Self, SourceError> {
        for (table, path) in &files {
            if registry.get(table).is_none() {
                return Err(SourceError::InvalidStage(format!(
                    "{} is not a configured table",
                    table
                )));
            }
            if !path.is_file() {
                return Err(SourceError::InvalidStage(format!(
                    "{}: staged file {} does not exist",
                    table,
                    path.display()
                )));
            }
        }
        Ok(Self { files })
    }

    pub fn get(&self, table: &str) -> Option<&Path> {
        self.files.get(table).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.files.iter().map(|(t, p)| (t.as_str(), p.as_path()))
    }

    pub fn tables(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Keep only the named tables (an empty selection keeps everything)
    pub fn select(self, tables: &[String]) -> Self {
        if tables.is_empty() {
            return self;
        }
        Self {
            files: self
                .files
                .into_iter()
                .filter(|(t, _)| tables.contains(t))
                .collect(),
        }
    }
}

/// List, classify and download the accepted files into `work_dir`
///
/// Rejected files are logged and skipped. A failed download aborts staging.
pub async fn stage_inputs(
    store: &dyn FileStore,
    classifier: &FilenameClassifier,
    registry: &TableRegistry,
    folder: &str,
    work_dir: &Path,
) -> Result<StagedFiles, SourceError> {
    tokio::fs::create_dir_all(work_dir).await?;

    let listed = store.list_files(folder).await?;
    info!(
        "Found {} file(s) in {} folder {} (current year {})",
        listed.len(),
        store.kind(),
        folder,
        classifier.current_year()
    );

    let mut files = BTreeMap::new();
    for file in &listed {
        let table = match classifier.classify(&file.name) {
            Classification::Table { table, .. } => table,
            Classification::Reject(reason) => {
                info!("  Skipping {}: {}", file.name, reason);
                continue;
            }
        };

        let local_path = work_dir.join(&file.name);
        debug!("  Downloading {} -> {}", file.name, local_path.display());
        store.download(&file.id, &local_path).await?;
        info!("  {} -> {}", file.name, table);

        if let Some(previous) = files.insert(table.clone(), local_path) {
            warn!(
                "  {} matched more than once, replacing {}",
                table,
                previous.display()
            );
        }
    }

    if files.is_empty() {
        warn!("No matching files found; every table will be skipped");
    }
    StagedFiles::new(files, registry)
}

/// Remove spreadsheets with `extension` from `work_dir`
///
/// Returns the number of files removed. A missing directory counts as clean.
pub fn cleanup_work_dir(work_dir: &Path, extension: &str) -> Result<usize, SourceError> {
    if !work_dir.exists() {
        return Ok(0);
    }

    let suffix = extension.to_lowercase();
    let mut removed = 0;
    for entry in std::fs::read_dir(work_dir)? {
        let path = entry?.path();
        let matches = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_lowercase().ends_with(&suffix))
                .unwrap_or(false);
        if matches {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }

    if removed > 0 {
        debug!("Removed {} stale file(s) from {}", removed, work_dir.display());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staged_files_validation() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("buyers_2026.xlsx");
        std::fs::write(&file, b"x").unwrap();
        let registry = TableRegistry::crm_defaults();

        let ok = StagedFiles::new(
            BTreeMap::from([("crm_buyers".to_string(), file.clone())]),
            &registry,
        )
        .unwrap();
        assert_eq!(ok.get("crm_buyers"), Some(file.as_path()));

        let unknown = StagedFiles::new(
            BTreeMap::from([("crm_notes".to_string(), file.clone())]),
            &registry,
        );
        assert!(matches!(unknown, Err(SourceError::InvalidStage(_))));

        let missing = StagedFiles::new(
            BTreeMap::from([("crm_buyers".to_string(), temp.path().join("gone.xlsx"))]),
            &registry,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn test_select_subset() {
        let temp = TempDir::new().unwrap();
        let mut files = BTreeMap::new();
        for (table, name) in [("crm_buyers", "b.xlsx"), ("crm_leads", "l.xlsx")] {
            let path = temp.path().join(name);
            std::fs::write(&path, b"x").unwrap();
            files.insert(table.to_string(), path);
        }
        let staged = StagedFiles::new(files, &TableRegistry::crm_defaults()).unwrap();

        assert_eq!(staged.clone().select(&[]).len(), 2);
        assert_eq!(staged.select(&["crm_leads".to_string()]).tables(), vec!["crm_leads"]);
    }

    #[test]
    fn test_cleanup_only_removes_matching_extension() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.xlsx"), b"x").unwrap();
        std::fs::write(temp.path().join("B.XLSX"), b"x").unwrap();
        std::fs::write(temp.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(cleanup_work_dir(temp.path(), ".xlsx").unwrap(), 2);
        assert!(temp.path().join("keep.txt").exists());
        assert_eq!(cleanup_work_dir(&temp.path().join("missing"), ".xlsx").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stage_inputs_classifies_and_downloads() {
        let source = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        for name in [
            "buyers_2026.xlsx",
            "buyers_2025.xlsx",
            "all_properties.xlsx",
            "all_buyers.xlsx",
            "notes.txt",
        ] {
            std::fs::write(source.path().join(name), b"x").unwrap();
        }

        let registry = TableRegistry::crm_defaults();
        let classifier = FilenameClassifier::new(&registry, ".xlsx", "crm_", 2026);
        let store = LocalFolderStore::new(source.path());

        let staged = stage_inputs(&store, &classifier, &registry, ".", work.path())
            .await
            .unwrap();

        assert_eq!(staged.tables(), vec!["crm_buyers", "crm_properties"]);
        assert_eq!(
            staged.get("crm_buyers"),
            Some(work.path().join("buyers_2026.xlsx").as_path())
        );
        assert!(work.path().join("all_properties.xlsx").exists());
        assert!(!work.path().join("buyers_2025.xlsx").exists());
    }
}
