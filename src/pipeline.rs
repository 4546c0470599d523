//! End-to-end pipeline orchestration
//!
//! Stage: list, classify and download source files.
//! Extract and load: filter each staged file against its watermark and
//! replace `raw.<table>`.
//! Transform: reconcile raw into bronze, then refresh gold views.
//!
//! Everything runs sequentially against one warehouse handle.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::classify::FilenameClassifier;
use crate::config::{ConfigError, PipelineConfig, SourceKind};
use crate::database::{DatabaseError, Warehouse};
use crate::extract::IncrementalExtractor;
use crate::gold::{GoldRefreshResult, refresh_gold_views};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::runlog::RunLog;
use crate::source::{FileStore, SourceError, StagedFiles, cleanup_work_dir, stage_inputs};
use crate::tables::{TableConfig, TableRegistry};

/// Fatal pipeline errors; per-table problems are reported, not raised
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Options for a pipeline invocation
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these tables (empty means all)
    pub tables: Vec<String>,
    /// Stage and extract only; write nothing to the warehouse
    pub dry_run: bool,
}

impl RunOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tables(tables: Vec<String>) -> Self {
        Self {
            tables,
            dry_run: false,
        }
    }
}

/// Extraction and load result for one staged file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLoad {
    pub file: PathBuf,
    pub watermark: NaiveDateTime,
    pub total_rows: usize,
    pub kept_rows: usize,
    /// Rows written to raw; zero on a dry run
    pub written_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Extraction and load results of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub load_id: String,
    pub dry_run: bool,
    pub tables: BTreeMap<String, TableLoad>,
}

impl LoadReport {
    pub fn error_count(&self) -> usize {
        self.tables.values().filter(|t| t.error.is_some()).count()
    }

    pub fn rows_written(&self) -> u64 {
        self.tables.values().map(|t| t.written_rows).sum()
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gold: Vec<GoldRefreshResult>,
}

impl PipelineReport {
    /// Failed loads plus failed reconciliations; gold failures are separate
    pub fn error_count(&self) -> usize {
        self.load.as_ref().map_or(0, LoadReport::error_count)
            + self.reconcile.as_ref().map_or(0, ReconcileReport::error_count)
    }

    pub fn gold_failures(&self) -> usize {
        self.gold.iter().filter(|g| !g.is_ok()).count()
    }
}

/// Pipeline bound to one warehouse and one configuration
pub struct Pipeline<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    config: &'a PipelineConfig,
    registry: TableRegistry,
    work_dir: PathBuf,
    source_dir: Option<PathBuf>,
}

impl<'a, W: Warehouse + ?Sized> Pipeline<'a, W> {
    /// Paths in `config` are resolved against `config_dir`
    pub fn new(
        warehouse: &'a W,
        config: &'a PipelineConfig,
        config_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let source_dir = match config.source.kind {
            SourceKind::Local => Some(config_dir.join(&config.source.folder)),
            SourceKind::Drive => None,
        };
        Ok(Self {
            warehouse,
            config,
            registry: config.registry()?,
            work_dir: config.get_work_dir(config_dir),
            source_dir,
        })
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Tables selected by `options`, in configuration order
    pub fn selected_tables(&self, options: &RunOptions) -> Result<Vec<TableConfig>, ConfigError> {
        Ok(self
            .registry
            .select(&options.tables)?
            .into_iter()
            .cloned()
            .collect())
    }

    fn clean_work_dir(&self) -> Result<(), SourceError> {
        // A local store reading straight from the work directory owns those files
        if self.source_dir.as_deref() == Some(self.work_dir.as_path()) {
            return Ok(());
        }
        cleanup_work_dir(&self.work_dir, &self.config.source.extension)?;
        Ok(())
    }

    /// Download the current inputs into the work directory
    pub async fn stage(
        &self,
        store: &dyn FileStore,
        options: &RunOptions,
    ) -> Result<StagedFiles, PipelineError> {
        self.selected_tables(options)?;
        self.clean_work_dir()?;

        let classifier = FilenameClassifier::for_today(self.config, &self.registry);
        let staged = stage_inputs(
            store,
            &classifier,
            &self.registry,
            &self.config.source.folder,
            &self.work_dir,
        )
        .await?;
        Ok(staged.select(&options.tables))
    }

    /// Extract every staged file and replace its raw table
    ///
    /// A file that fails to parse or load is reported and does not stop the
    /// others.
    pub async fn extract_and_load(&self, staged: &StagedFiles, dry_run: bool) -> LoadReport {
        let extractor = IncrementalExtractor::new();
        let run_log = RunLog::new(self.warehouse);
        let mut report = LoadReport {
            load_id: uuid::Uuid::new_v4().to_string(),
            dry_run,
            tables: BTreeMap::new(),
        };

        for (table_name, path) in staged.iter() {
            let Some(table) = self.registry.get(table_name) else {
                info!("Skipping {}: no config found", table_name);
                continue;
            };

            let watermark = run_log.get_last_watermark(&table.name).await;
            let mut load = TableLoad {
                file: path.to_path_buf(),
                watermark,
                total_rows: 0,
                kept_rows: 0,
                written_rows: 0,
                error: None,
            };

            match extractor.extract_file(path, table, watermark) {
                Ok(rows) => {
                    load.total_rows = rows.total_rows;
                    load.kept_rows = rows.kept_rows();
                    if !dry_run {
                        match self.warehouse.replace_staging(&rows, &report.load_id).await {
                            Ok(written) => {
                                info!("raw.{}: {} rows loaded", table.name, written);
                                load.written_rows = written;
                            }
                            Err(e) => {
                                warn!("raw.{}: load failed: {}", table.name, e);
                                load.error = Some(e.to_string());
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: extraction failed: {}", table.name, e);
                    load.error = Some(e.to_string());
                }
            }

            report.tables.insert(table.name.clone(), load);
        }

        report
    }

    /// Reconcile the selected tables, then refresh gold views
    pub async fn transform(&self, options: &RunOptions) -> Result<PipelineReport, PipelineError> {
        let tables = self.selected_tables(options)?;
        let reconcile = Reconciler::new(self.warehouse).reconcile_all(&tables).await;
        let gold = refresh_gold_views(self.warehouse, &self.config.gold_views).await;

        Ok(PipelineReport {
            load: None,
            reconcile: Some(reconcile),
            gold,
        })
    }

    /// Stage, extract and load only
    pub async fn extract(
        &self,
        store: &dyn FileStore,
        options: &RunOptions,
    ) -> Result<LoadReport, PipelineError> {
        let staged = self.stage(store, options).await?;
        let report = self.extract_and_load(&staged, options.dry_run).await;
        if !options.dry_run
            && let Err(e) = self.clean_work_dir()
        {
            warn!("Could not clean work directory: {}", e);
        }
        Ok(report)
    }

    /// Full run: extract, load, reconcile and refresh
    pub async fn run(
        &self,
        store: &dyn FileStore,
        options: &RunOptions,
    ) -> Result<PipelineReport, PipelineError> {
        let load = self.extract(store, options).await?;
        if options.dry_run {
            info!("Dry run: {} file(s) extracted, nothing written", load.tables.len());
            return Ok(PipelineReport {
                load: Some(load),
                ..Default::default()
            });
        }

        let mut report = self.transform(options).await?;
        report.load = Some(load);
        info!(
            "Run complete: {} error(s), {} gold view failure(s)",
            report.error_count(),
            report.gold_failures()
        );
        Ok(report)
    }
}

#[cfg(all(test, feature = "duckdb-backend"))]
mod tests {
    use super::*;
    use crate::database::DuckDBWarehouse;
    use crate::reconcile::TableOutcome;
    use crate::source::LocalFolderStore;
    use chrono::Datelike;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PipelineConfig) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("exports")).unwrap();
        let mut config = PipelineConfig::default();
        config.source.extension = ".csv".to_string();
        (dir, config)
    }

    fn leads_file(dir: &Path) -> PathBuf {
        let year = chrono::Local::now().year();
        dir.join("exports").join(format!("leads_{}.csv", year))
    }

    #[tokio::test]
    async fn test_run_dry_run_writes_nothing() {
        let (dir, config) = setup();
        std::fs::write(
            leads_file(dir.path()),
            "EventID,LastUpdate,Name\n1,02/01/2024 10:00,X\n",
        )
        .unwrap();

        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        warehouse.initialize().await.unwrap();
        let pipeline = Pipeline::new(&warehouse, &config, dir.path()).unwrap();
        let store = LocalFolderStore::new(dir.path());

        let options = RunOptions {
            tables: vec![],
            dry_run: true,
        };
        let report = pipeline.run(&store, &options).await.unwrap();

        let load = report.load.unwrap();
        assert_eq!(load.tables["crm_leads"].kept_rows, 1);
        assert_eq!(load.tables["crm_leads"].written_rows, 0);
        assert!(report.reconcile.is_none());
        assert!(!warehouse.table_exists("raw", "crm_leads").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_loads_and_reconciles() {
        let (dir, config) = setup();
        std::fs::write(
            leads_file(dir.path()),
            "EventID,LastUpdate,Name,\n1,02/01/2024 10:00,X,\n2,03/01/2024 09:30,Y,\n",
        )
        .unwrap();

        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        warehouse.initialize().await.unwrap();
        let pipeline = Pipeline::new(&warehouse, &config, dir.path()).unwrap();
        let store = LocalFolderStore::new(dir.path());

        let report = pipeline
            .run(&store, &RunOptions::tables(vec!["crm_leads".to_string()]))
            .await
            .unwrap();

        assert_eq!(report.error_count(), 0);
        let reconcile = report.reconcile.unwrap();
        assert_eq!(reconcile.outcomes.len(), 1);
        assert!(matches!(
            reconcile.get("crm_leads"),
            Some(TableOutcome::Success { rows: 2, .. })
        ));
        assert_eq!(warehouse.count_rows("bronze", "crm_leads").await.unwrap(), 2);
        // The unnamed trailing column never reaches bronze
        let columns = warehouse.table_columns("bronze", "crm_leads").await.unwrap();
        assert!(columns.iter().all(|c| !c.name.starts_with("unnamed")));
        // Staged copies are removed after loading
        assert!(!pipeline.work_dir().join(leads_file(dir.path()).file_name().unwrap()).exists());
    }

    #[tokio::test]
    async fn test_unknown_table_selection_is_fatal() {
        let (dir, config) = setup();
        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        let pipeline = Pipeline::new(&warehouse, &config, dir.path()).unwrap();

        let result = pipeline
            .transform(&RunOptions::tables(vec!["crm_notes".to_string()]))
            .await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
