//! End-to-end runs over CSV exports in a temporary folder

#![cfg(feature = "duckdb-backend")]

use chrono::Datelike;
use crm_elt::{
    DuckDBWarehouse, LocalFolderStore, Pipeline, PipelineConfig, RunLog, RunOptions, TableOutcome,
    Warehouse,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    config: PipelineConfig,
    warehouse: DuckDBWarehouse,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("exports")).unwrap();
        let mut config = PipelineConfig::default();
        config.source.extension = ".csv".to_string();
        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        warehouse.initialize().await.unwrap();
        Self {
            dir,
            config,
            warehouse,
        }
    }

    fn export(&self, base: &str, content: &str) -> PathBuf {
        let year = chrono::Local::now().year();
        let path = self
            .dir
            .path()
            .join("exports")
            .join(format!("{}_{}.csv", base, year));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }
}

#[tokio::test]
async fn test_watermark_excludes_seen_rows_and_keeps_newer() {
    let fx = Fixture::new().await;
    let pipeline = Pipeline::new(&fx.warehouse, &fx.config, fx.root()).unwrap();
    let store = LocalFolderStore::new(fx.root());
    let options = RunOptions::tables(vec!["crm_leads".to_string()]);

    fx.export(
        "leads",
        "EventID,LastUpdate,Name\n1,01/01/2024 08:00,A\n2,05/01/2024 12:00,B\n",
    );
    let first = pipeline.run(&store, &options).await.unwrap();
    assert_eq!(first.error_count(), 0);
    assert_eq!(
        RunLog::new(&fx.warehouse)
            .get_last_watermark("crm_leads")
            .await
            .to_string(),
        "2024-01-05 12:00:00"
    );

    // Same export plus one row a second past the watermark
    fx.export(
        "leads",
        "EventID,LastUpdate,Name\n1,01/01/2024 08:00,A\n2,05/01/2024 12:00,B\n3,05/01/2024 12:00:01,C\n",
    );
    let second = pipeline.run(&store, &options).await.unwrap();

    let load = second.load.as_ref().unwrap();
    assert_eq!(load.tables["crm_leads"].total_rows, 3);
    assert_eq!(load.tables["crm_leads"].kept_rows, 1);
    assert!(matches!(
        second.reconcile.as_ref().unwrap().get("crm_leads"),
        Some(TableOutcome::Success { rows: 1, .. })
    ));
    assert_eq!(fx.warehouse.count_rows("bronze", "crm_leads").await.unwrap(), 3);
}

#[tokio::test]
async fn test_rerun_without_new_rows_leaves_bronze_unchanged() {
    let fx = Fixture::new().await;
    let pipeline = Pipeline::new(&fx.warehouse, &fx.config, fx.root()).unwrap();
    let store = LocalFolderStore::new(fx.root());

    fx.export("buyers", "EntityID,CreateTime\na,02/01/2024\nb,03/01/2024\n");
    pipeline.run(&store, &RunOptions::all()).await.unwrap();
    fx.export("buyers", "EntityID,CreateTime\na,02/01/2024\nb,03/01/2024\n");
    let second = pipeline.run(&store, &RunOptions::all()).await.unwrap();

    assert_eq!(second.load.as_ref().unwrap().tables["crm_buyers"].kept_rows, 0);
    assert_eq!(
        second.reconcile.as_ref().unwrap().get("crm_buyers"),
        Some(&TableOutcome::Skipped { rows: 0 })
    );
    assert_eq!(fx.warehouse.count_rows("bronze", "crm_buyers").await.unwrap(), 2);
}

#[tokio::test]
async fn test_unparsable_file_is_isolated() {
    let fx = Fixture::new().await;
    let pipeline = Pipeline::new(&fx.warehouse, &fx.config, fx.root()).unwrap();
    let store = LocalFolderStore::new(fx.root());

    fx.export("events", "EventID,EventDate\n1,02/01/2024\n");
    // Invalid UTF-8 cannot be read as CSV
    std::fs::write(fx.export("sellers", ""), [0xff, 0xfe, 0x00, b'\n', 0xc3]).unwrap();

    let report = pipeline.run(&store, &RunOptions::all()).await.unwrap();

    let load = report.load.as_ref().unwrap();
    assert!(load.tables["crm_sellers"].error.is_some());
    assert!(load.tables["crm_events"].error.is_none());
    assert_eq!(report.error_count(), 1);
    assert_eq!(fx.warehouse.count_rows("bronze", "crm_events").await.unwrap(), 1);
}

#[tokio::test]
async fn test_gold_views_refresh_after_reconcile() {
    let mut fx = Fixture::new().await;
    fx.config.gold_views = vec![
        crm_elt::gold::GoldView::new("gold.buyer_count")
            .with_definition("SELECT COUNT(*) AS n FROM bronze.crm_buyers"),
    ];
    let pipeline = Pipeline::new(&fx.warehouse, &fx.config, fx.root()).unwrap();
    let store = LocalFolderStore::new(fx.root());

    fx.export("buyers", "EntityID,CreateTime\na,02/01/2024\nb,03/01/2024\n");
    let report = pipeline.run(&store, &RunOptions::all()).await.unwrap();

    assert_eq!(report.gold.len(), 1);
    assert!(report.gold[0].is_ok());
    let result = fx
        .warehouse
        .execute_query("SELECT n FROM gold.buyer_count")
        .await
        .unwrap();
    assert_eq!(result.first_i64("n"), Some(2));
}

#[tokio::test]
async fn test_header_in_bookkeeping_namespace_still_loads() {
    let fx = Fixture::new().await;
    let pipeline = Pipeline::new(&fx.warehouse, &fx.config, fx.root()).unwrap();
    let store = LocalFolderStore::new(fx.root());

    fx.export(
        "leads",
        "EventID,LastUpdate,_ELT Load ID\n1,01/01/2024 08:00,abc\n",
    );
    let report = pipeline
        .run(&store, &RunOptions::tables(vec!["crm_leads".to_string()]))
        .await
        .unwrap();

    assert_eq!(report.error_count(), 0);
    let result = fx
        .warehouse
        .execute_query("SELECT elt_load_id FROM bronze.crm_leads")
        .await
        .unwrap();
    assert_eq!(result.first_str("elt_load_id"), Some("abc"));
}
