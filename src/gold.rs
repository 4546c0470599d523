//! Gold view refresh
//!
//! Runs after reconciliation. A failing view is logged and reported; it never
//! affects the other views or the reconciliation outcomes.

use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement as SqlStatement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::database::schema::GOLD_SCHEMA;
use crate::database::{DatabaseError, DatabaseResult, Dialect, SqlValue, Warehouse, qualified, quote_ident};

/// A derived view in the gold layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldView {
    /// `schema.view`, or a bare view name in the `gold` schema
    pub name: String,
    /// Defining SELECT, needed to create the view where it does not exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl GoldView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: None,
        }
    }

    pub fn with_definition(mut self, sql: impl Into<String>) -> Self {
        self.definition = Some(sql.into());
        self
    }

    /// Schema and view name
    pub fn parts(&self) -> (&str, &str) {
        match self.name.split_once('.') {
            Some((schema, view)) => (schema, view),
            None => (GOLD_SCHEMA, self.name.as_str()),
        }
    }

    fn definition_sql(&self) -> Option<&str> {
        self.definition
            .as_deref()
            .map(|d| d.trim().trim_end_matches(';').trim())
            .filter(|d| !d.is_empty())
    }

    /// Check the name and that the definition is a single query
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (schema, view) = self.parts();
        if schema.is_empty() || view.is_empty() || view.contains('.') {
            return Err(ConfigError::Validation(format!(
                "invalid gold view name: '{}'",
                self.name
            )));
        }

        if let Some(sql) = self.definition_sql() {
            let statements = Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| {
                ConfigError::Validation(format!("{}: invalid definition: {}", self.name, e))
            })?;
            match statements.as_slice() {
                [SqlStatement::Query(_)] => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "{}: definition must be a single SELECT query",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// What a refresh did to a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshAction {
    /// Existing materialized view refreshed in place
    Refreshed,
    /// Materialized view created from its definition
    Created,
    /// Table rebuilt from its definition
    Rebuilt,
}

/// Outcome of refreshing one view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldRefreshResult {
    pub view: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RefreshAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GoldRefreshResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

async fn refresh_view<W: Warehouse + ?Sized>(
    warehouse: &W,
    view: &GoldView,
) -> DatabaseResult<RefreshAction> {
    let (schema, name) = view.parts();
    let target = qualified(schema, name);

    match warehouse.dialect() {
        Dialect::Postgres => {
            let exists = warehouse
                .execute_query_params(
                    "SELECT COUNT(*) AS n FROM pg_matviews \
                     WHERE CAST(schemaname AS TEXT) = $1 AND CAST(matviewname AS TEXT) = $2",
                    &[SqlValue::text(schema), SqlValue::text(name)],
                )
                .await?
                .first_i64("n")
                .unwrap_or(0)
                > 0;

            if exists {
                warehouse
                    .execute_batch(&format!("REFRESH MATERIALIZED VIEW {}", target))
                    .await?;
                return Ok(RefreshAction::Refreshed);
            }

            let definition = view.definition_sql().ok_or_else(|| {
                DatabaseError::InvalidInput(format!(
                    "materialized view {} does not exist and has no definition",
                    view.name
                ))
            })?;
            warehouse
                .execute_batch(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}; CREATE MATERIALIZED VIEW {} AS {}",
                    quote_ident(schema),
                    target,
                    definition
                ))
                .await?;
            Ok(RefreshAction::Created)
        }
        Dialect::DuckDb => {
            let definition = view.definition_sql().ok_or_else(|| {
                DatabaseError::InvalidInput(format!(
                    "{} has no definition to rebuild from",
                    view.name
                ))
            })?;
            warehouse
                .execute_batch(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}; CREATE OR REPLACE TABLE {} AS {}",
                    quote_ident(schema),
                    target,
                    definition
                ))
                .await?;
            Ok(RefreshAction::Rebuilt)
        }
    }
}

/// Refresh every view in order, isolating failures
pub async fn refresh_gold_views<W: Warehouse + ?Sized>(
    warehouse: &W,
    views: &[GoldView],
) -> Vec<GoldRefreshResult> {
    if !views.is_empty() {
        info!("Refreshing {} gold view(s)", views.len());
    }

    let mut results = Vec::with_capacity(views.len());
    for view in views {
        let result = match refresh_view(warehouse, view).await {
            Ok(action) => {
                info!("  {}: {:?}", view.name, action);
                GoldRefreshResult {
                    view: view.name.clone(),
                    action: Some(action),
                    error: None,
                }
            }
            Err(e) => {
                warn!("  Could not refresh {}: {}", view.name, e);
                GoldRefreshResult {
                    view: view.name.clone(),
                    action: None,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts() {
        assert_eq!(GoldView::new("gold.customers_mv").parts(), ("gold", "customers_mv"));
        assert_eq!(GoldView::new("customers_mv").parts(), ("gold", "customers_mv"));
    }

    #[test]
    fn test_validate_definition() {
        let ok = GoldView::new("gold.customers_mv")
            .with_definition("SELECT entityid, max(createtime) FROM bronze.crm_buyers GROUP BY 1;");
        assert!(ok.validate().is_ok());

        let not_query = GoldView::new("gold.x").with_definition("DROP TABLE bronze.crm_buyers");
        assert!(not_query.validate().is_err());

        let two = GoldView::new("gold.x").with_definition("SELECT 1; SELECT 2");
        assert!(two.validate().is_err());

        let garbage = GoldView::new("gold.x").with_definition("SELEC nothing FROM");
        assert!(garbage.validate().is_err());

        assert!(GoldView::new("a.b.c").validate().is_err());
        assert!(GoldView::new("gold.").validate().is_err());
    }

    #[cfg(feature = "duckdb-backend")]
    #[tokio::test]
    async fn test_refresh_isolates_failures() {
        use crate::database::DuckDBWarehouse;

        let warehouse = DuckDBWarehouse::in_memory().unwrap();
        warehouse.initialize().await.unwrap();
        warehouse
            .execute_batch("CREATE TABLE bronze.crm_buyers (entityid TEXT); INSERT INTO bronze.crm_buyers VALUES ('a'), ('a'), ('b')")
            .await
            .unwrap();

        let views = vec![
            GoldView::new("gold.broken").with_definition("SELECT * FROM bronze.missing"),
            GoldView::new("gold.customers_mv")
                .with_definition("SELECT DISTINCT entityid FROM bronze.crm_buyers"),
            GoldView::new("gold.undefined"),
        ];
        let results = refresh_gold_views(&warehouse, &views).await;

        assert_eq!(results.len(), 3);
        assert!(!results[0].is_ok());
        assert_eq!(results[1].action, Some(RefreshAction::Rebuilt));
        assert!(!results[2].is_ok());
        assert_eq!(warehouse.count_rows("gold", "customers_mv").await.unwrap(), 2);
    }
}
