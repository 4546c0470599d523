//! PostgreSQL warehouse backend implementation
//!
//! Provides a PostgreSQL backend for scheduled deployments. A single client
//! is shared behind an async mutex; the pipeline runs sequentially.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, warn};

use super::schema::WarehouseSchema;
use super::{
    DatabaseError, DatabaseResult, Dialect, QueryResult, SqlValue, Statement, Warehouse,
};
use crate::config::PostgresSection;
use crate::extract::StagingRowSet;

/// PostgreSQL warehouse backend
pub struct PostgresWarehouse {
    /// Connection string
    connection_string: String,
    /// PostgreSQL client (wrapped for async access)
    client: Arc<Mutex<tokio_postgres::Client>>,
    /// Session and timeout settings
    settings: PostgresSection,
}

impl PostgresWarehouse {
    /// Connect with default session settings
    pub async fn new(connection_string: &str) -> DatabaseResult<Self> {
        let settings = PostgresSection {
            connection_string: Some(connection_string.to_string()),
            ..Default::default()
        };
        Self::connect(&settings).await
    }

    /// Connect using a `[postgres]` configuration section
    pub async fn connect(settings: &PostgresSection) -> DatabaseResult<Self> {
        let connection_string = settings.connection_string.clone().ok_or_else(|| {
            DatabaseError::ConfigError("PostgreSQL connection string not configured".to_string())
        })?;

        let mut pg_config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid connection string: {}", e)))?;
        pg_config.application_name(&settings.application_name);

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to connect to PostgreSQL: {}", e))
            })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self {
            connection_string,
            client: Arc::new(Mutex::new(client)),
            settings: settings.clone(),
        })
    }

    /// Get the connection string (masked for security)
    pub fn connection_string_masked(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@')
            && let Some(colon_pos) = self.connection_string[..at_pos].rfind(':')
        {
            let prefix = &self.connection_string[..colon_pos + 1];
            let suffix = &self.connection_string[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }
        self.connection_string.clone()
    }

    /// Borrow typed parameters as driver bind values
    fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
        params
            .iter()
            .map(|p| match p {
                SqlValue::Text(v) => v as &(dyn ToSql + Sync),
                SqlValue::Timestamp(v) => v as &(dyn ToSql + Sync),
                SqlValue::BigInt(v) => v as &(dyn ToSql + Sync),
            })
            .collect()
    }

    fn session_limits_sql(&self) -> String {
        format!(
            "SET LOCAL lock_timeout = '{}s'; SET LOCAL statement_timeout = '{}s'",
            self.settings.lock_timeout_secs, self.settings.statement_timeout_secs
        )
    }

    fn rows_to_result(rows: &[tokio_postgres::Row], start: std::time::Instant) -> QueryResult {
        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let json_rows = rows
            .iter()
            .map(|row| Self::row_to_json(row, &columns))
            .collect();

        QueryResult {
            columns,
            rows: json_rows,
            rows_affected: None,
            execution_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Convert a PostgreSQL row to a JSON value
    fn row_to_json(row: &tokio_postgres::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            map.insert(col_name.clone(), Self::get_column_value(row, i));
        }

        serde_json::Value::Object(map)
    }

    /// Get a column value as JSON
    fn get_column_value(row: &tokio_postgres::Row, idx: usize) -> serde_json::Value {
        // Try different types
        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v
                .map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v
                .map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v
                .map(serde_json::Value::Bool)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDateTime>>(idx) {
            return v
                .map(|ts| serde_json::Value::String(ts.to_string()))
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDate>>(idx) {
            return v
                .map(|d| serde_json::Value::String(d.to_string()))
                .unwrap_or(serde_json::Value::Null);
        }

        serde_json::Value::Null
    }
}

#[async_trait(?Send)]
impl Warehouse for PostgresWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(&self) -> DatabaseResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(&WarehouseSchema::create_schemas_sql())
            .await
            .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to create schemas: {}", e)))
    }

    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        self.execute_query_params(sql, &[]).await
    }

    async fn execute_query_params(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> DatabaseResult<QueryResult> {
        let start = std::time::Instant::now();
        let client = self.client.lock().await;

        let rows = client
            .query(sql, &Self::bind(params))
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

        Ok(Self::rows_to_result(&rows, start))
    }

    async fn execute_statement(&self, sql: &str, params: &[SqlValue]) -> DatabaseResult<u64> {
        debug!("{}", sql);
        let client = self.client.lock().await;
        client
            .execute(sql, &Self::bind(params))
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Execute failed: {}", e)))
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        debug!("{}", sql);
        let client = self.client.lock().await;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Batch execute failed: {}", e)))
    }

    async fn run_in_transaction(&self, statements: &[Statement]) -> DatabaseResult<Vec<u64>> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("Begin failed: {}", e)))?;

        tx.batch_execute(&self.session_limits_sql())
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        let mut counts = Vec::with_capacity(statements.len());
        for statement in statements {
            debug!("{}", statement.sql);
            // Dropping `tx` on error rolls back
            let n = tx
                .execute(statement.sql.as_str(), &Self::bind(&statement.params))
                .await
                .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
            counts.push(n);
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("Commit failed: {}", e)))?;
        Ok(counts)
    }

    async fn replace_staging(&self, rows: &StagingRowSet, load_id: &str) -> DatabaseResult<u64> {
        let (drop_sql, create_sql, insert_sql) = WarehouseSchema::staging_sql(self.dialect(), rows);
        let load_id = SqlValue::text(load_id);
        let loaded_at = SqlValue::Timestamp(Some(Utc::now().naive_utc()));

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("Begin failed: {}", e)))?;

        tx.batch_execute(&format!("{}; {}", drop_sql, create_sql))
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        let insert = tx
            .prepare(&insert_sql)
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        let mut written = 0u64;
        for row in &rows.rows {
            let mut values = row.clone();
            values.push(load_id.clone());
            values.push(loaded_at.clone());
            written += tx
                .execute(&insert, &Self::bind(&values))
                .await
                .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("Commit failed: {}", e)))?;
        debug!("raw.{}: {} rows staged", rows.table, written);
        Ok(written)
    }

    async fn terminate_stale_sessions(&self) -> DatabaseResult<u64> {
        let sql = format!(
            "SELECT pg_terminate_backend(pid) AS terminated \
             FROM pg_stat_activity \
             WHERE pid <> pg_backend_pid() \
               AND datname = current_database() \
               AND (state LIKE 'idle in transaction%' OR (state = 'idle' AND application_name = $1)) \
               AND state_change < now() - interval '{} seconds'",
            self.settings.stale_session_idle_secs
        );

        let client = self.client.lock().await;
        let rows = client
            .query(sql.as_str(), &[&self.settings.application_name])
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Session cleanup failed: {}", e)))?;

        let terminated = rows
            .iter()
            .filter(|row| row.try_get::<_, bool>("terminated").unwrap_or(false))
            .count() as u64;
        if terminated > 0 {
            info!("Terminated {} stale session(s)", terminated);
        }
        Ok(terminated)
    }
}
