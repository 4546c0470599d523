//! Static per-table load settings
//!
//! Column names are in normalized form (lowercase, spaces to underscores)
//! because the extractor normalizes every spreadsheet header before use.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// How staged rows are written into the durable table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// Delete rows with matching keys, then insert the staged batch
    Merge,
    /// Insert the staged batch as-is
    Append,
}

impl std::str::FromStr for WriteStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merge" => Ok(WriteStrategy::Merge),
            "append" => Ok(WriteStrategy::Append),
            _ => Err(format!(
                "Unknown write strategy: {}. Use 'merge' or 'append'.",
                s
            )),
        }
    }
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::Merge => write!(f, "merge"),
            WriteStrategy::Append => write!(f, "append"),
        }
    }
}

/// Load settings for one logical table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name, identical in the raw and bronze schemas
    pub name: String,
    /// Cursor column used for incremental filtering
    pub incremental_column: String,
    /// Ordered key columns (empty means append-only)
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Write strategy into bronze
    #[serde(alias = "write_disposition")]
    pub strategy: WriteStrategy,
    /// Whether source files are split per calendar year (`<base>_<yyyy>`)
    #[serde(default)]
    pub year_partitioned: bool,
    /// Columns parsed as timestamps; every other column is text
    #[serde(default)]
    pub date_columns: Vec<String>,
    /// File base name for non-partitioned sources (defaults to the table name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

impl TableConfig {
    /// Create a config with no date columns besides the cursor column
    pub fn new(
        name: impl Into<String>,
        incremental_column: impl Into<String>,
        primary_key: &[&str],
        strategy: WriteStrategy,
    ) -> Self {
        let incremental_column = incremental_column.into();
        Self {
            name: name.into(),
            date_columns: vec![incremental_column.clone()],
            incremental_column,
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
            strategy,
            year_partitioned: false,
            source_name: None,
        }
    }

    /// Mark the source as split per calendar year
    pub fn partitioned(mut self) -> Self {
        self.year_partitioned = true;
        self
    }

    /// Set the full list of timestamp columns (the cursor column is always kept)
    pub fn with_date_columns(mut self, columns: &[&str]) -> Self {
        self.date_columns = columns.iter().map(|s| s.to_string()).collect();
        let cursor = self.incremental_column.clone();
        if !self.is_date_column(&cursor) {
            self.date_columns.push(cursor);
        }
        self
    }

    /// Set the source file base name for a non-partitioned table
    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    /// Whether a normalized column must be parsed as a timestamp
    pub fn is_date_column(&self, column: &str) -> bool {
        self.date_columns.iter().any(|c| c == column)
    }

    /// File base name that maps onto this table when it is not partitioned
    pub fn file_base(&self) -> &str {
        self.source_name.as_deref().unwrap_or(&self.name)
    }

    /// Columns that identify an entity for merge deletion.
    ///
    /// The cursor column is dropped from the key so a newer version of the
    /// same entity replaces the older one. A key made only of the cursor
    /// column is used whole.
    pub fn merge_key(&self) -> Vec<&str> {
        let identity: Vec<&str> = self
            .primary_key
            .iter()
            .filter(|c| **c != self.incremental_column)
            .map(String::as_str)
            .collect();

        if identity.is_empty() {
            self.primary_key.iter().map(String::as_str).collect()
        } else {
            identity
        }
    }

    /// Check the static invariants of this table
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation("table name is empty".to_string()));
        }
        if self.strategy == WriteStrategy::Merge && self.primary_key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}: merge strategy requires a primary key",
                self.name
            )));
        }
        if !self.is_date_column(&self.incremental_column) {
            return Err(ConfigError::Validation(format!(
                "{}: incremental column '{}' must be listed in date_columns",
                self.name, self.incremental_column
            )));
        }
        Ok(())
    }
}

/// Ordered collection of table configs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRegistry {
    tables: Vec<TableConfig>,
}

impl TableRegistry {
    /// Build a registry, validating every table and rejecting duplicate names
    pub fn new(tables: Vec<TableConfig>) -> Result<Self, ConfigError> {
        for (i, table) in tables.iter().enumerate() {
            table.validate()?;
            if tables[..i].iter().any(|t| t.name == table.name) {
                return Err(ConfigError::Validation(format!(
                    "duplicate table config: {}",
                    table.name
                )));
            }
        }
        Ok(Self { tables })
    }

    /// The CRM export tables
    pub fn crm_defaults() -> Self {
        Self {
            tables: default_crm_tables(),
        }
    }

    /// Look up a table by name
    pub fn get(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Iterate tables in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &TableConfig> {
        self.tables.iter()
    }

    /// Table names in configuration order
    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Resolve a user selection; an empty selection means every table
    pub fn select(&self, names: &[String]) -> Result<Vec<&TableConfig>, ConfigError> {
        if names.is_empty() {
            return Ok(self.tables.iter().collect());
        }

        let unknown: Vec<&str> = names
            .iter()
            .filter(|n| self.get(n).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::Validation(format!(
                "unknown table(s): {}. Available: {}",
                unknown.join(", "),
                self.names().join(", ")
            )));
        }

        Ok(self
            .tables
            .iter()
            .filter(|t| names.iter().any(|n| *n == t.name))
            .collect())
    }

    pub fn into_vec(self) -> Vec<TableConfig> {
        self.tables
    }
}

fn default_crm_tables() -> Vec<TableConfig> {
    // CRM originals: "Last change", "CreateTime", "EventDate", "LastUpdate", "EventID"
    let contacts = |name: &str| {
        TableConfig::new(
            name,
            "createtime",
            &["entityid", "createtime"],
            WriteStrategy::Append,
        )
        .partitioned()
    };

    vec![
        TableConfig::new(
            "crm_properties",
            "last_change",
            &["reference", "last_change"],
            WriteStrategy::Merge,
        )
        .with_date_columns(&["create_date", "last_change", "publish_date"])
        .with_source_name("all_properties"),
        contacts("crm_buyers"),
        contacts("crm_sellers"),
        contacts("crm_buyers_sellers"),
        TableConfig::new(
            "crm_leads",
            "lastupdate",
            &["eventid", "lastupdate"],
            WriteStrategy::Merge,
        )
        .partitioned()
        .with_date_columns(&["createdate", "startdate", "enddate", "lastupdate"]),
        TableConfig::new(
            "crm_events",
            "eventdate",
            &["eventid", "eventdate"],
            WriteStrategy::Append,
        )
        .partitioned(),
        contacts("crm_archived"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let registry = TableRegistry::crm_defaults();
        assert_eq!(registry.len(), 7);
        for table in registry.iter() {
            table.validate().unwrap();
        }
        assert!(TableRegistry::new(registry.into_vec()).is_ok());
    }

    #[test]
    fn test_merge_without_key_rejected() {
        let table = TableConfig::new("t", "updated", &[], WriteStrategy::Merge);
        assert!(matches!(table.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_incremental_column_must_be_date() {
        let mut table = TableConfig::new("t", "updated", &["id"], WriteStrategy::Merge);
        table.date_columns.clear();
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_merge_key_drops_cursor_column() {
        let registry = TableRegistry::crm_defaults();
        let leads = registry.get("crm_leads").unwrap();
        assert_eq!(leads.merge_key(), vec!["eventid"]);

        let cursor_only = TableConfig::new("t", "ts", &["ts"], WriteStrategy::Merge);
        assert_eq!(cursor_only.merge_key(), vec!["ts"]);
    }

    #[test]
    fn test_duplicate_tables_rejected() {
        let t = TableConfig::new("t", "ts", &["id"], WriteStrategy::Append);
        assert!(TableRegistry::new(vec![t.clone(), t]).is_err());
    }

    #[test]
    fn test_select() {
        let registry = TableRegistry::crm_defaults();
        assert_eq!(registry.select(&[]).unwrap().len(), 7);

        let picked = registry
            .select(&["crm_leads".to_string(), "crm_buyers".to_string()])
            .unwrap();
        // Configuration order wins over selection order
        assert_eq!(picked[0].name, "crm_buyers");
        assert_eq!(picked[1].name, "crm_leads");

        assert!(registry.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_write_strategy_from_str() {
        assert_eq!("merge".parse::<WriteStrategy>().unwrap(), WriteStrategy::Merge);
        assert_eq!("APPEND".parse::<WriteStrategy>().unwrap(), WriteStrategy::Append);
        assert!("upsert".parse::<WriteStrategy>().is_err());
    }
}
