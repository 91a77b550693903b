use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::constants::{self, to_owned_list};
use crate::error::{PipelineError, Result};
use crate::types::ColumnType;

const DEFAULT_CONFIG_FILE: &str = "etl.toml";

/// Immutable run configuration. Built once in `main` and handed by reference
/// to every stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_path: PathBuf,
    pub database: DatabaseConfig,
    pub tables: TableNames,
    pub columns: ColumnConfig,
    /// Upper bound on rows per insert batch.
    pub chunk_size: usize,
    pub merge: MergeConfig,
    pub encoding: EncodingConfig,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub raw: String,
    pub staging: String,
    pub warehouse: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub expected: Vec<String>,
    pub text: Vec<String>,
    pub drop: Vec<String>,
    pub encode: Vec<String>,
    pub key: Vec<String>,
    pub warehouse: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub missing_key_policy: MissingKeyPolicy,
}

/// What the merger does with staging rows that carry no natural key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingKeyPolicy {
    #[default]
    Skip,
    Abort,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Persist label mappings so codes stay stable across runs.
    pub persist: bool,
}

/// Command-line values that win over file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub source_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("data/raw/fraudTrain.csv"),
            database: DatabaseConfig::default(),
            tables: TableNames::default(),
            columns: ColumnConfig::default(),
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            merge: MergeConfig::default(),
            encoding: EncodingConfig::default(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warehouse.db"),
            busy_timeout_ms: 5_000,
            journal_mode: "WAL".to_string(),
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            raw: constants::RAW_TABLE.to_string(),
            staging: constants::STAGING_TABLE.to_string(),
            warehouse: constants::WAREHOUSE_TABLE.to_string(),
        }
    }
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            expected: to_owned_list(constants::RAW_COLUMNS),
            text: to_owned_list(constants::TEXT_COLUMNS),
            drop: to_owned_list(constants::DROP_COLUMNS),
            encode: to_owned_list(constants::ENCODE_COLUMNS),
            key: to_owned_list(constants::KEY_COLUMNS),
            warehouse: to_owned_list(constants::WAREHOUSE_COLUMNS),
        }
    }
}

impl ColumnConfig {
    /// Declared type of each warehouse column, in `warehouse` order.
    pub fn warehouse_types(&self) -> Vec<ColumnType> {
        self.warehouse
            .iter()
            .map(|c| {
                let c = c.as_str();
                if self.encode.iter().any(|e| e == c) || constants::INTEGER_COLUMNS.contains(&c) {
                    ColumnType::Integer
                } else if constants::REAL_COLUMNS.contains(&c) {
                    ColumnType::Real
                } else {
                    ColumnType::Text
                }
            })
            .collect()
    }
}

impl PipelineConfig {
    /// Defaults, then the TOML file, then `.env`/process environment, then CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                debug!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: PipelineConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded pipeline configuration");
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ETL_SOURCE_PATH") {
            self.source_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_RAW_TABLE") {
            self.tables.raw = v;
        }
        if let Some(v) = lookup("ETL_STAGING_TABLE") {
            self.tables.staging = v;
        }
        if let Some(v) = lookup("ETL_WAREHOUSE_TABLE") {
            self.tables.warehouse = v;
        }
        if let Some(v) = lookup("ETL_CHUNK_SIZE") {
            self.chunk_size = v
                .trim()
                .parse()
                .map_err(|_| PipelineError::Config(format!("ETL_CHUNK_SIZE is not a number: '{}'", v)))?;
        }
        if let Some(v) = lookup("ETL_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(source) = &overrides.source_path {
            self.source_path = source.clone();
        }
        if let Some(db) = &overrides.database_path {
            self.database.path = db.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be greater than zero".into()));
        }

        let tables = [
            &self.tables.raw,
            &self.tables.staging,
            &self.tables.warehouse,
        ];
        for name in tables {
            if !is_identifier(name) {
                return Err(PipelineError::Config(format!(
                    "table name '{}' is not a plain SQL identifier",
                    name
                )));
            }
            if name == constants::ENCODINGS_TABLE {
                return Err(PipelineError::Config(format!("table name '{}' is reserved", name)));
            }
        }
        let distinct: HashSet<&String> = tables.iter().copied().collect();
        if distinct.len() != tables.len() {
            return Err(PipelineError::Config(
                "raw, staging and warehouse tables must be distinct".into(),
            ));
        }

        let cols = &self.columns;
        let expected: HashSet<&str> = cols.expected.iter().map(String::as_str).collect();
        for required in [constants::COL_TRANS_TIME, constants::COL_DOB] {
            if !expected.contains(required) {
                return Err(PipelineError::Config(format!(
                    "expected columns must include '{}'",
                    required
                )));
            }
        }
        if let Some(bad) = cols.expected.iter().find(|c| !is_identifier(c)) {
            return Err(PipelineError::Config(format!(
                "expected column '{}' is not a plain SQL identifier",
                bad
            )));
        }
        if cols.key.is_empty() {
            return Err(PipelineError::Config("key column list is empty".into()));
        }
        require_subset("text", &cols.text, &expected)?;
        require_subset("drop", &cols.drop, &expected)?;
        require_subset("key", &cols.key, &expected)?;

        // Columns that survive the transformer.
        let mut staged: HashSet<&str> = expected
            .iter()
            .copied()
            .filter(|c| !cols.drop.iter().any(|d| d == c))
            .filter(|c| *c != constants::COL_TRANS_TIME && *c != constants::COL_DOB)
            .collect();
        staged.extend(constants::DERIVED_COLUMNS.iter().copied());

        require_subset("encode", &cols.encode, &staged)?;
        staged.remove(constants::COL_RECORD_KEY);
        require_subset("warehouse", &cols.warehouse, &staged)?;
        if cols.warehouse.is_empty() {
            return Err(PipelineError::Config("warehouse column list is empty".into()));
        }
        Ok(())
    }
}

fn require_subset(label: &str, list: &[String], allowed: &HashSet<&str>) -> Result<()> {
    match list.iter().find(|c| !allowed.contains(c.as_str())) {
        Some(col) => Err(PipelineError::Config(format!(
            "{} column '{}' is not available at that stage",
            label, col
        ))),
        None => Ok(()),
    }
}

/// Table and column names are interpolated into SQL, so only bare identifiers pass.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn warehouse_types_are_fixed_by_column() {
        let columns = ColumnConfig::default();
        let types = columns.warehouse_types();
        let ty = |name: &str| {
            let idx = columns.warehouse.iter().position(|c| c == name).unwrap();
            types[idx]
        };
        assert_eq!(types.len(), columns.warehouse.len());
        assert_eq!(ty("amt"), ColumnType::Real);
        assert_eq!(ty("merch_long"), ColumnType::Real);
        assert_eq!(ty("category"), ColumnType::Integer);
        assert_eq!(ty("age"), ColumnType::Integer);

        let mut raw_gender = ColumnConfig::default();
        raw_gender.encode.retain(|c| c != "gender");
        let idx = raw_gender.warehouse.iter().position(|c| c == "gender").unwrap();
        assert_eq!(raw_gender.warehouse_types()[idx], ColumnType::Text);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("ETL_DB_PATH", "/tmp/x.db"),
            ("ETL_WAREHOUSE_TABLE", "fact_txn"),
            ("ETL_CHUNK_SIZE", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.tables.warehouse, "fact_txn");
        assert_eq!(config.chunk_size, 250);
        config.validate().unwrap();
    }

    #[test]
    fn bad_chunk_size_env_is_config_error() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(|k| (k == "ETL_CHUNK_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn rejects_non_identifier_table_names() {
        let mut config = PipelineConfig::default();
        config.tables.raw = "raw.transactions; DROP TABLE x".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_shared_table_names() {
        let mut config = PipelineConfig::default();
        config.tables.staging = config.tables.warehouse.clone();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_encoding_a_dropped_column() {
        let mut config = PipelineConfig::default();
        config.columns.encode.push("merchant".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("merchant"));
    }

    #[test]
    fn rejects_warehouse_column_that_never_reaches_staging() {
        let mut config = PipelineConfig::default();
        config.columns.warehouse.push("dob".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
            source_path = "extract.csv"
            chunk_size = 10

            [merge]
            missing_key_policy = "abort"

            [encoding]
            persist = true
            "#,
        )
        .unwrap();

        assert_eq!(config.source_path, PathBuf::from("extract.csv"));
        assert_eq!(config.merge.missing_key_policy, MissingKeyPolicy::Abort);
        assert!(config.encoding.persist);
        assert_eq!(config.tables.raw, constants::RAW_TABLE);
        assert_eq!(config.columns.expected.len(), 22);
    }

    #[test]
    fn identifier_check() {
        assert!(is_identifier("transactions_raw"));
        assert!(is_identifier("_t1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("raw.transactions"));
        assert!(!is_identifier(""));
    }
}
