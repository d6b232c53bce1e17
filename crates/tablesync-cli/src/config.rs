//! CLI configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tablesync_store::{ConflictPolicy, StoreOptions};

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// `SQLite` database path
    pub db_path: PathBuf,

    /// Deadline for each sync operation
    pub timeout: Duration,

    /// Policy for conflicting client changes
    pub conflict_policy: ConflictPolicy,

    /// Tables to sync; discovered from the database when empty
    pub tables: Vec<TableConfig>,
}

/// One syncable table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableConfig {
    /// Table name
    pub name: String,

    /// Whether clients may push changes to it
    #[serde(default = "default_sync_up")]
    pub sync_up: bool,
}

fn default_sync_up() -> bool {
    true
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./tablesync.db"),
            timeout: StoreOptions::default().timeout,
            conflict_policy: ConflictPolicy::default(),
            tables: Vec::new(),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TABLESYNC_DB_PATH`: `SQLite` database path
    /// - `TABLESYNC_TIMEOUT_MS`: per-operation deadline in milliseconds, 0 disables it
    /// - `TABLESYNC_CONFLICT_POLICY`: "server-wins" or "client-wins"
    /// - `TABLESYNC_TABLES`: JSON array of `{"name": ..., "sync_up": bool}`
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("TABLESYNC_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(timeout) = lookup("TABLESYNC_TIMEOUT_MS") {
            let millis: u64 = timeout
                .trim()
                .parse()
                .context("Invalid TABLESYNC_TIMEOUT_MS")?;
            config.timeout = Duration::from_millis(millis);
        }

        if let Some(policy) = lookup("TABLESYNC_CONFLICT_POLICY") {
            config.conflict_policy = policy
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid TABLESYNC_CONFLICT_POLICY")?;
        }

        if let Some(tables) = lookup("TABLESYNC_TABLES") {
            config.tables =
                serde_json::from_str(&tables).context("Invalid TABLESYNC_TABLES JSON")?;
        }

        Ok(config)
    }

    /// Store options derived from this configuration.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = CliConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./tablesync.db"));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.conflict_policy, ConflictPolicy::ServerWins);
        assert!(config.tables.is_empty());
    }

    #[test]
    fn reads_every_variable() {
        let config = CliConfig::from_lookup(lookup(&[
            ("TABLESYNC_DB_PATH", "/tmp/clinic.db"),
            ("TABLESYNC_TIMEOUT_MS", "250"),
            ("TABLESYNC_CONFLICT_POLICY", "client-wins"),
            (
                "TABLESYNC_TABLES",
                r#"[{"name": "patients"}, {"name": "clinics", "sync_up": false}]"#,
            ),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/clinic.db"));
        assert_eq!(config.store_options().timeout, Duration::from_millis(250));
        assert_eq!(config.conflict_policy, ConflictPolicy::ClientWins);
        assert_eq!(
            config.tables,
            vec![
                TableConfig {
                    name: "patients".to_string(),
                    sync_up: true
                },
                TableConfig {
                    name: "clinics".to_string(),
                    sync_up: false
                },
            ]
        );
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(CliConfig::from_lookup(lookup(&[("TABLESYNC_TIMEOUT_MS", "soon")])).is_err());
        assert!(CliConfig::from_lookup(lookup(&[("TABLESYNC_CONFLICT_POLICY", "merge")])).is_err());
        assert!(CliConfig::from_lookup(lookup(&[("TABLESYNC_TABLES", "patients")])).is_err());
    }
}
