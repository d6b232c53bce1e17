//! Command implementations. Each returns the text to print.

use crate::config::{CliConfig, TableConfig};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tablesync_core::{SyncRegistry, Watermark};
use tablesync_proto::{handle_pull, handle_push, PullRequest, PushRequest, WireMessage};
use tablesync_store::{SqliteStore, SyncTable, TableEntity};

/// Open the configured database.
///
/// # Errors
///
/// Returns error if the database cannot be opened.
pub fn open_store(config: &CliConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path, config.store_options())
        .with_context(|| format!("Failed to open {}", config.db_path.display()))
}

/// Build the registry from configured tables, or from every conforming
/// table in the database when none are configured.
///
/// # Errors
///
/// Returns error if a configured table is missing or lacks sync columns.
pub fn build_registry(config: &CliConfig, store: &SqliteStore) -> Result<SyncRegistry<SqliteStore>> {
    let tables = if config.tables.is_empty() {
        discover_tables(store)?
    } else {
        config.tables.clone()
    };

    let mut registry = SyncRegistry::new();
    for table in tables {
        let entity = TableEntity::new(&table.name)?;
        entity.verify(store)?;
        if table.sync_up {
            registry.register(SyncTable::new(table.name, config.conflict_policy)?)?;
        } else {
            registry.register_down(entity)?;
        }
    }

    if registry.is_empty() {
        bail!("No syncable tables found in {}", config.db_path.display());
    }

    Ok(registry)
}

fn discover_tables(store: &SqliteStore) -> Result<Vec<TableConfig>> {
    let mut stmt = store.connection().prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let tables = names
        .into_iter()
        .filter(|name| {
            TableEntity::new(name.as_str())
                .and_then(|entity| entity.verify(store))
                .is_ok()
        })
        .map(|name| TableConfig {
            name,
            sync_up: true,
        })
        .collect();

    Ok(tables)
}

/// `init-table <name> [columns...]`
///
/// # Errors
///
/// Returns error if the table cannot be created.
pub fn init_table(config: &CliConfig, name: &str, columns: &[String]) -> Result<String> {
    let store = open_store(config)?;
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    store.create_sync_table(name, &columns)?;
    Ok(format!("Created sync table '{name}'"))
}

/// `pull [since]`
///
/// # Errors
///
/// Returns error if the watermark is malformed or any table fails.
pub fn pull(config: &CliConfig, since: Option<&str>) -> Result<String> {
    let store = open_store(config)?;
    let registry = build_registry(config, &store)?;

    let request = match since {
        Some(since) => PullRequest::since(
            since
                .parse::<Watermark>()
                .with_context(|| format!("Invalid watermark '{since}'"))?,
        ),
        None => PullRequest::default(),
    };

    let response = handle_pull(&registry, &request, &store)?;
    Ok(serde_json::to_string_pretty(&response)?)
}

/// `push <file> [last_pushed_at]`
///
/// # Errors
///
/// Returns error if the file is unreadable or malformed, or any table fails.
pub fn push(config: &CliConfig, file: &Path, last_pushed_at: Option<&str>) -> Result<String> {
    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut request = PushRequest::from_json(&bytes)
        .with_context(|| format!("Invalid push request in {}", file.display()))?;

    if let Some(value) = last_pushed_at {
        request.last_pushed_at = value
            .parse()
            .with_context(|| format!("Invalid watermark '{value}'"))?;
    }

    let mut store = open_store(config)?;
    let registry = build_registry(config, &store)?;
    let response = handle_push(&registry, &request, &mut store)?;
    Ok(serde_json::to_string_pretty(&response)?)
}

/// `tables`
///
/// # Errors
///
/// Returns error if the registry cannot be built.
pub fn tables(config: &CliConfig) -> Result<String> {
    let store = open_store(config)?;
    let registry = build_registry(config, &store)?;

    let lines: Vec<String> = registry
        .names()
        .map(|name| {
            let up = registry.capabilities(name).is_some_and(|c| c.up);
            format!("{name}\t{}", if up { "down+up" } else { "down" })
        })
        .collect();

    Ok(lines.join("\n"))
}
