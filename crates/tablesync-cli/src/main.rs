//! # tablesync CLI
//!
//! Pull and push deltas against a `SQLite` database from the command line.

use anyhow::Result;
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::CliConfig;

fn main() -> Result<()> {
    // Logs go to stderr so command output stays pipeable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let config = CliConfig::from_env()?;
    tracing::debug!(db_path = %config.db_path.display(), timeout = ?config.timeout, "Loaded configuration");

    let output = match args[1].as_str() {
        "init-table" => {
            if args.len() < 3 {
                eprintln!("Usage: tablesync init-table <name> [columns...]");
                std::process::exit(1);
            }
            commands::init_table(&config, &args[2], &args[3..])?
        }
        "pull" => commands::pull(&config, args.get(2).map(String::as_str))?,
        "push" => {
            if args.len() < 3 {
                eprintln!("Usage: tablesync push <file> [last_pushed_at]");
                std::process::exit(1);
            }
            commands::push(&config, Path::new(&args[2]), args.get(3).map(String::as_str))?
        }
        "tables" => commands::tables(&config)?,
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    };

    println!("{output}");
    Ok(())
}

fn print_help() {
    println!(
        r#"tablesync

USAGE:
    tablesync <COMMAND> [OPTIONS]

COMMANDS:
    init-table <name> [columns...]    Create a table carrying the sync columns
    pull [since]                      Print changes since a watermark (ms or RFC 3339)
    push <file> [last_pushed_at]      Apply a push request JSON file
    tables                            List syncable tables and their capabilities
    help                              Show this help message

ENVIRONMENT:
    TABLESYNC_DB_PATH           SQLite database path (default ./tablesync.db)
    TABLESYNC_TIMEOUT_MS        Per-operation deadline, 0 disables (default 30000)
    TABLESYNC_CONFLICT_POLICY   server-wins | client-wins (default server-wins)
    TABLESYNC_TABLES            JSON array of {{"name": ..., "sync_up": bool}}
    RUST_LOG                    Log filter (default info)

EXAMPLES:
    tablesync init-table patients given_name surname
    tablesync pull 2024-01-01T00:00:00Z
    tablesync push changes.json 1704067200000
"#
    );
}
