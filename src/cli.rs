//! CLI argument parsing using Clap.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

/// vehicle-store - versioned JSON record store
#[derive(Parser, Debug)]
#[command(name = "vehicle-store")]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:
  vehicle-store put AB12CDE --field owner='John Doe' --field mileage=42000
  vehicle-store put AB12CDE --json '{\"colour\": \"Red\"}'
  vehicle-store get AB12CDE --snapshot
  vehicle-store check
")]
pub struct Cli {
    /// Record file (defaults to the configured database path)
    #[arg(long, global = true, env = "VEHICLE_STORE_DB")]
    pub db: Option<PathBuf>,

    /// Settings file to load instead of the default
    #[arg(long, global = true, env = "VEHICLE_STORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Lock wait bound in milliseconds (0 waits forever)
    #[arg(long, global = true, env = "VEHICLE_STORE_LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the stored record for KEY
    Get {
        key: String,
        /// Print current field values instead of full history
        #[arg(long)]
        snapshot: bool,
    },

    /// Merge fields into the record for KEY
    Put {
        key: String,
        /// JSON object of fields
        #[arg(long, conflicts_with = "field")]
        json: Option<String>,
        /// NAME=VALUE pair; VALUE is parsed as JSON when possible
        #[arg(long = "field", value_parser = parse_field)]
        field: Vec<(String, Value)>,
    },

    /// Remove the record for KEY
    Delete { key: String },

    /// Record an access event for KEY
    Searched { key: String },

    /// List stored keys
    Keys,

    /// Scan the record file and report problems
    Check,

    /// Drop malformed lines and duplicate keys
    Repair,
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("field name is empty in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
