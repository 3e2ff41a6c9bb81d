//! vehicle-store - command line access to the versioned record store

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use vehicle_store::RecordStore;
use vehicle_store::cli::{Cli, Commands};
use vehicle_store::config::Config;
use vehicle_store::lookup::canonical_key;

fn main() {
    if let Err(err) = main_impl() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn main_impl() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load_at(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path());
    let mut options = config.store_options();
    if let Some(ms) = cli.lock_timeout_ms {
        options.lock_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }

    let store = RecordStore::open_with(&db_path, options)
        .with_context(|| format!("opening record store {}", db_path.display()))?;

    match cli.command {
        Commands::Get { key, snapshot } => {
            let key = canonical_key(&key)?;
            let Some(record) = store.read(&key)? else {
                bail!("no record stored for {key}");
            };
            if snapshot {
                print_json(&record.snapshot())?;
            } else {
                print_json(&record)?;
            }
        }
        Commands::Put { key, json, field } => {
            let key = canonical_key(&key)?;
            let fields = match json {
                Some(raw) => match serde_json::from_str::<Value>(&raw)
                    .context("parsing --json")?
                {
                    Value::Object(map) => map,
                    other => bail!("--json must be an object, got {other}"),
                },
                None => field.into_iter().collect::<Map<String, Value>>(),
            };
            if fields.is_empty() {
                bail!("nothing to write: pass --json or at least one --field");
            }
            store.write(&key, fields)?;
            if let Some(record) = store.read(&key)? {
                print_json(&record)?;
            }
        }
        Commands::Delete { key } => {
            let key = canonical_key(&key)?;
            if !store.delete(&key)? {
                bail!("no record stored for {key}");
            }
        }
        Commands::Searched { key } => {
            let key = canonical_key(&key)?;
            let Some(record) = store.record_search(&key)? else {
                bail!("no record stored for {key}");
            };
            print_json(&record.searched)?;
        }
        Commands::Keys => {
            for key in store.keys() {
                println!("{key}");
            }
        }
        Commands::Check => {
            let report = store.check()?;
            print_json(&report)?;
            if !report.is_clean() {
                bail!("record file has problems; run `vehicle-store repair`");
            }
        }
        Commands::Repair => {
            print_json(&store.repair()?)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
