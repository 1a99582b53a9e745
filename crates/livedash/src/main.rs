//! livedash - local dashboard management
//!
//! Lists, shows, creates, deletes, imports and exports the dashboards stored
//! in the configured local storage directory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use livedash::AppConfig;
use livedash_core::DashboardId;
use livedash_sync::{DashboardRef, ImportMode, SyncEngine};
use tracing::info;

/// Live dashboard client tools
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via LIVEDASH_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List local dashboards
    List,
    /// Print a dashboard document as JSON
    Show { id: String },
    /// Import dashboards from a JSON file (array or export bundle)
    Import {
        file: String,
        /// Remove all local dashboards first
        #[arg(long)]
        replace: bool,
    },
    /// Export all local dashboards (stdout when no file is given)
    Export { file: Option<String> },
    /// Create an empty local dashboard
    Create { name: String },
    /// Delete a local dashboard
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    livedash_telemetry::init_logging()?;

    // CLI arg > LIVEDASH_CONFIG env var > default
    let config_path = AppConfig::resolve_path(args.config);
    let config = AppConfig::load_or_default(&config_path)?;
    info!(
        config_path = %config_path,
        storage_dir = %config.sync.storage_dir.display(),
        "Configuration loaded"
    );

    let engine = SyncEngine::from_config(config.sync.clone())?;

    match args.command {
        Command::List => {
            let summaries = engine.list_local()?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Command::Show { id } => {
            let doc = engine.open_local(&DashboardId::new(id))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Command::Import { file, replace } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {file}"))?;
            let mode = if replace {
                ImportMode::Replace
            } else {
                ImportMode::Merge
            };
            let report = engine.import(&json, mode)?;
            for failure in &report.failures {
                eprintln!("skipped {failure}");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.imported == 0 && report.errors > 0 {
                bail!("no dashboards imported from {file}");
            }
        }
        Command::Export { file } => {
            let bundle = engine.export_local()?;
            match file {
                Some(path) => {
                    std::fs::write(&path, bundle)
                        .with_context(|| format!("Failed to write {path}"))?;
                    info!(path = %path, "Exported dashboards");
                }
                None => println!("{bundle}"),
            }
        }
        Command::Create { name } => {
            let doc = engine.create_local(&name)?;
            println!("{}", doc.id);
        }
        Command::Delete { id } => {
            engine
                .delete(&DashboardRef::Local(DashboardId::new(id)))
                .await?;
        }
    }

    Ok(())
}
