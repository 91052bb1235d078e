//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `recordkit_core` linkage.
//! - Open a store from a model bundle and print per-kind entity counts.
//!
//! Usage: `recordkit_cli [--data-dir DIR] [--resources DIR] [--log-dir DIR]
//! [--destroy] <model_name> <store_file_name>`

use clap::Parser;
use log::info;
use recordkit_core::{Predicate, StoreConfig, StoreManager};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "recordkit_cli", version, about = "Open a recordkit store and print entity counts")]
struct Args {
    /// Directory holding the store file; defaults to the documents directory.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Directory holding `<model>.model.json`.
    #[arg(long = "resources", value_name = "DIR")]
    resource_dir: Option<PathBuf>,
    /// Absolute directory for rolling log files.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// Delete the store file instead of opening it.
    #[arg(long, requires = "model_name")]
    destroy: bool,
    #[arg(requires = "store_file_name")]
    model_name: Option<String>,
    store_file_name: Option<String>,
}

fn run(args: Args) -> Result<(), String> {
    if let Some(log_dir) = &args.log_dir {
        recordkit_core::init_logging(recordkit_core::default_log_level(), log_dir)
            .map_err(|err| err.to_string())?;
    }

    let (Some(model_name), Some(store_file_name)) = (&args.model_name, &args.store_file_name)
    else {
        return Err("expected <model_name> <store_file_name>".to_string());
    };

    let mut config = StoreConfig::new(model_name.as_str(), store_file_name.as_str());
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(dir) = &args.resource_dir {
        config = config.with_resource_dir(dir);
    }

    let manager = StoreManager::new();
    manager.configure(config);
    if args.destroy {
        manager.destroy();
        println!("store destroyed");
        return Ok(());
    }

    let store = manager.store().map_err(|err| err.to_string())?;
    let ctx = manager
        .main_context()
        .ok_or_else(|| "store opened without a main context".to_string())?;
    info!(
        "event=cli_open module=cli status=ok model={} kinds={}",
        store.model().name,
        store.model().entities.len()
    );

    for entity in &store.model().entities {
        let repo = store.repository(&entity.kind).map_err(|err| err.to_string())?;
        let count = repo
            .count(&Predicate::True, &ctx)
            .map_err(|err| err.to_string())?;
        println!("{} count={}", entity.kind, count);
    }
    Ok(())
}

fn main() -> ExitCode {
    println!("recordkit_core version={}", recordkit_core::core_version());
    let args = Args::parse();
    if args.model_name.is_none() {
        return ExitCode::SUCCESS;
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
