use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;

use iplog::config::Config;
use iplog::geolocation;
use iplog::models::ConnectEvent;
use iplog::output::{OutputFormat, OutputHandler};
use iplog::persistence::{self, StorageBackend};
use iplog::tracking::{AddressTracker, HistoryPolicy};

/// Address history command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "iplog", about = "Per-user address history")]
pub enum Cli {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Record one sighting of a user
    Record {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Stable user id
        id: String,
        /// Display name
        name: String,
        /// Address the user connected from
        address: String,
    },
    /// Show a user's address history by display name
    Lookup {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Display name, matched ignoring case
        name: String,
    },
    /// Show the most recent record of a user
    Last {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Stable user id
        id: String,
        /// Also report whether this is the user's current address
        #[structopt(short, long)]
        address: Option<String>,
    },
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        eprintln!("Configuration file not found: {:?}", path);
        eprintln!("Run 'iplog config' to generate a default configuration");
        std::process::exit(1);
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn StorageBackend>, Box<dyn std::error::Error>> {
    Ok(persistence::open_backend(
        &config.storage,
        config.history.max_size,
    )?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::from_args();

    match cli {
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Record {
            config,
            id,
            name,
            address,
        } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            let lookup = if config.features.query_location {
                geolocation::from_config(&config.lookup).unwrap_or_else(|e| {
                    log::warn!("Geolocation unavailable, recording without it: {}", e);
                    None
                })
            } else {
                None
            };

            let tracker = AddressTracker::new(
                store.clone(),
                lookup,
                HistoryPolicy::from_config(&config),
            );
            let result = tracker.record(&ConnectEvent { id, name, address });
            drop(tracker);
            store.shutdown();

            let outcome = result?;
            println!(
                "Recorded {} for {} ({}, {} address(es) in history)",
                outcome.profile.current_address.as_deref().unwrap_or("-"),
                outcome.profile.display_name,
                if outcome.new_address { "new" } else { "known" },
                outcome.profile.history.len()
            );
        }
        Cli::Lookup { config, name } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            let result = store.find_by_name(&name);
            store.shutdown();

            let mut output = OutputHandler::new(
                OutputFormat::from_name(&config.output.format),
                config.output.file_path.clone(),
            )?;
            output.write_lookup(&name, result?.as_ref())?;
        }
        Cli::Last {
            config,
            id,
            address,
        } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;
            let last = store.last_record(&id);
            let recorded = match &address {
                Some(address) => Some(store.is_recorded(&id, address)),
                None => None,
            };
            store.shutdown();

            match last? {
                Some(record) => {
                    println!("Address:    {}", record.address);
                    println!("Location:   {}", record.location.as_deref().unwrap_or("unknown"));
                    println!("ISP:        {}", record.isp.as_deref().unwrap_or("unknown"));
                    println!("First seen: {}", record.first_seen);
                    println!("Last seen:  {}", record.last_seen);
                }
                None => println!("No records for {}", id),
            }
            if let (Some(address), Some(recorded)) = (address, recorded) {
                let verdict = if recorded? { "is" } else { "is not" };
                println!("{} {} the current address of {}", address, verdict, id);
            }
        }
    }

    Ok(())
}
