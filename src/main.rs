use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

use offline_store::cache::{CacheConfig, CacheLayer, CacheStrategy};
use offline_store::config::Config;
use offline_store::logging;
use offline_store::offline::{NetworkQuality, ProbeReport, ServiceAvailability, StatusTracker};

#[derive(Parser, Debug)]
#[command(name = "offline-store")]
#[command(about = "Inspect and maintain an offline-first local data store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-store/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache directory (overrides the config file)
  #[arg(short, long)]
  dir: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the value stored under a key
  Get { key: String },
  /// Store a JSON value under a key
  Set {
    key: String,
    /// JSON value; bare words are stored as strings
    value: String,
    /// Time to live in seconds (default from config)
    #[arg(long)]
    ttl: Option<u64>,
  },
  /// Remove a key
  Remove { key: String },
  /// List live keys
  Keys,
  /// Print cache statistics
  Stats,
  /// Remove expired entries
  Cleanup,
  /// Print the operation mode and sync policy for a connectivity state
  Policy {
    /// Whether the network is reachable
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    reachable: bool,
    /// excellent, good, fair, poor or none
    #[arg(long, default_value = "good", value_parser = parse_enum::<NetworkQuality>)]
    quality: NetworkQuality,
    /// available, degraded, unavailable, maintenance, checking or unknown
    #[arg(long, default_value = "available", value_parser = parse_enum::<ServiceAvailability>)]
    service: ServiceAvailability,
  },
}

/// Parse a snake_case enum through its serde representation.
fn parse_enum<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
  serde_json::from_value(serde_json::Value::String(s.to_lowercase())).map_err(|e| e.to_string())
}

fn level_filter(verbose: u8) -> LevelFilter {
  match verbose {
    0 => LevelFilter::WARN,
    1 => LevelFilter::INFO,
    2 => LevelFilter::DEBUG,
    _ => LevelFilter::TRACE,
  }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn open_cache(config: &Config, dir: PathBuf) -> Result<CacheLayer<String, serde_json::Value>> {
  // One-shot process: only the disk tier outlives it
  let cache_config = CacheConfig {
    strategy: CacheStrategy::DiskOnly,
    cleanup_interval: Duration::ZERO,
    ..config.cache_config()?
  };
  CacheLayer::open(cache_config, Some(dir.clone()))
    .map_err(|e| eyre!("Failed to open cache at {}: {}", dir.display(), e))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(level_filter(args.verbose), config.log_file.as_deref())?;

  let dir = args.dir.clone().unwrap_or_else(|| config.cache_dir());

  match args.command {
    Command::Policy {
      reachable,
      quality,
      service,
    } => {
      let tracker = StatusTracker::new(config.offline_config());
      let status = tracker.apply(ProbeReport {
        reachable,
        quality,
        service,
      });
      print_json(&serde_json::json!({
        "status": status,
        "policy": tracker.policy(),
      }))?;
    }
    Command::Get { key } => {
      let cache = open_cache(&config, dir)?;
      match cache.get(&key)? {
        Some(value) => print_json(&value)?,
        None => return Err(eyre!("Key not found: {}", key)),
      }
      cache.close()?;
    }
    Command::Set { key, value, ttl } => {
      let cache = open_cache(&config, dir)?;
      let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
      cache.set(key, value, ttl.map(Duration::from_secs))?;
      cache.close()?;
    }
    Command::Remove { key } => {
      let cache = open_cache(&config, dir)?;
      if !cache.remove(&key)? {
        eprintln!("Key not found: {}", key);
      }
      cache.close()?;
    }
    Command::Keys => {
      let cache = open_cache(&config, dir)?;
      let mut keys = cache.keys()?;
      keys.sort();
      for key in keys {
        println!("{}", key);
      }
      cache.close()?;
    }
    Command::Stats => {
      let cache = open_cache(&config, dir)?;
      print_json(&cache.stats()?)?;
      cache.close()?;
    }
    Command::Cleanup => {
      let cache = open_cache(&config, dir)?;
      println!("Removed {} expired entries", cache.cleanup()?);
      cache.close()?;
    }
  }

  Ok(())
}
