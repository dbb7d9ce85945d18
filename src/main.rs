use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hubcache::api::{ApiClient, Query};
use hubcache::cache::{CacheManager, CacheStore, SqliteStore};
use hubcache::call_args;
use hubcache::config::{self, BackendKind, Config};
use hubcache::freshness::Predicate;
use hubcache::logging;
use hubcache::sync::{CheckpointStore, StoreCheckpoints};

#[derive(Parser, Debug)]
#[command(name = "hubcache")]
#[command(about = "Cached access to a JSON API, with checkpointed sync state")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hubcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET one or more paths and print the JSON bodies
  Fetch {
    #[arg(required = true)]
    paths: Vec<String>,

    /// Query parameter, repeatable
    #[arg(short, long = "query", value_name = "KEY=VALUE", value_parser = parse_query_pair)]
    query: Vec<(String, String)>,

    /// Bypass the cache for this call
    #[arg(long)]
    no_cache: bool,
  },

  /// Inspect or maintain the response cache
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Inspect or reset checkpoints written by an embedded sync engine
  #[command(subcommand)]
  Checkpoint(CheckpointCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Show backend and entry count
  Stats,
  /// Remove every cached entry
  Clear,
  /// List keys stored longer ago than the given age
  Stale {
    #[arg(long, value_name = "SECS")]
    older_than: u64,
  },
  /// Delete expired rows from the SQLite cache
  Purge,
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
  /// Print the last item a sync engine fully handled
  Show { name: String },
  /// Forget progress so the next sync run starts from the beginning
  Reset { name: String },
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .filter(|(key, _)| !key.is_empty())
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(&config::data_dir()?.join("logs"))?;

  match args.command {
    Command::Fetch {
      paths,
      query,
      no_cache,
    } => fetch(&config, &paths, query.into_iter().collect(), no_cache).await,
    Command::Cache(command) => cache(&config, command).await,
    Command::Checkpoint(command) => checkpoint(command).await,
  }
}

async fn fetch(config: &Config, paths: &[String], query: Query, no_cache: bool) -> Result<()> {
  let token = Config::get_api_token().ok();
  let client = ApiClient::new(&config.api, token)?;

  let bodies = if no_cache {
    try_join_all(paths.iter().map(|path| client.get_json(path, &query))).await?
  } else {
    let api = CacheManager::from_config(&config.cache).wrap(client, "api");
    try_join_all(
      paths
        .iter()
        .map(|path| api.call("get", call_args![path, query])),
    )
    .await?
  };

  for body in bodies {
    let pretty = serde_json::to_string_pretty(&body)
      .map_err(|e| eyre!("Failed to format response: {}", e))?;
    println!("{}", pretty);
  }
  Ok(())
}

async fn cache(config: &Config, command: CacheCommand) -> Result<()> {
  match command {
    CacheCommand::Stats => {
      let manager = CacheManager::from_config(&config.cache);
      let stats = manager.stats().await?;
      println!("backend: {}", manager.store().backend_name());
      match stats.entries {
        Some(n) => println!("entries: {}", n),
        None => println!("entries: unknown"),
      }
      match config.cache.ttl() {
        Some(ttl) => println!("ttl: {}s", ttl.as_secs()),
        None => println!("ttl: none"),
      }
    }
    CacheCommand::Clear => {
      CacheManager::from_config(&config.cache).clear().await?;
      println!("cache cleared");
    }
    CacheCommand::Stale { older_than } => {
      let store = open_sqlite_cache(config)?;
      let predicate = Predicate::stale_since(Duration::from_secs(older_than));
      for key in store.keys_matching(&predicate)? {
        println!("{}", key);
      }
    }
    CacheCommand::Purge => {
      let removed = open_sqlite_cache(config)?.purge_expired()?;
      println!("removed {} expired entries", removed);
    }
  }
  Ok(())
}

fn open_sqlite_cache(config: &Config) -> Result<SqliteStore> {
  match config.cache.backend {
    BackendKind::Sqlite | BackendKind::Tiered => match &config.cache.path {
      Some(path) => SqliteStore::open_at(path),
      None => SqliteStore::open(),
    },
    other => Err(eyre!("This command needs the sqlite or tiered backend, not {:?}", other)),
  }
}

async fn checkpoint(command: CheckpointCommand) -> Result<()> {
  let path = config::data_dir()?.join("checkpoints.db");
  let checkpoints = StoreCheckpoints::new(Arc::new(SqliteStore::open_at(&path)?));

  match command {
    CheckpointCommand::Show { name } => match checkpoints.get(&name).await? {
      Some(checkpoint) => {
        println!("last processed: {}", checkpoint.last_processed_id);
        println!("last edited at: {}", checkpoint.last_edited_at.to_rfc3339());
      }
      None => println!("no checkpoint for {}", name),
    },
    CheckpointCommand::Reset { name } => {
      checkpoints.reset(&name).await?;
      println!("checkpoint {} reset", name);
    }
  }
  Ok(())
}
