use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strainsync::cache::{KeyValueStore, NoopStorage, PersistentCacheStore, SqliteStorage};
use strainsync::catalog::{FilterCriteria, RemoteCatalog, SqliteCatalog};
use strainsync::config::Config;
use strainsync::connectivity::{ConnectivityMonitor, ManualSignal, ProbeSignal};
use strainsync::coordinator::{CoordinatorOptions, QueryCoordinator};
use strainsync::logging;
use strainsync::pagination::InfiniteQuery;
use strainsync::sync::{CatalogDeltaSync, DeltaSyncTrigger};

/// Longer than the probe's connect timeout, so one full probe can finish.
const FIRST_READING_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Parser, Debug)]
#[command(name = "strainsync")]
#[command(about = "Query a strain catalog online or offline and keep a local mirror in sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/strainsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep query results in memory only
  #[arg(long)]
  no_persist: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch one page (or all pages) of a filtered query as JSON
  Query(QueryArgs),
  /// Pull remote changes into the local catalog
  Sync,
  /// Remove persisted query results
  ClearCache,
  /// Track connectivity and sync on every reconnect until Ctrl-C
  Watch,
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
  #[arg(short, long)]
  search: Option<String>,
  #[arg(long)]
  species: Option<String>,
  #[arg(long)]
  effect: Option<String>,
  #[arg(long)]
  flavor: Option<String>,
  #[arg(long)]
  min_thc: Option<f64>,
  #[arg(long)]
  max_thc: Option<f64>,
  /// 1-based page to fetch
  #[arg(short, long, default_value_t = 1, conflicts_with = "all")]
  page: u32,
  /// Fetch every page
  #[arg(long)]
  all: bool,
  /// Stop after this many pages with --all
  #[arg(long, default_value_t = 50)]
  max_pages: u32,
  #[arg(long)]
  page_size: Option<u32>,
  /// Read from the local catalog without touching the network
  #[arg(long)]
  offline: bool,
}

impl QueryArgs {
  fn criteria(&self, default_page_size: u32) -> FilterCriteria {
    let mut criteria = FilterCriteria::new(self.page_size.unwrap_or(default_page_size))
      .with_thc_range(self.min_thc, self.max_thc);
    if let Some(search) = &self.search {
      criteria = criteria.with_search(search);
    }
    if let Some(species) = &self.species {
      criteria = criteria.with_species(species);
    }
    if let Some(effect) = &self.effect {
      criteria = criteria.with_effect(effect);
    }
    if let Some(flavor) = &self.flavor {
      criteria = criteria.with_flavor(flavor);
    }
    criteria
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _log_guard = logging::init(&data_dir.join("logs"));

  let remote = RemoteCatalog::new(&config.remote)?;
  let local = SqliteCatalog::open(&data_dir.join("catalog.db"))?;

  match args.command {
    Command::Query(query) => {
      let monitor = if query.offline {
        let signal = ManualSignal::new();
        signal.set(false);
        ConnectivityMonitor::start(&signal)
      } else {
        probe_monitor(&config)
      };

      if args.no_persist {
        let store = PersistentCacheStore::new(NoopStorage, config.cache.buster());
        run_query(&config, remote, local, monitor, store, &query).await
      } else {
        let storage = SqliteStorage::open(&data_dir.join("cache.db"))?;
        let store = PersistentCacheStore::new(storage, config.cache.buster())
          .with_max_age(config.cache.max_age());
        run_query(&config, remote, local, monitor, store, &query).await
      }
    }
    Command::Sync => {
      let written = CatalogDeltaSync::new(remote, local.clone()).sync_now().await?;
      println!("Synced {} records ({} total)", written, local.count()?);
      Ok(())
    }
    Command::ClearCache => {
      let storage = SqliteStorage::open(&data_dir.join("cache.db"))?;
      PersistentCacheStore::new(storage, config.cache.buster())
        .clear()
        .await;
      println!("Query cache cleared");
      Ok(())
    }
    Command::Watch => watch(&config, remote, local).await,
  }
}

fn probe_monitor(config: &Config) -> ConnectivityMonitor {
  let interval = Duration::from_secs(config.connectivity.probe_interval_secs.max(1));
  match ProbeSignal::for_url(&config.remote.url, interval) {
    Some(signal) => ConnectivityMonitor::start(&signal),
    None => {
      tracing::warn!(url = %config.remote.url, "cannot probe remote host, assuming online");
      ConnectivityMonitor::start(&ManualSignal::new())
    }
  }
}

async fn run_query<S: KeyValueStore>(
  config: &Config,
  remote: RemoteCatalog,
  local: SqliteCatalog,
  monitor: ConnectivityMonitor,
  store: PersistentCacheStore<S>,
  args: &QueryArgs,
) -> Result<()> {
  // The first probe decides the path; unknown would read as online
  if monitor.wait_for_reading(FIRST_READING_TIMEOUT).await.is_none() {
    tracing::warn!("no connectivity reading yet, assuming online");
  }

  let coordinator = QueryCoordinator::new(
    Arc::new(remote),
    Arc::new(local),
    monitor,
    store,
    CoordinatorOptions::from_config(config),
  );
  coordinator.restore().await;

  let criteria = args.criteria(config.query.page_size);
  tracing::info!(key = %criteria.query_key(), page = args.page, all = args.all, "running query");

  let output = if args.all {
    let mut pages = InfiniteQuery::new(coordinator.clone(), criteria);
    let fetched = pages.fetch_all(args.max_pages).await?;
    let items: Vec<_> = pages.items().collect();
    json!({
      "pages": fetched,
      "has_more": pages.has_next_page(),
      "items": items,
    })
  } else {
    let result = coordinator.fetch_page_with_source(&criteria, args.page).await?;
    json!({
      "source": format!("{:?}", result.source),
      "cursor": result.data.cursor,
      "has_more": result.data.has_more,
      "items": result.data.items,
    })
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn watch(config: &Config, remote: RemoteCatalog, local: SqliteCatalog) -> Result<()> {
  let monitor = probe_monitor(config);
  let reconciler = Arc::new(CatalogDeltaSync::new(remote, local));
  let trigger = DeltaSyncTrigger::start(&monitor, reconciler)?;

  let _changes = monitor.subscribe(|online| {
    println!("{}", if online { "online" } else { "offline" });
  });

  println!("Watching connectivity, Ctrl-C to stop");
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  monitor.shutdown();
  println!("Stopped after {} delta syncs", trigger.run_count());
  Ok(())
}
