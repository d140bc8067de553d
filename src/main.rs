use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tasksync::config::Config;
use tasksync::{
  spawn_gateway, ApiClient, ApiExecutor, ContextOptions, DrainOutcome, Fetch, MutationQueue,
  NetFetcher, NetworkMonitor, SqliteStorage, SyncContext, SyncStorage, MAX_RETRIES, PUSH_FLAG,
};

#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(about = "Offline-first sync engine for the task scheduler")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tasksync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Treat the network as unavailable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show pending writes, cached queries, and the push flag
  Status,
  /// Deliver pending writes to the backend
  Sync,
  /// List queued writes in delivery order
  Queue,
  /// Host the sync engine in the foreground until interrupted
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Status => status(&config),
    Command::Sync => sync(&config, args.offline).await,
    Command::Queue => list_queue(&config),
    Command::Run => run(&config, args.offline).await,
  }
}

/// The guard must stay alive for the duration of the program or buffered
/// log lines are lost.
fn init_tracing(
  log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  if let Some(path) = log_file {
    let dir = match path.parent() {
      Some(p) if !p.as_os_str().is_empty() => p,
      _ => Path::new("."),
    };
    let file_name = path
      .file_name()
      .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
    let (writer, guard) =
      tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::registry()
      .with(env_filter)
      .with(
        tracing_subscriber::fmt::layer()
          .compact()
          .with_ansi(false)
          .with_writer(writer),
      )
      .init();
    Ok(Some(guard))
  } else {
    tracing_subscriber::registry()
      .with(env_filter)
      .with(
        tracing_subscriber::fmt::layer()
          .compact()
          .with_level(true)
          .with_target(false)
          .with_writer(std::io::stderr),
      )
      .init();
    Ok(None)
  }
}

fn status(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let pending = storage.load_queue()?;
  let snapshot = storage.load_snapshot()?;
  let push = storage.get_flag(PUSH_FLAG)?;

  println!("API:            {}", config.api.url);
  println!("Pending writes: {}", pending.len());
  println!("Cached queries: {}", snapshot.len());
  println!("Push enabled:   {}", if push { "yes" } else { "no" });
  if let Some(gateway) = &config.gateway {
    println!("Gateway:        {}", gateway.version);
  }
  Ok(())
}

async fn sync(config: &Config, offline: bool) -> Result<()> {
  if offline {
    return Err(eyre!("Cannot sync while offline."));
  }

  let token = Config::get_api_token()?;
  let storage = Arc::new(open_storage(config)?);
  let network = NetworkMonitor::new(true);
  let fetch = Arc::new(NetFetcher::new(config.request_timeout())?);
  let api = ApiClient::new(fetch, config.api_url()?).with_token(token);

  let queue = MutationQueue::new(storage, network)?;
  if queue.is_empty() {
    println!("Nothing to sync.");
    return Ok(());
  }

  println!("Delivering {} pending write(s)...", queue.len());
  let executor = ApiExecutor::new(api);
  match queue.drain(&executor).await? {
    DrainOutcome::Completed { delivered, dropped } => {
      println!("Done: {} delivered, {} dropped.", delivered, dropped);
    }
    DrainOutcome::Aborted {
      delivered,
      dropped,
      error,
    } => {
      println!(
        "Stopped after {} delivered, {} dropped: {}",
        delivered, dropped, error
      );
      println!("{} write(s) still pending; run sync again.", queue.len());
    }
    DrainOutcome::AlreadyRunning => {
      println!("A sync is already running.");
    }
  }
  Ok(())
}

/// Host the full engine: auto-drain on reconnect, query snapshots on the
/// configured cadence, and the response gateway when one is configured.
async fn run(config: &Config, offline: bool) -> Result<()> {
  let token = Config::get_api_token()?;
  let storage = Arc::new(open_storage(config)?);
  let network = NetworkMonitor::new(!offline);
  let fetch: Arc<dyn Fetch> = Arc::new(NetFetcher::new(config.request_timeout())?);

  // With a gateway section present, every API call routes through its cache.
  let mut gateway = None;
  let fetch = match &config.gateway {
    Some(section) => {
      let (handle, join) = spawn_gateway(section.open_store()?, fetch, section.manifest()?);
      let routed: Arc<dyn Fetch> = Arc::new(handle.clone());
      gateway = Some((handle, join));
      routed
    }
    None => fetch,
  };

  let api = ApiClient::new(fetch, config.api_url()?).with_token(token);
  let context = SyncContext::with_options(
    api,
    storage,
    network,
    ContextOptions::from_config(&config.sync),
  )?;

  println!(
    "tasksync running with {} pending write(s); Ctrl-C to stop.",
    context.queue().len()
  );
  tokio::signal::ctrl_c().await?;

  // The context persists its final snapshot on drop; the gateway worker
  // exits once the last handle is gone.
  drop(context);
  if let Some((handle, join)) = gateway {
    drop(handle);
    let _ = join.await;
  }
  println!("Stopped.");
  Ok(())
}

fn list_queue(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let pending = storage.load_queue()?;
  if pending.is_empty() {
    println!("Queue is empty.");
    return Ok(());
  }

  for entry in &pending {
    println!(
      "{}  {:<6} {:<8} {}  (attempt {}/{})",
      entry.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      entry.kind().as_str(),
      entry.entity_type(),
      entry.mutation.entity_id(),
      entry.retry_count,
      MAX_RETRIES,
    );
  }
  Ok(())
}

fn open_storage(config: &Config) -> Result<SqliteStorage> {
  let storage = match &config.sync.db_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  Ok(storage)
}
