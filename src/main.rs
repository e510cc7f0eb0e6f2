use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use saferoute::cache::Intercept;
use saferoute::commands::ClientCommand;
use saferoute::event::{self, EventHandler, HostEvent};
use saferoute::http::Request;
use saferoute::outbox::{DrainOutcome, OutboxKind, SyncTrigger};
use saferoute::{Config, Worker, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "saferoute")]
#[command(about = "Offline caching and emergency outbox for the SafeRoute app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./saferoute.yaml, then $XDG_CONFIG_HOME/saferoute/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// App origin, overriding the config file
  #[arg(long)]
  origin: Option<Url>,

  /// Cache version tag, overriding the config file
  #[arg(long = "cache-version")]
  cache_version: Option<String>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the app shell for the configured version
  Install,
  /// Delete superseded cache generations
  Activate,
  /// Run one request through the caching strategies
  Fetch {
    url: Url,
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// Send `Accept: text/html`, as a page navigation does
    #[arg(long)]
    accept_html: bool,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Queue an emergency or location payload
  Store {
    kind: OutboxKind,
    /// JSON payload
    payload: String,
  },
  /// Post a control message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// Drain the outbox
  Sync {
    /// Sync tag to drain (default: everything, ignoring backoff)
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// Show cache generations and pending outbox items
  Status,
  /// Delete every cache generation
  Purge {
    /// Also drop queued outbox items
    #[arg(long)]
    outbox: bool,
  },
  /// Decode a push payload into the notification to display
  Push { payload: Option<String> },
  /// Run the event loop: periodic sync, control messages as JSON lines on
  /// stdin, client events as JSON lines on stdout
  Watch,
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("saferoute=info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "saferoute.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      None
    }
  }
}

fn load_config(args: &Args) -> Result<Config> {
  // Without any config file, --origin alone is enough to run.
  let mut config = match (&args.config, &args.origin) {
    (None, Some(origin)) if Config::find_config_file().is_none() => Config::new(
      origin.clone(),
      args.cache_version.clone().unwrap_or_else(|| "v1".to_string()),
    ),
    _ => Config::load(args.config.as_deref())?,
  };

  if let Some(origin) = &args.origin {
    config.origin = origin.clone();
  }
  if let Some(version) = &args.cache_version {
    config.version = version.clone();
  }
  Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", json);
  Ok(())
}

fn parse_json(input: &str) -> Result<serde_json::Value> {
  serde_json::from_str(input).map_err(|e| eyre!("Invalid JSON: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref());

  let config = load_config(&args)?;
  let worker = Arc::new(Worker::open(config)?);

  match args.command {
    Command::Install => {
      let report = worker.install().await?;
      println!(
        "Cached {} entries in {} ({})",
        report.cached,
        report.generation,
        worker.state()?
      );
    }
    Command::Activate => {
      let report = worker.activate()?;
      println!(
        "Kept {}; deleted {}",
        report.kept.join(", "),
        if report.deleted.is_empty() {
          "nothing".to_string()
        } else {
          report.deleted.join(", ")
        }
      );
    }
    Command::Fetch {
      url,
      method,
      accept_html,
      data,
    } => {
      let mut request = Request::new(method, url);
      if accept_html {
        request = request.with_header("Accept", "text/html");
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }

      let (response, source) = match worker.fetch(request).await {
        Intercept::Respond(served) => (served.response, format!("{:?}", served.source)),
        Intercept::PassThrough(request) => {
          (worker.pass_through(&request).await, "PassThrough".into())
        }
      };
      eprintln!("{} ({})", response.status, source);
      std::io::stdout()
        .write_all(&response.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?;
    }
    Command::Store { kind, payload } => {
      let item = worker.store(kind, &parse_json(&payload)?)?;
      println!("Queued {} item {}", item.kind, item.id);
    }
    Command::Message { json } => {
      let outcome = worker.handle_message(&parse_json(&json)?)?;
      println!("{:?}", outcome);
    }
    Command::Sync { tag } => {
      let trigger = tag.map(SyncTrigger::Tag).unwrap_or(SyncTrigger::Now);
      match worker.sync(trigger).await? {
        DrainOutcome::Completed(report) => {
          println!("Synced {} item(s)", report.synced);
          if !report.failed.is_empty() {
            println!("Still queued after failure: {:?}", report.failed);
          }
        }
        DrainOutcome::Coalesced => println!("A sync was already running"),
      }
    }
    Command::Status => print_json(&worker.status()?)?,
    Command::Purge { outbox } => {
      println!("{:?}", worker.dispatch(ClientCommand::PurgeCaches)?);
      if outbox {
        println!("Dropped {} outbox item(s)", worker.purge_outbox()?);
      }
    }
    Command::Push { payload } => {
      print_json(&worker.push(payload.as_deref().map(str::as_bytes)))?;
    }
    Command::Watch => watch(worker).await?,
  }

  Ok(())
}

async fn watch(worker: Arc<Worker>) -> Result<()> {
  let events = EventHandler::new(Some(worker.config().periodic_sync_interval()));
  let tx = events.sender();

  let mut client = worker.clients().attach();
  tokio::spawn(async move {
    while let Some(event) = client.recv().await {
      match serde_json::to_string(&event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize client event"),
      }
    }
  });

  if worker.state()? != WorkerState::Activated {
    let _ = tx.send(HostEvent::Install);
  }
  // Coming online: flush whatever is queued.
  let _ = tx.send(HostEvent::Sync(SyncTrigger::Now));

  let messages = tx.clone();
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str(&line) {
        Ok(message) => {
          if messages.send(HostEvent::Message(message)).is_err() {
            break;
          }
        }
        Err(e) => warn!(error = %e, "Ignoring malformed message line"),
      }
    }
  });

  event::run(worker, events, async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(error = %e, "Failed to listen for Ctrl-C");
    }
  })
  .await;

  Ok(())
}
