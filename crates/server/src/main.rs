use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zona_live::{ArrivalNotifier, HttpClient, MapSession};
use zona_protocol::Event;
use zona_server::{format_log_line, Config, LogBacklog};

#[derive(Debug, Parser)]
#[command(name = "zona-server", version, about = "Zona tactical map server")]
struct Cli {
    /// YAML config file; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the API, change stream and pages (default).
    Serve(ServeArgs),
    /// Follow a running server's event log from the terminal.
    Watch(WatchArgs),
}

#[derive(Debug, Default, clap::Args)]
struct ServeArgs {
    #[arg(long)]
    addr: Option<SocketAddr>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    allow_remote: bool,
    /// Leave an empty database empty.
    #[arg(long)]
    no_seed: bool,
}

#[derive(Debug, clap::Args)]
struct WatchArgs {
    #[arg(long, default_value = "http://127.0.0.1:39333")]
    url: String,
    /// Seconds to wait before re-subscribing after the stream drops.
    #[arg(long, default_value_t = 3)]
    retry_secs: u64,
    /// Ring the terminal bell on each arrival.
    #[arg(long)]
    bell: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("zona_server=info,zona_live=info,zona_engine=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            let mut config = Config::load_or_default(cli.config.as_deref())?;
            if let Some(addr) = args.addr {
                config.addr = addr;
            }
            if let Some(db) = args.db {
                config.db_path = db;
            }
            config.allow_remote |= args.allow_remote;
            config.seed_demo &= !args.no_seed;
            zona_server::serve(config).await
        }
        Command::Watch(args) => watch(args).await,
    }
}

struct LogPrinter {
    bell: bool,
}

impl ArrivalNotifier for LogPrinter {
    fn event_arrived(&self, event: &Event) {
        let mut out = std::io::stdout().lock();
        let bell = if self.bell { "\x07" } else { "" };
        let _ = writeln!(out, "{bell}{}", format_log_line(event));
        let _ = out.flush();
    }
}

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let client = Arc::new(HttpClient::new(args.url.trim_end_matches('/')));
    let notifier: Arc<dyn ArrivalNotifier> = Arc::new(LogPrinter { bell: args.bell });
    let retry = Duration::from_secs(args.retry_secs.max(1));
    let mut backlog = LogBacklog::default();

    loop {
        let session = MapSession::spawn(client.clone(), notifier.clone());
        let mut state = session.state();
        tracing::info!(url = %client.base_url(), "watching");

        let ended = async {
            while state.changed().await.is_ok() {
                let lines = backlog.take(&state.borrow_and_update());
                for line in lines {
                    println!("{line}");
                }
            }
        };
        tokio::select! {
            _ = ended => {}
            _ = tokio::signal::ctrl_c() => {
                session.unmount();
                return Ok(());
            }
        }
        session.unmount();
        tracing::warn!(retry_secs = retry.as_secs(), "change stream ended; resubscribing");
        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
