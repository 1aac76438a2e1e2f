//! quire server binary
//!
//! ## Usage
//!
//! ```bash
//! # Run with built-in defaults (127.0.0.1:8421, ./notebooks, echo kernel)
//! quire-server
//!
//! # Run from a config script, overriding the port
//! quire-server --config quire.rhai --port 9000
//!
//! # Print the resolved configuration and exit
//! quire-server --config quire.rhai check-config
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quire_kernel::{QuireConfig, load_config, load_config_file};
use quire_server::QuireServer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "quire-server", version, about = "Collaborative notebook server")]
struct Cli {
    /// Rhai config script (defaults are built in).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on.
    #[arg(long, short)]
    port: Option<u16>,

    /// Directory notebooks are stored under.
    #[arg(long)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved configuration and exit.
    CheckConfig,
}

impl Cli {
    fn resolve(&self) -> anyhow::Result<QuireConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => load_config(quire_kernel::config::DEFAULT_CONFIG)
                .context("parsing built-in defaults")?,
        };
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(storage) = &self.storage {
            config.storage.root = storage.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match cli.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => {
            println!("{config:#?}");
            ExitCode::SUCCESS
        }
        None => match run_server(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "server error");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_server(config: QuireConfig) -> anyhow::Result<()> {
    tracing::info!(
        bind = %config.server.bind,
        port = config.server.port,
        storage = %config.storage.root.display(),
        "starting quire server"
    );
    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| format!("creating {}", config.storage.root.display()))?;

    let server = QuireServer::new(config);
    let listener = server.bind().await.context("binding listener")?;
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}
