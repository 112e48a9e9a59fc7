use std::path::PathBuf;

use butler_daemon::{daemon, mcp};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "butlerd", about = "Per-domain butler daemon")]
struct Cli {
    /// Path to butler.toml. Defaults to ./butler.toml, overridable with
    /// BUTLER_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve this butler's tools over stdio JSON-RPC for a CLI runtime.
    McpBridge,
}

fn config_path(cli: &Cli) -> String {
    cli.config
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .or_else(|| std::env::var("BUTLER_CONFIG").ok())
        .unwrap_or_else(|| "butler.toml".to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = config_path(&cli);
    let config = butler_core::config::ButlerConfig::load(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("butlerd={},tower_http=warn", config.log.level).into()),
        )
        .init();

    // The bridge is a plain blocking stdio loop; no runtime needed.
    if matches!(cli.command, Some(Command::McpBridge)) {
        return mcp::run_bridge(&config);
    }

    let config_dir = PathBuf::from(&path)
        .parent()
        .map(|p| p.to_path_buf())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            info!(butler = %config.name, port = config.port, "starting butler daemon");
            let running = daemon::ButlerDaemon::new(config, config_dir, daemon::default_registry())
                .start()
                .await?;

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            running.shutdown().await;
            Ok(())
        })
}
