use anyhow::Context;
use cellsync_node::{load_config, CellConfig, CellIdentity, Role};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "cellsync-node", version, about = "CellSync storage cell")]
struct Args {
    /// UDP port this cell listens on; also its identity on the wire.
    #[arg(long)]
    port: u16,

    #[arg(long, value_delimiter = ',', num_args = 0..)]
    neighbors: Vec<u16>,

    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Start already differentiated instead of as a stem cell.
    #[arg(long, value_enum)]
    role: Option<Role>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit log lines as JSON objects.
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl Args {
    fn cell_config(&self) -> anyhow::Result<CellConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => CellConfig::default(),
        };
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.cell_config()?;
    let identity = CellIdentity::new(args.port, args.neighbors.clone());
    let role = args.role.unwrap_or(Role::Stem);

    let handle = cellsync_node::spawn(identity, role, config)
        .await
        .with_context(|| format!("failed to start cell on port {}", args.port))?;

    shutdown_signal().await;
    info!(port = handle.port(), "Shutdown requested");
    handle.stop().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
