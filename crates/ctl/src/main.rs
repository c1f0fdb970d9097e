mod client;
mod supervisor;

use anyhow::{anyhow, Context, Result};
use cellsync_node::{UdpTransport, MAX_DATAGRAM};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use supervisor::{default_node_bin, ClusterSpec, Supervisor};

const DEFAULT_PORTS: [u16; 4] = [5000, 5001, 5002, 5003];
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Parser, Debug)]
#[command(
    name = "cellsync-ctl",
    version,
    about = "CellSync cluster supervisor and client tools"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a local cluster until interrupted.
    Cluster(ClusterArgs),
    Upload(UploadArgs),
    Fetch(FetchArgs),
    /// Send a chunk whose payload no longer matches its hash.
    Inject(InjectArgs),
    /// Tell one cell to corrupt and spread its own data.
    Sabotage(SabotageArgs),
}

#[derive(Parser, Debug)]
struct ClusterArgs {
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_PORTS)]
    ports: Vec<u16>,

    #[arg(long)]
    node_bin: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    storage_root: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Randomly kill and revive cells every few seconds.
    #[arg(long, default_value_t = false)]
    chaos: bool,

    #[arg(long, default_value_t = 10)]
    status_every_secs: u64,

    /// Keep cell output in the log buffer without echoing it.
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

#[derive(Parser, Debug)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_PORTS)]
    ports: Vec<u16>,

    #[arg(long, default_value_t = 2)]
    redundancy: usize,

    #[arg(long, default_value_t = cellsync_client_sdk::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[arg(long, default_value_t = client::CLIENT_PORT)]
    client_port: u16,

    #[arg(long, default_value_t = 10)]
    pace_ms: u64,

    #[arg(long)]
    report_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct FetchArgs {
    #[arg(long)]
    filename: String,

    #[arg(long)]
    total: u64,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_PORTS)]
    ports: Vec<u16>,

    #[arg(long, default_value = "recovered.bin")]
    out: PathBuf,

    #[arg(long, default_value_t = client::CLIENT_PORT)]
    client_port: u16,

    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    #[arg(long)]
    report_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InjectArgs {
    #[arg(long)]
    file: PathBuf,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_PORTS)]
    ports: Vec<u16>,

    #[arg(long, default_value_t = client::CLIENT_PORT)]
    client_port: u16,
}

#[derive(Parser, Debug)]
struct SabotageArgs {
    #[arg(long)]
    target: u16,

    #[arg(long, default_value_t = 0)]
    client_port: u16,
}

#[derive(Debug, Serialize)]
struct OperationReport {
    operation: String,
    ok: bool,
    timestamp_ms: i64,
    details: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Cluster(cluster) => run_cluster(cluster).await,
        Commands::Upload(upload) => run_upload(upload).await,
        Commands::Fetch(fetch) => run_fetch(fetch).await,
        Commands::Inject(inject) => run_inject(inject).await,
        Commands::Sabotage(sabotage) => run_sabotage(sabotage).await,
    }
}

async fn run_cluster(args: ClusterArgs) -> Result<()> {
    let ports = dedup_ports(&args.ports);
    if ports.is_empty() {
        return Err(anyhow!("at least one port is required"));
    }
    let spec = ClusterSpec {
        ports: ports.clone(),
        node_bin: args.node_bin.unwrap_or_else(default_node_bin),
        storage_root: args.storage_root,
        config: args.config,
    };
    let mut supervisor = Supervisor::new(spec);
    if args.quiet {
        supervisor = supervisor.quiet();
    }
    supervisor.wipe_storage()?;
    for port in &ports {
        supervisor.start(*port)?;
    }
    print_status(&mut supervisor)?;

    let mut rng = StdRng::from_entropy();
    let mut status_tick = tokio::time::interval(Duration::from_secs(args.status_every_secs.max(1)));
    status_tick.tick().await;
    let chaos_delay = |rng: &mut StdRng| Duration::from_millis(rng.gen_range(3_000..=6_000));
    let chaos = tokio::time::sleep(chaos_delay(&mut rng));
    tokio::pin!(chaos);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status_tick.tick() => print_status(&mut supervisor)?,
            _ = &mut chaos, if args.chaos => {
                if let Err(e) = supervisor.chaos_step(&mut rng).await {
                    tracing::warn!(error = %e, "Chaos step failed");
                }
                chaos.as_mut().reset(tokio::time::Instant::now() + chaos_delay(&mut rng));
            }
        }
    }

    supervisor.stop_all().await;
    println!("cluster stopped log_lines={}", supervisor.logs().len());
    Ok(())
}

fn print_status(supervisor: &mut Supervisor) -> Result<()> {
    let status = supervisor.status();
    println!("cluster status {}", serde_json::to_string(&status)?);
    Ok(())
}

async fn run_upload(args: UploadArgs) -> Result<()> {
    let ports = dedup_ports(&args.ports);
    let chunks = cellsync_client_sdk::chunk_file(&args.file, args.chunk_size)?;
    let plan = cellsync_client_sdk::distribute(&chunks, &ports, args.redundancy)?;
    let filename = chunks
        .first()
        .map(|c| c.filename.clone())
        .unwrap_or_default();

    let transport = bind_client(args.client_port).await?;
    let sent = client::upload(&transport, &plan, Duration::from_millis(args.pace_ms)).await?;
    let replicas = args.redundancy.min(ports.len());
    println!(
        "upload complete file={} chunks={} replicas={} datagrams={}",
        filename,
        chunks.len(),
        replicas,
        sent
    );
    if let Some(path) = &args.report_out {
        let placement: BTreeMap<u16, Vec<&str>> = plan
            .assignments
            .iter()
            .map(|(port, records)| (*port, records.iter().map(|r| r.id.as_str()).collect()))
            .collect();
        write_report(
            path,
            "upload",
            true,
            serde_json::json!({
                "filename": filename,
                "total_chunks": chunks.len(),
                "replicas": replicas,
                "placement": placement,
            }),
        )?;
    }
    Ok(())
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let ports = dedup_ports(&args.ports);
    let transport = bind_client(args.client_port).await?;
    let fetched = client::fetch(
        &transport,
        &args.filename,
        args.total,
        &ports,
        Duration::from_secs(args.timeout_secs),
    )
    .await;

    let chunks = match fetched {
        Ok(chunks) => chunks,
        Err(e) => {
            if let Some(path) = &args.report_out {
                write_report(path, "fetch", false, serde_json::json!({ "error": e.to_string() }))?;
            }
            return Err(e);
        }
    };
    cellsync_client_sdk::reconstruct_file(&chunks, &args.out)?;
    println!(
        "fetch complete file={} chunks={} out={}",
        args.filename,
        chunks.len(),
        args.out.display()
    );
    if let Some(path) = &args.report_out {
        write_report(
            path,
            "fetch",
            true,
            serde_json::json!({
                "filename": args.filename,
                "chunks": chunks.len(),
                "out": args.out,
            }),
        )?;
    }
    Ok(())
}

async fn run_inject(args: InjectArgs) -> Result<()> {
    let ports = dedup_ports(&args.ports);
    let mut chunks =
        cellsync_client_sdk::chunk_file(&args.file, cellsync_client_sdk::DEFAULT_CHUNK_SIZE)?;
    let corrupted = client::inject_corruption(&mut chunks)
        .ok_or_else(|| anyhow!("{} is empty, nothing to corrupt", args.file.display()))?
        .clone();

    let transport = bind_client(args.client_port).await?;
    client::send_corrupted(&transport, &corrupted, &ports).await;
    println!(
        "inject sent chunk={} declared_hash={} from_port={} targets={:?}",
        corrupted.id,
        corrupted.hash,
        transport.port(),
        ports
    );
    Ok(())
}

async fn run_sabotage(args: SabotageArgs) -> Result<()> {
    let transport = bind_client(args.client_port).await?;
    client::sabotage(&transport, args.target).await?;
    println!("sabotage sent target={}", args.target);
    Ok(())
}

async fn bind_client(port: u16) -> Result<UdpTransport> {
    UdpTransport::bind(LOCALHOST, port, MAX_DATAGRAM)
        .await
        .with_context(|| format!("failed to bind client port {port}"))
}

fn dedup_ports(ports: &[u16]) -> Vec<u16> {
    let mut out = Vec::new();
    for port in ports {
        if !out.contains(port) {
            out.push(*port);
        }
    }
    out
}

fn write_report(path: &Path, operation: &str, ok: bool, details: serde_json::Value) -> Result<()> {
    let report = OperationReport {
        operation: operation.to_string(),
        ok,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        details,
    };
    fs::write(path, serde_json::to_vec_pretty(&report)?)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(())
}
