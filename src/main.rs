use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use fleet_rm::bus::envelope::FIRST_DAEMON_RANK;
use fleet_rm::config::{DaemonConfig, JobLimits, PresenceConfig, SchedulerConfig, DEFAULT_SCHEDULER_PORT};
use fleet_rm::dashboard::{run_dashboard, DashboardState};
use fleet_rm::job::{AppSpec, JobSpec};
use fleet_rm::node::{query_status, run_daemon, run_scheduler, LocalCluster};
use fleet_rm::presence::NodeInfo;
use fleet_rm::shutdown::install_shutdown_handler;
use fleet_rm::status::ClusterStatus;

#[derive(Parser, Debug)]
#[command(name = "fleet-rm")]
#[command(version)]
#[command(about = "A cluster resource manager with daemon-level failure recovery")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler
    Scheduler(SchedulerArgs),

    /// Run a per-node daemon
    Daemon(DaemonArgs),

    /// Print the scheduler's view of the cluster
    Status(StatusArgs),

    /// Run a whole cluster in-process with simulated workers
    Sim(SimArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug, Clone)]
struct PresenceArgs {
    /// Heartbeat interval in milliseconds (0 disables failure detection)
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Quiet period in milliseconds before bootstrap completes
    #[arg(long, default_value = "3000")]
    wireup_ms: u64,
}

impl From<PresenceArgs> for PresenceConfig {
    fn from(args: PresenceArgs) -> Self {
        Self {
            heartbeat_interval_ms: args.heartbeat_ms,
            wireup_timeout_ms: args.wireup_ms,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Scheduler Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SchedulerArgs {
    /// Job family (cluster instance) id
    #[arg(long, default_value = "1")]
    family: u32,

    /// UDP port to listen on
    #[arg(long, default_value_t = DEFAULT_SCHEDULER_PORT)]
    port: u16,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Milliseconds launched processes have to report running
    #[arg(long, default_value = "10000")]
    launch_timeout_ms: u64,

    /// Node names whose daemons are expected (comma-separated)
    #[arg(long, value_delimiter = ',')]
    expect: Vec<String>,

    /// Largest number of processes one job may ask for
    #[arg(long, default_value = "16384")]
    max_procs_per_job: u32,

    /// Processes per launch instruction
    #[arg(long, default_value = "256")]
    launch_batch: usize,

    /// Drained jobs kept for status queries
    #[arg(long, default_value = "128")]
    finished_retention: usize,

    /// Job description files to submit once bootstrap completes
    #[arg(long)]
    job: Vec<PathBuf>,

    #[command(flatten)]
    presence: PresenceArgs,
}

// =============================================================================
// Daemon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DaemonArgs {
    /// Job family (cluster instance) id
    #[arg(long, default_value = "1")]
    family: u32,

    /// Daemon rank, unique within the family
    #[arg(long, default_value_t = FIRST_DAEMON_RANK)]
    rank: u32,

    /// Node name (defaults to the host name)
    #[arg(long)]
    node: Option<String>,

    /// Process slots on this node (defaults to available parallelism)
    #[arg(long)]
    slots: Option<u32>,

    /// Scheduler address
    #[arg(long, short = 's', default_value = "127.0.0.1:47000")]
    scheduler: SocketAddr,

    /// UDP port to listen on (0 picks one)
    #[arg(long, default_value = "0")]
    port: u16,

    #[command(flatten)]
    presence: PresenceArgs,
}

// =============================================================================
// Status Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Scheduler address
    #[arg(long, short = 's', default_value = "127.0.0.1:47000")]
    scheduler: SocketAddr,

    /// Job family (cluster instance) id
    #[arg(long, default_value = "1")]
    family: u32,

    /// How long to wait for the answer, in milliseconds
    #[arg(long, default_value = "3000")]
    timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Simulation Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SimArgs {
    /// Number of simulated daemons
    #[arg(long, default_value = "3")]
    daemons: u32,

    /// Worker processes in the demo job
    #[arg(long, default_value = "4")]
    procs: u32,

    /// Crash the first daemon after this many seconds
    #[arg(long)]
    crash_after_secs: Option<u64>,

    /// Stop after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    #[command(flatten)]
    presence: PresenceArgs,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn dashboard_addr(port: Option<u16>) -> Result<Option<SocketAddr>, Box<dyn std::error::Error>> {
    Ok(match port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    })
}

fn print_status(status: &ClusterStatus) {
    println!("Cluster Status");
    println!("{}", "=".repeat(40));
    println!(
        "Bootstrap: {}",
        if status.bootstrapped { "complete" } else { "in progress" }
    );
    println!();

    println!("Daemons:");
    println!("{:<12} {:<16} {:<18} CONTACT", "IDENTITY", "NODE", "STATE");
    println!("{}", "-".repeat(64));
    for daemon in &status.daemons {
        println!(
            "{:<12} {:<16} {:<18} {}",
            daemon.identity.to_string(),
            daemon.node,
            daemon.state.to_string(),
            daemon.contact.as_deref().unwrap_or("-")
        );
    }
    println!();

    println!("Nodes:");
    println!("{:<16} {:<14} {:<6} HOSTED", "NAME", "STATE", "SLOTS");
    println!("{}", "-".repeat(46));
    for node in &status.nodes {
        println!(
            "{:<16} {:<14} {:<6} {}",
            node.name,
            node.state.to_string(),
            node.slots,
            node.hosted
        );
    }
    println!();

    let jobs: Vec<_> = status.jobs.iter().chain(status.finished.iter()).collect();
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    println!("Processes:");
    println!(
        "{:<10} {:<18} {:<12} {:<18} {:<16} {:<8} RESTARTS",
        "PROCESS", "JOB STATE", "APP", "STATE", "NODE", "PID"
    );
    println!("{}", "-".repeat(96));
    for job in jobs {
        for proc in &job.procs {
            println!(
                "{:<10} {:<18} {:<12} {:<18} {:<16} {:<8} {}",
                format!("{}.{}", job.id, proc.rank),
                job.state.to_string(),
                proc.app,
                proc.state.to_string(),
                proc.node.as_deref().unwrap_or("-"),
                proc.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                proc.restarts
            );
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_scheduler(args: SchedulerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let token = install_shutdown_handler()?;

    let mut jobs = Vec::with_capacity(args.job.len());
    for path in &args.job {
        jobs.push(JobSpec::load(path)?);
    }

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut config = SchedulerConfig::new(args.family, listen_addr)
        .with_presence(args.presence.into())
        .with_launch_timeout(args.launch_timeout_ms)
        .with_limits(JobLimits {
            max_procs_per_job: args.max_procs_per_job,
            launch_batch: args.launch_batch.max(1),
            finished_retention: args.finished_retention,
        });
    for node in args.expect {
        config = config.with_expected_node(node);
    }
    if let Some(addr) = dashboard_addr(args.dashboard_port)? {
        config = config.with_dashboard(addr);
    }

    tracing::info!(
        family = config.family,
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        jobs = jobs.len(),
        "Starting fleet-rm scheduler"
    );

    run_scheduler(config, jobs, token).await?;
    Ok(())
}

async fn handle_daemon(args: DaemonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let token = install_shutdown_handler()?;

    let local = NodeInfo::local();
    let node = NodeInfo::new(
        args.node.unwrap_or(local.hostname),
        args.slots.unwrap_or(local.slots),
    );
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = DaemonConfig::new(args.family, args.rank, node)
        .with_scheduler(args.scheduler)
        .with_listen_addr(listen_addr)
        .with_presence(args.presence.into());

    tracing::info!(
        family = config.family,
        rank = config.rank,
        node = %config.node.hostname,
        scheduler = %config.scheduler_addr,
        "Starting fleet-rm daemon"
    );

    run_daemon(config, token).await?;
    Ok(())
}

async fn handle_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let status = query_status(args.scheduler, args.family, Duration::from_millis(args.timeout_ms)).await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => print_status(&status),
    }
    Ok(())
}

async fn handle_sim(args: SimArgs) -> Result<(), Box<dyn std::error::Error>> {
    let token = install_shutdown_handler()?;

    let presence: PresenceConfig = args.presence.into();
    let config = SchedulerConfig::default().with_presence(presence.clone());
    let mut cluster = LocalCluster::start(config);

    let mut identities = Vec::new();
    for i in 0..args.daemons {
        identities.push(cluster.add_daemon(&format!("sim{}", i), args.procs.max(1)));
    }

    if let Some(addr) = dashboard_addr(args.dashboard_port)? {
        let state = DashboardState {
            scheduler: cluster.scheduler.clone(),
        };
        tokio::spawn(async move {
            run_dashboard(addr, state).await;
        });
    }

    let spec = JobSpec::new(
        "sim",
        vec![AppSpec::new("worker", vec!["worker".into()], args.procs).with_restarts(3, 1)],
    );
    let job = cluster.scheduler.submit(spec).await?;
    tracing::info!(job, daemons = args.daemons, procs = args.procs, "Simulated cluster running");

    let crash_at = args.crash_after_secs.map(Duration::from_secs);
    let stop_at = args.duration_secs.map(Duration::from_secs);
    let started = tokio::time::Instant::now();
    let mut report = tokio::time::interval(Duration::from_millis(presence.wireup_timeout_ms.max(1000)));
    let mut crashed = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = report.tick() => {
                let elapsed = started.elapsed();
                if let (Some(at), false) = (crash_at, crashed) {
                    if elapsed >= at {
                        if let Some(victim) = identities.first() {
                            cluster.crash_daemon(*victim);
                        }
                        crashed = true;
                    }
                }
                print_status(&cluster.scheduler.status().await?);
                println!();
                if stop_at.is_some_and(|at| elapsed >= at) {
                    break;
                }
            }
        }
    }

    cluster.shutdown().await;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Scheduler(args) => handle_scheduler(args).await?,
        Commands::Daemon(args) => handle_daemon(args).await?,
        Commands::Status(args) => handle_status(args).await?,
        Commands::Sim(args) => handle_sim(args).await?,
    }

    Ok(())
}
