use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use mimalloc::MiMalloc;

use vmward::activity::ActivityDetector;
use vmward::config::Settings;
use vmward::hypervisor::{Hypervisor, VmHandle};
use vmward::observability::logging::{self, LogFormat};
use vmward::pressure::SysinfoMetrics;
use vmward::progress::LogSink;
use vmward::readiness::{Operation, ReadinessProber};
use vmward::watchdog::Watchdog;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(
    name = "vmward",
    version,
    about = "VMware Workstation pool warden: provisioning and idle reclamation"
)]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON logs instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the idle-reclamation watchdog in the foreground
    Serve,
    /// One-shot host pressure sample and running-VM listing
    Status,
    /// List snapshots of a VM
    Snapshots {
        /// VM name (alias or directory under vm_root)
        #[arg(long)]
        vm: String,
    },
    /// Revert a VM to a snapshot and wait until it is RDP-reachable
    Revert {
        #[arg(long)]
        vm: String,
        #[arg(long)]
        snapshot: String,
    },
    /// Power on a VM if needed and wait until it is RDP-reachable
    Connect {
        #[arg(long)]
        vm: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    let settings = Arc::new(Settings::load(cli.config.as_deref())?);
    which::which(&settings.vmrun_path)
        .with_context(|| format!("vmrun not found at '{}'", settings.vmrun_path.display()))?;
    let hv = Hypervisor::new(Arc::clone(&settings));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        match cli.command {
            Commands::Serve => serve(hv).await,
            Commands::Status => status(hv, cli.json).await,
            Commands::Snapshots { vm } => snapshots(hv, &settings, &vm).await,
            Commands::Revert { vm, snapshot } => {
                provision(hv, &settings, &vm, Operation::Revert { snapshot }).await
            }
            Commands::Connect { vm } => provision(hv, &settings, &vm, Operation::Connect).await,
        }
    })
}

async fn serve(hv: Hypervisor) -> Result<()> {
    if !hv.settings().idle.enabled {
        anyhow::bail!("idle watchdog is disabled in config ([idle] enabled = false)");
    }
    let detector = Arc::new(ActivityDetector::new(hv.clone()));
    let watchdog = Watchdog::new(hv, detector, SysinfoMetrics::new());
    watchdog.run().await;
    Ok(())
}

async fn status(hv: Hypervisor, json: bool) -> Result<()> {
    use vmward::pressure::PressureMonitor;

    let mut monitor = PressureMonitor::new(
        SysinfoMetrics::new(),
        hv.settings().resources.clone(),
    );
    // Prime the CPU counter: the first sysinfo reading is meaningless.
    let _ = monitor.sample();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    let snapshot = monitor.sample();

    if json {
        let running = hv.list_running().await?;
        let doc = serde_json::json!({
            "pressure": snapshot,
            "running": running,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let mem = format!("{:.2} GB", snapshot.available_mem_gb);
    let cpu = format!("{:.1}%", snapshot.cpu_used_pct);
    println!("available memory: {}", mem.cyan());
    println!("cpu used:         {}", cpu.cyan());
    println!(
        "pressure:         {}",
        if snapshot.pressure {
            "yes".red().bold().to_string()
        } else {
            "no".green().to_string()
        }
    );

    let running = hv.list_running().await?;
    println!("running VMs:      {}", running.len());
    for vm in &running {
        println!("  {}  {}", vm.name().bold(), vm.vmx().display());
    }
    Ok(())
}

async fn snapshots(hv: Hypervisor, settings: &Settings, name: &str) -> Result<()> {
    let vm = VmHandle::resolve(settings, name)?;
    let snapshots = hv.list_snapshots(&vm).await?;
    if snapshots.is_empty() {
        println!("{} has no snapshots", vm.name());
    }
    for snapshot in snapshots {
        println!("{}", snapshot);
    }
    Ok(())
}

async fn provision(hv: Hypervisor, settings: &Settings, name: &str, op: Operation) -> Result<()> {
    let vm = VmHandle::resolve(settings, name)?;
    let prober = ReadinessProber::new(hv);
    let sink = LogSink::new(vm.name());
    let outcome = prober.provision(&vm, &op, &sink).await?;
    println!("{}", outcome.ip);
    Ok(())
}
