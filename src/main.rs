// Hyperpod Orchestrator - Main Entry Point
//
// Small operator CLI over the library:
// - probe which hypervisor driver this host can run
// - print the QEMU command line for a VM without starting it
// - run a single VM and stream its hub events
// - inspect port range and iptables rule generation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyperpod_orchestrator::config::Config;
use hyperpod_orchestrator::hypervisor::constants::QEMU_SYSTEM_EXE;
use hyperpod_orchestrator::hypervisor::{probe, BootConfig, VmContext};
use hyperpod_orchestrator::logging::LogLevel;
use hyperpod_orchestrator::network::{self, generate_iptables_args, PortMapping, PortRange};
use hyperpod_orchestrator::qemu::{self, QemuDriver};
use hyperpod_orchestrator::metrics_server::{self, VmStatus};
use hyperpod_orchestrator::metrics;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Hyperpod: containers in lightweight VMs
#[derive(Parser, Debug)]
#[command(name = "hyperpod")]
#[command(author = "Hyperpod Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Hypervisor drivers and pod networking for container VMs", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ~/.config/hyperpod/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Select a hypervisor driver and report which one loaded
    Probe {
        /// Driver name; overrides the config file
        #[arg(long)]
        driver: Option<String>,
    },
    /// Print the QEMU command line for a VM without launching it
    QemuArgs {
        #[arg(long)]
        id: String,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        /// VM home directory (default: <base_dir>/<id>)
        #[arg(long)]
        home: Option<PathBuf>,
    },
    /// Launch a VM and print its events until it stops
    Run {
        #[arg(long)]
        id: String,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        kernel: Option<String>,
        #[arg(long)]
        initrd: Option<String>,
        /// Serve /metrics on this port while the VM runs
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Parse a port range ("80" or "8000-8010")
    PortRange { spec: String },
    /// Print the nat and filter rules for one port mapping
    IptablesArgs {
        /// Container IP address
        #[arg(long)]
        ip: String,
        #[arg(long, default_value = "tcp")]
        proto: String,
        /// Host port range
        #[arg(long)]
        host: String,
        /// Container port range
        #[arg(long)]
        container: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let mut logging = config.logging_config()?;
    if args.verbose {
        logging.level = LogLevel::Debug;
    }
    logging.init()?;

    match args.command {
        Some(Commands::Probe { driver }) => {
            let name = driver.unwrap_or_else(|| config.hypervisor.driver.clone());
            let driver = probe(&name, &config.hypervisor)
                .await
                .with_context(|| format!("Failed to load driver {:?}", name))?;
            println!("{}", driver.name());
        }
        Some(Commands::QemuArgs {
            id,
            cpus,
            memory,
            home,
        }) => {
            let exe = qemu::find_executable(config.hypervisor.qemu_executable.as_deref())
                .unwrap_or_else(|| PathBuf::from(QEMU_SYSTEM_EXE));
            let driver = QemuDriver::new(exe)
                .with_log_dir(config.hypervisor.qemu_log_dir.clone())
                .with_vsock(config.hypervisor.enable_vsock);
            let home = home.unwrap_or_else(|| config.hypervisor.base_dir.join(&id));
            let boot = boot_config(&config, cpus, memory, None, None);
            let (ctx, _rx) = VmContext::new(id, boot, home, &driver);
            for arg in driver.command_line(&ctx) {
                println!("{}", arg);
            }
        }
        Some(Commands::Run {
            id,
            cpus,
            memory,
            kernel,
            initrd,
            metrics_port,
        }) => {
            let boot = boot_config(&config, cpus, memory, kernel, initrd);
            run_vm(&config, id, boot, metrics_port).await?;
        }
        Some(Commands::PortRange { spec }) => {
            let range = PortRange::parse(&spec)?;
            println!("{} {} {}", range.begin, range.end, range.len());
        }
        Some(Commands::IptablesArgs {
            ip,
            proto,
            host,
            container,
        }) => {
            let mapping = PortMapping::new(&proto, &host, &container)?;
            let (nat, filter) = generate_iptables_args(&ip, &mapping)?;
            println!("nat: {}", nat.join(" "));
            println!("filter: {}", filter.join(" "));
        }
        None => {
            info!("No command specified. Use \"hyperpod --help\" for usage.");
        }
    }

    Ok(())
}

fn boot_config(
    config: &Config,
    cpus: Option<u32>,
    memory: Option<u32>,
    kernel: Option<String>,
    initrd: Option<String>,
) -> BootConfig {
    let hv = &config.hypervisor;
    BootConfig {
        cpu: cpus.unwrap_or(hv.default_cpus),
        memory: memory.unwrap_or(hv.default_memory_mb),
        kernel: kernel.unwrap_or_else(|| hv.kernel.clone()),
        initrd: initrd.unwrap_or_else(|| hv.initrd.clone()),
        enable_vsock: hv.enable_vsock,
        ..Default::default()
    }
}

/// Launch one VM and follow its hub until a terminal event. Ctrl-C asks
/// the VM to shut down; a second Ctrl-C kills it.
async fn run_vm(config: &Config, id: String, boot: BootConfig, metrics_port: Option<u16>) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    if !config.network.disable_iptables {
        match network::SystemIptables::new() {
            Ok(runner) => network::setup_network(
                &runner,
                &config.network.bridge,
                &config.network.bridge_ip,
                false,
            )?,
            Err(e) => warn!(error = %e, "skipping pod network setup"),
        }
    }

    let driver = probe(&config.hypervisor.driver, &config.hypervisor).await?;

    let port = metrics_port.or(config.metrics.enabled.then_some(config.metrics.port));
    if let Some(port) = port {
        let status = VmStatus {
            vm: id.clone(),
            driver: driver.name(),
        };
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(port, status).await {
                error!(error = %e, "metrics server stopped");
            }
        });
    }

    let home = config.hypervisor.base_dir.join(&id);
    tokio::fs::create_dir_all(&home)
        .await
        .with_context(|| format!("Failed to create VM home {:?}", home))?;

    let (ctx, mut events) = VmContext::new(id, boot, home, driver.as_ref());
    info!(vm = %ctx.id, driver = ctx.driver_name(), "launching vm");
    ctx.launch().await;

    let mut interrupts = 0;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", event.name());
                if event.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    info!(vm = %ctx.id, "interrupted, shutting down vm");
                    ctx.shutdown().await;
                } else {
                    warn!(vm = %ctx.id, "interrupted again, killing vm");
                    ctx.kill().await;
                }
            }
        }
    }

    ctx.close().await;
    info!(vm = %ctx.id, "vm stopped");
    Ok(())
}
