/*
* Testkit Command Line Interface
* ------------------------------
*
* Spins up throwaway libvirt machines for end-to-end runs, optionally wires
* them into a swarm, and tears them down again.
*
* Command Structure:
* ---------------
* testkit
* ├── create <count>          // batch of ready machines (+ swarm unless --no-swarm)
* ├── rm <name>...            // removes machines a previous run left behind
* ├── ls                      // running domains of this testkit
* └── init                    // writes config/default.json
*
* A failed `create` never leaves machines behind: the orchestrator rolls
* back its own batch, and a bootstrap failure tears the batch down here.
* Ctrl-C cancels whatever is in flight and goes through the same rollback.
*
* Usage Examples:
* -------------
* ```bash
* VIRSH_DISK_DIR=/e2e testkit create 3
* eval "$(VIRSH_DISK_DIR=/e2e testkit create 1 --no-swarm --env-only)"
* testkit rm e2e-1A2B3C-0 e2e-1A2B3C-1
* ```
*/

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

use crate::cluster::SwarmBootstrap;
use crate::config::Settings;
use crate::core::command::SystemRunner;
use crate::core::libvirt::Virsh;
use crate::core::machine_set::{remove_all, MachineSet};
use crate::core::{Machine, VirshDriver};

#[derive(Parser)]
#[command(name = "testkit")]
#[command(about = "Throwaway libvirt machines and swarms for end-to-end tests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Debug level logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a batch of ready machines
    Create {
        count: usize,
        /// Leave the machines as standalone engines
        #[arg(long)]
        no_swarm: bool,
        #[arg(long, default_value = "0.0.0.0:2377")]
        listen_addr: String,
        /// How long to wait for every node to report ready, in seconds
        #[arg(long, default_value_t = 120)]
        ready_timeout: u64,
        /// Print only the shell exports
        #[arg(long)]
        env_only: bool,
    },
    /// Remove machines by name
    Rm {
        #[arg(required = true)]
        names: Vec<String>,
        /// Undefine the domains but keep their disks
        #[arg(long)]
        keep_disk: bool,
    },
    /// List running testkit machines
    Ls,
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };

    match cli.command {
        Commands::Create {
            count,
            no_swarm,
            listen_addr,
            ready_timeout,
            env_only,
        } => {
            let ready_timeout = Duration::from_secs(ready_timeout);
            handle_create_command(settings, count, no_swarm, &listen_addr, ready_timeout, env_only).await
        }
        Commands::Rm { names, keep_disk } => handle_rm_command(settings, &names, keep_disk).await,
        Commands::Ls => handle_ls_command(settings).await,
        Commands::Init { .. } => Ok(()),
    }
}

async fn handle_create_command(
    settings: Settings,
    count: usize,
    no_swarm: bool,
    listen_addr: &str,
    ready_timeout: Duration,
    env_only: bool,
) -> anyhow::Result<()> {
    let provision = settings.provision.clone();
    let driver = Arc::new(VirshDriver::new(settings));
    let set = MachineSet::new(driver, &provision);

    let cancel = set.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, rolling back");
            cancel.cancel();
        }
    });

    let machines = set.create_machines(count).await?;

    if !no_swarm {
        let bootstrap = SwarmBootstrap::new(listen_addr);
        let token = set.cancellation_token();
        let joined = match bootstrap.bootstrap(&machines).await {
            Ok(cluster) => cluster.await_ready(&token, ready_timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            error!(state = %bootstrap.state(), "Tearing down {} machines", machines.len());
            remove_all(&machines).await;
            return Err(e.into());
        }
    }

    if !env_only {
        println!("{} {} machine(s) ready", "✓".green(), machines.len());
    }
    for machine in &machines {
        println!("{}", machine.connection_env());
    }
    Ok(())
}

async fn handle_rm_command(settings: Settings, names: &[String], keep_disk: bool) -> anyhow::Result<()> {
    let driver = VirshDriver::new(settings);
    let mut failed = 0;
    for name in names {
        let machine = driver.existing(name);
        let result = if keep_disk {
            machine.remove_preserve_disk().await
        } else {
            machine.remove().await
        };
        match result {
            Ok(()) => println!("{} {}", "✓".green(), name),
            Err(e) => {
                failed += 1;
                println!("{} {}: {}", "✗".red(), name, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} machines could not be removed", failed, names.len());
    }
    Ok(())
}

async fn handle_ls_command(settings: Settings) -> anyhow::Result<()> {
    let prefix = format!("{}-", settings.provision.name_prefix);
    let virsh = Virsh::new(Arc::new(SystemRunner));
    let domains: Vec<String> = virsh
        .active_domains()
        .await
        .into_iter()
        .filter(|d| d.starts_with(&prefix))
        .collect();

    println!("{}", "Running machines:".bold());
    if domains.is_empty() {
        println!("  (none)");
    }
    for domain in domains {
        println!("- {} ({})", domain, "running".green());
    }
    Ok(())
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.json");
    if target.exists() && !force {
        error!("{} already exists. Use --force to overwrite.", target.display());
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let config_str = serde_json::to_string_pretty(&Settings::default())?;
    std::fs::write(&target, config_str)?;

    info!("Wrote {}", target.display());
    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
