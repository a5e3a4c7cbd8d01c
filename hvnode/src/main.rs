use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use hvnode_core::config::HvnodeConfig;
use hvnode_core::{HvnodeError, HvnodeResult};
use hvnode_vm::{Driver, DriverStatus, Machine};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "hvnode")]
#[command(about = "Hyper-V cluster node driver", long_about = None)]
struct Cli {
    /// Configuration file (TOML); environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Check that the management backend is usable
    Status,
    /// Node image operations
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },
    /// Machine operations
    Machine {
        #[command(subcommand)]
        command: MachineCommands,
    },
}

#[derive(clap::Subcommand)]
enum ImageCommands {
    /// List known images
    List,
    /// Refresh the image catalog
    Refresh {
        /// Manifest to read instead of the configured one
        #[arg(long)]
        url: Option<String>,
    },
    /// Download and verify an image
    Fetch { version: String },
    /// Verify and install a locally downloaded image
    Import { version: String, path: PathBuf },
    /// Remove a cached image
    Purge { version: String },
    /// Re-check a cached image against its checksum
    Verify { version: String },
}

#[derive(clap::Args)]
struct MachineRef {
    /// Machine name
    name: String,
    /// Cluster the machine belongs to
    #[arg(long)]
    cluster: String,
}

#[derive(clap::Subcommand)]
enum MachineCommands {
    /// List all machines known to the backend
    List,
    /// Show one machine
    Get(MachineRef),
    /// Create a machine from a downloaded image
    Create {
        #[command(flatten)]
        machine: MachineRef,
        /// Kubernetes version of the image to use
        #[arg(long)]
        k8s_version: String,
    },
    /// Start a machine
    Start(MachineRef),
    /// Stop a machine
    Stop(MachineRef),
    /// Turn a machine off immediately
    ForceStop(MachineRef),
    /// Wait for a pending state change
    Wait {
        #[command(flatten)]
        machine: MachineRef,
        /// Seconds to let the backend wait
        #[arg(long, default_value = "25")]
        timeout: u64,
    },
    /// Delete a machine and its files
    Delete(MachineRef),
}

#[tokio::main]
async fn main() -> HvnodeResult<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_directive = if cli.verbose { "hvnode=debug" } else { "hvnode=info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        default_directive
            .parse()
            .map_err(|e| HvnodeError::ConfigError(format!("Invalid log directive: {}", e)))?,
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => HvnodeConfig::from_file(path)?,
        None => HvnodeConfig::from_env()?,
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let driver = match Driver::from_config(config).await {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("Error initializing driver: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Status => handle_status(&driver).await,
        Commands::Image { command } => handle_image_command(&driver, command).await,
        Commands::Machine { command } => handle_machine_command(&driver, command, &cancel).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_status(driver: &Driver) -> HvnodeResult<()> {
    println!("{} ({})", driver.name(), driver.description());
    match driver.status().await {
        DriverStatus::Ready => {
            println!("Status: Ready");
            Ok(())
        }
        DriverStatus::Error(message) => {
            println!("Status: Error");
            Err(HvnodeError::backend_unavailable(message))
        }
    }
}

async fn handle_image_command(driver: &Driver, command: ImageCommands) -> HvnodeResult<()> {
    match command {
        ImageCommands::List => {
            let images = driver.list_images().await;
            if images.is_empty() {
                println!("No images known; run 'hvnode image refresh'");
            }
            for image in images {
                println!(
                    "{:<10} {:<14} {}{}",
                    image.k8s_version(),
                    image.status().to_string(),
                    image.source_url(),
                    if image.deprecated() { " (deprecated)" } else { "" }
                );
            }
        }
        ImageCommands::Refresh { url } => {
            driver.refresh_catalog(url.as_deref()).await?;
            println!("Image catalog refreshed");
        }
        ImageCommands::Fetch { version } => {
            let mut print_progress = |so_far: u64, total: u64| {
                if total > 0 {
                    eprint!("\r{:>3}% ({} / {} bytes)", so_far * 100 / total, so_far, total);
                } else {
                    eprint!("\r{} bytes", so_far);
                }
                let _ = std::io::stderr().flush();
            };
            let result = driver
                .fetch_image_with_progress(&version, &mut print_progress)
                .await;
            eprintln!();
            result?;
            println!("Image {} downloaded", version);
        }
        ImageCommands::Import { version, path } => {
            driver.import_local_file(&version, &path).await?;
            println!("Image {} imported from {}", version, path.display());
        }
        ImageCommands::Purge { version } => {
            driver.purge_local(&version).await?;
            println!("Image {} removed from the cache", version);
        }
        ImageCommands::Verify { version } => {
            if driver.verify_cached(&version).await? {
                println!("Image {} matches its checksum", version);
            } else {
                eprintln!(
                    "Image {} does not match its checksum; purge and fetch it again",
                    version
                );
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn handle_machine_command(
    driver: &Driver,
    command: MachineCommands,
    cancel: &CancellationToken,
) -> HvnodeResult<()> {
    match command {
        MachineCommands::List => {
            let machines = driver.list_machines().await?;
            if machines.is_empty() {
                println!("No machines found");
            }
            for machine in &machines {
                print_machine(machine);
            }
        }
        MachineCommands::Get(target) => {
            let machine = driver.get_machine(&target.name, &target.cluster).await?;
            print_machine(&machine);
        }
        MachineCommands::Create {
            machine,
            k8s_version,
        } => {
            let created = driver
                .create_machine(&machine.name, &machine.cluster, &k8s_version, cancel)
                .await?;
            print_machine(&created.machine);
            for caveat in &created.caveats {
                eprintln!("Warning: {}", caveat);
            }
        }
        MachineCommands::Start(target) => {
            let mut machine = driver.get_machine(&target.name, &target.cluster).await?;
            machine.start().await?;
            print_machine(&machine);
        }
        MachineCommands::Stop(target) => {
            let mut machine = driver.get_machine(&target.name, &target.cluster).await?;
            machine.stop().await?;
            print_machine(&machine);
        }
        MachineCommands::ForceStop(target) => {
            let mut machine = driver.get_machine(&target.name, &target.cluster).await?;
            machine.force_stop().await?;
            print_machine(&machine);
        }
        MachineCommands::Wait { machine, timeout } => {
            let mut handle = driver.get_machine(&machine.name, &machine.cluster).await?;
            if !handle
                .wait_for_state_change(Duration::from_secs(timeout), cancel)
                .await?
            {
                eprintln!("No state change reported within {}s", timeout);
            }
            print_machine(&handle);
        }
        MachineCommands::Delete(target) => {
            driver.delete_machine(&target.name, &target.cluster).await?;
            println!("Machine {} deleted", target.name);
        }
    }
    Ok(())
}

fn print_machine(machine: &Machine) {
    let ip = machine.known_ip_address();
    println!(
        "{:<30} {:<10} {:<16} {}",
        machine.qualified_name(),
        machine.status().to_string(),
        if ip.is_empty() { "-" } else { ip },
        machine.error_message()
    );
}
