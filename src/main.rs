use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use isoflash::adapters;
use isoflash::config::{self, AppConfig};
use isoflash::context::AppContext;
use isoflash::core::{
    BlockDevice, Catalog, OperationRequest, OperationResult, Orchestrator, Partition,
    PartitionTable,
};
use isoflash::logging::{self, LogConfig, LogLevel};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "isoflash")]
#[command(about = "Write ISO images to USB drives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $XDG_CONFIG_HOME/isoflash/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a file-backed simulated drive instead of real hardware
    #[arg(long, global = true)]
    simulation: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List removable drives
    Devices,
    /// Show partitions and mounts of one drive
    Details { device: PathBuf },
    /// Replace the drive's partition table, erasing it
    Reformat {
        device: PathBuf,
        #[arg(long, value_enum, default_value_t = TableArg::Gpt)]
        table: TableArg,
        #[arg(short, long)]
        yes: bool,
    },
    /// Write an image byte-for-byte with dd
    Flash {
        image: PathBuf,
        device: PathBuf,
        #[arg(short, long)]
        yes: bool,
    },
    /// Install Ventoy on the drive and copy the ISO onto it
    Ventoy {
        image: PathBuf,
        device: PathBuf,
        /// Path to Ventoy2Disk.sh (overrides ventoy.installer)
        #[arg(long)]
        installer: Option<PathBuf>,
        #[arg(short, long)]
        yes: bool,
    },
    /// Compute an image's SHA-256 and compare it
    Verify {
        image: PathBuf,
        /// Expected hex digest; looked up in the catalog when omitted
        #[arg(long)]
        expected: Option<String>,
    },
    /// List known images and their checksums
    Catalog,
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration to a file
    Init {
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TableArg {
    Gpt,
    Mbr,
}

impl From<TableArg> for PartitionTable {
    fn from(table: TableArg) -> Self {
        match table {
            TableArg::Gpt => PartitionTable::Gpt,
            TableArg::Mbr => PartitionTable::Mbr,
        }
    }
}

#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<LogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ventoy: Option<VentoyOverrides>,
}

#[derive(Serialize)]
struct VentoyOverrides {
    installer: PathBuf,
}

impl Overrides {
    fn from_cli(cli: &Cli) -> Self {
        let installer = match &cli.command {
            Commands::Ventoy { installer, .. } => installer.clone(),
            _ => None,
        };
        Self {
            simulation: cli.simulation.then_some(true),
            log_level: cli.verbose.then_some(LogLevel::Debug),
            json_logs: cli.json.then_some(true),
            ventoy: installer.map(|installer| VentoyOverrides { installer }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref(), Some(&Overrides::from_cli(&cli)))?;

    let log_sink = logging::init(LogConfig {
        json: config.json_logs,
        level: config.log_level,
        console: true,
    })?;
    debug!(level = %log_sink.level(), "Logging initialised");

    let inventory = adapters::get_inventory(&config)?;
    let orchestrator = Orchestrator::new(AppContext::new(config), inventory);
    run_command(&orchestrator, cli.command).await
}

async fn run_command(orchestrator: &Orchestrator, command: Commands) -> Result<ExitCode> {
    let request = match command {
        Commands::Devices => {
            let devices = orchestrator.list_devices().await?;
            if devices.is_empty() {
                println!("No removable drives found.");
            }
            for device in devices {
                println!("{}", device);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Details { device } => {
            let device = find_device(orchestrator, &device).await?;
            print_details(&device);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Reformat { device, table, yes } => {
            let table = PartitionTable::from(table);
            let device = find_device(orchestrator, &device).await?;
            let prompt = format!("Erase {} and write a {} partition table?", device, table);
            if !confirmed(yes, &prompt)? {
                return Ok(ExitCode::SUCCESS);
            }
            OperationRequest::reformat(device.identity(), table)
        }
        Commands::Flash { image, device, yes } => {
            let device = find_device(orchestrator, &device).await?;
            let prompt = format!("Overwrite {} with {}?", device, image.display());
            if !confirmed(yes, &prompt)? {
                return Ok(ExitCode::SUCCESS);
            }
            OperationRequest::flash_dd(device.identity(), image)
        }
        Commands::Ventoy {
            image, device, yes, ..
        } => {
            let device = find_device(orchestrator, &device).await?;
            let prompt = format!(
                "Install Ventoy on {} (erasing it) and copy {}?",
                device,
                image.display()
            );
            if !confirmed(yes, &prompt)? {
                return Ok(ExitCode::SUCCESS);
            }
            OperationRequest::flash_ventoy(device.identity(), image)
        }
        Commands::Verify { image, expected } => {
            let expected = expected.or_else(|| catalog_digest(orchestrator, &image));
            OperationRequest::verify_hash(image, expected)
        }
        Commands::Catalog => {
            print_catalog(&Catalog::new(orchestrator.config().catalog.clone()));
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Config(command) => return run_config(orchestrator.config(), command),
    };

    let result = run_operation(orchestrator, request).await;
    println!("{}", result);

    match result {
        OperationResult::Success { .. } => Ok(ExitCode::SUCCESS),
        OperationResult::Failure(failure) => {
            if !failure.raw_output.is_empty() {
                eprintln!("--- tool output ---\n{}", failure.raw_output);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Run to completion, printing events. Ctrl-C cancels the operation.
async fn run_operation(orchestrator: &Orchestrator, request: OperationRequest) -> OperationResult {
    let handle = orchestrator.execute(request);
    let canceller = handle.canceller();

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            canceller.cancel();
        }
    });

    let result = handle.run(|event| println!("{}", event)).await;
    interrupt.abort();
    result
}

async fn find_device(orchestrator: &Orchestrator, path: &Path) -> Result<BlockDevice> {
    match orchestrator.describe(path).await? {
        Some(device) => Ok(device),
        None => bail!(
            "{} is not a removable drive (see `isoflash devices`)",
            path.display()
        ),
    }
}

fn catalog_digest(orchestrator: &Orchestrator, image: &Path) -> Option<String> {
    let catalog = Catalog::new(orchestrator.config().catalog.clone());
    match catalog.expected_digest(image) {
        Some((name, digest)) => {
            println!("Comparing against catalog entry \"{}\"", name);
            Some(digest.to_string())
        }
        None => {
            warn!(
                image = %image.display(),
                "No expected hash known for this image, verify the printed digest manually"
            );
            None
        }
    }
}

fn confirmed(yes: bool, prompt: &str) -> Result<bool> {
    use std::io::{Write, stdin, stdout};

    if yes {
        return Ok(true);
    }

    print!("{} [y/N] ", prompt);
    stdout().flush()?;

    let mut input = String::new();
    stdin().read_line(&mut input)?;

    let accepted = input.trim().eq_ignore_ascii_case("y");
    if !accepted {
        println!("Aborted.");
    }
    Ok(accepted)
}

fn print_details(device: &BlockDevice) {
    println!("Device:      {}", device.path.display());
    println!("Model:       {}", device.model);
    println!("Size:        {} bytes", device.size_bytes);
    println!("Transport:   {}", device.transport);
    println!("Table:       {}", device.partition_table);
    if let Some(mount) = &device.mount_point {
        println!("Mounted at:  {}", mount.display());
    }
    if device.partitions.is_empty() {
        println!("Partitions:  none");
        return;
    }
    println!("Partitions:");
    for part in &device.partitions {
        print_partition(part, 1);
    }
}

fn print_partition(part: &Partition, depth: usize) {
    let mount = part
        .mount_point
        .as_ref()
        .map(|m| m.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    let path = format!("{}{}", "  ".repeat(depth), part.path.display());
    println!(
        "{:<24} {:>14} bytes  {:<11} {:<12} {}",
        path, part.size_bytes, part.filesystem, part.label, mount
    );
    for volume in &part.volumes {
        print_partition(volume, depth + 1);
    }
}

fn print_catalog(catalog: &Catalog) {
    if catalog.entries().is_empty() {
        println!("The catalog is empty. Add [[catalog]] entries to the config file.");
        return;
    }
    for entry in catalog.entries() {
        println!(
            "{:<24} {}\n{:<24} {}",
            entry.name,
            entry.url,
            "",
            entry.sha256.as_deref().unwrap_or("(no checksum)")
        );
    }
}

fn run_config(config: &AppConfig, command: ConfigCommand) -> Result<ExitCode> {
    match command {
        ConfigCommand::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommand::Init { path, force } => {
            let path = match path {
                Some(path) => path,
                None => config::default_config_path()
                    .context("Cannot determine a config location, pass a path")?,
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            config.write_to(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
