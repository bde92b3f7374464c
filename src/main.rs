use anyhow::Context;
use clap::{Parser, Subcommand};
use puente::config::{ConfigError, RegistryConfig};
use puente::ServerRegistry;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "puente")]
#[command(about = "Backend server registry and connection pooling core for database proxies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Puente Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a registry definition file
    Validate {
        /// Path to the registry definition to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Load a registry definition and print a report for every server
    Report {
        /// Path to the registry definition file
        #[arg(short, long)]
        config: PathBuf,
        /// Number of pool workers to simulate
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },
    /// Write per-server configuration fragments to a directory
    Persist {
        /// Path to the registry definition file
        #[arg(short, long)]
        config: PathBuf,
        /// Directory the fragments are written into
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Generate an example registry definition file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Report { config, workers } => {
            report(config, workers).await?;
        }
        Commands::Persist { config, output } => {
            persist(config, output).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn build_registry(config_path: &PathBuf, workers: usize) -> anyhow::Result<ServerRegistry> {
    let config = RegistryConfig::load_from_file(config_path)
        .with_context(|| format!("Failed to load registry definition {:?}", config_path))?;

    let registry = ServerRegistry::new(workers);
    for (name, params) in &config.servers {
        registry
            .apply_config(name, params)
            .await
            .with_context(|| format!("Failed to apply configuration for server '{}'", name))?;
    }

    info!(
        servers = config.servers.len(),
        workers,
        "Registry loaded from {:?}",
        config_path
    );
    Ok(registry)
}

async fn report(config_path: PathBuf, workers: usize) -> anyhow::Result<()> {
    let registry = build_registry(&config_path, workers).await?;

    for report in registry.reports().await {
        println!("{}", report);
    }

    registry.shutdown().await;
    Ok(())
}

async fn persist(config_path: PathBuf, output: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&output)
        .with_context(|| format!("Failed to create output directory {:?}", output))?;

    let registry = build_registry(&config_path, 1).await?;
    let written = registry.persist_all(&output).await?;

    for path in &written {
        println!("Wrote {:?}", path);
    }
    println!("{} server fragment(s) written", written.len());

    registry.shutdown().await;
    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating example registry definition: {:?}", output);

    RegistryConfig::create_example_config(&output)
        .map_err(|e| anyhow::anyhow!("Failed to generate config: {}", e))?;

    println!("Registry definition generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  puente report --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating registry definition: {:?}", config_path);

    match RegistryConfig::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Registry definition is valid");
            println!("  Servers: {} defined", config.servers.len());
            for (i, (name, params)) in config.servers.iter().enumerate() {
                println!(
                    "    {}: {} ({}:{}, pool {}x{}s)",
                    i + 1,
                    name,
                    params.target(),
                    params.port,
                    params.persistpoolmax,
                    params.persistmaxtime
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Registry definition validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("puente v{}", env!("CARGO_PKG_VERSION"));
    println!("Backend server registry and connection pooling core for database proxies");
    println!();
    println!("Features:");
    println!("  • Per-worker pooling of reusable backend connections");
    println!("  • Adaptive response time estimation for weighted routing");
    println!("  • Atomic status tracking with monitor and admin hooks");
    println!("  • Crash-safe persistence of server configuration fragments");
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
