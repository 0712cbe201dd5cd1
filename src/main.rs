//! PushBuild - Build binaries and push them to remote hosts
//!
//! One binary for both sides: `build` runs on the developer machine or CI,
//! `serve` runs on every host that receives executables.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pushbuild::build::{apply_reports, HostBuilder, Orchestrator};
use pushbuild::config::{self, BuildConfig, ServerConfig, TlsConfig};
use pushbuild::network::{server_acceptor, DeployClient, Server};

/// PushBuild - build binaries and push them to remote hosts
#[derive(Parser)]
#[command(name = "pushbuild")]
#[command(author = "PushBuild Contributors")]
#[command(version)]
#[command(about = "Build binaries and push them to remote hosts over mutual TLS", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build packages and deploy them to their targets
    Build {
        /// Packages to build (all configured packages when omitted)
        packages: Vec<String>,
    },

    /// Run the deploy server
    Serve,

    /// Show size and digest of a package on a server
    Info {
        /// Server address (`host` or `host:port`)
        target: String,
        /// Package name
        name: String,
    },

    /// Download a package from a server
    Get {
        /// Server address (`host` or `host:port`)
        target: String,
        /// Package name
        name: String,
        /// Where to write the executable
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show current configuration
    Config {
        /// Use the server configuration
        #[arg(long)]
        server: bool,

        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Build { packages } => {
            run_build(&client_config_path(cli.config), packages).await?;
        }
        Commands::Serve => {
            run_server(&server_config_path(cli.config)).await?;
        }
        Commands::Info { target, name } => {
            let client = DeployClient::new(&client_tls(&client_config_path(cli.config))?)?;
            let info = client.info(&target, &name).await?;

            println!("Package: {}", name);
            println!("Size:    {} bytes", info.binary_size);
            println!("SHA-256: {}", hex::encode(info.signature.data()));
        }
        Commands::Get {
            target,
            name,
            output,
        } => {
            let client = DeployClient::new(&client_tls(&client_config_path(cli.config))?)?;
            let package = client.get(&target, &name).await?;

            tokio::fs::write(&output, package.payload.data()).await?;
            println!(
                "Package `{}` ({} bytes) written to: {}",
                name,
                package.payload.size(),
                output.display()
            );
        }
        Commands::Config {
            server,
            generate,
            output,
        } => {
            if generate {
                let sample = if server {
                    config::generate_sample_server_config()?
                } else {
                    config::generate_sample_config()?
                };
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else if server {
                let config = ServerConfig::load(&server_config_path(cli.config))?;
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                let config = BuildConfig::load(&client_config_path(cli.config))?;
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn client_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(BuildConfig::default_path)
}

fn server_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(ServerConfig::find_default)
        .unwrap_or_else(|| PathBuf::from(config::SERVER_CONFIG_FILE))
}

fn client_tls(path: &Path) -> anyhow::Result<TlsConfig> {
    let config = BuildConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .tls
        .with_context(|| format!("No [tls] section in {}", path.display()))
}

/// Build the selected packages, then persist bumped versions when asked to
async fn run_build(path: &Path, requested: Vec<String>) -> anyhow::Result<()> {
    let mut config = BuildConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let tasks = Orchestrator::select_tasks(&config.packages, &requested);
    if tasks.is_empty() {
        tracing::warn!("Nothing to build");
        return Ok(());
    }

    let mut orchestrator = Orchestrator::new(
        config.parallelism(),
        Arc::new(HostBuilder::new(config.toolchain.clone())),
    );
    if tasks.iter().any(|task| task.package.deploy.is_some()) {
        orchestrator = orchestrator.with_tls(config.tls.as_ref());
    }

    tracing::info!(
        "Building {} packages with {} workers",
        tasks.len(),
        config.parallelism()
    );
    let total = tasks.len();
    let reports = orchestrator.run(tasks).await;

    if config.auto_upgrade {
        let changed = apply_reports(&mut config, &reports);
        if changed > 0 {
            config.save(path)?;
            tracing::info!("Saved {} bumped versions to {}", changed, path.display());
        }
    }

    let built = reports.iter().filter(|report| report.built).count();
    if built < total {
        anyhow::bail!("{} of {} builds failed", total - built, total);
    }

    tracing::info!("All {} builds completed", total);
    Ok(())
}

/// Run the deploy server until Ctrl+C
async fn run_server(path: &Path) -> anyhow::Result<()> {
    let config = ServerConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let acceptor = server_acceptor(&config.tls)?;
    let server = Server::new(&config, acceptor);

    #[cfg(unix)]
    let _reload = pushbuild::network::spawn_reload_watcher(path.to_path_buf(), server.registry().clone())?;

    let listener = server.bind().await?;

    println!("\n========================================");
    println!("  PushBuild Server Running");
    println!("========================================");
    println!("  Address:  {}", config.address);
    println!("  Handlers: {}", config.handler_count());
    println!("  Packages: {}", config.packages.len());
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["pushbuild", "build", "api", "worker"]).unwrap();
        match cli.command {
            Commands::Build { packages } => assert_eq!(packages, vec!["api", "worker"]),
            _ => panic!("expected build"),
        }

        let cli = Cli::try_parse_from(["pushbuild", "-c", "server.toml", "serve"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("server.toml")));

        assert!(Cli::try_parse_from(["pushbuild", "get", "host", "api"]).is_err());
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let path = PathBuf::from("custom.toml");
        assert_eq!(client_config_path(Some(path.clone())), path);
        assert_eq!(server_config_path(Some(path.clone())), path);
    }
}
