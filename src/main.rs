//! Infra — identity and access management for Kubernetes clusters.
//!
//! One binary, two roles: `infra server` runs the central registry,
//! `infra engine` runs the per-cluster agent.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use infra_common::logging::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "infra", version, about, long_about = None)]
struct Cli {
    /// Default log level; RUST_LOG overrides.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Force "json" or "pretty" log output instead of auto-detecting.
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Write logs to a daily-rotated file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the registry server
    Server(ServerArgs),

    /// Run the per-cluster engine
    Engine(EngineArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: SocketAddr,

    /// PostgreSQL connection string
    #[arg(long, env = "INFRA_DATABASE_URL")]
    database_url: String,

    /// TLS certificate PEM file; plain HTTP when omitted
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key PEM file
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Configuration file with providers and permissions
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Organization name for this deployment
    #[arg(long, default_value = "default")]
    organization: String,
}

#[derive(Parser, Debug)]
struct EngineArgs {
    /// Registry host or URL
    #[arg(long, env = "INFRA_REGISTRY")]
    registry: String,

    /// Connector access key
    #[arg(long, env = "INFRA_ACCESS_KEY")]
    access_key: String,

    /// Destination name; defaults to the engine's namespace
    #[arg(long)]
    name: Option<String>,

    /// Cluster API endpoint reported to the registry; introspected when
    /// omitted
    #[arg(long)]
    endpoint: Option<String>,

    /// Verify the registry's TLS certificate
    #[arg(long)]
    force_tls_verify: bool,

    /// Proxy listen address
    #[arg(long, default_value = "0.0.0.0:80")]
    listen: SocketAddr,
}

fn log_format(cli: &Cli) -> anyhow::Result<LogFormat> {
    match cli.log_format.as_deref() {
        None => Ok(LogFormat::Auto),
        Some("json") => Ok(LogFormat::Json),
        Some("pretty") => Ok(LogFormat::Pretty),
        Some(other) => anyhow::bail!("unknown log format {other:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, log_format(&cli)?, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Server(args) => {
            infra_registry::serve(infra_registry::ServerOptions {
                addr: args.listen,
                database_url: args.database_url,
                tls_cert: args.tls_cert,
                tls_key: args.tls_key,
                config_file: args.config_file,
                organization: args.organization,
            })
            .await?;
        }
        Commands::Engine(args) => {
            infra_engine::run(infra_engine::Options {
                registry: args.registry,
                access_key: args.access_key,
                name: args.name,
                endpoint: args.endpoint,
                force_tls_verify: args.force_tls_verify,
                listen_addr: args.listen,
            })
            .await?;
        }
    }
    Ok(())
}
