mod config_commands;
mod simulate;

use std::path::{Path, PathBuf};

use {
    clap::{Parser, Subcommand},
    livewire_config::{LivewireConfig, Severity},
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "livewire", about = "Livewire: live plugin stream orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to use instead of the discovered one.
    #[arg(long, global = true, env = "LIVEWIRE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator against in-memory plugins and subscribers.
    Simulate(simulate::SimulateArgs),
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Load the explicit config file, or discover one.
fn load_config(path: Option<&Path>) -> anyhow::Result<LivewireConfig> {
    match path {
        Some(path) => livewire_config::load_config(path),
        None => Ok(livewire_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "livewire starting");

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate(args) => {
            let result = livewire_config::validate(&config);
            for d in &result.diagnostics {
                match d.severity {
                    Severity::Error => error!(path = d.path, "{}", d.message),
                    Severity::Warning => warn!(path = d.path, "{}", d.message),
                }
            }
            if result.has_errors() {
                anyhow::bail!("configuration has errors; run `livewire config check`");
            }
            simulate::run(config, args).await
        },
        Commands::Config { action } => config_commands::handle_config(action, &config),
    }
}
