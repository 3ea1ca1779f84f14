//! keel CLI: validate resilience configuration and exercise the stack with a
//! synthetic workload.

mod cli;
mod simulate;

use anyhow::{Context, Result};
use clap::Parser;
use keel_core::ResilienceConfig;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, OutputFormat};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Check { config, format } => {
            let config = load_config(&config)?;
            println!("{}", render(&config, format)?);
            tracing::info!("Configuration is valid");
            Ok(())
        }
        Commands::Defaults { format } => {
            println!("{}", render(&ResilienceConfig::default(), format)?);
            Ok(())
        }
        Commands::Simulate(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(simulate::run(args))
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("keel=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keel=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load a YAML or JSON config, chosen by file extension.
pub(crate) fn load_config(path: &Path) -> Result<ResilienceConfig> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config = if is_json {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ResilienceConfig::from_json(&contents)
    } else {
        ResilienceConfig::from_yaml_file(path)
    };

    config.with_context(|| format!("Invalid configuration in {}", path.display()))
}

fn render(config: &ResilienceConfig, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(config)?,
        OutputFormat::Json => serde_json::to_string_pretty(config)?,
    })
}
