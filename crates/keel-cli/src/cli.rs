use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Resilience toolkit for agent services", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a config file and print the effective configuration
    Check {
        /// YAML or JSON config file
        config: PathBuf,

        /// Output format for the effective configuration
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: OutputFormat,
    },

    /// Print the default configuration
    Defaults {
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: OutputFormat,
    },

    /// Run a synthetic workload through the pool, gates and job queue
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Config file; a fast demo configuration is used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of jobs to submit
    #[arg(short, long, default_value_t = 20)]
    pub jobs: usize,

    /// Probability that a simulated dependency call fails
    #[arg(long, default_value_t = 0.3)]
    pub failure_rate: f64,

    /// Give up waiting for jobs after this many seconds
    #[arg(long, default_value_t = 30)]
    pub deadline_secs: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}
