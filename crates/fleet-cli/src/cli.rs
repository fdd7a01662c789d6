use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fleet",
    about = "Cluster membership and scheduling tool",
    version = env!("CARGO_PKG_VERSION"),
    author = "Fleet Project Team",
    long_about = "Runs the membership authority, registers backends, inspects cluster membership and places work items on live hosts."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format (plain, json)
    #[arg(long, default_value = "plain")]
    pub format: OutputFormat,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Run a membership authority (state store) until interrupted
    Statestore {
        /// Port to listen on (defaults to the configured bind address)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Register a service endpoint and follow membership until interrupted
    Backend {
        /// Authority address (host:port)
        #[arg(short, long)]
        authority: Option<String>,

        /// Service id to register under
        #[arg(short, long, default_value = "exec")]
        service: String,

        /// Endpoint to register (host:port)
        #[arg(long)]
        address: String,
    },

    /// Show the hosts known for a service
    Hosts {
        /// Authority address (host:port)
        #[arg(short, long)]
        authority: Option<String>,

        /// Service id (defaults to the scheduler's service)
        #[arg(short, long)]
        service: Option<String>,

        /// Wait until at least this many hosts are known
        #[arg(long)]
        expect: Option<usize>,

        /// How long to wait for membership, in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// Place work items on live hosts
    Schedule {
        /// Authority address (host:port)
        #[arg(short, long)]
        authority: Option<String>,

        /// Service id (defaults to the scheduler's service)
        #[arg(short, long)]
        service: Option<String>,

        /// Wait until at least this many hosts are known
        #[arg(long)]
        expect: Option<usize>,

        /// How long to wait for membership, in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Work items as id[=host:port,host:port,...]
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Wait until a TCP endpoint accepts connections
    Probe {
        /// Endpoint to probe (host:port)
        address: String,

        /// Connection attempts
        #[arg(long, default_value = "10")]
        attempts: u32,

        /// Delay between attempts, in milliseconds
        #[arg(long, default_value = "100")]
        interval_ms: u64,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Plain,
    Json,
}
