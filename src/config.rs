use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "weir")]
#[command(version)]
#[command(about = "Distributed truncated-SHA-256 collision search (Pollard rho with distinguished points)")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Wgpu,
    Cpu,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the collision server: collect DPs, detect pre-collisions
    Server {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// SQLite database path
        #[arg(long, default_value = "weir.db")]
        db: PathBuf,

        /// Leading zero bits that make a state distinguished
        #[arg(long, default_value_t = 16)]
        dp_bits: u32,

        /// Digest bytes kept from the front
        #[arg(long, default_value_t = 8)]
        hash_prefix_bytes: usize,

        /// Digest bytes kept from the back
        #[arg(long, default_value_t = 0)]
        hash_suffix_bytes: usize,

        /// HTTP handler threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },

    /// Walk chains and report distinguished points to the server
    Mine {
        /// Username for authentication (not needed for --dry-run)
        username: Option<String>,

        /// User token for authentication (not needed for --dry-run)
        usertoken: Option<String>,

        #[arg(long, default_value = "http://localhost:8080/")]
        server: String,

        /// Leading zero bits that make a state distinguished
        #[arg(long, default_value_t = 16)]
        dp_bits: u32,

        /// Digest bytes kept from the front
        #[arg(long, default_value_t = 8)]
        hash_prefix_bytes: usize,

        /// Digest bytes kept from the back
        #[arg(long, default_value_t = 0)]
        hash_suffix_bytes: usize,

        /// Walk backends to start, in order
        #[arg(long, value_enum, value_delimiter = ',', default_value = "wgpu,cpu")]
        backends: Vec<BackendKind>,

        /// GPU lanes (concurrent chains) per dispatch
        #[arg(long, default_value_t = 0x4000)]
        lanes: usize,

        /// Walk iterations per lane per dispatch
        #[arg(long, default_value_t = 0x400)]
        steps: u32,

        /// Distinguished point capacity per dispatch
        #[arg(long, default_value_t = 1024)]
        max_dps: usize,

        /// CPU walker threads (defaults to the core count)
        #[arg(long)]
        cpu_threads: Option<usize>,

        /// Print found DPs instead of submitting them
        #[arg(long)]
        dry_run: bool,

        /// Re-walk one DP per batch on the CPU as a backend cross-check
        #[arg(long)]
        verify: bool,

        /// Seconds between stats lines
        #[arg(long, default_value_t = 10)]
        stats_interval: u64,
    },

    /// Recover the colliding message pair from two chain starts
    Finalize {
        /// Starting point of chain A (hex)
        start_a: String,

        /// Starting point of chain B (hex)
        start_b: String,

        /// Leading zero bits that make a state distinguished
        #[arg(long, default_value_t = 16)]
        dp_bits: u32,

        /// Digest bytes kept from the front
        #[arg(long, default_value_t = 8)]
        hash_prefix_bytes: usize,

        /// Digest bytes kept from the back
        #[arg(long, default_value_t = 0)]
        hash_suffix_bytes: usize,

        /// Per-chain iteration bound (default: 2^(dp_bits+8))
        #[arg(long)]
        max_steps: Option<u64>,
    },

    /// Create a user and print its token
    CreateUser {
        username: String,

        /// Token for the user (a UUIDv4 is generated when omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// SQLite database path
        #[arg(long, default_value = "weir.db")]
        db: PathBuf,
    },
}
