//! CLI argument parsing using clap 4.x derive macros

use clap::{Parser, Subcommand};
use nodehost_core::contract::lockfile::LOCKFILE_NAME;
use std::path::PathBuf;

/// Contract-driven node runtime host
///
/// Validates node contracts, maintains the protocol lockfile and runs a host
/// over the in-memory reference handlers.
#[derive(Parser, Debug)]
#[command(name = "nodehost")]
#[command(author, about, long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./nodehost.toml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate every contract in a directory
    Validate {
        /// Directory of *.yaml / *.yml contracts
        dir: PathBuf,

        /// Require every contract to declare its fingerprint
        #[arg(long)]
        strict: bool,
    },

    /// Print the structural fingerprint of one contract
    Fingerprint {
        /// Contract file
        file: PathBuf,
    },

    /// Write or check the protocol lockfile
    Lock {
        /// Fail if the committed lockfile has drifted instead of rewriting it
        #[arg(long)]
        check: bool,

        /// Lockfile path
        #[arg(short, long, default_value = LOCKFILE_NAME)]
        path: PathBuf,
    },

    /// Boot a host and route JSON-lines envelopes read from stdin
    Run {
        /// Contract directory (added to runtime.contracts_dir)
        #[arg(long)]
        contracts: Option<PathBuf>,

        /// Register an identity function for COMPUTE nodes
        #[arg(long)]
        echo_compute: bool,

        /// Print the health report as JSON on exit
        #[arg(long)]
        health: bool,
    },
}
