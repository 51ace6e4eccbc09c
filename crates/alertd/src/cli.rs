//! Command-line entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "alertd", about = "Bitcoin SV alert engine daemon")]
pub struct Cli {
    /// Optional JSON config file, layered over embedded defaults and
    /// `ALERTD_*` environment variables.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the long-running alert engine: overlay, gossip intake, sync,
    /// retry scheduler, and the HTTP inspection API.
    Run,

    /// Print a freshly generated genesis key set (5 public/private key
    /// pairs) for operators bootstrapping a new alert network.
    GenesisKeygen,
}
