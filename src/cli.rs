use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser, PartialEq)]
#[command(
    name = "taskmesh-manager",
    about = "A manager node for a decentralized task marketplace",
    version = "1.0"
)]
pub struct Cli {
    /// Specify the subcommand to run.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum Commands {
    /// Start the manager node: p2p WebSocket transport, HTTP surface and the
    /// dispatch control loop.
    StartManager(StartArgs),
}

#[derive(Debug, Args, PartialEq)]
pub struct StartArgs {
    /// Listen port for the p2p WebSocket transport.
    #[clap(long, default_value_t = 19955)]
    pub port: u16,

    /// Listen port for the HTTP transport and admin surface.
    #[clap(long, default_value_t = 8889)]
    pub http_port: u16,

    /// Directory for the embedded key-value store.
    #[clap(long, default_value = "./manager-db")]
    pub db_path: PathBuf,

    /// Hex-encoded private key seed; the first 32 bytes derive the payout
    /// signing key. Payments stay disabled without it.
    #[clap(long)]
    pub private_key: Option<String>,

    /// Address authorized to receive settlements.
    #[clap(long)]
    pub payment_account: Option<String>,

    /// Path to a snarkjs verification key JSON used for bulk proof settlement.
    #[clap(long)]
    pub verification_key_path: Option<PathBuf>,

    /// Maximum number of payment records one proof batch may span.
    #[clap(long, default_value_t = 100)]
    pub payment_batch_size: u32,

    /// Let workers onboard without an access code.
    #[clap(long)]
    pub no_access_codes: bool,

    /// Do not run dispatch automatically each cycle.
    #[clap(long)]
    pub no_auto_manage: bool,

    /// Do not mount the admin surface.
    #[clap(long)]
    pub no_admin: bool,

    /// Control-loop tick cadence in milliseconds.
    #[clap(long, default_value_t = 1000)]
    pub tick_interval_ms: u64,

    /// How long an offer stays open before it expires, in milliseconds.
    #[clap(long, default_value_t = 30_000)]
    pub task_acceptance_ms: i64,

    /// Log file path; logs go to stdout when unset.
    #[clap(long)]
    pub log_path: Option<PathBuf>,
}
