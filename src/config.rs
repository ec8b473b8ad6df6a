use std::env;
use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing::warn;

use crate::cli::StartArgs;
use crate::error::{Error, Result};

/// How many consecutive failed proof verifications a worker is allowed before
/// it is disconnected for the remainder of the session.
pub const PROOF_FAILURE_THRESHOLD: u32 = 3;

/// How many cycles a worker that rejected a task is kept off that task's
/// candidate list.
pub const REJECTION_BACKOFF_CYCLES: u64 = 10;

/// Upper bound on the graceful drain when stopping: accepted tasks get this
/// long to complete or expire before they are hard-cancelled.
pub const GRACEFUL_STOP_MS: u64 = 10_000;

/// Resolved manager configuration. Environment variables win over CLI flags,
/// flags win over defaults.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// p2p WebSocket listen port.
    pub port: u16,
    /// HTTP transport / admin port.
    pub http_port: u16,
    /// Run the dispatch step on every control-loop tick.
    pub auto_manage: bool,
    pub listen: Vec<String>,
    pub announce: Vec<String>,
    /// Maximum number of records a proof request may span.
    pub payment_batch_size: u32,
    pub require_access_codes: bool,
    /// Settlement address. Payments are disabled entirely when unset.
    pub payment_account: Option<String>,
    pub with_admin: bool,
    pub tick_interval_ms: u64,
    /// How long a task may stay offered before the sweep reclaims it.
    pub task_acceptance_ms: i64,
    pub db_path: PathBuf,
    pub log_path: Option<PathBuf>,
    /// snarkjs verification key JSON for bulk proof settlement.
    pub verification_key_path: Option<PathBuf>,
    /// Hex seed; the first 32 bytes derive the EdDSA signing key.
    pub private_key: Option<String>,
}

pub static CONFIG: OnceCell<ManagerConfig> = OnceCell::new();

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            panic!("{name} is set but could not be parsed");
        }),
        Err(_) => fallback,
    }
}

fn env_flag(name: &str, fallback: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "yes"),
        Err(_) => fallback,
    }
}

/// Resolves the configuration once at startup. Everything here fails fast so
/// a misconfigured manager never reaches the control loop.
pub fn run_config(args: &StartArgs) {
    dotenv::dotenv().ok();

    let port = env_or("MANAGER_PORT", args.port);
    let http_port = env_or("MANAGER_HTTP_PORT", args.http_port);
    let listen = match env::var("MANAGER_LISTEN") {
        Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
        Err(_) => vec![format!("ws://0.0.0.0:{port}")],
    };
    let announce = match env::var("MANAGER_ANNOUNCE") {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    };

    let payment_account = env::var("MANAGER_PAYMENT_ACCOUNT")
        .ok()
        .or_else(|| args.payment_account.clone());
    let private_key = env::var("MANAGER_PRIVATE_KEY")
        .ok()
        .or_else(|| args.private_key.clone());

    if payment_account.is_none() {
        warn!("No payment account configured, payments are disabled...");
    }

    let config = ManagerConfig {
        port,
        http_port,
        auto_manage: env_flag("MANAGER_AUTO_MANAGE", !args.no_auto_manage),
        listen,
        announce,
        payment_batch_size: env_or("MANAGER_PAYMENT_BATCH_SIZE", args.payment_batch_size),
        require_access_codes: env_flag("MANAGER_REQUIRE_ACCESS_CODES", !args.no_access_codes),
        payment_account,
        with_admin: env_flag("MANAGER_WITH_ADMIN", !args.no_admin),
        tick_interval_ms: env_or("MANAGER_TICK_INTERVAL_MS", args.tick_interval_ms),
        task_acceptance_ms: env_or("MANAGER_TASK_ACCEPTANCE_MS", args.task_acceptance_ms),
        db_path: env::var("MANAGER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| args.db_path.clone()),
        log_path: env::var("MANAGER_LOG_PATH")
            .map(PathBuf::from)
            .ok()
            .or_else(|| args.log_path.clone()),
        verification_key_path: env::var("MANAGER_VERIFICATION_KEY_PATH")
            .map(PathBuf::from)
            .ok()
            .or_else(|| args.verification_key_path.clone()),
        private_key,
    };

    CONFIG.set(config).expect("Config is already initialized!");
}

pub fn get_config() -> Result<&'static ManagerConfig> {
    CONFIG.get().ok_or(Error::config_not_initialized())
}
