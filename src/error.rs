use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. The variants mirror the kinds that cross the wire:
/// peers receive `{ kind, message }`, the admin surface maps everything to a
/// 500 with the same pair.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("deadline passed: {0}")]
    DeadlinePassed(String),

    #[error("replay: {0}")]
    Replay(String),

    #[error("invalid proof: {0}")]
    ProofInvalid(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// The wire-level error kind, sent back to peers in typed error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::Forbidden(_) => "Forbidden",
            Error::DeadlinePassed(_) => "DeadlinePassed",
            Error::Replay(_) => "Replay",
            Error::ProofInvalid(_) => "ProofInvalid",
            Error::Store(_) | Error::Io(_) | Error::Serde(_) => "StoreError",
            Error::Transport(_) => "TransportError",
            Error::Cancelled(_) => "Cancelled",
            Error::Custom(_) => "Internal",
        }
    }

    pub fn unknown_template(id: &str) -> Self {
        Error::NotFound(format!("template {id} is not registered"))
    }

    pub fn duplicate_task(id: &str) -> Self {
        Error::Conflict(format!("task {id} already exists"))
    }

    pub fn not_offered(id: &str) -> Self {
        Error::Conflict(format!("task {id} is not in the offered state"))
    }

    pub fn not_accepted(id: &str) -> Self {
        Error::Conflict(format!("task {id} is not in the accepted state"))
    }

    pub fn wrong_worker(id: &str) -> Self {
        Error::Forbidden(format!("task {id} is assigned to a different worker"))
    }

    pub fn already_onboarded(peer: &str) -> Self {
        Error::Conflict(format!("worker {peer} is already onboarded"))
    }

    pub fn access_codes_required() -> Self {
        Error::Forbidden("onboarding requires an access code".to_string())
    }

    pub fn bad_access_code() -> Self {
        Error::Forbidden("access code is unknown or already consumed".to_string())
    }

    pub fn replayed_nonce(peer: &str) -> Self {
        Error::Replay(format!("onboarding nonce for {peer} was already used"))
    }

    pub fn unknown_nonce(nonce: u64) -> Self {
        Error::NotFound(format!("no payment record with nonce {nonce}"))
    }

    pub fn batch_too_large(span: u64, max: u32) -> Self {
        Error::InvalidArgument(format!("batch spans {span} records, maximum is {max}"))
    }

    pub fn inconsistent_sum(claimed: u64, recorded: u64) -> Self {
        Error::ProofInvalid(format!(
            "claimed sum {claimed} does not match recorded sum {recorded}"
        ))
    }

    pub fn range_overlap(expected: u64, got: u64) -> Self {
        Error::ProofInvalid(format!(
            "proof range must continue at nonce {expected}, got {got}"
        ))
    }

    pub fn payments_disabled() -> Self {
        Error::Forbidden("payments are disabled: no payment account configured".to_string())
    }

    pub fn config_not_initialized() -> Self {
        Error::Custom("manager config is not initialized".to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Store(e.to_string())
    }
}
