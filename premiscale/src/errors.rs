//! Error taxonomy (spec.md §7). `FatalError` is the subset that reaches the
//! Supervisor and ends the process; everything else is a per-subsystem
//! recoverable error that stays inside the component that issued the I/O.

/// Errors that terminate the process. Config errors exit `2`; everything
/// else here exits `1` (spec.md §6 CLI surface, §7 propagation policy).
#[derive(thiserror::Error, Debug)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("contract violation in {subsystem}: {detail}")]
    ContractViolation { subsystem: &'static str, detail: String },

    #[error("{subsystem} failed: {source}")]
    ChildFailed {
        subsystem: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl FatalError {
    /// Process exit code per spec.md §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 2,
            FatalError::ContractViolation { .. } | FatalError::ChildFailed { .. } => 1,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unknown config apiVersion: {0}")]
    UnknownVersion(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {detail}")]
    InvalidValue { field: String, detail: String },

    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
