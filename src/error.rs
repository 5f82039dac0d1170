use thiserror::Error;

use crate::coordination::ClaimError;

/// Process exit code for a successful command.
pub const EXIT_OK: i32 = 0;
/// Process exit code for fatal failures (store unavailable, I/O).
pub const EXIT_FATAL: i32 = 1;
/// Process exit code when another agent won a claim.
pub const EXIT_CONFLICT: i32 = 2;
/// Process exit code for rejected input or a disallowed transition.
pub const EXIT_VALIDATION: i32 = 3;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid trace carrier: {0}")]
    InvalidCarrier(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Store is locked by another process: {0}")]
    StoreLocked(std::path::PathBuf),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidRunTransition { from: String, to: String },

    #[error("No workflow registered for work type: {0}")]
    UnknownWorkType(String),
}

impl Error {
    /// Map an error onto the command-line exit code contract.
    ///
    /// Conflicts are distinguishable from true failures so that calling
    /// agents can move on to different work without operator help.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Claim(ClaimError::Conflict { .. }) => EXIT_CONFLICT,
            Error::Claim(ClaimError::StoreUnavailable(_)) => EXIT_FATAL,
            Error::Claim(_) => EXIT_VALIDATION,
            Error::Validation(_)
            | Error::InvalidCarrier(_)
            | Error::InvalidRunTransition { .. }
            | Error::UnknownWorkType(_) => EXIT_VALIDATION,
            _ => EXIT_FATAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
