/*!
 * Error types for Bulwark
 */

use bulwark_core_resilience::ResilienceError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BulwarkError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INVALID_CONFIG: i32 = 3;

#[derive(Debug, Error)]
pub enum BulwarkError {
    /// Settings file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Settings file is not valid TOML for [`Settings`](crate::settings::Settings)
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be rendered back to TOML
    #[error("Failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),

    /// A primitive rejected its configuration
    #[error("{section}.{name}: {source}")]
    Resilience {
        section: &'static str,
        name: String,
        #[source]
        source: ResilienceError,
    },

    /// No instance with this name was configured
    #[error("{section}.{name}: no such instance")]
    UnknownInstance { section: &'static str, name: String },

    /// Logging could not be set up
    #[error("Logging error: {0}")]
    Logging(String),
}

impl BulwarkError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BulwarkError::Parse(_)
            | BulwarkError::Resilience { .. }
            | BulwarkError::UnknownInstance { .. } => EXIT_INVALID_CONFIG,
            BulwarkError::Read { .. } | BulwarkError::Render(_) | BulwarkError::Logging(_) => {
                EXIT_FATAL
            }
        }
    }

    pub fn resilience(section: &'static str, name: &str, source: ResilienceError) -> Self {
        BulwarkError::Resilience {
            section,
            name: name.to_string(),
            source,
        }
    }

    pub fn unknown_instance(section: &'static str, name: &str) -> Self {
        BulwarkError::UnknownInstance {
            section,
            name: name.to_string(),
        }
    }
}
