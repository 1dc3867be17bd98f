//! Error types for forknorm

use thiserror::Error;

/// Result type alias using forknorm's Error
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors reported synchronously by the kernel, before any unit is forked.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Invalid argument provided to a kernel call
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// A caller-owned buffer holds fewer elements than the call requires
    #[error("Buffer '{buffer}' too short: need {required} elements, got {actual}")]
    BufferTooShort {
        /// The buffer name
        buffer: &'static str,
        /// Elements required by the call
        required: usize,
        /// Elements actually available
        actual: usize,
    },

    /// A configuration value is out of range or cannot be parsed
    #[error("Invalid config '{key}': {reason}")]
    InvalidConfig {
        /// The configuration key
        key: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Malformed JSON configuration
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The worker pool backing a dispatcher could not be created
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl KernelError {
    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key,
            reason: reason.into(),
        }
    }

    /// Check that `buffer` holds at least `required` elements
    pub(crate) fn check_len(buffer: &'static str, actual: usize, required: usize) -> Result<()> {
        if actual < required {
            return Err(Self::BufferTooShort {
                buffer,
                required,
                actual,
            });
        }
        Ok(())
    }
}
