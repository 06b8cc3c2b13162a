//! Error - CLI Error Types
//!
//! Error handling for the dynfusion command line tool.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

// =============================================================================
// CLI Error Type
// =============================================================================

/// Errors that can occur while running a CLI command
#[derive(Error, Debug)]
pub enum CliError {
    /// Graph description could not be read or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The fusion engine rejected the graph or failed at runtime
    #[error("Fusion error: {0}")]
    Fusion(#[from] axonml_dynfusion::Error),

    /// Output could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Bad command line argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}
