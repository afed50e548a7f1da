//! Error types for blockctl.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Setup script failed: {0}")]
    SetupFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
