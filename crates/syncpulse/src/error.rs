use miette::Diagnostic;
use thiserror::Error;

/// Top-level CLI error with process exit codes.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] syncpulse_config::ConfigError),

    #[error(transparent)]
    Api(#[from] syncpulse_api::Error),

    #[error(transparent)]
    Core(#[from] syncpulse_core::CoreError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Api(_) | Self::Core(_) => 1,
        }
    }
}
