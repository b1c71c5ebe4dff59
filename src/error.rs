use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Pin not configured: {0}")]
    NotConfigured(u32),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Line disconnected: {0}")]
    Disconnected(String),
}

impl GpioError {
    /// Errors after which retrying against the same line request is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpioError::Disconnected(_))
    }
}
