//! Custom error types for the application.
//!
//! `AcqError` consolidates every failure kind the acquisition pipeline can
//! produce, from configuration rejection (caught before any I/O) to
//! microcontroller handshake failures and worker crashes. Recoverable
//! conditions (frame timeouts, corrupt frames, queue backpressure) are *not*
//! errors: they are counted by the workers and surfaced in their reports.
//!
//! By using `#[from]`, `AcqError` can be seamlessly created from underlying
//! error types, so `?` works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Infeasible trigger schedule: {0}")]
    InfeasibleSchedule(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Camera '{name}' not found: {reason}")]
    DeviceNotFound { name: String, reason: String },

    #[error("Camera '{name}' rejected configuration: {reason}")]
    DeviceConfigRejected { name: String, reason: String },

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Microcontroller handshake failed: {0}")]
    McuHandshake(String),

    #[error("Microcontroller protocol error: {0}")]
    McuProtocol(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Worker '{0}' failed; see log for the underlying error")]
    WorkerFailed(String),

    #[error("Interrupted by operator")]
    Interrupted,

    #[error("Feature '{0}' is not enabled. Rebuild with --features {0}")]
    FeatureNotEnabled(&'static str),
}

impl AcqError {
    /// Process exit code for this error kind.
    ///
    /// 1 = validation failure, 2 = MCU handshake failure, 3 = worker crash,
    /// 130 = operator interrupt. Everything else maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            AcqError::McuHandshake(_) | AcqError::McuProtocol(_) => 2,
            AcqError::WorkerFailed(_) => 3,
            AcqError::Interrupted => 130,
            _ => 1,
        }
    }
}
