use thiserror::Error;

/// Reasons a device label could not be resolved.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device number {index} is out of range, choose 1-{len}")]
    IndexOutOfRange { index: String, len: usize },

    #[error("Unknown device '{name}', valid devices: {}", .valid.join(", "))]
    UnknownName { name: String, valid: Vec<String> },

    #[error("No device selected: input closed")]
    InputClosed,

    #[error("Console error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single measurement cycle. None of them is retried.
#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("No server reachable: {0}")]
    NoServerReachable(String),

    #[error("Measurement timed out: {0}")]
    Timeout(String),

    #[error("Measurement engine error: {0}")]
    Engine(String),
}

impl From<reqwest::Error> for MeasurementError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MeasurementError::Timeout(err.to_string())
        } else if err.is_connect() {
            MeasurementError::NoServerReachable(err.to_string())
        } else {
            MeasurementError::Engine(err.to_string())
        }
    }
}
