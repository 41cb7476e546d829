//! Errors raised by the attach and detach machinery. The retry policy of
//! the connector outer loop dispatches on variants, so each failure class
//! from the taxonomy gets its own variant rather than a message string.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeviceError {
    /// The retryable sentinel: every worker settled and no block device
    /// ever appeared. The only error the connect outer loop retries on.
    #[snafu(display("volume device not found"))]
    VolumeNotFound,

    #[snafu(display("timeout"))]
    CommandTimeout { command: String },

    #[snafu(display("command `{}` failed with code {}: {}", command, code, output))]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[snafu(display("failed to run `{}`: {}", command, source))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("login to portal {} failed: {}", portal, reason))]
    LoginFailed { portal: String, reason: String },

    #[snafu(display(
        "device {} identity {} does not match expected {}",
        device,
        actual,
        expected
    ))]
    IdentityMismatch {
        device: String,
        actual: String,
        expected: String,
    },

    #[snafu(display(
        "initiator {} is already attached to host {}",
        initiator,
        host
    ))]
    InitiatorConflict { initiator: String, host: String },

    #[snafu(display("no connector registered for transport {}", transport))]
    NotRegistered { transport: String },

    #[snafu(display("connector for transport {} already registered", transport))]
    AlreadyRegistered { transport: String },

    #[snafu(display("invalid connect request: {}", reason))]
    InvalidRequest { reason: String },

    #[snafu(display("multipath tooling unavailable: {}", reason))]
    MultipathUnavailable { reason: String },

    #[snafu(display("disconnect of {} timed out: device still present", id))]
    DisconnectTimeout { id: String },

    #[snafu(display("task {} failed: {}", task, reason))]
    TaskFailed { task: String, reason: String },

    #[snafu(display("array request failed: {}", reason))]
    Array { reason: String },

    #[snafu(display("IO error: {}", source))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error: {}", source))]
    Json { source: serde_json::Error },

    #[snafu(display("NVMe error: {}", source))]
    Nvme { source: nvmectl::NvmeError },

    #[snafu(display("{}", message))]
    Generic { message: String },
}

impl DeviceError {
    pub fn new(message: &str) -> DeviceError {
        DeviceError::Generic {
            message: message.to_string(),
        }
    }

    /// Whether the error is the device-not-found sentinel the connect
    /// outer loop is allowed to retry on.
    pub fn is_volume_not_found(&self) -> bool {
        matches!(self, DeviceError::VolumeNotFound)
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(source: std::io::Error) -> DeviceError {
        DeviceError::Io { source }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(source: serde_json::Error) -> DeviceError {
        DeviceError::Json { source }
    }
}

impl From<nvmectl::NvmeError> for DeviceError {
    fn from(source: nvmectl::NvmeError) -> DeviceError {
        DeviceError::Nvme { source }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError::Generic { message }
    }
}
