//! Error types for MCA acquisition control.
//!
//! Every component returns [`Result`]; nothing panics across a component
//! boundary. The variants follow the failure taxonomy of the acquisition
//! core:
//!
//! - [`McaError::NullOrUnbound`] - a library binding or reference was never
//!   initialized. Fatal to the call, never retried.
//! - [`McaError::DeviceIo`] - the transport or hardware reported a failure,
//!   carrying the backend's native code and its vendor text.
//! - [`McaError::Range`] - a preset does not fit the 32-bit hardware encoding.
//! - [`McaError::TimedOut`] - a busy-wait or calibration exceeded its deadline.
//! - [`McaError::Unsupported`] - the backend variant lacks an optional
//!   capability.

use thiserror::Error;

/// Result type alias for MCA operations.
pub type Result<T> = std::result::Result<T, McaError>;

/// Errors that can occur while controlling an MCA channel.
#[derive(Error, Debug)]
pub enum McaError {
    /// A library binding, capability or reference was never initialized.
    #[error("{what} is not bound")]
    NullOrUnbound {
        /// What was missing
        what: String,
    },

    /// The backend reported a failure.
    #[error("{backend} error ({code}): {message}")]
    DeviceIo {
        /// Backend that failed
        backend: &'static str,
        /// Native status code
        code: i32,
        /// Vendor error text
        message: String,
    },

    /// A preset would overflow the hardware encoding.
    #[error("{message} (maximum representable preset is {max_seconds} s)")]
    Range {
        /// What overflowed
        message: String,
        /// Largest preset the register holds, in seconds
        max_seconds: f64,
    },

    /// A busy-wait or calibration exceeded its deadline.
    #[error("{operation} timed out after {seconds} s")]
    TimedOut {
        /// Operation that ran out of time
        operation: String,
        /// Deadline in seconds
        seconds: f64,
    },

    /// The backend variant does not implement an optional operation.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        /// Backend lacking the operation
        backend: &'static str,
        /// Operation requested
        operation: &'static str,
    },

    /// Invalid configuration or parameter.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong
        message: String,
    },

    /// Region of interest outside the spectrum or the ROI table.
    #[error("Invalid ROI {index}: {message}")]
    InvalidRoi {
        /// ROI table index
        index: usize,
        /// What is wrong
        message: String,
    },

    /// A controller is already registered for this channel id.
    #[error("Channel '{id}' is already registered")]
    ChannelAlreadyRegistered {
        /// Channel id
        id: String,
    },

    /// No controller is registered for this channel id.
    #[error("Channel '{id}' is not registered")]
    ChannelNotFound {
        /// Channel id
        id: String,
    },

    /// The remote peer sent something the proxy could not interpret.
    #[error("Remote transport error: {message}")]
    Transport {
        /// What the proxy could not interpret
        message: String,
    },

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl McaError {
    /// Build a [`McaError::DeviceIo`].
    pub fn device_io(backend: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::DeviceIo {
            backend,
            code,
            message: message.into(),
        }
    }

    /// Build a [`McaError::NullOrUnbound`].
    pub fn unbound(what: impl Into<String>) -> Self {
        Self::NullOrUnbound { what: what.into() }
    }

    /// Build a [`McaError::InvalidConfig`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Native backend code, if this is a device I/O error.
    pub fn device_io_code(&self) -> Option<i32> {
        match self {
            Self::DeviceIo { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error came from a deadline.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Check if this error reports a missing capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Check if this error reports an unbound library or reference.
    pub fn is_unbound(&self) -> bool {
        matches!(self, Self::NullOrUnbound { .. })
    }
}

impl From<figment::Error> for McaError {
    fn from(err: figment::Error) -> Self {
        Self::InvalidConfig {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for McaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McaError::device_io("detector_library", -17, "run already active");
        assert!(err.to_string().contains("-17"));
        assert!(err.to_string().contains("run already active"));
        assert_eq!(err.device_io_code(), Some(-17));
    }

    #[test]
    fn test_range_reports_limit() {
        let err = McaError::Range {
            message: "Preset of 2000 s overflows".to_string(),
            max_seconds: 1717.986918,
        };
        assert!(err.to_string().contains("1717.986918"));
    }

    #[test]
    fn test_classification() {
        let timed_out = McaError::TimedOut {
            operation: "clock calibration".to_string(),
            seconds: 10.0,
        };
        assert!(timed_out.is_timed_out());
        assert!(!timed_out.is_unsupported());
        assert_eq!(timed_out.device_io_code(), None);

        let unsupported = McaError::Unsupported {
            backend: "remote",
            operation: "read_adc_trace",
        };
        assert!(unsupported.is_unsupported());
        assert!(McaError::unbound("module library").is_unbound());
    }
}
