//! Error types and handling for nicring

use crate::hw::HwError;

/// Result type alias for ring operations
pub type Result<T> = std::result::Result<T, RingError>;

/// Error taxonomy for the ring engine
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Not enough free buffers under non-blocking acquisition
    #[error("Resource exhausted: requested {requested}, available {available}")]
    ResourceExhausted { requested: usize, available: usize },

    /// Posting failed at the hardware interface
    #[error("Hardware rejected request: {message}")]
    HardwareRejected { message: String, transient: bool },

    /// Requested hardware offload is not advertised by this ring
    #[error("Offload unsupported: {feature}")]
    OffloadUnsupported { feature: &'static str },

    /// Non-offload hardware feature is missing
    #[error("Feature unsupported: {feature}")]
    Unsupported { feature: &'static str },

    /// A blocking wait was cancelled
    #[error("Wait interrupted")]
    Interrupted,

    /// Buffer accounting invariant broken
    #[error("Consistency violation: {message}")]
    ConsistencyViolation { message: String },

    /// The underlying interface is down
    #[error("Ring is down")]
    RingDown,

    /// The ring latched a consistency violation earlier
    #[error("Ring is faulted after a consistency violation")]
    RingFaulted,

    /// Offload context was already released
    #[error("Offload context {id} has been released")]
    StaleContext { id: u64 },

    /// Offload context still referenced by posted work
    #[error("Offload context {id} has {in_flight} operations in flight")]
    ContextBusy { id: u64, in_flight: u32 },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Completion channel failures
    #[error("Notification error: {message}")]
    Notification { message: String },

    /// I/O related errors (region mapping, eventfd)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl RingError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a resource exhausted error
    pub fn exhausted(requested: usize, available: usize) -> Self {
        Self::ResourceExhausted {
            requested,
            available,
        }
    }

    /// Create a consistency violation
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a notification error
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
        }
    }

    /// Create a transient (backpressure) hardware rejection
    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::HardwareRejected {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether the caller may back off and retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } | Self::Interrupted => true,
            Self::HardwareRejected { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether the ring must be abandoned
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyViolation { .. } | Self::RingFaulted)
    }
}

impl From<std::io::Error> for RingError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<HwError> for RingError {
    fn from(err: HwError) -> Self {
        match err {
            HwError::QueueFull => Self::backpressure("send queue full"),
            HwError::InvalidDescriptor(reason) => Self::HardwareRejected {
                message: format!("invalid descriptor: {}", reason),
                transient: false,
            },
            HwError::Unsupported(feature) => Self::Unsupported { feature },
            HwError::Fatal(reason) => Self::HardwareRejected {
                message: reason,
                transient: false,
            },
        }
    }
}
