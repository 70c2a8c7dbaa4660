/// Result alias that carries the custom [`BeatSyncError`] type.
pub type Result<T> = std::result::Result<T, BeatSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatSyncError {
    /// Free-form message for failures that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The capture device could not be opened. The session never starts.
    #[error("audio device {device} could not be opened: {reason}")]
    Device { device: String, reason: String },
    /// The OSC destination could not be parsed or resolved.
    #[error("invalid OSC endpoint {host}:{port}: {reason}")]
    Endpoint {
        host: String,
        port: u16,
        reason: String,
    },
    /// A single datagram failed to leave the socket.
    #[error("failed to send {address} to {host}:{port}: {reason}")]
    Transport {
        host: String,
        port: u16,
        address: String,
        reason: String,
    },
    /// Rejected configuration or argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Malformed JSON configuration document.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
    /// OSC packet serialisation failure.
    #[error("OSC encoding error: {0:?}")]
    Encode(rosc::OscError),
}

impl BeatSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn device(device: impl ToString, reason: impl ToString) -> Self {
        Self::Device {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }
}

impl From<&str> for BeatSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<rosc::OscError> for BeatSyncError {
    fn from(value: rosc::OscError) -> Self {
        Self::Encode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_names_device_and_cause() {
        let err = BeatSyncError::device("#7", "no such input device");
        let text = err.to_string();
        assert!(text.contains("#7"));
        assert!(text.contains("no such input device"));
    }
}
