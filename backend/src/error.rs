#[derive(Debug, thiserror::Error)]
pub enum TaggerError {
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    TooLarge(String),
    /// Failure raised by the accelerator runtime while scoring.
    #[error("{0}")]
    DeviceFault(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Model(String),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl TaggerError {
    /// Stable name reported to clients alongside the message.
    pub fn classification(&self) -> &'static str {
        match self {
            TaggerError::Input(_) => "InputError",
            TaggerError::TooLarge(_) => "PayloadTooLarge",
            TaggerError::DeviceFault(_) => "DeviceFault",
            TaggerError::Config(_) => "ConfigError",
            TaggerError::Protocol(_) => "ProtocolError",
            TaggerError::Model(_) => "ModelError",
            TaggerError::Image(_) => "ImageError",
            TaggerError::Io(_) => "IoError",
        }
    }

    pub fn is_device_fault(&self) -> bool {
        matches!(self, TaggerError::DeviceFault(_))
    }

    /// Configuration errors leave the service in an inconsistent state and must stop it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaggerError::Config(_))
    }

    pub fn describe(&self) -> String {
        format!("{}: {}", self.classification(), self)
    }
}

impl From<serde_json::Error> for TaggerError {
    fn from(err: serde_json::Error) -> Self {
        TaggerError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_prefixes_classification() {
        let err = TaggerError::Input("limit must be a non-negative integer".into());
        assert_eq!(
            err.describe(),
            "InputError: limit must be a non-negative integer"
        );
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(TaggerError::Config("vocabulary mismatch".into()).is_fatal());
        assert!(!TaggerError::DeviceFault("CUDA error".into()).is_fatal());
        assert!(!TaggerError::Protocol("bad json".into()).is_fatal());
    }

    #[test]
    fn json_errors_are_protocol_errors() {
        let err: TaggerError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.classification(), "ProtocolError");
    }
}
