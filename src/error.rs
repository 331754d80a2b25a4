/// Central error type for the relay node.
///
/// Subsystems keep their own closed error sets (capture classification in
/// particular); this enum is the surface crossed at the crate boundary:
/// startup, configuration, and I/O plumbing.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("logging initialization error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;

    #[test]
    fn test_error_display() {
        let error = RelayError::Config("server.host is empty".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: server.host is empty"
        );

        let error = RelayError::Logging("subscriber already set".to_string());
        assert!(error.to_string().contains("logging initialization"));
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let error: RelayError = io_error.into();
        assert!(matches!(error, RelayError::Io(_)));
        assert!(error.to_string().contains("IO error"));

        let error: RelayError = CaptureError::NoData.into();
        assert!(matches!(error, RelayError::Capture(_)));
    }

    #[test]
    fn test_result_alias() {
        fn ok_fn() -> RelayResult<u32> {
            Ok(7)
        }
        fn err_fn() -> RelayResult<u32> {
            Err(RelayError::Config("bad".to_string()))
        }

        assert_eq!(ok_fn().unwrap(), 7);
        assert!(matches!(err_fn(), Err(RelayError::Config(_))));
    }
}
