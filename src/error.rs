//! Error types for the ingestion, inference and broadcast pipeline.
//!
//! All errors implement `std::error::Error` and carry enough context to decide
//! whether the failing operation is worth retrying.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: the upstream video stream could not be opened
//! - **Stream Ended**: terminal, the source will produce no more frames
//! - **Inference Errors**: a single model call failed (counted, never retried)
//! - **Subscriber Delivery**: one subscriber channel is dead (pruned locally)
//! - **Telemetry Unavailable**: a hardware backend could not be sampled
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use livevlm::PipelineError;
//!
//! let error = PipelineError::connection_failed("rtsp://cam/stream", "connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! Endpoint strings stored in errors are always masked before construction, so
//! rendering an error never leaks stream credentials.

use std::time::Duration;
use thiserror::Error;

use crate::endpoint::mask_credentials;

/// Result type alias for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connection {
        endpoint: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Stream ended: {reason}")]
    StreamEnded { reason: String },

    #[error("Inference failed: {reason}")]
    Inference {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Delivery to subscriber {subscriber} failed: {reason}")]
    SubscriberDelivery { subscriber: u64, reason: String },

    #[error("Telemetry backend {backend} unavailable: {reason}")]
    TelemetryUnavailable { backend: String, reason: String },

    #[error("Frame decode error: {details}")]
    Decode { details: String },

    #[error("Image encoding failed: {details}")]
    Encode { details: String },

    #[error("Invalid configuration: {details}")]
    Config {
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Connection { .. } => true,
            PipelineError::Decode { .. } => true,
            PipelineError::Timeout { .. } => true,
            PipelineError::Inference { .. } => false,
            PipelineError::StreamEnded { .. } => false,
            PipelineError::SubscriberDelivery { .. } => false,
            PipelineError::TelemetryUnavailable { .. } => false,
            PipelineError::Encode { .. } => false,
            PipelineError::Config { .. } => false,
            PipelineError::Io(_) => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            PipelineError::Connection { .. } => vec![
                "Check the camera is reachable from this host",
                "Verify the stream URL, port and credentials",
                "Try TCP transport if UDP packets are being dropped",
            ],
            PipelineError::StreamEnded { .. } => vec![
                "Restart the source once the upstream stream is available again",
                "Increase reconnect_attempts or reconnect_delay",
            ],
            PipelineError::Inference { .. } => vec![
                "Check the inference server is running",
                "Verify api_base, model name and API key",
                "Increase the request timeout for slow models",
            ],
            PipelineError::SubscriberDelivery { .. } => vec![
                "Reconnect the subscriber",
                "Increase the per-subscriber channel capacity",
            ],
            PipelineError::TelemetryUnavailable { .. } => vec![
                "Install the vendor monitoring tools for this GPU",
                "Force the cpu platform in the telemetry configuration",
            ],
            PipelineError::Decode { .. } => vec![
                "Check the stream codec is supported",
                "Packet loss on the network path can corrupt frames",
            ],
            PipelineError::Encode { .. } => vec!["Check the frame dimensions are non-zero"],
            PipelineError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Compare the values against the documented defaults",
            ],
            PipelineError::Timeout { .. } => vec![
                "Increase timeout duration",
                "Check system and network load",
            ],
            PipelineError::Io(_) => vec!["Check file exists and is readable", "Check permissions"],
        }
    }

    /// Helper constructor for connection errors. The endpoint is masked.
    pub fn connection_failed(endpoint: &str, reason: impl Into<String>) -> Self {
        PipelineError::Connection {
            endpoint: mask_credentials(endpoint),
            reason: reason.into(),
            source: None,
        }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        endpoint: &str,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        PipelineError::Connection {
            endpoint: mask_credentials(endpoint),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for terminal end-of-stream.
    pub fn stream_ended(reason: impl Into<String>) -> Self {
        PipelineError::StreamEnded { reason: reason.into() }
    }

    /// Helper constructor for inference failures.
    pub fn inference_failed(reason: impl Into<String>) -> Self {
        PipelineError::Inference { reason: reason.into(), source: None }
    }

    /// Helper constructor for inference failures with source.
    pub fn inference_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        PipelineError::Inference { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for decode errors.
    pub fn decode_error(details: impl Into<String>) -> Self {
        PipelineError::Decode { details: details.into() }
    }

    /// Helper constructor for telemetry backend errors.
    pub fn telemetry_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::TelemetryUnavailable { backend: backend.into(), reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(details: impl Into<String>) -> Self {
        PipelineError::Config { details: details.into(), source: None }
    }

    /// Whether this error is the terminal end-of-stream signal.
    pub fn is_stream_ended(&self) -> bool {
        matches!(self, PipelineError::StreamEnded { .. })
    }
}

impl From<serde_yaml_ng::Error> for PipelineError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        PipelineError::Config { details: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::Encode { details: err.to_string() }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Io(std::io::Error::other(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn connection_errors_never_render_passwords(
            user in "[a-z]{1,8}",
            password in "[A-Za-z0-9]{4,16}",
            host in "[a-z]{1,10}",
            reason in "[a-z ]{0,20}"
          ) {
            let url = format!("rtsp://{}:{}@{}:554/stream", user, password, host);
            let error = PipelineError::connection_failed(&url, reason.clone());
            let rendered = error.to_string();

            let leaked = format!(":{}@", password);
            prop_assert!(!rendered.contains(&leaked));
            prop_assert!(rendered.contains("****"));
            prop_assert!(rendered.contains(&host));
            prop_assert!(rendered.contains(&reason));
          }

          #[test]
          fn error_messages_carry_their_context(
            reason in ".*",
            subscriber in 0u64..10_000u64,
            duration_ms in 1u64..60000u64
          ) {
            let ended = PipelineError::stream_ended(reason.clone());
            let inference = PipelineError::inference_failed(reason.clone());
            let delivery = PipelineError::SubscriberDelivery { subscriber, reason: reason.clone() };
            let timeout = PipelineError::Timeout { duration: Duration::from_millis(duration_ms) };

            prop_assert!(ended.to_string().contains(&reason));
            prop_assert!(inference.to_string().contains(&reason));
            prop_assert!(delivery.to_string().contains(&subscriber.to_string()));
            prop_assert!(!timeout.to_string().is_empty());
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<PipelineError>();

        let error = PipelineError::stream_ended("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(PipelineError::connection_failed("rtsp://cam", "refused").is_retryable());
        assert!(PipelineError::decode_error("bad slice").is_retryable());
        assert!(!PipelineError::stream_ended("exhausted").is_retryable());
        assert!(!PipelineError::inference_failed("500").is_retryable());
        assert!(!PipelineError::telemetry_unavailable("nvml", "missing").is_retryable());

        for error in [
            PipelineError::connection_failed("rtsp://cam", "refused"),
            PipelineError::stream_ended("done"),
            PipelineError::inference_failed("boom"),
        ] {
            assert!(!error.recovery_suggestions().is_empty());
        }
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::other("socket closed");
        let error =
            PipelineError::connection_failed_with_source("rtsp://cam", "open failed", Box::new(io));
        let source = std::error::Error::source(&error).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("socket closed"));
    }

    #[test]
    fn yaml_errors_convert_to_config() {
        let err = serde_yaml_ng::from_str::<Vec<u32>>("{ not: a list").unwrap_err();
        let converted: PipelineError = err.into();
        assert!(matches!(converted, PipelineError::Config { .. }));
    }
}
