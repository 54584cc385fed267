//! Vision-language model backend contract

use std::time::SystemTime;

use async_trait::async_trait;

use crate::Result;

/// One frame's worth of work handed to a backend
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Sequence number of the source frame
    pub frame_seq: u64,
    /// JPEG-encoded frame
    pub jpeg: Vec<u8>,
    /// Fully resolved prompt, context included
    pub prompt: String,
    pub max_tokens: u32,
    pub submitted_at: SystemTime,
}

/// A model that answers a text prompt about a single image.
///
/// Implementations must be safe to call from any task. The engine never
/// issues more than one call at a time, but nothing else is assumed.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    /// Model identifier reported to clients
    fn model(&self) -> String;

    /// Run the model and return its raw text output.
    ///
    /// Failures should be `PipelineError::Inference` or
    /// `PipelineError::Timeout`.
    async fn infer(&self, request: &InferenceRequest) -> Result<String>;

    /// Switch the model used by later calls.
    ///
    /// Backends serving a single fixed model ignore this.
    fn update_model(&self, _model: &str) {}
}
