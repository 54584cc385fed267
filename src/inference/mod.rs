//! Vision-language model inference
//!
//! - [`InferenceBackend`] is the model contract, with [`OpenAiBackend`] as
//!   the HTTP implementation
//! - [`InferenceEngine`] throttles calls to one in flight and keeps the
//!   temporal context used to build each prompt

mod backend;
mod engine;
mod history;
mod openai;
mod prompt;

pub use backend::{InferenceBackend, InferenceRequest};
pub use engine::{CurrentResult, INITIAL_RESULT, InferenceEngine, InferenceResult, Metrics};
pub use history::{HistorySummary, ResponseHistory};
pub use openai::{ModelInfo, OpenAiBackend};
pub use prompt::{CONTEXT_ENTRY_CHARS, build_contextual_prompt, truncate_entry};
