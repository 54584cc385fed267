//! Live video to vision-language model pipeline.
//!
//! livevlm pulls frames from a live video source, hands a sampled subset to a
//! vision-language model one call at a time, and fans the answers out to any
//! number of subscribers together with hardware telemetry.
//!
//! # Features
//!
//! - **Resilient sources**: network streams reconnect with exponential backoff;
//!   peer-fed frames share the same pull contract
//! - **Single-flight inference**: frames arriving while the model is busy are
//!   dropped, so answers always describe a recent frame
//! - **Temporal context**: recent answers are folded into the next prompt
//! - **Non-blocking fan-out**: slow or dead subscribers are pruned, never waited on
//! - **Telemetry**: NVIDIA, Jetson or host-only metrics with a rolling history
//!
//! # Example
//!
//! ```rust,no_run
//! use livevlm::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> livevlm::Result<()> {
//!     livevlm::logging::init("livevlm=info");
//!
//!     let config = PipelineConfig::load("livevlm.yaml")?;
//!     let mut pipeline = Pipeline::with_openai(config)?;
//!     pipeline.start_telemetry().await;
//!
//!     // Frames decoded by the peer connection are pushed in here
//!     let frames = pipeline.attach_peer().await;
//!     let mut events = pipeline.subscribe();
//!
//!     # drop(frames);
//!     while let Some(event) = events.recv().await {
//!         println!("{event}");
//!     }
//!
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
pub mod endpoint;
mod error;
pub mod logging;
mod sync_utils;
pub mod types;

// Frame ingestion
pub mod driver;
pub mod source;
pub mod sources;
pub mod stream;

// Inference, fan-out and telemetry
pub mod broadcast;
pub mod inference;
pub mod pipeline;
pub mod telemetry;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use broadcast::{Broadcaster, ClientCommand, Event, Subscription};
pub use config::PipelineConfig;
pub use endpoint::StreamEndpoint;
pub use inference::{InferenceBackend, InferenceEngine, InferenceResult, Metrics, OpenAiBackend};
pub use pipeline::Pipeline;
pub use source::{FrameSource, SourceControl, SourceStats};
pub use sources::{ChannelSource, FrameSender, ReconnectPolicy, ResilientSource};
pub use telemetry::{TelemetrySampler, TelemetrySnapshot};
