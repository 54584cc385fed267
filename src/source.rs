//! Frame source trait and shared source types

use std::sync::Arc;

use serde::Serialize;

use crate::Result;
use crate::types::{ConnectionState, Frame};

/// Trait for anything that yields decoded frames
///
/// Two sources feed the same downstream contract and are mutually exclusive
/// within one pipeline: a reconnecting network stream and a peer connection
/// pushing webcam frames.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Pull the next frame, waiting for it if necessary.
    ///
    /// Returns:
    /// - `Ok(frame)` - frames arrive in strictly increasing `seq` order
    /// - `Err(PipelineError::StreamEnded)` - terminal, no more frames will come
    /// - `Err(e)` - any other failure the source could not absorb
    async fn next_frame(&mut self) -> Result<Frame>;

    /// Control handle usable from other tasks while `next_frame` is pending
    fn control(&self) -> Arc<dyn SourceControl>;
}

/// Out-of-band control over a running source
pub trait SourceControl: Send + Sync + 'static {
    /// Stop the source. Idempotent.
    ///
    /// May block briefly while an in-progress read finishes; call it through
    /// `spawn_blocking` from async contexts.
    fn stop(&self);

    /// Current statistics
    fn stats(&self) -> SourceStats;

    fn is_stopped(&self) -> bool {
        self.stats().stopped
    }
}

/// Properties of the upstream video stream reported by the connector
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
}

/// Snapshot of a source's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    /// Masked URL, absent for peer-fed sources
    pub url: Option<String>,
    pub state: ConnectionState,
    pub connected: bool,
    pub frames_received: u64,
    pub stopped: bool,
    #[serde(flatten)]
    pub stream: Option<StreamInfo>,
}
