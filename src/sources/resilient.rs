//! Reconnecting network stream source

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbImage;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connector::{StreamConnector, StreamHandle};
use crate::endpoint::StreamEndpoint;
use crate::source::{FrameSource, SourceControl, SourceStats, StreamInfo};
use crate::sync_utils::lock;
use crate::types::{ConnectionState, Frame};
use crate::{PipelineError, Result};

/// Frames between progress log lines (~10s at 30fps)
const PROGRESS_LOG_INTERVAL: u64 = 300;

/// Exponential backoff policy for reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Connection attempts per reconnection sequence
    pub attempts: u32,

    /// Wait before the second attempt; doubles for each attempt after that
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { attempts: 5, base_delay: Duration::from_secs(2) }
    }
}

impl ReconnectPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }

    /// Wait before 1-based attempt `attempt`: none for the first, then
    /// `base_delay * 2^(attempt - 2)`.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return None;
        }
        let factor = 1u32 << (attempt - 2).min(31);
        Some(self.base_delay.saturating_mul(factor))
    }
}

/// Outcome of one blocking read
enum ReadOutcome {
    Image(RgbImage),
    Stopped,
    Ended,
    Failed(PipelineError),
}

/// State shared between the read path, the reconnect routine and `stop()`
struct Shared {
    endpoint: StreamEndpoint,
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,

    /// Live connection, guarded by the one lock both reads and `stop()` take
    connection: Mutex<Option<Box<dyn StreamHandle>>>,
    stream_info: Mutex<Option<StreamInfo>>,
    state: watch::Sender<ConnectionState>,
    frames_received: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Apply a state transition if the state machine allows it
    fn transition(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!("Connection state {} -> {}", current, next);
                *current = next;
                applied = true;
            }
            applied
        });
        applied
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.state().is_terminal()
    }

    /// Open a fresh connection and install it (blocking)
    fn open_blocking(&self) -> Result<()> {
        info!("Connecting to stream: {}", self.endpoint);

        let mut handle = self.connector.connect(&self.endpoint).inspect_err(|e| {
            error!("Failed to connect to stream {}: {}", self.endpoint, e);
        })?;

        let stream_info = handle.info();
        info!(
            codec = %stream_info.codec,
            width = ?stream_info.width,
            height = ?stream_info.height,
            fps = ?stream_info.fps,
            "Stream connected"
        );

        let mut connection = lock(&self.connection);
        if self.is_stopped() {
            // Stopped while the handshake was in flight
            close_handle(handle.as_mut());
            return Err(PipelineError::stream_ended("source stopped"));
        }
        if let Some(mut stale) = connection.take() {
            close_handle(stale.as_mut());
        }
        *connection = Some(handle);
        *lock(&self.stream_info) = Some(stream_info);
        drop(connection);

        self.transition(ConnectionState::Connected);
        Ok(())
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        let shared = Arc::clone(self);
        tokio::task::spawn_blocking(move || shared.open_blocking()).await?
    }

    /// Read one frame (blocking). Checks the stop flag before and after
    /// taking the connection lock.
    fn read_blocking(&self) -> ReadOutcome {
        if self.is_stopped() {
            return ReadOutcome::Stopped;
        }

        let mut connection = lock(&self.connection);
        if self.is_stopped() {
            return ReadOutcome::Stopped;
        }
        if !self.state().is_readable() {
            return ReadOutcome::Ended;
        }
        let Some(handle) = connection.as_mut() else {
            return ReadOutcome::Ended;
        };

        match handle.read_frame(&self.cancel) {
            Ok(Some(image)) => ReadOutcome::Image(image),
            Ok(None) if self.cancel.is_cancelled() => ReadOutcome::Stopped,
            Ok(None) => {
                info!("Stream reached end of file");
                ReadOutcome::Ended
            }
            Err(_) if self.cancel.is_cancelled() => ReadOutcome::Stopped,
            Err(e) => {
                error!("Error decoding frame: {}", e);
                ReadOutcome::Failed(e)
            }
        }
    }

    async fn read(self: &Arc<Self>) -> Result<ReadOutcome> {
        let shared = Arc::clone(self);
        Ok(tokio::task::spawn_blocking(move || shared.read_blocking()).await?)
    }

    /// Drop the current connection, closing it first (blocking)
    fn release_blocking(&self) {
        let mut connection = lock(&self.connection);
        if let Some(mut handle) = connection.take() {
            close_handle(handle.as_mut());
        }
        *lock(&self.stream_info) = None;
    }

    /// Run one reconnection sequence with exponential backoff
    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        if !self.transition(ConnectionState::Reconnecting) {
            return Err(PipelineError::stream_ended("source stopped"));
        }
        info!("Attempting reconnection to {}", self.endpoint);

        let shared = Arc::clone(self);
        tokio::task::spawn_blocking(move || shared.release_blocking()).await?;

        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            info!("Reconnection attempt {}/{}", attempt, attempts);

            if let Some(delay) = self.policy.delay_before(attempt) {
                info!("Waiting {:?} before reconnection attempt", delay);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(PipelineError::stream_ended(
                            "source stopped during reconnection",
                        ));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.open().await {
                Ok(()) => {
                    info!("Reconnected successfully on attempt {}", attempt);
                    return Ok(());
                }
                Err(_) if self.is_stopped() => {
                    return Err(PipelineError::stream_ended("source stopped during reconnection"));
                }
                Err(e) => warn!("Reconnection attempt {} failed: {}", attempt, e),
            }
        }

        error!("Reconnection failed after {} attempts", attempts);
        self.transition(ConnectionState::Stopped);
        Err(PipelineError::stream_ended(format!("reconnection failed after {attempts} attempts")))
    }

    /// Mark the stream ended without an explicit stop
    fn mark_ended(&self) {
        self.transition(ConnectionState::Stopped);
        self.release_blocking();
    }
}

impl SourceControl for Shared {
    fn stop(&self) {
        debug!("Stopping stream source, stopped={}", self.is_stopped());

        // Flag first so pending reads and backoff sleeps bail out
        self.cancel.cancel();
        self.transition(ConnectionState::Stopped);

        // Waits for any in-progress read to release the connection
        let mut connection = lock(&self.connection);
        if let Some(mut handle) = connection.take() {
            debug!("Closing stream connection");
            close_handle(handle.as_mut());
            info!(
                "Stream closed: {} frames received",
                self.frames_received.load(Ordering::Relaxed)
            );
        }
        *lock(&self.stream_info) = None;
    }

    fn stats(&self) -> SourceStats {
        let state = self.state();
        let stopped = self.is_stopped();
        SourceStats {
            url: Some(self.endpoint.masked()),
            state,
            connected: state == ConnectionState::Connected && !stopped,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            stopped,
            stream: lock(&self.stream_info).clone(),
        }
    }

    fn is_stopped(&self) -> bool {
        Shared::is_stopped(self)
    }
}

fn close_handle(handle: &mut dyn StreamHandle) {
    if let Err(e) = handle.close() {
        warn!("Error closing stream connection: {}", e);
    }
}

/// Network stream source that transparently reconnects with backoff
///
/// Reads run on the blocking thread pool so demuxing never stalls the tasks
/// that deliver events or schedule inference.
pub struct ResilientSource {
    shared: Arc<Shared>,
}

impl ResilientSource {
    /// Connect to `endpoint` once. Reconnection only applies to failures
    /// after this initial handshake succeeds.
    pub async fn connect(
        endpoint: StreamEndpoint,
        connector: Arc<dyn StreamConnector>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            endpoint,
            connector,
            policy,
            cancel: CancellationToken::new(),
            connection: Mutex::new(None),
            stream_info: Mutex::new(None),
            state,
            frames_received: AtomicU64::new(0),
        });

        shared.open().await?;
        Ok(Self { shared })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch connection state transitions
    pub fn state_updates(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.stats().connected
    }

    pub fn stats(&self) -> SourceStats {
        self.shared.stats()
    }

    /// Stop the source; see [`SourceControl::stop`]
    pub fn stop(&self) {
        SourceControl::stop(self.shared.as_ref());
    }

    fn emit(&self, image: RgbImage) -> Frame {
        let seq = self.shared.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
        if seq % PROGRESS_LOG_INTERVAL == 0 {
            debug!("Received {} frames", seq);
        }
        Frame::new(seq, image)
    }
}

#[async_trait::async_trait]
impl FrameSource for ResilientSource {
    async fn next_frame(&mut self) -> Result<Frame> {
        if self.shared.is_stopped() {
            return Err(PipelineError::stream_ended("source stopped"));
        }

        match self.shared.read().await? {
            ReadOutcome::Image(image) => return Ok(self.emit(image)),
            ReadOutcome::Stopped => return Err(PipelineError::stream_ended("source stopped")),
            ReadOutcome::Ended => warn!("Stream ended unexpectedly, attempting reconnection"),
            ReadOutcome::Failed(e) => warn!("Read failed ({}), attempting reconnection", e),
        }

        self.shared.reconnect().await?;

        match self.shared.read().await? {
            ReadOutcome::Image(image) => Ok(self.emit(image)),
            ReadOutcome::Stopped => Err(PipelineError::stream_ended("source stopped")),
            ReadOutcome::Ended | ReadOutcome::Failed(_) => {
                let shared = Arc::clone(&self.shared);
                tokio::task::spawn_blocking(move || shared.mark_ended()).await?;
                Err(PipelineError::stream_ended("no frames after reconnection"))
            }
        }
    }

    fn control(&self) -> Arc<dyn SourceControl> {
        self.shared.clone()
    }
}

impl Drop for ResilientSource {
    fn drop(&mut self) {
        debug!("Dropping stream source");
        self.shared.cancel.cancel();
    }
}
