//! Driver spawns and manages the frame pump task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::inference::InferenceEngine;
use crate::source::{FrameSource, SourceControl};
use crate::types::{Cadence, Frame};

/// Consecutive non-terminal source errors tolerated before giving up
const MAX_ERRORS: u32 = 10;

/// Result of spawning the driver task
pub struct DriverChannels {
    /// Every pulled frame. `None` before the first frame and again once the
    /// source has ended.
    pub frames: watch::Receiver<Option<Frame>>,
    /// Control over the source the task owns
    pub control: Arc<dyn SourceControl>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Decides which pulled frames are offered to the engine
struct Sampler {
    cadence: Cadence,
    min_gap: Option<Duration>,
    last_accepted: Option<Instant>,
}

impl Sampler {
    fn new(cadence: Cadence) -> Self {
        Self { cadence, min_gap: cadence.throttle_interval(), last_accepted: None }
    }

    fn wants(&self, count: u64) -> bool {
        match (self.min_gap, self.last_accepted) {
            (Some(gap), Some(last)) => last.elapsed() >= gap,
            (Some(_), None) => true,
            (None, _) => self.cadence.selects(count),
        }
    }

    fn accepted(&mut self) {
        self.last_accepted = Some(Instant::now());
    }
}

/// Driver spawns and manages the frame pump
///
/// The pump owns the source, republishes every frame on a watch channel and
/// offers the sampled subset to the inference engine.
pub struct Driver;

impl Driver {
    /// Spawn the pump task for `source`
    pub fn spawn<S>(source: S, engine: InferenceEngine, cadence: Cadence) -> DriverChannels
    where
        S: FrameSource,
    {
        let (frame_tx, frame_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let control = source.control();

        let cancel_task = cancel.clone();
        let task = tokio::spawn(async move {
            Self::frame_pump_task(source, engine, cadence, frame_tx, cancel_task).await;
        });

        DriverChannels { frames: frame_rx, control, cancel, task }
    }

    async fn frame_pump_task<S>(
        mut source: S,
        engine: InferenceEngine,
        cadence: Cadence,
        frame_tx: watch::Sender<Option<Frame>>,
        cancel: CancellationToken,
    ) where
        S: FrameSource,
    {
        info!("Frame pump started ({:?})", cadence);
        let mut frame_count = 0u64;
        let mut submitted = 0u64;
        let mut error_count = 0u32;
        let mut sampler = Sampler::new(cadence);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Frame pump cancelled");
                    break;
                }
                result = source.next_frame() => result,
            };

            match result {
                Ok(frame) => {
                    frame_count += 1;
                    error_count = 0;
                    trace!("Frame {} ({}x{})", frame.seq, frame.width(), frame.height());

                    if sampler.wants(frame_count) && engine.submit_frame(frame.clone()) {
                        sampler.accepted();
                        submitted += 1;
                    }

                    if frame_tx.send(Some(frame)).is_err() {
                        debug!("Frame receiver dropped, shutting down");
                        break;
                    }
                }
                Err(e) if e.is_stream_ended() => {
                    info!("Frame source ended after {} frames: {}", frame_count, e);
                    let _ = frame_tx.send(None);
                    break;
                }
                Err(e) => {
                    // Don't crash on failures the source passed through
                    error_count += 1;
                    error!("Frame source error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many frame source errors, shutting down");
                        let _ = frame_tx.send(None);
                        break;
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!("Frame pump ended ({} frames, {} submitted for inference)", frame_count, submitted);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use image::RgbImage;

    use super::*;
    use crate::config::InferenceConfig;
    use crate::inference::{InferenceBackend, InferenceRequest};
    use crate::sources::channel_source;
    use crate::{PipelineError, Result};

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for CountingBackend {
        fn model(&self) -> String {
            "counting".into()
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("frame {}", request.frame_seq))
        }
    }

    fn engine(backend: Arc<CountingBackend>) -> InferenceEngine {
        InferenceEngine::new(backend, &InferenceConfig::default())
    }

    #[tokio::test]
    async fn republishes_frames_and_samples_every_nth() {
        let _ = tracing_subscriber::fmt::try_init();
        let backend = Arc::new(CountingBackend::default());
        let engine = engine(backend.clone());
        let mut results = engine.subscribe_results();

        let (sender, source) = channel_source(16);
        let mut channels = Driver::spawn(source, engine.clone(), Cadence::EveryNth(3));

        for _ in 0..3 {
            sender.send(RgbImage::new(4, 4)).await.expect("send");
        }
        let result = results.recv().await.expect("result");
        assert_eq!(result.frame_seq, 3);

        channels
            .frames
            .wait_for(|f| f.as_ref().is_some_and(|f| f.seq == 3))
            .await
            .expect("frame 3");

        drop(sender);
        channels.task.await.expect("pump");
        assert!(channels.frames.borrow().is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(channels.control.is_stopped());
    }

    #[tokio::test]
    async fn cancel_stops_the_pump() {
        let engine = engine(Arc::new(CountingBackend::default()));
        let (_sender, source) = channel_source(4);
        let channels = Driver::spawn(source, engine, Cadence::default());

        channels.cancel.cancel();
        channels.task.await.expect("pump");
    }

    struct Flaky {
        remaining_errors: u32,
    }

    #[async_trait]
    impl FrameSource for Flaky {
        async fn next_frame(&mut self) -> Result<Frame> {
            if self.remaining_errors > 0 {
                self.remaining_errors -= 1;
                return Err(PipelineError::decode_error("corrupt packet"));
            }
            Err(PipelineError::stream_ended("done"))
        }

        fn control(&self) -> Arc<dyn SourceControl> {
            let (_sender, source) = channel_source(1);
            source.control()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_too_many_errors() {
        let engine = engine(Arc::new(CountingBackend::default()));
        let start = Instant::now();
        let channels = Driver::spawn(Flaky { remaining_errors: 50 }, engine, Cadence::default());

        channels.task.await.expect("pump");
        assert!(channels.frames.borrow().is_none());
        // Nine backoffs: 100, 200, 400, 800, then 1600 capped
        assert!(start.elapsed() >= Duration::from_millis(100 + 200 + 400 + 800 + 1600 * 5));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_absorbed() {
        let engine = engine(Arc::new(CountingBackend::default()));
        let channels = Driver::spawn(Flaky { remaining_errors: 3 }, engine, Cadence::default());
        channels.task.await.expect("pump");
    }

    #[test]
    fn rate_cadence_gates_on_elapsed_time() {
        let mut sampler = Sampler::new(Cadence::Max(1000));
        assert!(sampler.wants(1));
        sampler.accepted();
        std::thread::sleep(Duration::from_millis(5));
        assert!(sampler.wants(2));

        let sampler = Sampler::new(Cadence::EveryNth(2));
        assert!(!sampler.wants(1));
        assert!(sampler.wants(2));
    }
}
