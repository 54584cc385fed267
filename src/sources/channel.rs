//! Peer-fed frame source
//!
//! The peer-connection layer decodes webcam frames itself and pushes them in
//! through a [`FrameSender`]. The paired [`ChannelSource`] exposes them through
//! the same pull contract as the network source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use image::RgbImage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::source::{FrameSource, SourceControl, SourceStats};
use crate::types::{ConnectionState, Frame};
use crate::{PipelineError, Result};

/// Create a connected sender/source pair with room for `capacity` frames
pub fn channel_source(capacity: usize) -> (FrameSender, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(ChannelShared {
        cancel: CancellationToken::new(),
        ended: AtomicBool::new(false),
        frames_received: AtomicU64::new(0),
    });
    (FrameSender { tx, cancel: shared.cancel.clone() }, ChannelSource { rx, shared })
}

/// Producer half handed to the peer-connection layer
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<RgbImage>,
    cancel: CancellationToken,
}

impl FrameSender {
    /// Push a frame, waiting for queue space
    pub async fn send(&self, image: RgbImage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::stream_ended("source stopped"));
        }
        self.tx.send(image).await.map_err(|_| PipelineError::stream_ended("source dropped"))
    }

    /// Push a frame without waiting. Returns `false` if the frame was dropped
    /// because the queue is full or the source is gone.
    pub fn try_send(&self, image: RgbImage) -> bool {
        !self.cancel.is_cancelled() && self.tx.try_send(image).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

struct ChannelShared {
    cancel: CancellationToken,
    ended: AtomicBool,
    frames_received: AtomicU64,
}

impl SourceControl for ChannelShared {
    fn stop(&self) {
        debug!("Stopping peer-fed source");
        self.cancel.cancel();
    }

    fn stats(&self) -> SourceStats {
        let stopped = self.cancel.is_cancelled() || self.ended.load(Ordering::Relaxed);
        SourceStats {
            url: None,
            state: if stopped { ConnectionState::Stopped } else { ConnectionState::Connected },
            connected: !stopped,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            stopped,
            stream: None,
        }
    }
}

/// Pull side of a peer-fed frame queue
pub struct ChannelSource {
    rx: mpsc::Receiver<RgbImage>,
    shared: Arc<ChannelShared>,
}

impl ChannelSource {
    pub fn stats(&self) -> SourceStats {
        self.shared.stats()
    }

    pub fn stop(&self) {
        self.shared.stop();
    }
}

#[async_trait::async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Frame> {
        let image = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            image = self.rx.recv() => image,
        };

        match image {
            Some(image) => {
                let seq = self.shared.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(Frame::new(seq, image))
            }
            None => {
                if !self.shared.ended.swap(true, Ordering::Relaxed) {
                    info!(
                        "Peer track ended after {} frames",
                        self.shared.frames_received.load(Ordering::Relaxed)
                    );
                }
                self.rx.close();
                Err(PipelineError::stream_ended("peer track ended"))
            }
        }
    }

    fn control(&self) -> Arc<dyn SourceControl> {
        self.shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_numbered_in_push_order() {
        let (sender, mut source) = channel_source(4);
        for _ in 0..3 {
            sender.send(RgbImage::new(2, 2)).await.expect("send");
        }

        let seqs = [
            source.next_frame().await.expect("1").seq,
            source.next_frame().await.expect("2").seq,
            source.next_frame().await.expect("3").seq,
        ];
        assert_eq!(seqs, [1, 2, 3]);
        assert_eq!(source.stats().frames_received, 3);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        let (sender, _source) = channel_source(1);
        assert!(sender.try_send(RgbImage::new(1, 1)));
        assert!(!sender.try_send(RgbImage::new(1, 1)));
    }

    #[tokio::test]
    async fn dropping_the_sender_ends_the_stream() {
        let (sender, mut source) = channel_source(2);
        drop(sender);

        let err = source.next_frame().await.expect_err("ended");
        assert!(err.is_stream_ended());
        assert!(source.stats().stopped);
    }

    #[tokio::test]
    async fn stop_wakes_a_pending_pull() {
        let (sender, mut source) = channel_source(2);
        let control = source.control();

        let pull = tokio::spawn(async move { source.next_frame().await });
        tokio::task::yield_now().await;
        control.stop();
        control.stop();

        assert!(pull.await.expect("join").expect_err("stopped").is_stream_ended());
        assert!(sender.is_closed());
        assert!(sender.send(RgbImage::new(1, 1)).await.is_err());
    }
}
