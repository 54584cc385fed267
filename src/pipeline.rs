//! Pipeline owner context
//!
//! [`Pipeline`] constructs and holds the inference engine, broadcaster,
//! telemetry sampler and at most one frame source, and wires them together:
//!
//! ```text
//! source -> driver -> engine -> broadcaster -> subscribers
//!                              telemetry -^
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, ClientCommand, Event, Subscription};
use crate::config::PipelineConfig;
use crate::driver::{Driver, DriverChannels};
use crate::inference::{InferenceBackend, InferenceEngine, InferenceResult, OpenAiBackend};
use crate::source::{FrameSource, SourceStats};
use crate::sources::{
    FrameSender, ReconnectPolicy, ResilientSource, StreamConnector, channel_source,
};
use crate::stream::ThrottleExt;
use crate::telemetry::TelemetrySampler;
use crate::types::Frame;
use crate::{PipelineError, Result};

/// Slowest rate `frames()` throttles to
const MIN_FRAME_HZ: f64 = 0.001;

/// Live video to VLM pipeline
pub struct Pipeline {
    config: PipelineConfig,
    engine: InferenceEngine,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
    forwarder: Option<(CancellationToken, JoinHandle<()>)>,
    telemetry: Option<(CancellationToken, JoinHandle<()>)>,
    source: Option<DriverChannels>,
}

impl Pipeline {
    /// Build a pipeline around `backend`. Must be called inside a tokio
    /// runtime.
    pub fn new(config: PipelineConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        config.validate()?;

        let engine = InferenceEngine::new(backend, &config.inference);
        let broadcaster = Broadcaster::new(config.broadcast.channel_capacity);
        let cancel = CancellationToken::new();

        let forwarder_cancel = cancel.child_token();
        let forwarder = tokio::spawn(forward_results(
            engine.clone(),
            engine.subscribe_results(),
            broadcaster.clone(),
            forwarder_cancel.clone(),
        ));

        info!("Pipeline ready (model={})", engine.backend().model());
        Ok(Self {
            config,
            engine,
            broadcaster,
            cancel,
            forwarder: Some((forwarder_cancel, forwarder)),
            telemetry: None,
            source: None,
        })
    }

    /// Build a pipeline talking to an OpenAI-compatible server
    pub fn with_openai(config: PipelineConfig) -> Result<Self> {
        if config.inference.model.is_empty() {
            return Err(PipelineError::config_error("inference.model must be set"));
        }
        let backend = Arc::new(OpenAiBackend::new(&config.inference)?);
        Self::new(config, backend)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Start the telemetry sampler if enabled, probing the platform
    pub async fn start_telemetry(&mut self) {
        if !self.config.telemetry.enabled {
            debug!("Telemetry disabled");
            return;
        }
        if self.telemetry.is_some() {
            return;
        }

        // Probing may shell out to nvidia-smi
        let config = self.config.telemetry.clone();
        match tokio::task::spawn_blocking(move || TelemetrySampler::from_config(&config)).await {
            Ok(sampler) => self.start_telemetry_with(sampler),
            Err(e) => warn!("Telemetry probe failed: {}", e),
        }
    }

    /// Start telemetry with a prepared sampler. No-op if already running.
    pub fn start_telemetry_with(&mut self, sampler: TelemetrySampler) {
        if self.telemetry.is_some() {
            return;
        }
        let cancel = self.cancel.child_token();
        let interval = self.config.telemetry.interval();
        let task = sampler.spawn(interval, self.broadcaster.clone(), cancel.clone());
        self.telemetry = Some((cancel, task));
    }

    /// Feed the pipeline from `source`, replacing any current source
    pub async fn attach_source<S>(&mut self, source: S)
    where
        S: FrameSource,
    {
        self.detach_source().await;
        let channels = Driver::spawn(source, self.engine.clone(), self.config.processing.cadence);
        self.source = Some(channels);
    }

    /// Connect the configured network stream through `connector`
    pub async fn connect_stream(&mut self, connector: Arc<dyn StreamConnector>) -> Result<()> {
        let endpoint = self
            .config
            .source
            .endpoint()
            .ok_or_else(|| PipelineError::config_error("source.url is not set"))?;
        let policy = ReconnectPolicy::new(
            self.config.source.reconnect_attempts,
            self.config.source.reconnect_delay(),
        );

        info!("Connecting to {}", endpoint.masked());
        let source = ResilientSource::connect(endpoint, connector, policy).await?;
        self.attach_source(source).await;
        Ok(())
    }

    /// Start a peer-fed source and return the half the peer pushes into
    pub async fn attach_peer(&mut self) -> FrameSender {
        let (sender, source) = channel_source(self.config.processing.frame_queue);
        self.attach_source(source).await;
        sender
    }

    /// Stop and drop the current source, if any
    pub async fn detach_source(&mut self) {
        let Some(channels) = self.source.take() else {
            return;
        };

        let control = channels.control.clone();
        // stop() may wait for an in-progress blocking read
        if let Err(e) = tokio::task::spawn_blocking(move || control.stop()).await {
            warn!("Source stop failed: {}", e);
        }
        channels.cancel.cancel();
        if let Err(e) = channels.task.await {
            warn!("Frame pump task failed: {}", e);
        }
    }

    pub fn source_stats(&self) -> Option<SourceStats> {
        self.source.as_ref().map(|channels| channels.control.stats())
    }

    /// Processed frame sequence handed back to the peer, optionally limited
    /// to `max_hz` frames per second (latest frame wins).
    ///
    /// Waits for the first frame and ends when the source ends.
    pub fn frames(&self, max_hz: Option<f64>) -> BoxStream<'static, Frame> {
        let Some(channels) = &self.source else {
            return stream::empty().boxed();
        };

        let frames = WatchStream::new(channels.frames.clone())
            .skip_while(|opt| {
                let is_none = opt.is_none();
                async move { is_none }
            })
            .take_while(|opt| {
                let is_some = opt.is_some();
                async move { is_some }
            })
            .filter_map(|opt| async move { opt });

        match max_hz.and_then(frame_period) {
            Some(period) => frames.throttle(period).boxed(),
            None => frames.boxed(),
        }
    }

    /// Open a subscription to result and telemetry events
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Parse and apply a JSON control message from a subscriber
    pub fn handle_message(&self, json: &str) -> Result<Option<Event>> {
        ClientCommand::parse(json).map(|command| self.handle_command(command))
    }

    /// Apply a control message and return the confirmation for the sender.
    ///
    /// Blank prompts and model names are ignored.
    pub fn handle_command(&self, command: ClientCommand) -> Option<Event> {
        match command {
            ClientCommand::UpdatePrompt { prompt, max_tokens } => {
                let prompt = prompt.trim();
                if prompt.is_empty() {
                    return None;
                }
                self.engine.update_prompt(prompt, max_tokens);
                Some(Event::PromptUpdated { prompt: prompt.to_string() })
            }
            ClientCommand::UpdateModel { model } => {
                let model = model.trim();
                if model.is_empty() {
                    return None;
                }
                self.engine.update_model(model);
                Some(Event::ModelUpdated { model: model.to_string() })
            }
        }
    }

    /// Ordered shutdown: telemetry, source, in-flight inference, subscribers
    pub async fn shutdown(mut self) {
        info!("Shutting down pipeline");

        if let Some((cancel, task)) = self.telemetry.take() {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("Telemetry task failed: {}", e);
            }
        }

        self.detach_source().await;

        let timeout = self.config.inference.request_timeout();
        if !self.engine.wait_idle(timeout).await {
            warn!("In-flight inference did not finish within {:?}", timeout);
        }

        if let Some((cancel, task)) = self.forwarder.take() {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("Result forwarder failed: {}", e);
            }
        }

        self.broadcaster.close_all();
        self.cancel.cancel();
        info!("Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        debug!("Dropping pipeline");
        self.cancel.cancel();
        if let Some(channels) = &self.source {
            channels.cancel.cancel();
        }
    }
}

/// Throttle period for `max_hz`, or `None` for an unthrottled stream
fn frame_period(max_hz: f64) -> Option<Duration> {
    if !max_hz.is_finite() || max_hz <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / max_hz.max(MIN_FRAME_HZ)).ok()
}

/// Publish every engine result as a `vlm_response` event
async fn forward_results(
    engine: InferenceEngine,
    mut results: broadcast::Receiver<InferenceResult>,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            received = results.recv() => received,
            _ = cancel.cancelled() => break,
        };

        match received {
            Ok(InferenceResult { text, .. }) => {
                broadcaster.publish(&Event::VlmResponse { text, metrics: engine.metrics() });
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Result forwarder lagged, skipped {} results", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_period_clamps_extreme_rates() {
        assert_eq!(frame_period(4.0), Some(Duration::from_millis(250)));
        assert_eq!(frame_period(1.0e-300), Some(Duration::from_secs(1000)));
        assert_eq!(frame_period(0.0), None);
        assert_eq!(frame_period(-2.0), None);
        assert_eq!(frame_period(f64::NAN), None);
        assert_eq!(frame_period(f64::INFINITY), None);
    }
}
