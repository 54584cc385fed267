//! Single-flight inference engine
//!
//! At most one model call is in flight at any time. Frames offered while a
//! call is running are dropped, never queued, so the engine always works on
//! a recent frame no matter how slow the model is.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use serde::{Serialize, Serializer};
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{debug, error, info};

use super::backend::{InferenceBackend, InferenceRequest};
use super::history::{HistorySummary, ResponseHistory};
use super::prompt::build_contextual_prompt;
use crate::Result;
use crate::config::InferenceConfig;
use crate::sync_utils::{lock, read, write};
use crate::types::Frame;

/// Shown before the first call completes
pub const INITIAL_RESULT: &str = "Initializing...";

const RESULT_CHANNEL_CAPACITY: usize = 16;

/// Outcome of one model call
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub frame_seq: u64,
    /// Model output, or `"Error: ..."` when the call failed
    pub text: String,
    /// Encode plus model call
    pub latency: Duration,
    pub completed_at: SystemTime,
    pub success: bool,
}

/// Latest text plus whether a call is running right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentResult {
    pub text: String,
    pub is_processing: bool,
}

/// Latency and call counters, serialized in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    #[serde(rename = "last_latency_ms", serialize_with = "as_millis")]
    pub last_latency: Duration,
    #[serde(rename = "avg_latency_ms", serialize_with = "as_millis")]
    pub average_latency: Duration,
    #[serde(rename = "total_inferences")]
    pub total_calls: u64,
    pub is_processing: bool,
}

fn as_millis<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

#[derive(Debug, Default)]
struct LatencyStats {
    last: Duration,
    average: Duration,
    total_calls: u64,
}

impl LatencyStats {
    /// Cumulative mean over every completed call
    fn record(&mut self, latency: Duration) {
        self.total_calls += 1;
        let n = self.total_calls as f64;
        let previous = self.average.as_secs_f64();
        let average = previous + (latency.as_secs_f64() - previous) / n;
        self.average = Duration::from_secs_f64(average.max(0.0));
        self.last = latency;
    }
}

#[derive(Debug, Clone)]
struct PromptSettings {
    prompt: String,
    max_tokens: u32,
    context_enabled: bool,
}

struct EngineInner {
    backend: Arc<dyn InferenceBackend>,
    /// Held for the full duration of a call
    slot: Arc<tokio::sync::Mutex<()>>,
    processing: AtomicBool,
    settings: RwLock<PromptSettings>,
    history: Mutex<ResponseHistory>,
    latency: Mutex<LatencyStats>,
    current: Mutex<String>,
    jpeg_quality: u8,
    results: broadcast::Sender<InferenceResult>,
}

/// Owns the call slot. Clears the processing flag when the call finishes or
/// its future is dropped.
struct CallGuard {
    inner: Arc<EngineInner>,
    _slot: OwnedMutexGuard<()>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.inner.processing.store(false, Ordering::Release);
    }
}

/// Shared handle to the inference engine.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct InferenceEngine {
    inner: Arc<EngineInner>,
}

impl InferenceEngine {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: &InferenceConfig) -> Self {
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let settings = PromptSettings {
            prompt: config.prompt.clone(),
            max_tokens: config.max_tokens,
            context_enabled: config.enable_context,
        };

        Self {
            inner: Arc::new(EngineInner {
                backend,
                slot: Arc::new(tokio::sync::Mutex::new(())),
                processing: AtomicBool::new(false),
                settings: RwLock::new(settings),
                history: Mutex::new(ResponseHistory::new(config.max_history)),
                latency: Mutex::new(LatencyStats::default()),
                current: Mutex::new(INITIAL_RESULT.to_string()),
                jpeg_quality: config.jpeg_quality,
                results,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.inner.backend
    }

    /// Offer a frame without waiting.
    ///
    /// Starts a background call and returns `true` if the engine was idle.
    /// Returns `false` and drops the frame if a call is already running.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        let Some(guard) = self.try_begin() else {
            debug!(frame = frame.seq, "Inference busy, skipping frame");
            return false;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(frame, guard).await;
        });
        true
    }

    /// Run a call on `frame` inline if the engine is idle.
    ///
    /// Returns `None` without touching the backend when a call is already
    /// in flight.
    pub async fn process(&self, frame: Frame) -> Option<InferenceResult> {
        let guard = self.try_begin()?;
        Some(self.run(frame, guard).await)
    }

    fn try_begin(&self) -> Option<CallGuard> {
        let slot = self.inner.slot.clone().try_lock_owned().ok()?;
        self.inner.processing.store(true, Ordering::Release);
        Some(CallGuard { inner: self.inner.clone(), _slot: slot })
    }

    async fn run(&self, frame: Frame, guard: CallGuard) -> InferenceResult {
        let result = self.analyze(frame).await;

        *lock(&self.inner.current) = result.text.clone();
        self.inner.processing.store(false, Ordering::Release);
        // Published while the slot is still held, so `wait_idle` implies delivery
        let _ = self.inner.results.send(result.clone());
        drop(guard);
        result
    }

    async fn analyze(&self, frame: Frame) -> InferenceResult {
        let frame_seq = frame.seq;
        let settings = read(&self.inner.settings).clone();
        let prompt = self.resolve_prompt(&settings);

        let start = Instant::now();
        let outcome = self.call_backend(frame, prompt, settings.max_tokens).await;
        let latency = start.elapsed();
        lock(&self.inner.latency).record(latency);

        let (text, success) = match outcome {
            Ok(text) => {
                let text = text.trim().to_string();
                if !text.is_empty() {
                    lock(&self.inner.history).push(text.clone());
                }
                let latency_ms = latency.as_millis() as u64;
                info!(frame = frame_seq, latency_ms, "VLM response: {}", text);
                (text, true)
            }
            Err(e) => {
                // Include the source chain, e.g. the transport error behind a failed request
                let e = anyhow::Error::from(e);
                error!(frame = frame_seq, "Inference failed: {:#}", e);
                (format!("Error: {e:#}"), false)
            }
        };

        InferenceResult { frame_seq, text, latency, completed_at: SystemTime::now(), success }
    }

    async fn call_backend(&self, frame: Frame, prompt: String, max_tokens: u32) -> Result<String> {
        let quality = self.inner.jpeg_quality;
        let frame_seq = frame.seq;
        let jpeg = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality)).await??;

        let request = InferenceRequest {
            frame_seq,
            jpeg,
            prompt,
            max_tokens,
            submitted_at: SystemTime::now(),
        };
        self.inner.backend.infer(&request).await
    }

    fn resolve_prompt(&self, settings: &PromptSettings) -> String {
        if !settings.context_enabled {
            return settings.prompt.clone();
        }
        let recent = lock(&self.inner.history).recent();
        build_contextual_prompt(&settings.prompt, &recent)
    }

    /// The prompt the next call would send
    pub fn next_prompt(&self) -> String {
        let settings = read(&self.inner.settings).clone();
        self.resolve_prompt(&settings)
    }

    pub fn current_result(&self) -> CurrentResult {
        CurrentResult {
            text: lock(&self.inner.current).clone(),
            is_processing: self.is_processing(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> Metrics {
        let stats = lock(&self.inner.latency);
        Metrics {
            last_latency: stats.last,
            average_latency: stats.average,
            total_calls: stats.total_calls,
            is_processing: self.is_processing(),
        }
    }

    pub fn prompt(&self) -> String {
        read(&self.inner.settings).prompt.clone()
    }

    pub fn max_tokens(&self) -> u32 {
        read(&self.inner.settings).max_tokens
    }

    /// Replace the base prompt, and the token limit if given. Applies from
    /// the next call on.
    pub fn update_prompt(&self, prompt: impl Into<String>, max_tokens: Option<u32>) {
        let mut settings = write(&self.inner.settings);
        settings.prompt = prompt.into();
        if let Some(max_tokens) = max_tokens {
            settings.max_tokens = max_tokens;
        }
        info!("Prompt updated: {} (max_tokens={})", settings.prompt, settings.max_tokens);
    }

    /// Switch the backend's model
    pub fn update_model(&self, model: &str) {
        self.inner.backend.update_model(model);
    }

    /// Drop all stored responses
    pub fn clear_history(&self) -> usize {
        let cleared = lock(&self.inner.history).clear();
        info!("Cleared {} context entries", cleared);
        cleared
    }

    pub fn set_context_mode(&self, enabled: bool) {
        write(&self.inner.settings).context_enabled = enabled;
        info!("Temporal context {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn history_summary(&self) -> HistorySummary {
        let enabled = read(&self.inner.settings).context_enabled;
        let history = lock(&self.inner.history);
        HistorySummary {
            enabled,
            max_history: history.max_history(),
            current_count: history.len(),
            history: history.window(),
        }
    }

    /// Receive every completed result
    pub fn subscribe_results(&self) -> broadcast::Receiver<InferenceResult> {
        self.inner.results.subscribe()
    }

    /// Wait until no call is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.slot.lock()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use image::RgbImage;
    use tokio::sync::Notify;

    use super::*;
    use crate::PipelineError;

    /// Echoes the prompt back, optionally holding each call until released
    struct EchoBackend {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        fail: AtomicBool,
    }

    impl EchoBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                gate: None,
                fail: AtomicBool::new(false),
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                gate: Some(gate),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        fn model(&self) -> String {
            "echo".into()
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            lock(&self.prompts).push(request.prompt.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::inference_failed("model unavailable"));
            }
            Ok(format!("  response {n}  "))
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, RgbImage::new(8, 8))
    }

    fn engine(backend: Arc<EchoBackend>, max_history: usize) -> InferenceEngine {
        let config = InferenceConfig { max_history, ..InferenceConfig::default() };
        InferenceEngine::new(backend, &config)
    }

    #[tokio::test]
    async fn starts_with_placeholder() {
        let engine = engine(EchoBackend::new(), 4);
        assert_eq!(
            engine.current_result(),
            CurrentResult { text: INITIAL_RESULT.into(), is_processing: false }
        );
        assert_eq!(engine.metrics().total_calls, 0);
    }

    #[tokio::test]
    async fn sequential_calls_each_reach_the_backend() {
        let backend = EchoBackend::new();
        let engine = engine(backend.clone(), 4);

        for seq in 1..=5 {
            let result = engine.process(frame(seq)).await.expect("idle");
            assert!(result.success);
            assert_eq!(result.text, format!("response {seq}"));
        }

        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        assert_eq!(engine.metrics().total_calls, 5);
        assert_eq!(engine.current_result().text, "response 5");
    }

    #[tokio::test]
    async fn busy_engine_drops_frames() {
        let gate = Arc::new(Notify::new());
        let backend = EchoBackend::gated(gate.clone());
        let engine = engine(backend.clone(), 4);

        assert!(engine.submit_frame(frame(1)));
        assert!(engine.is_processing());
        for seq in 2..10 {
            assert!(!engine.submit_frame(frame(seq)));
        }
        assert!(engine.process(frame(10)).await.is_none());

        // Let the spawned call reach the backend before releasing it
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        assert!(engine.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(!engine.is_processing());
        assert_eq!(engine.current_result().text, "response 1");
    }

    #[tokio::test]
    async fn results_are_published() {
        let engine = engine(EchoBackend::new(), 4);
        let mut results = engine.subscribe_results();

        assert!(engine.submit_frame(frame(7)));
        let result = results.recv().await.expect("result");
        assert_eq!(result.frame_seq, 7);
        assert_eq!(result.text, "response 1");
    }

    #[tokio::test]
    async fn context_grows_with_history() {
        let backend = EchoBackend::new();
        let engine = engine(backend.clone(), 2);

        for seq in 1..=4 {
            engine.process(frame(seq)).await.expect("idle");
        }

        let prompts = lock(&backend.prompts).clone();
        assert_eq!(prompts[0], engine.prompt());
        assert!(prompts[1].contains("  1 frame(s) ago: response 1"));
        assert!(!prompts[1].contains("2 frame(s) ago"));
        // Capped at max_history entries, newest first
        assert!(prompts[3].contains("  1 frame(s) ago: response 3"));
        assert!(prompts[3].contains("  2 frame(s) ago: response 2"));
        assert!(!prompts[3].contains("3 frame(s) ago"));
    }

    #[tokio::test]
    async fn disabled_context_sends_base_prompt() {
        let backend = EchoBackend::new();
        let engine = engine(backend.clone(), 4);
        engine.set_context_mode(false);

        for seq in 1..=3 {
            engine.process(frame(seq)).await.expect("idle");
        }

        assert!(lock(&backend.prompts).iter().all(|p| p == &engine.prompt()));
        let summary = engine.history_summary();
        assert!(!summary.enabled);
        assert_eq!(summary.current_count, 3);
    }

    #[tokio::test]
    async fn failures_surface_as_error_text_and_skip_history() {
        let backend = EchoBackend::new();
        backend.fail.store(true, Ordering::SeqCst);
        let engine = engine(backend.clone(), 4);

        let result = engine.process(frame(1)).await.expect("idle");
        assert!(!result.success);
        assert_eq!(result.text, "Error: Inference failed: model unavailable");
        assert_eq!(engine.current_result().text, result.text);
        assert_eq!(engine.history_summary().current_count, 0);
        assert_eq!(engine.metrics().total_calls, 1);
        assert!(!engine.is_processing());
    }

    #[tokio::test]
    async fn failures_keep_the_source_chain() {
        struct Unreachable;

        #[async_trait]
        impl InferenceBackend for Unreachable {
            fn model(&self) -> String {
                "unreachable".into()
            }

            async fn infer(&self, _request: &InferenceRequest) -> Result<String> {
                let io = std::io::Error::other("connection refused");
                Err(PipelineError::inference_failed_with_source("request failed", Box::new(io)))
            }
        }

        let engine = InferenceEngine::new(Arc::new(Unreachable), &InferenceConfig::default());
        let result = engine.process(frame(1)).await.expect("idle");
        assert_eq!(result.text, "Error: Inference failed: request failed: connection refused");
    }

    #[tokio::test]
    async fn abandoned_call_clears_processing() {
        let gate = Arc::new(Notify::new());
        let engine = engine(EchoBackend::gated(gate), 4);

        let call = engine.process(frame(1));
        assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());

        assert!(engine.wait_idle(Duration::from_secs(1)).await);
        assert!(!engine.is_processing());
        assert!(!engine.metrics().is_processing);
        assert_eq!(
            engine.current_result(),
            CurrentResult { text: INITIAL_RESULT.into(), is_processing: false }
        );
        // The slot is free again
        assert!(engine.submit_frame(frame(2)));
    }

    #[tokio::test]
    async fn summary_counts_every_stored_response() {
        let engine = engine(EchoBackend::new(), 2);
        for seq in 1..=3 {
            engine.process(frame(seq)).await.expect("idle");
        }

        let summary = engine.history_summary();
        assert_eq!(summary.max_history, 2);
        assert_eq!(summary.current_count, 3);
        assert_eq!(summary.history, vec!["response 2", "response 3"]);
    }

    #[tokio::test]
    async fn empty_frames_fail_to_encode() {
        let backend = EchoBackend::new();
        let engine = engine(backend.clone(), 4);

        let result = engine.process(Frame::new(1, RgbImage::new(0, 0))).await.expect("idle");
        assert!(!result.success);
        assert!(result.text.starts_with("Error: "));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prompt_updates_apply_to_next_call() {
        let backend = EchoBackend::new();
        let engine = engine(backend.clone(), 4);
        engine.set_context_mode(false);

        engine.update_prompt("Count the people.", Some(64));
        engine.process(frame(1)).await.expect("idle");

        assert_eq!(lock(&backend.prompts)[0], "Count the people.");
        assert_eq!(engine.max_tokens(), 64);

        engine.update_prompt("Name the colours.", None);
        assert_eq!(engine.max_tokens(), 64);
        assert_eq!(engine.next_prompt(), "Name the colours.");
    }

    #[tokio::test]
    async fn clear_history_resets_context() {
        let engine = engine(EchoBackend::new(), 4);
        for seq in 1..=3 {
            engine.process(frame(seq)).await.expect("idle");
        }

        assert_eq!(engine.clear_history(), 3);
        assert_eq!(engine.next_prompt(), engine.prompt());
    }

    #[test]
    fn average_is_cumulative_mean() {
        let mut stats = LatencyStats::default();
        for ms in [100, 200, 300] {
            stats.record(Duration::from_millis(ms));
        }
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.last, Duration::from_millis(300));
        assert!((stats.average.as_secs_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn metrics_serialize_in_milliseconds() {
        let metrics = Metrics {
            last_latency: Duration::from_millis(1500),
            average_latency: Duration::from_millis(250),
            total_calls: 2,
            is_processing: true,
        };
        let value = serde_json::to_value(metrics).expect("json");
        assert_eq!(value["last_latency_ms"], 1500.0);
        assert_eq!(value["avg_latency_ms"], 250.0);
        assert_eq!(value["total_inferences"], 2);
        assert_eq!(value["is_processing"], true);
    }
}
