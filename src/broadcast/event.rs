//! Messages exchanged with subscribers

use serde::{Deserialize, Serialize};

use crate::inference::Metrics;
use crate::telemetry::TelemetrySnapshot;
use crate::{PipelineError, Result};

/// Event pushed to every subscriber, rendered as JSON with a `type` tag
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    VlmResponse { text: String, metrics: Metrics },
    GpuStats { stats: TelemetrySnapshot },
    Status { text: String, status: String },
    PromptUpdated { prompt: String },
    ModelUpdated { model: String },
}

impl Event {
    /// Greeting sent to each new subscriber
    pub fn connected() -> Self {
        Event::Status { text: "Connected to server".to_string(), status: "Ready".to_string() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::VlmResponse { .. } => "vlm_response",
            Event::GpuStats { .. } => "gpu_stats",
            Event::Status { .. } => "status",
            Event::PromptUpdated { .. } => "prompt_updated",
            Event::ModelUpdated { .. } => "model_updated",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| PipelineError::Encode {
            details: format!("failed to serialize {} event: {e}", self.kind()),
        })
    }
}

/// Control message sent by a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    UpdatePrompt {
        prompt: String,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    UpdateModel {
        model: String,
    },
}

impl ClientCommand {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::decode_error(format!("invalid client message: {e}")))
    }
}
