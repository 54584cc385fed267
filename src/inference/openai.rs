//! OpenAI-compatible chat completions backend
//!
//! Works against any server exposing `/v1/chat/completions` with image
//! content parts (vLLM, llama.cpp server, LM Studio and friends).

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::backend::{InferenceBackend, InferenceRequest};
use crate::config::InferenceConfig;
use crate::endpoint::mask_api_key;
use crate::sync_utils::{read, write};
use crate::{PipelineError, Result};

#[derive(Debug, Clone)]
struct ApiSettings {
    api_base: String,
    api_key: String,
    model: String,
}

/// A model advertised by the server's `/models` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
}

pub struct OpenAiBackend {
    http_client: HttpClient,
    settings: RwLock<ApiSettings>,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let http_client = HttpClient::builder().timeout(timeout).build().map_err(|e| {
            PipelineError::inference_failed_with_source("failed to build HTTP client", Box::new(e))
        })?;

        let settings = ApiSettings {
            api_base: trim_base(&config.api_base),
            api_key: normalize_key(&config.api_key),
            model: config.model.clone(),
        };
        info!(
            "VLM backend: {} model={} key={}",
            settings.api_base,
            settings.model,
            mask_api_key(&settings.api_key)
        );

        Ok(Self {
            http_client,
            settings: RwLock::new(settings),
            temperature: config.temperature,
            timeout,
        })
    }

    pub fn api_base(&self) -> String {
        read(&self.settings).api_base.clone()
    }

    /// Point later calls at a different server and/or key
    pub fn update_api_settings(&self, api_base: Option<&str>, api_key: Option<&str>) {
        let mut settings = write(&self.settings);
        if let Some(base) = api_base {
            settings.api_base = trim_base(base);
        }
        if let Some(key) = api_key {
            settings.api_key = normalize_key(key);
        }
        info!(
            "VLM API settings updated: {} key={}",
            settings.api_base,
            mask_api_key(&settings.api_key)
        );
    }

    /// Query the models the server currently serves
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let ApiSettings { api_base, api_key, .. } = read(&self.settings).clone();

        let response = self
            .http_client
            .get(format!("{api_base}/models"))
            .bearer_auth(&api_key)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::inference_failed(format!("HTTP {status}: {body}")));
        }

        #[derive(Deserialize)]
        struct ModelList {
            data: Vec<ModelInfo>,
        }
        let list: ModelList = response.json().await.map_err(|e| {
            PipelineError::inference_failed_with_source("malformed model list", Box::new(e))
        })?;
        Ok(list.data)
    }

    fn request_error(&self, error: reqwest::Error) -> PipelineError {
        if error.is_timeout() {
            PipelineError::Timeout { duration: self.timeout }
        } else {
            PipelineError::inference_failed_with_source("request failed", Box::new(error))
        }
    }
}

fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}

/// Local servers ignore the key but still expect one
fn normalize_key(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() { "EMPTY".to_string() } else { key.to_string() }
}

/// Chat completions body with the frame inlined as a data URL
pub(crate) fn completion_body(
    model: &str,
    prompt: &str,
    jpeg: &[u8],
    max_tokens: u32,
    temperature: f32,
) -> Value {
    let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg));
    json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": data_url }
                }
            ]
        }],
        "max_tokens": max_tokens,
        "temperature": temperature,
    })
}

/// Pull the first choice's message text out of a completion response
pub(crate) fn completion_text(response: &Value) -> Result<String> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PipelineError::inference_failed("response has no message content"))
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn model(&self) -> String {
        read(&self.settings).model.clone()
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<String> {
        let ApiSettings { api_base, api_key, model } = read(&self.settings).clone();
        let body = completion_body(
            &model,
            &request.prompt,
            &request.jpeg,
            request.max_tokens,
            self.temperature,
        );
        debug!(frame = request.frame_seq, bytes = request.jpeg.len(), "Sending frame to {}", model);

        let response = self
            .http_client
            .post(format!("{api_base}/chat/completions"))
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!("VLM server returned {}", status);
            return Err(PipelineError::inference_failed(format!("HTTP {status}: {error_text}")));
        }

        let value: Value = response.json().await.map_err(|e| self.request_error(e))?;
        completion_text(&value)
    }

    fn update_model(&self, model: &str) {
        let mut settings = write(&self.settings);
        info!("VLM model changed: {} -> {}", settings.model, model);
        settings.model = model.to_string();
    }
}
