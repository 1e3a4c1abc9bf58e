// Warden — local-inference client.
// Narrow client over the local model server (Ollama wire protocol): generate,
// streaming generate, warm/unload primitives (called only by the VRAM mutex),
// embeddings, and the availability probe the router keys off.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio_stream::Stream;

use crate::error::{CoreError, CoreResult};
use crate::vram::{ModelBackend, ModelKind};

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const WARM_TIMEOUT: Duration = Duration::from_secs(60);
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(3600);
const PKILL_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_ESCALATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub system: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub images: Option<Vec<String>>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.7,
            max_tokens: 2048,
            images: None,
        }
    }
}

pub struct LocalClient {
    http: reqwest::Client,
    base_url: String,
    coder_model: String,
    vision_model: String,
    embedding_model: String,
    process_name: String,
}

impl LocalClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        coder_model: &str,
        vision_model: &str,
        embedding_model: &str,
        process_name: &str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            coder_model: coder_model.to_string(),
            vision_model: vision_model.to_string(),
            embedding_model: embedding_model.to_string(),
            process_name: process_name.to_string(),
        }
    }

    fn model_name(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Coder => &self.coder_model,
            ModelKind::Vision => &self.vision_model,
        }
    }

    /// True iff the server answers the model-listing probe.
    pub async fn is_available(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn list_models(&self) -> CoreResult<Vec<String>> {
        let body: Value = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CoreError::Infra(format!("local: list models failed: {e}")))?
            .json()
            .await
            .map_err(|e| CoreError::Infra(format!("local: list models parse failed: {e}")))?;
        let names = body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub async fn generate(
        &self,
        kind: ModelKind,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> CoreResult<String> {
        let mut payload = json!({
            "model": self.model_name(kind),
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
            },
        });
        if let Some(system) = &opts.system {
            payload["system"] = json!(system);
        }
        if let Some(images) = &opts.images {
            payload["images"] = json!(images);
        }

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(GENERATE_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::Infra(format!("local: generate failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Infra(format!(
                "local: generate returned {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Infra(format!("local: generate parse failed: {e}")))?;
        Ok(body["response"].as_str().unwrap_or_default().to_string())
    }

    /// Stream response fragments until the server's terminal `done` marker.
    pub fn generate_stream(
        &self,
        kind: ModelKind,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> impl Stream<Item = CoreResult<String>> + Send + use<> {
        let mut payload = json!({
            "model": self.model_name(kind),
            "prompt": prompt,
            "stream": true,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
            },
        });
        if let Some(system) = &opts.system {
            payload["system"] = json!(system);
        }
        let http = self.http.clone();
        let url = format!("{}/api/generate", self.base_url);

        try_stream! {
            let resp = http
                .post(&url)
                .timeout(GENERATE_TIMEOUT)
                .json(&payload)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| CoreError::Infra(format!("local: stream failed: {e}")))?;

            let mut byte_stream = resp.bytes_stream();
            let mut line_buffer = String::new();
            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk
                    .map_err(|e| CoreError::Infra(format!("local: stream read failed: {e}")))?;
                line_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(nl) = line_buffer.find('\n') {
                    let line = line_buffer[..nl].trim().to_string();
                    line_buffer = line_buffer[nl + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<Value>(&line) else { continue };
                    if let Some(token) = event["response"].as_str() {
                        if !token.is_empty() {
                            yield token.to_string();
                        }
                    }
                    if event["done"].as_bool() == Some(true) {
                        break 'outer;
                    }
                }
            }
        }
    }

    /// Embed one text with the configured embedding model.
    pub async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let body: Value = self
            .http
            .post(format!("{}/api/embeddings", self.base_url))
            .timeout(Duration::from_secs(30))
            .json(&json!({ "model": self.embedding_model, "prompt": text }))
            .send()
            .await
            .map_err(|e| CoreError::Infra(format!("local: embed failed: {e}")))?
            .json()
            .await
            .map_err(|e| CoreError::Infra(format!("local: embed parse failed: {e}")))?;
        let embedding = body["embedding"]
            .as_array()
            .ok_or_else(|| CoreError::Infra("local: embed response missing embedding".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        Ok(embedding)
    }

    /// Pull any missing model at startup. Long-running; spawned in the
    /// background and only when the server is reachable.
    pub async fn ensure_models_pulled(&self) {
        let existing = self.list_models().await.unwrap_or_default();
        for model in [self.coder_model.clone(), self.vision_model.clone()] {
            if existing.iter().any(|m| m.contains(&model)) {
                tracing::info!("local: model {} already available", model);
                continue;
            }
            tracing::info!("local: pulling model {} (this may take a while)", model);
            let resp = self
                .http
                .post(format!("{}/api/pull", self.base_url))
                .timeout(PULL_TIMEOUT)
                .json(&json!({ "name": model }))
                .send()
                .await;
            match resp {
                Ok(resp) => {
                    let mut stream = resp.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        if chunk.is_err() {
                            break;
                        }
                    }
                    tracing::info!("local: model {} pulled", model);
                }
                Err(e) => tracing::error!("local: pull of {} failed: {}", model, e),
            }
        }
    }
}

#[async_trait]
impl ModelBackend for LocalClient {
    async fn warm(&self, kind: ModelKind) -> CoreResult<()> {
        let model = self.model_name(kind);
        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(WARM_TIMEOUT)
            .json(&json!({ "model": model, "prompt": "", "keep_alive": "10m" }))
            .send()
            .await
            .map_err(|e| CoreError::Infra(format!("local: warm of {model} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Infra(format!(
                "local: warm of {model} returned {}",
                resp.status()
            )));
        }
        tracing::info!("local: model {} warmed in VRAM", model);
        Ok(())
    }

    async fn unload_all(&self) -> CoreResult<()> {
        for model in [&self.coder_model, &self.vision_model] {
            let result = self
                .http
                .post(format!("{}/api/generate", self.base_url))
                .timeout(UNLOAD_TIMEOUT)
                .json(&json!({ "model": model, "prompt": "", "keep_alive": "0" }))
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!("local: unload request for {} failed: {}", model, e);
            }
        }
        tracing::info!("local: requested VRAM unload for all models");
        Ok(())
    }

    async fn kill_server(&self) {
        let name = self.process_name.clone();
        if let Err(e) = run_pkill("-TERM", &name).await {
            tracing::error!("local: SIGTERM of {} failed: {}", name, e);
        }
        tokio::time::sleep(KILL_ESCALATION).await;
        if let Err(e) = run_pkill("-KILL", &name).await {
            tracing::error!("local: SIGKILL of {} failed: {}", name, e);
        }
    }
}

async fn run_pkill(signal: &str, process: &str) -> CoreResult<()> {
    let status = tokio::time::timeout(
        PKILL_TIMEOUT,
        Command::new("pkill").arg(signal).arg(process).status(),
    )
    .await
    .map_err(|_| CoreError::Infra("pkill timed out".into()))?
    .map_err(|e| CoreError::Infra(format!("pkill spawn failed: {e}")))?;
    // pkill exits 1 when no process matched — that is fine here.
    tracing::debug!("local: pkill {} {} exited with {}", signal, process, status);
    Ok(())
}
