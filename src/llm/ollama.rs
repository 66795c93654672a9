use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::stream::{collect_stream, parse_ndjson_line};
use super::{
    ChatRequest, ClientError, MODELS_TIMEOUT_SECS, Provider, RequestContext, timeout_for,
};
use crate::config::{NetworkSettings, ProviderConfig, ProviderKind};

/// Local Ollama daemon, `/api/generate` + `/api/tags`.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    network: NetworkSettings,
}

impl OllamaProvider {
    pub fn new(client: Client, cfg: &ProviderConfig, network: NetworkSettings) -> Self {
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            network,
        }
    }

    fn body(request: &ChatRequest) -> Value {
        let prompt = if request.system.trim().is_empty() {
            request.prompt.clone()
        } else {
            format!("{}\n\n{}", request.system, request.prompt)
        };
        json!({
            "model": request.model,
            "prompt": prompt,
            "stream": request.stream,
            "options": {
                "temperature": request.temperature,
                "top_p": 0.9,
                "num_predict": 4096,
                "repeat_penalty": 1.1
            }
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    async fn send_request(
        &self,
        request: &ChatRequest,
        chunks: Option<&UnboundedSender<String>>,
    ) -> Result<String, ClientError> {
        let ctx = RequestContext {
            provider: ProviderKind::Ollama,
            url: format!("{}/api/generate", self.base_url),
            timeout_secs: timeout_for(&self.network, request.stream),
        };
        debug!(url = %ctx.url, model = %request.model, stream = request.stream, "ollama generate");

        let resp = self
            .client
            .post(&ctx.url)
            .timeout(Duration::from_secs(ctx.timeout_secs))
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| ctx.map_err(e))?;
        let resp = ctx.check_status(resp).await?;

        if request.stream {
            return collect_stream(resp, parse_ndjson_line, chunks, &ctx).await;
        }

        let text = resp.text().await.map_err(|e| ctx.map_err(e))?;
        let val: Value = serde_json::from_str(&text).map_err(|e| ctx.decode_error(e.to_string()))?;
        if let Some(err) = val.get("error").and_then(|e| e.as_str()) {
            return Err(ClientError::Api {
                provider: ProviderKind::Ollama,
                message: err.to_string(),
            });
        }
        val.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| ctx.decode_error("missing \"response\" field"))
    }

    async fn list_available_models(&self) -> Result<Vec<String>, ClientError> {
        let ctx = RequestContext {
            provider: ProviderKind::Ollama,
            url: format!("{}/api/tags", self.base_url),
            timeout_secs: MODELS_TIMEOUT_SECS,
        };
        let resp = self
            .client
            .get(&ctx.url)
            .timeout(Duration::from_secs(ctx.timeout_secs))
            .send()
            .await
            .map_err(|e| ctx.map_err(e))?;
        let resp = ctx.check_status(resp).await?;
        let val: Value = resp.json().await.map_err(|e| ctx.map_err(e))?;
        Ok(val
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}
