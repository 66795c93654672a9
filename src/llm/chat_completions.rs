use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::stream::{collect_stream, extract_content, parse_sse_line};
use super::{
    ChatRequest, ClientError, MODELS_TIMEOUT_SECS, Provider, RequestContext, timeout_for,
};
use crate::config::{NetworkSettings, ProviderConfig, ProviderKind};

const DEEPSEEK_MODELS: &[&str] = &["deepseek-chat", "deepseek-coder"];

/// Cloud backend speaking the OpenAI chat-completions protocol.
pub struct ChatCompletionsProvider {
    kind: ProviderKind,
    client: Client,
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    network: NetworkSettings,
}

impl ChatCompletionsProvider {
    pub fn new(
        kind: ProviderKind,
        client: Client,
        cfg: &ProviderConfig,
        api_key: Option<String>,
        network: NetworkSettings,
    ) -> Self {
        Self {
            kind,
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key_env: cfg.api_key_env.clone(),
            api_key,
            network,
        }
    }

    fn key(&self) -> Result<&str, ClientError> {
        self.api_key.as_deref().ok_or_else(|| ClientError::MissingApiKey {
            provider: self.kind,
            env: self.api_key_env.clone(),
        })
    }

    fn body(request: &ChatRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if !request.system.trim().is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));
        json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": request.stream
        })
    }
}

#[async_trait]
impl Provider for ChatCompletionsProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn is_authenticated(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send_request(
        &self,
        request: &ChatRequest,
        chunks: Option<&UnboundedSender<String>>,
    ) -> Result<String, ClientError> {
        let api_key = self.key()?;
        let ctx = RequestContext {
            provider: self.kind,
            url: format!("{}/chat/completions", self.base_url),
            timeout_secs: timeout_for(&self.network, request.stream),
        };
        debug!(provider = %self.kind, url = %ctx.url, model = %request.model, stream = request.stream, "chat completion");

        let resp = self
            .client
            .post(&ctx.url)
            .timeout(Duration::from_secs(ctx.timeout_secs))
            .bearer_auth(api_key)
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| ctx.map_err(e))?;
        let resp = ctx.check_status(resp).await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if request.stream && content_type.contains("text/event-stream") {
            return collect_stream(resp, parse_sse_line, chunks, &ctx).await;
        }

        // Some gateways ignore `stream: true` and answer with a plain JSON body.
        let text = resp.text().await.map_err(|e| ctx.map_err(e))?;
        let val: Value = serde_json::from_str(&text).map_err(|e| ctx.decode_error(e.to_string()))?;
        let content = extract_content(&val).ok_or_else(|| ctx.decode_error("no choices[0].message.content"))?;
        if let Some(tx) = chunks {
            let _ = tx.send(content.clone());
        }
        Ok(content)
    }

    async fn list_available_models(&self) -> Result<Vec<String>, ClientError> {
        let api_key = self.key()?;
        if self.kind == ProviderKind::Deepseek {
            return Ok(DEEPSEEK_MODELS.iter().map(|m| m.to_string()).collect());
        }

        let ctx = RequestContext {
            provider: self.kind,
            url: format!("{}/models", self.base_url),
            timeout_secs: MODELS_TIMEOUT_SECS,
        };
        let resp = self
            .client
            .get(&ctx.url)
            .timeout(Duration::from_secs(ctx.timeout_secs))
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| ctx.map_err(e))?;
        let resp = ctx.check_status(resp).await?;
        let val: Value = resp.json().await.map_err(|e| ctx.map_err(e))?;
        let mut models: Vec<String> = val
            .get("data")
            .and_then(|d| d.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .filter(|id| id.starts_with("gpt"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        Ok(models)
    }
}
