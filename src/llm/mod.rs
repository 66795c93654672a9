mod chat_completions;
mod ollama;
mod stream;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{Config, NetworkSettings, ProviderConfig, ProviderKind, resolve_api_key};
use crate::util::truncate_with_suffix;

pub use chat_completions::ChatCompletionsProvider;
pub use ollama::OllamaProvider;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const MODELS_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{provider} is configured but has no API key. Use: !set {provider} <api_key> (or export {env})")]
    MissingApiKey { provider: ProviderKind, env: String },
    #[error("Cannot connect to {provider} at {url}. {hint}")]
    Connect {
        provider: ProviderKind,
        url: String,
        hint: &'static str,
    },
    #[error("{provider} did not answer within {secs}s. Try a simpler request.")]
    Timeout { provider: ProviderKind, secs: u64 },
    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("Invalid response from {provider}: {detail}")]
    Decode { provider: ProviderKind, detail: String },
    #[error("{provider} reported an error: {message}")]
    Api { provider: ProviderKind, message: String },
    #[error("Request to {provider} failed: {detail}")]
    Transport { provider: ProviderKind, detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub stream: bool,
    pub temperature: f64,
}

/// A backend able to answer prompts.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn is_authenticated(&self) -> bool;

    /// Returns the full answer. When `request.stream` is set, deltas are also
    /// sent to `chunks` as they arrive.
    async fn send_request(
        &self,
        request: &ChatRequest,
        chunks: Option<&UnboundedSender<String>>,
    ) -> Result<String, ClientError>;

    async fn list_available_models(&self) -> Result<Vec<String>, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Ready,
    MissingApiKey,
}

/// One adapter per provider kind; an adapter is replaced when its key changes.
pub struct ProviderRegistry {
    network: NetworkSettings,
    ollama: Box<dyn Provider>,
    openai: Box<dyn Provider>,
    deepseek: Box<dyn Provider>,
}

impl ProviderRegistry {
    pub fn from_config(cfg: &Config) -> Result<Self, ClientError> {
        let network = cfg.network.clone();
        Ok(Self {
            ollama: build_adapter(ProviderKind::Ollama, &cfg.providers.ollama, None, &network)?,
            openai: build_adapter(
                ProviderKind::Openai,
                &cfg.providers.openai,
                resolve_api_key(&cfg.providers.openai),
                &network,
            )?,
            deepseek: build_adapter(
                ProviderKind::Deepseek,
                &cfg.providers.deepseek,
                resolve_api_key(&cfg.providers.deepseek),
                &network,
            )?,
            network,
        })
    }

    /// Installs `key` for `kind`, taking precedence over the environment.
    pub fn set_api_key(
        &mut self,
        kind: ProviderKind,
        provider: &ProviderConfig,
        key: String,
    ) -> Result<(), ClientError> {
        let adapter = build_adapter(kind, provider, Some(key), &self.network)?;
        match kind {
            ProviderKind::Ollama => self.ollama = adapter,
            ProviderKind::Openai => self.openai = adapter,
            ProviderKind::Deepseek => self.deepseek = adapter,
        }
        Ok(())
    }

    pub fn get(&self, kind: ProviderKind) -> &dyn Provider {
        match kind {
            ProviderKind::Ollama => self.ollama.as_ref(),
            ProviderKind::Openai => self.openai.as_ref(),
            ProviderKind::Deepseek => self.deepseek.as_ref(),
        }
    }

    pub fn status(&self, kind: ProviderKind) -> ProviderStatus {
        if self.get(kind).is_authenticated() {
            ProviderStatus::Ready
        } else {
            ProviderStatus::MissingApiKey
        }
    }
}

fn build_adapter(
    kind: ProviderKind,
    provider: &ProviderConfig,
    api_key: Option<String>,
    network: &NetworkSettings,
) -> Result<Box<dyn Provider>, ClientError> {
    let client = build_client(kind)?;
    let adapter: Box<dyn Provider> = match kind {
        ProviderKind::Ollama => Box::new(OllamaProvider::new(client, provider, network.clone())),
        ProviderKind::Openai | ProviderKind::Deepseek => Box::new(ChatCompletionsProvider::new(
            kind,
            client,
            provider,
            api_key,
            network.clone(),
        )),
    };
    Ok(adapter)
}

fn build_client(kind: ProviderKind) -> Result<Client, ClientError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(concat!("codemate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ClientError::Transport {
            provider: kind,
            detail: format!("failed to build HTTP client: {e}"),
        })
}

/// What a failed request was doing, used to pick a user-facing error.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    pub provider: ProviderKind,
    pub url: String,
    pub timeout_secs: u64,
}

impl RequestContext {
    pub fn map_err(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                provider: self.provider,
                secs: self.timeout_secs,
            }
        } else if err.is_connect() {
            ClientError::Connect {
                provider: self.provider,
                url: self.url.clone(),
                hint: match self.provider {
                    ProviderKind::Ollama => "Is Ollama running? Start it with `ollama serve`.",
                    _ => "Check your network connection and base_url.",
                },
            }
        } else if let Some(status) = err.status() {
            ClientError::Http {
                provider: self.provider,
                status: status.as_u16(),
                body: String::new(),
            }
        } else if err.is_decode() {
            ClientError::Decode {
                provider: self.provider,
                detail: err.to_string(),
            }
        } else {
            ClientError::Transport {
                provider: self.provider,
                detail: err.to_string(),
            }
        }
    }

    pub async fn check_status(&self, resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::Http {
            provider: self.provider,
            status: status.as_u16(),
            body: truncate_with_suffix(body.trim(), 300, " ..."),
        })
    }

    pub fn decode_error(&self, detail: impl Into<String>) -> ClientError {
        ClientError::Decode {
            provider: self.provider,
            detail: detail.into(),
        }
    }
}

pub(crate) fn timeout_for(network: &NetworkSettings, stream: bool) -> u64 {
    if stream {
        network.stream_timeout_secs
    } else {
        network.timeout_secs
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Single-shot HTTP responder for exercising adapters without a network.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    pub struct CapturedRequest {
        pub head: String,
        pub body: String,
    }

    /// Serves one request with the given status line, content type and body.
    pub async fn serve_once(
        status: &'static str,
        content_type: &'static str,
        body: String,
    ) -> (String, JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let (head, body_start) = loop {
                let n = socket.read(&mut buf).await.expect("read");
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break (String::from_utf8_lossy(&raw[..pos]).to_string(), pos + 4);
                }
                if n == 0 {
                    break (String::from_utf8_lossy(&raw).to_string(), raw.len());
                }
            };
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while raw.len() < body_start + content_length {
                let n = socket.read(&mut buf).await.expect("read body");
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
            }
            let req_body = String::from_utf8_lossy(&raw[body_start..]).to_string();

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            CapturedRequest {
                head,
                body: req_body,
            }
        });
        (format!("http://{addr}"), handle)
    }

    /// Accepts one connection, reads the request and never answers.
    pub async fn silent_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        (format!("http://{addr}"), handle)
    }

    /// A local URL nothing is listening on.
    pub async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> Config {
        let mut cfg = Config::default();
        cfg.providers.openai.api_key_env = "CODEMATE_TEST_UNSET_OPENAI".to_string();
        cfg.providers.deepseek.api_key_env = "CODEMATE_TEST_UNSET_DEEPSEEK".to_string();
        cfg
    }

    #[test]
    fn registry_reports_unauthenticated_cloud_providers() {
        let cfg = offline_config();
        let registry = ProviderRegistry::from_config(&cfg).unwrap();
        assert_eq!(registry.status(ProviderKind::Ollama), ProviderStatus::Ready);
        assert_eq!(registry.status(ProviderKind::Openai), ProviderStatus::MissingApiKey);
        assert_eq!(registry.get(ProviderKind::Deepseek).kind(), ProviderKind::Deepseek);
    }

    #[test]
    fn stored_key_authenticates() {
        let mut cfg = offline_config();
        cfg.providers.openai.api_key = Some("sk-live".to_string());
        let registry = ProviderRegistry::from_config(&cfg).unwrap();
        assert_eq!(registry.status(ProviderKind::Openai), ProviderStatus::Ready);
    }

    #[test]
    fn explicit_key_authenticates_without_stored_one() {
        let cfg = offline_config();
        let mut registry = ProviderRegistry::from_config(&cfg).unwrap();
        registry
            .set_api_key(ProviderKind::Deepseek, &cfg.providers.deepseek, "ds-key".to_string())
            .unwrap();
        assert_eq!(registry.status(ProviderKind::Deepseek), ProviderStatus::Ready);
        assert_eq!(registry.status(ProviderKind::Openai), ProviderStatus::MissingApiKey);
    }

    #[test]
    fn error_messages_are_distinct() {
        let connect = ClientError::Connect {
            provider: ProviderKind::Ollama,
            url: "http://localhost:11434".to_string(),
            hint: "Is Ollama running? Start it with `ollama serve`.",
        };
        let timeout = ClientError::Timeout {
            provider: ProviderKind::Ollama,
            secs: 120,
        };
        let http = ClientError::Http {
            provider: ProviderKind::Openai,
            status: 401,
            body: "bad key".to_string(),
        };
        assert!(connect.to_string().contains("ollama serve"));
        assert!(timeout.to_string().contains("120s"));
        assert_eq!(http.to_string(), "openai returned HTTP 401: bad key");
    }
}
