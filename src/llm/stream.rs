use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::{ClientError, RequestContext};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub delta: Option<String>,
    pub done: bool,
    pub error: Option<String>,
}

/// Ollama streams newline-delimited JSON objects `{response, done}`.
pub fn parse_ndjson_line(line: &str) -> ParsedLine {
    let Ok(val) = serde_json::from_str::<Value>(line.trim()) else {
        return ParsedLine::default();
    };
    ParsedLine {
        delta: val
            .get("response")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        done: val.get("done").and_then(|v| v.as_bool()).unwrap_or(false),
        error: val.get("error").and_then(|v| v.as_str()).map(str::to_string),
    }
}

/// OpenAI-style server-sent events: `data: {json}` lines ended by `data: [DONE]`.
pub fn parse_sse_line(line: &str) -> ParsedLine {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return ParsedLine::default();
    };
    let data = data.trim();
    if data == "[DONE]" {
        return ParsedLine {
            done: true,
            ..ParsedLine::default()
        };
    }
    let Ok(val) = serde_json::from_str::<Value>(data) else {
        return ParsedLine::default();
    };
    ParsedLine {
        delta: extract_delta_content(&val).filter(|s| !s.is_empty()),
        done: false,
        error: val
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .map(str::to_string),
    }
}

pub fn extract_delta_content(value: &Value) -> Option<String> {
    let content = value.get("choices")?.get(0)?.get("delta")?.get("content")?;
    content_text(content)
}

pub fn extract_content(value: &Value) -> Option<String> {
    let content = value.get("choices")?.get(0)?.get("message")?.get("content")?;
    content_text(content)
}

fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if item.get("type").and_then(|t| t.as_str()) == Some("text")
                    && let Some(t) = item.get("text").and_then(|t| t.as_str())
                {
                    out.push_str(t);
                }
            }
            if out.is_empty() { None } else { Some(out) }
        }
        _ => None,
    }
}

/// Splits a byte stream into lines without breaking multi-byte characters
/// that straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(idx + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Reads the response body line by line, forwarding each delta to `chunks`
/// and returning the accumulated answer. Stops at the provider's done marker.
pub(crate) async fn collect_stream(
    mut resp: reqwest::Response,
    parse: fn(&str) -> ParsedLine,
    chunks: Option<&UnboundedSender<String>>,
    ctx: &RequestContext,
) -> Result<String, ClientError> {
    let mut full = String::new();
    let mut buffer = LineBuffer::default();

    while let Some(chunk) = resp.chunk().await.map_err(|e| ctx.map_err(e))? {
        for line in buffer.push(&chunk) {
            if line.trim().is_empty() {
                continue;
            }
            if apply_line(parse(&line), &mut full, chunks, ctx)? {
                return Ok(full);
            }
        }
    }
    if let Some(line) = buffer.finish() {
        apply_line(parse(&line), &mut full, chunks, ctx)?;
    }
    debug!(provider = %ctx.provider, "stream ended without done marker");
    Ok(full)
}

fn apply_line(
    parsed: ParsedLine,
    full: &mut String,
    chunks: Option<&UnboundedSender<String>>,
    ctx: &RequestContext,
) -> Result<bool, ClientError> {
    if let Some(message) = parsed.error {
        return Err(ClientError::Api {
            provider: ctx.provider,
            message,
        });
    }
    if let Some(delta) = parsed.delta {
        if let Some(tx) = chunks {
            // The receiver may be gone if output was cancelled; keep accumulating.
            let _ = tx.send(delta.clone());
        }
        full.push_str(&delta);
    }
    Ok(parsed.done)
}
