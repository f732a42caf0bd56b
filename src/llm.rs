use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::errors::ServiceError;

/// A structured-output language model: a system prompt plus page context in,
/// one JSON object out.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &str, context: &str) -> Result<Value, ServiceError>;
}

/// Fields the model reports for one page. Missing, null or mistyped values
/// decode as empty rather than failing the row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Classification {
    #[serde(alias = "api", deserialize_with = "lenient_string")]
    pub target_api: String,
    #[serde(deserialize_with = "lenient_string")]
    pub package: String,
    #[serde(deserialize_with = "lenient_string")]
    pub language: String,
    #[serde(deserialize_with = "lenient_string")]
    pub deprecated_in: String,
    #[serde(deserialize_with = "lenient_string")]
    pub removed_in: String,
    #[serde(deserialize_with = "lenient_string")]
    pub replaced_by: String,
    #[serde(deserialize_with = "lenient_string")]
    pub change_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub reason: String,
    #[serde(deserialize_with = "lenient_string")]
    pub source: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub confidence: f64,
    #[serde(deserialize_with = "lenient_string")]
    pub evidence: String,
}

impl Classification {
    pub fn from_value(value: Value) -> Result<Self, ServiceError> {
        serde_json::from_value(value).map_err(|e| ServiceError::Malformed(e.to_string()))
    }
}

/// Block indices the model judged relevant, in the order it listed them.
pub fn selected_blocks(value: &Value, min_confidence: f64) -> Vec<usize> {
    let Some(entries) = value.get("relevant_examples").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries {
        let relevant = entry.get("is_relevant").and_then(|v| v.as_bool()).unwrap_or(true);
        let confidence = entry.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0);
        let Some(index) = entry.get("block_index").and_then(|v| v.as_u64()) else {
            continue;
        };
        let index = index as usize;
        if relevant && confidence >= min_confidence && !out.contains(&index) {
            out.push(index);
        }
    }
    out
}

/// `(code, output)` pairs from a split reply. Entries without code are
/// dropped; a reply without an `examples` array is malformed.
pub fn split_examples(value: &Value) -> Result<Vec<(String, String)>, ServiceError> {
    let entries = value
        .get("examples")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ServiceError::Malformed("expected an \"examples\" array".into()))?;
    Ok(entries
        .iter()
        .filter_map(|entry| {
            let code = entry.get("code")?.as_str()?.trim_end();
            if code.trim().is_empty() {
                return None;
            }
            let output = entry.get("output").and_then(|v| v.as_str()).unwrap_or("").trim();
            Some((code.to_string(), output.to_string()))
        })
        .collect())
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

// ── Chat-completions client ──

/// OpenAI-compatible chat-completions classifier in JSON mode.
pub struct ChatClassifier {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: String,
}

impl ChatClassifier {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("LLM API key is not configured"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .no_proxy()
            .build()?;
        info!("Classifier ready: model {} at {}", config.model, config.api_base);
        Ok(ChatClassifier {
            client,
            config: config.clone(),
            api_key,
        })
    }

    async fn send_once(&self, prompt: &str, context: &str) -> Result<Value, ServiceError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": prompt },
                { "role": "user", "content": context },
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.api_base.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(match status.as_u16() {
                401 | 403 => ServiceError::Auth(format!("{}: {}", status, snippet)),
                429 => ServiceError::Quota(format!("{}: {}", status, snippet)),
                _ => ServiceError::Transport(format!("{}: {}", status, snippet)),
            });
        }

        let payload: Value = response.json().await.map_err(transport_error)?;
        let content = payload
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| ServiceError::Malformed("response has no message content".into()))?;
        parse_json_content(content)
    }
}

#[async_trait]
impl Classifier for ChatClassifier {
    async fn classify(&self, prompt: &str, context: &str) -> Result<Value, ServiceError> {
        let max = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.send_once(prompt, context).await {
                Ok(v) => {
                    debug!("Classifier answered on attempt {}", attempt);
                    return Ok(v);
                }
                Err(e) if e.is_retryable() && attempt < max => {
                    warn!("Classifier call failed, retrying ({}/{}): {}", attempt, max, e);
                    tokio::time::sleep(Duration::from_millis(1000 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout
    } else if e.is_decode() {
        ServiceError::Malformed(e.to_string())
    } else {
        ServiceError::Transport(e.to_string())
    }
}

/// Parse a model reply as a JSON object, tolerating a Markdown code fence.
pub fn parse_json_content(content: &str) -> Result<Value, ServiceError> {
    let mut text = content.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        text = rest.trim().trim_end_matches("```").trim();
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| ServiceError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ServiceError::Malformed("expected a JSON object".into()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every request with the given status and body.
    async fn serve(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                            let len = head
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if buf.len() >= end + 4 + len {
                                break;
                            }
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn config(api_base: String) -> LlmConfig {
        LlmConfig {
            api_base,
            api_key: Some("sk-test".into()),
            max_retries: 1,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn parses_json_mode_reply() {
        let content = r#"{"target_api": "numpy.ndarray.shape", "replaced_by": "ndarray.reshape", "confidence": 0.92, "removed_in": null}"#;
        let body = json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] });
        let base = serve("200 OK", body.to_string()).await;

        let classifier = ChatClassifier::new(&config(base)).unwrap();
        let value = classifier.classify("system", "page").await.unwrap();
        let c = Classification::from_value(value).unwrap();
        assert_eq!(c.target_api, "numpy.ndarray.shape");
        assert_eq!(c.replaced_by, "ndarray.reshape");
        assert_eq!(c.removed_in, "");
        assert!((c.confidence - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn auth_and_quota_are_distinguished() {
        let base = serve("401 Unauthorized", r#"{"error":"bad key"}"#.into()).await;
        let err = ChatClassifier::new(&config(base)).unwrap().classify("s", "c").await.unwrap_err();
        assert!(matches!(err, ServiceError::Auth(_)));

        let base = serve("429 Too Many Requests", r#"{"error":"quota"}"#.into()).await;
        let err = ChatClassifier::new(&config(base)).unwrap().classify("s", "c").await.unwrap_err();
        assert!(matches!(err, ServiceError::Quota(_)));
    }

    #[tokio::test]
    async fn non_json_content_is_malformed() {
        let body = json!({ "choices": [{ "message": { "content": "I cannot help with that." } }] });
        let base = serve("200 OK", body.to_string()).await;
        let err = ChatClassifier::new(&config(base)).unwrap().classify("s", "c").await.unwrap_err();
        assert!(matches!(err, ServiceError::Malformed(_)));
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(ChatClassifier::new(&LlmConfig::default()).is_err());
    }

    #[test]
    fn code_fences_are_tolerated() {
        let v = parse_json_content("```json\n{\"api\": \"_.chunk\"}\n```").unwrap();
        let c = Classification::from_value(v).unwrap();
        assert_eq!(c.target_api, "_.chunk");
        assert!(parse_json_content("[1, 2]").is_err());
    }

    #[test]
    fn lenient_field_types() {
        let c = Classification::from_value(json!({
            "deprecated_in": 2.0,
            "replaced_by": ["a", "b"],
            "confidence": "0.75"
        }))
        .unwrap();
        assert_eq!(c.deprecated_in, "2.0");
        assert_eq!(c.replaced_by, "a, b");
        assert!((c.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn block_selection_filters_low_confidence() {
        let v = json!({ "relevant_examples": [
            { "block_index": 2, "is_relevant": true, "confidence": 0.9 },
            { "block_index": 0, "is_relevant": false, "confidence": 0.9 },
            { "block_index": 1, "is_relevant": true, "confidence": 0.3 },
            { "block_index": 2, "is_relevant": true, "confidence": 0.8 }
        ]});
        assert_eq!(selected_blocks(&v, 0.6), vec![2]);
        assert!(selected_blocks(&json!({}), 0.6).is_empty());
    }

    #[test]
    fn split_reply_parsing() {
        let v = json!({ "examples": [
            { "code": "_.chunk(['a', 'b'], 1);\n", "output": "[['a'], ['b']]" },
            { "code": "  ", "output": "x" },
            { "code": "_.chunk([]);", "output": null },
            { "output": "orphan" }
        ]});
        let pairs = split_examples(&v).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("_.chunk(['a', 'b'], 1);".to_string(), "[['a'], ['b']]".to_string()),
                ("_.chunk([]);".to_string(), String::new()),
            ]
        );
        assert!(matches!(split_examples(&json!({ "code": "x" })), Err(ServiceError::Malformed(_))));
    }
}
