// ========== OpenAI-compatible (covers OpenAI, DeepSeek, some Qwen proxies) ==========

use crate::{ModelBackend, PredictRequest, PredictResponse, TextEmbedder};
use async_trait::async_trait;
use futures::StreamExt;
use pi_core::ChatMessage;
use pi_error::{PiError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o, deepseek-chat
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
    pub temperature: f32,
    pub timeout: Duration,
}

impl From<&pi_core::config::LlmSettings> for OpenAiCompatConfig {
    fn from(s: &pi_core::config::LlmSettings) -> Self {
        Self {
            base_url: s.base_url.clone(),
            api_key: s.api_key.clone(),
            chat_model: s.chat_model.clone(),
            embedding_model: s.embedding_model.clone(),
            temperature: s.temperature,
            timeout: Duration::from_secs(s.timeout_secs),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn model_for(&self, req: &PredictRequest) -> String {
        if req.model_name.is_empty() {
            self.cfg.chat_model.clone()
        } else {
            req.model_name.clone()
        }
    }

    async fn send_chat(&self, body: &OaiChatReq) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(&self.cfg.api_key)
            .timeout(self.cfg.timeout)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(PiError::LlmService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: if status.as_u16() == 429 {
                    Some(Duration::from_secs(30))
                } else {
                    None
                },
            });
        }
        Ok(resp)
    }
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
    model: Option<String>,
    usage: Option<OaiUsage>,
}

#[derive(Deserialize)]
struct OaiStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiStreamChoice {
    delta: OaiStreamDelta,
}

#[derive(Deserialize)]
struct OaiStreamChunk {
    choices: Vec<OaiStreamChoice>,
}

/// 单行 SSE 解析结果
#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
}

pub(crate) fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let chunk: OaiStreamChunk = serde_json::from_str(data).ok()?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(SseEvent::Delta(text))
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatClient {
    #[instrument(skip(self, req), fields(model = %req.model_name))]
    async fn predict(&self, req: PredictRequest) -> Result<PredictResponse> {
        let body = OaiChatReq {
            model: self.model_for(&req),
            messages: req.messages()?,
            temperature: Some(self.cfg.temperature),
            stream: false,
        };

        let data: OaiChatResp = self.send_chat(&body).await?.json().await?;
        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let mut resp = PredictResponse::text(content);
        if let Some(usage) = data.usage {
            resp = resp.with_usage(usage.prompt_tokens, usage.completion_tokens);
        }
        resp.model_version = data.model;
        Ok(resp)
    }

    #[instrument(skip(self, req), fields(model = %req.model_name))]
    async fn predict_stream(
        &self,
        req: PredictRequest,
    ) -> Result<mpsc::Receiver<Result<PredictResponse>>> {
        let body = OaiChatReq {
            model: self.model_for(&req),
            messages: req.messages()?,
            temperature: Some(self.cfg.temperature),
            stream: true,
        };

        let resp = self.send_chat(&body).await?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut pending = String::new();

            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(PiError::from(e))).await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    match parse_sse_line(&line) {
                        Some(SseEvent::Delta(text)) => {
                            if tx.send(Ok(PredictResponse::text(text))).await.is_err() {
                                // 接收端已关闭
                                return;
                            }
                        }
                        Some(SseEvent::Done) => return,
                        None => {}
                    }
                }
            }

            if let Some(SseEvent::Delta(text)) = parse_sse_line(&pending) {
                let _ = tx.send(Ok(PredictResponse::text(text))).await;
            }
        });

        Ok(rx)
    }

    async fn healthy(&self) -> bool {
        match self
            .http
            .get(self.url("/v1/models"))
            .bearer_auth(&self.cfg.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "openai_compat health check failed");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "openai_compat"
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl TextEmbedder for OpenAiCompatClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.batch_embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PiError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: "empty embedding response".to_string(),
                retry_after: None,
            })
    }

    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| PiError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(self.url("/v1/embeddings"))
            .bearer_auth(&self.cfg.api_key)
            .timeout(self.cfg.timeout)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(PiError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: None,
            });
        }

        let data: OaiEmbedResp = resp.json().await?;
        if data.data.len() != texts.len() {
            return Err(PiError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    data.data.len()
                ),
                retry_after: None,
            });
        }
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}
