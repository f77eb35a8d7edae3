//! 离线实现：固定回复的推理后端与基于哈希的嵌入器

use crate::{ModelBackend, PredictRequest, PredictResponse, TextEmbedder};
use async_trait::async_trait;
use pi_core::estimate_tokens;
use pi_error::{PiError, Result};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// 固定回复的推理后端
pub struct StaticBackend {
    reply: String,
    /// 流式输出时每个片段的字符数
    piece_chars: usize,
    fail: bool,
    report_usage: bool,
    last_request: Mutex<Option<PredictRequest>>,
}

impl StaticBackend {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            piece_chars: 64,
            fail: false,
            report_usage: true,
            last_request: Mutex::new(None),
        }
    }

    /// 每次调用都返回错误
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }

    pub fn with_piece_chars(mut self, piece_chars: usize) -> Self {
        self.piece_chars = piece_chars.max(1);
        self
    }

    pub fn without_usage(mut self) -> Self {
        self.report_usage = false;
        self
    }

    /// 最近一次收到的请求
    pub fn last_request(&self) -> Option<PredictRequest> {
        self.last_request.lock().ok().and_then(|g| g.clone())
    }

    fn remember(&self, req: &PredictRequest) {
        if let Ok(mut guard) = self.last_request.lock() {
            *guard = Some(req.clone());
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            return Err(PiError::LlmService {
                provider: "static".to_string(),
                message: "configured to fail".to_string(),
                retry_after: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ModelBackend for StaticBackend {
    async fn predict(&self, req: PredictRequest) -> Result<PredictResponse> {
        self.remember(&req);
        self.check()?;

        let resp = PredictResponse::text(self.reply.clone());
        if !self.report_usage {
            return Ok(resp);
        }
        let prompt_tokens = estimate_tokens(&String::from_utf8_lossy(&req.input)) as u64;
        let completion_tokens = estimate_tokens(&self.reply) as u64;
        Ok(resp.with_usage(prompt_tokens, completion_tokens))
    }

    async fn predict_stream(
        &self,
        req: PredictRequest,
    ) -> Result<mpsc::Receiver<Result<PredictResponse>>> {
        self.remember(&req);
        self.check()?;

        let pieces: Vec<String> = self
            .reply
            .chars()
            .collect::<Vec<_>>()
            .chunks(self.piece_chars)
            .map(|c| c.iter().collect())
            .collect();

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for piece in pieces {
                if tx.send(Ok(PredictResponse::text(piece))).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn healthy(&self) -> bool {
        !self.fail
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// 词袋哈希嵌入，相同文本得到相同向量
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut word = String::new();
        for c in text.chars() {
            if pi_core::tokens::is_cjk(c) {
                if !word.is_empty() {
                    out.push(std::mem::take(&mut word));
                }
                out.push(c.to_string());
            } else if c.is_alphanumeric() {
                word.extend(c.to_lowercase());
            } else if !word.is_empty() {
                out.push(std::mem::take(&mut word));
            }
        }
        if !word.is_empty() {
            out.push(word);
        }
        out
    }

    // FNV-1a，跨进程稳定
    fn hash(token: &str) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in token.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in Self::tokens(text) {
            let idx = (Self::hash(&token) % self.dimensions as u64) as usize;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl TextEmbedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}
