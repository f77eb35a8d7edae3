use async_trait::async_trait;
use pi_core::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub use pi_error::{PiError, Result};

pub mod mock;
pub mod openai;

pub use mock::{HashEmbedder, StaticBackend};
pub use openai::{OpenAiCompatClient, OpenAiCompatConfig};

/// `input_format` 取值：JSON 编码的对话消息数组
pub const INPUT_FORMAT_CHAT: &str = "chat_messages";
/// `input_format` 取值：纯文本提示
pub const INPUT_FORMAT_TEXT: &str = "text";

/// 模型推理后端
///
/// 调用方通过丢弃 future 取消单次推理；流式推理由后端持有发送端，
/// 接收端被丢弃后后端应尽快停止。
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn predict(&self, req: PredictRequest) -> Result<PredictResponse>;

    async fn predict_stream(
        &self,
        req: PredictRequest,
    ) -> Result<mpsc::Receiver<Result<PredictResponse>>>;

    async fn healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// 文本嵌入
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    pub model_name: String,
    pub input: Vec<u8>,
    pub input_format: String,
    pub metadata: HashMap<String, String>,
}

impl PredictRequest {
    pub fn chat(
        model_name: &str,
        messages: &[ChatMessage],
        metadata: HashMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            model_name: model_name.to_string(),
            input: serde_json::to_vec(messages)?,
            input_format: INPUT_FORMAT_CHAT.to_string(),
            metadata,
        })
    }

    /// 将输入还原为对话消息；纯文本输入视为一条用户消息
    pub fn messages(&self) -> Result<Vec<ChatMessage>> {
        if self.input_format == INPUT_FORMAT_CHAT {
            Ok(serde_json::from_slice(&self.input)?)
        } else {
            Ok(vec![ChatMessage::user(
                String::from_utf8_lossy(&self.input).into_owned(),
            )])
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictResponse {
    pub outputs: HashMap<String, Vec<u8>>,
    pub model_version: Option<String>,
}

impl PredictResponse {
    pub fn text(text: impl Into<String>) -> Self {
        let mut outputs = HashMap::new();
        outputs.insert("text".to_string(), text.into().into_bytes());
        Self {
            outputs,
            model_version: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        for (key, value) in [
            ("prompt_tokens", prompt_tokens),
            ("completion_tokens", completion_tokens),
            ("total_tokens", prompt_tokens + completion_tokens),
        ] {
            self.outputs
                .insert(key.to_string(), value.to_string().into_bytes());
        }
        self
    }

    /// 模型文本：优先 `text`，其次 `output`
    pub fn text_output(&self) -> Option<String> {
        self.outputs
            .get("text")
            .or_else(|| self.outputs.get("output"))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// 读取 JSON 编码的整数用量字段
    pub fn usage_value(&self, key: &str) -> Option<u64> {
        self.outputs
            .get(key)
            .and_then(|bytes| serde_json::from_slice::<u64>(bytes).ok())
    }
}
