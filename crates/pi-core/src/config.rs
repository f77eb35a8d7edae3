//! 配置：YAML 文件 + `PI_*` 环境变量覆盖

use pi_error::{PiError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rag: RagSettings,
    pub prompt: PromptSettings,
    pub generator: GeneratorSettings,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    pub default_top_k: usize,
    pub similarity_threshold: f32,
    pub rerank_multiplier: usize,
    pub index_concurrency: usize,
    /// 分块目标大小（估算 token）
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// 报告生成时 RAG 上下文的 token 预算
    pub context_budget: usize,
    pub reranker: Option<RerankerSettings>,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            similarity_threshold: 0.5,
            rerank_multiplier: 3,
            index_concurrency: 8,
            chunk_size: 512,
            chunk_overlap: 64,
            context_budget: 3000,
            reranker: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RerankerSettings {
    #[serde(rename = "cohere")]
    Cohere {
        api_key: String,
        model: Option<String>,
        api_url: Option<String>,
    },
    #[serde(rename = "keyword")]
    Keyword { boost_factor: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub max_context_tokens: usize,
    /// 为固定指令块预留的 token
    pub instruction_reserve: usize,
    pub template_version: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            instruction_reserve: 300,
            template_version: "v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub model_name: String,
    pub model_version: Option<String>,
    pub use_rag: bool,
    pub enable_validation: bool,
    pub stream_flush_bytes: usize,
    pub stream_buffer: usize,
    pub verification_timeout_ms: u64,
    pub verification_threshold: f32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            model_name: "patent-analyst".to_string(),
            model_version: None,
            use_rag: true,
            enable_validation: true,
            stream_flush_bytes: 1024,
            stream_buffer: 32,
            verification_timeout_ms: 3000,
            verification_threshold: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub embedding_model: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            chat_model: "gpt-4o".to_string(),
            embedding_model: Some("text-embedding-3-small".to_string()),
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: AppConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| PiError::Configuration {
            key: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let cfg = Self::from_yaml_str(&s)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    /// 用进程环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PI_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("PI_LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = lookup("PI_LLM_CHAT_MODEL") {
            self.llm.chat_model = v.clone();
            self.generator.model_name = v;
        }
        if let Some(v) = lookup("PI_LLM_EMBED_MODEL") {
            self.llm.embedding_model = Some(v);
        }
        if let Some(v) = lookup("PI_RAG_TOP_K").and_then(|s| s.parse().ok()) {
            self.rag.default_top_k = v;
        }
        if let Some(v) = lookup("PI_RAG_SIMILARITY_THRESHOLD").and_then(|s| s.parse().ok()) {
            self.rag.similarity_threshold = v;
        }
        if let Some(v) = lookup("PI_RAG_INDEX_CONCURRENCY").and_then(|s| s.parse().ok()) {
            self.rag.index_concurrency = v;
        }
        if let Some(v) = lookup("PI_MAX_CONTEXT_TOKENS").and_then(|s| s.parse().ok()) {
            self.prompt.max_context_tokens = v;
        }
        if let Some(api_key) = lookup("COHERE_API_KEY") {
            if self.rag.reranker.is_none() {
                self.rag.reranker = Some(RerankerSettings::Cohere {
                    api_key,
                    model: lookup("COHERE_RERANK_MODEL"),
                    api_url: None,
                });
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rag.chunk_size == 0 {
            return Err(PiError::Configuration {
                key: "rag.chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.rag.chunk_overlap >= self.rag.chunk_size {
            return Err(PiError::Configuration {
                key: "rag.chunk_overlap".to_string(),
                reason: "must be smaller than rag.chunk_size".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.rag.similarity_threshold) {
            return Err(PiError::Configuration {
                key: "rag.similarity_threshold".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.rag.default_top_k, 10);
        assert_eq!(cfg.rag.rerank_multiplier, 3);
        assert_eq!(cfg.rag.index_concurrency, 8);
        assert_eq!(cfg.prompt.instruction_reserve, 300);
        assert_eq!(cfg.generator.stream_flush_bytes, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = AppConfig::from_yaml_str(
            r#"
rag:
  default_top_k: 4
  reranker:
    kind: keyword
    boost_factor: 0.2
prompt:
  max_context_tokens: 2000
"#,
        )
        .unwrap();
        assert_eq!(cfg.rag.default_top_k, 4);
        assert_eq!(cfg.rag.similarity_threshold, 0.5);
        assert_eq!(cfg.prompt.max_context_tokens, 2000);
        assert!(matches!(
            cfg.rag.reranker,
            Some(RerankerSettings::Keyword { .. })
        ));
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        let err = AppConfig::from_yaml_str("rag:\n  chunk_size: 10\n  chunk_overlap: 10\n")
            .unwrap_err();
        assert!(matches!(err, PiError::Configuration { .. }));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PI_RAG_TOP_K", "7"),
            ("PI_LLM_CHAT_MODEL", "deepseek-chat"),
            ("COHERE_API_KEY", "k"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rag.default_top_k, 7);
        assert_eq!(cfg.generator.model_name, "deepseek-chat");
        assert!(matches!(
            cfg.rag.reranker,
            Some(RerankerSettings::Cohere { .. })
        ));
    }
}
