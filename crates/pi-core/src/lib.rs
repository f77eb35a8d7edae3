use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod analysis;
pub mod config;
pub mod metrics;
pub mod report;
pub mod tokens;

pub use analysis::{
    AnalysisTask, ClaimContext, DetailLevel, MoleculeContext, OutputFormat, PatentContext,
    PriorArtContext,
};
pub use config::AppConfig;
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, NoopMetrics};
pub use report::*;
pub use tokens::estimate_tokens;

pub use pi_error::{PiError as Error, Result};

/// 文档来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Patent,
    CaseLaw,
    ExaminationGuideline,
    Paper,
    Regulatory,
    #[default]
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Patent => "patent",
            SourceType::CaseLaw => "case_law",
            SourceType::ExaminationGuideline => "examination_guideline",
            SourceType::Paper => "paper",
            SourceType::Regulatory => "regulatory",
            SourceType::Other => "other",
        }
    }

    /// 从存储负载中的标签还原，未知标签归为 `Other`
    pub fn from_label(label: &str) -> Self {
        match label {
            "patent" => SourceType::Patent,
            "case_law" => SourceType::CaseLaw,
            "examination_guideline" | "guideline" => SourceType::ExaminationGuideline,
            "paper" => SourceType::Paper,
            "regulatory" => SourceType::Regulatory,
            _ => SourceType::Other,
        }
    }
}

/// 发送给模型的一条对话消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// 外部提供的待索引文档
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub language: Option<String>,
}

/// 分块器产出的文档片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub source_type: SourceType,
    pub token_count: usize,
    pub index: usize,
    pub metadata: HashMap<String, String>,
}

/// 检索得到的片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub source_type: SourceType,
    pub score: f32,
    pub reranker_score: Option<f32>,
    pub token_count: usize,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RagChunk {
    /// 有重排分数时取重排分数，否则取相似度
    pub fn effective_score(&self) -> f32 {
        self.reranker_score.unwrap_or(self.score)
    }

    fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    fn title_or_id(&self) -> &str {
        self.meta("title").unwrap_or(&self.document_id)
    }

    /// 拼入模型上下文时使用的来源标注
    pub fn source_annotation(&self) -> String {
        match self.source_type {
            SourceType::Patent => {
                let number = self.meta("patent_number").unwrap_or(&self.document_id);
                if let Some(claim) = self.meta("claim_number") {
                    format!("Patent {}, Claim {}", number, claim)
                } else if let Some(section) = self.meta("section") {
                    format!("Patent {}, {}", number, section)
                } else {
                    format!("Patent {}", number)
                }
            }
            SourceType::CaseLaw => {
                let name = self.meta("case_name").unwrap_or_else(|| self.title_or_id());
                format!("Case: {}", name)
            }
            SourceType::ExaminationGuideline => match self.meta("mpep_section") {
                Some(section) => format!("MPEP §{}", section),
                None => format!("Examination Guideline: {}", self.title_or_id()),
            },
            SourceType::Paper => format!("Paper: {}", self.title_or_id()),
            SourceType::Regulatory => format!("Regulation: {}", self.title_or_id()),
            SourceType::Other => format!("Source: {}", self.title_or_id()),
        }
    }
}

/// 检索过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalFilters {
    pub date_from: Option<chrono::NaiveDate>,
    pub date_to: Option<chrono::NaiveDate>,
    pub jurisdictions: Vec<String>,
    pub classifications: Vec<String>,
    pub document_types: Vec<String>,
    pub assignees: Vec<String>,
    pub exclude_document_ids: Vec<String>,
}

/// 检索请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagQuery {
    pub query: String,
    /// 预先计算好的查询向量，存在时跳过嵌入
    pub embedding: Option<Vec<f32>>,
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub source_types: Vec<SourceType>,
    pub filters: RetrievalFilters,
}

impl RagQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_source_types(mut self, source_types: Vec<SourceType>) -> Self {
        self.source_types = source_types;
        self
    }
}

/// 检索结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagResult {
    pub query: String,
    pub chunks: Vec<RagChunk>,
    pub total_found: usize,
    pub reranker_applied: bool,
    pub latency_ms: u64,
}

impl RagResult {
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
