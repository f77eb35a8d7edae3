use crate::analysis::{AnalysisTask, OutputFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 报告正文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportContent {
    pub title: String,
    pub executive_summary: String,
    pub sections: Vec<ReportSection>,
    pub conclusions: Vec<Conclusion>,
    pub recommendations: Vec<Recommendation>,
    pub risk_assessment: Option<RiskAssessment>,
    pub citations: Vec<Citation>,
    pub raw_output: String,
}

impl ReportContent {
    /// 正文总字符数（摘要、章节、结论、建议）
    pub fn text_length(&self) -> usize {
        let sections: usize = self.sections.iter().map(ReportSection::text_length).sum();
        let conclusions: usize = self
            .conclusions
            .iter()
            .map(|c| c.statement.chars().count())
            .sum();
        let recommendations: usize = self
            .recommendations
            .iter()
            .map(|r| r.action.chars().count() + r.rationale.chars().count())
            .sum();
        self.executive_summary.chars().count() + sections + conclusions + recommendations
    }
}

/// 报告章节，可递归嵌套
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
    pub order: usize,
    pub subsections: Vec<ReportSection>,
    pub tables: Vec<ReportTable>,
    pub figures: Vec<ReportFigure>,
}

impl ReportSection {
    pub fn new(title: impl Into<String>, content: impl Into<String>, order: usize) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            order,
            ..Default::default()
        }
    }

    fn text_length(&self) -> usize {
        self.content.chars().count()
            + self
                .subsections
                .iter()
                .map(ReportSection::text_length)
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportTable {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportFigure {
    pub caption: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conclusion {
    pub statement: String,
    /// 0.0 ~ 1.0
    pub confidence: Option<f32>,
    pub supporting_evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recommendation {
    pub action: String,
    pub priority: Option<Priority>,
    pub rationale: String,
    pub timeline: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskAssessment {
    pub overall_risk: Option<RiskLevel>,
    pub summary: String,
    pub risk_factors: Vec<RiskFactor>,
    pub mitigation_strategies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskFactor {
    pub description: String,
    pub severity: Option<RiskLevel>,
}

/// 引用来源分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CitationSourceType {
    Patent,
    ExaminationGuideline,
    Statute,
    CaseLaw,
    Literature,
    #[default]
    Other,
}

/// 引用核验状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Verified,
    NotFound,
}

impl VerificationStatus {
    /// 推进核验状态；已核验的引用不会回退，返回是否发生变化
    pub fn advance(&mut self, next: VerificationStatus) -> bool {
        if *self == VerificationStatus::Verified || *self == next {
            return false;
        }
        *self = next;
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Citation {
    pub id: String,
    pub source: String,
    pub source_type: CitationSourceType,
    pub verification_status: VerificationStatus,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMetadata {
    pub model_id: String,
    pub model_version: Option<String>,
    pub template_version: String,
    pub request_id: String,
    pub output_format: OutputFormat,
    pub rag_used: bool,
    pub rag_chunks_used: usize,
    pub reranker_applied: bool,
    pub prompt_tokens_estimated: usize,
    pub truncation_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub category: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(severity: IssueSeverity, category: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.to_string(),
            message: message.into(),
        }
    }
}

/// 报告质量评估结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub score: f32,
    pub structural_score: f32,
    pub citation_score: f32,
    pub length_score: f32,
    pub actionability_score: f32,
    pub issues: Vec<ValidationIssue>,
}

/// 最终报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub task: AnalysisTask,
    pub content: ReportContent,
    pub metadata: ReportMetadata,
    pub validation: Option<ValidationResult>,
    pub generated_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub token_usage: TokenUsage,
}

/// 流式生成时推送给调用方的片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportChunk {
    pub report_id: Uuid,
    pub sequence: usize,
    pub content: String,
    pub section_hint: Option<String>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Markdown,
    Pdf,
    Docx,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "markdown",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Docx => "docx",
        }
    }
}
