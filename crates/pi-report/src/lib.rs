//! 专利分析报告生成
//!
//! 检索增强、提示词组装、模型推理、输出解析、引用核验、质量评分与导出。

pub mod citations;
pub mod export;
pub mod generator;
pub mod parser;
pub mod stream;
pub mod validation;

pub use citations::{classify_source, extract_citations, verify_citations};
pub use export::{export_report, ReportExporter, MARKDOWN_TEMPLATE_NAME};
pub use generator::{ReportGenerator, ReportRequest};
pub use parser::{
    classify_heading, parse_llm_output, parse_llm_output_with_status, parse_recommendation_item,
    parse_risk_level, strip_code_fences, ParseOutcome, SectionKind, FALLBACK_SECTION_TITLE,
    PREAMBLE_SECTION_TITLE,
};
pub use stream::{detect_section_hint, should_flush, ReportStream, StreamOutcome};
pub use validation::validate_content;

pub use pi_core::{ExportFormat, Report, ReportChunk, ReportContent, ValidationResult};
pub use pi_error::{PiError, Result};
