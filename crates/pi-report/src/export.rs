//! 报告导出
//!
//! Markdown 由注册表中的 `export/markdown` 模板渲染，调用方可以注册同名模板覆盖版式。

use once_cell::sync::Lazy;
use pi_core::{ExportFormat, Report, ReportSection, ReportTable, VerificationStatus};
use pi_error::{PiError, Result};
use pi_prompt::TemplateRegistry;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const MARKDOWN_TEMPLATE_NAME: &str = "export/markdown";

const MARKDOWN_TEMPLATE: &str = "# {{title}}
{{#if executive_summary}}

## Executive Summary

{{executive_summary}}
{{/if}}
{{#each sections}}

{{heading}}
{{#if content}}

{{content}}
{{/if}}
{{#each tables}}

{{#if title}}**{{title}}**

{{/if}}
{{header_row}}
{{separator}}
{{#each rows}}
{{this}}
{{/each}}
{{/each}}
{{/each}}
{{#if conclusions}}

## Conclusions

{{#each conclusions}}
- {{statement}}{{#if confidence}} (confidence: {{confidence}}){{/if}}
{{/each}}
{{/if}}
{{#if recommendations}}

## Recommendations

{{#each recommendations}}
{{number}}. {{action}}{{#if priority}} **[{{priority}}]**{{/if}}
{{#if rationale}}
   - Rationale: {{rationale}}
{{/if}}
{{#if timeline}}
   - Timeline: {{timeline}}
{{/if}}
{{/each}}
{{/if}}
{{#if risk}}

## Risk Assessment

{{#if risk.overall}}
**Overall risk:** {{risk.overall}}

{{/if}}
{{#if risk.summary}}
{{risk.summary}}

{{/if}}
{{#each risk.factors}}
- {{description}}{{#if severity}} ({{severity}}){{/if}}
{{/each}}
{{#if risk.mitigations}}

**Mitigation strategies**

{{#each risk.mitigations}}
- {{this}}
{{/each}}
{{/if}}
{{/if}}
{{#if references}}

## References

{{#each references}}
- {{id}} {{source}} ({{status}}){{#if url}} <{{url}}>{{/if}}
{{/each}}
{{/if}}

---
*{{footer.task}}, generated by {{footer.model}} at {{footer.generated_at}}. Report {{footer.report_id}}, {{footer.total_tokens}} tokens, {{footer.latency_ms}} ms.*
";

static EXTRA_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn status_label(status: VerificationStatus) -> &'static str {
    match status {
        VerificationStatus::Verified => "verified",
        VerificationStatus::Unverified => "unverified",
        VerificationStatus::NotFound => "not found",
    }
}

fn pipe_row(cells: &[String]) -> String {
    let escaped: Vec<String> = cells.iter().map(|c| c.replace('|', "\\|")).collect();
    format!("| {} |", escaped.join(" | "))
}

fn table_view(table: &ReportTable) -> Value {
    json!({
        "title": table.title,
        "header_row": pipe_row(&table.headers),
        "separator": format!("|{}", " --- |".repeat(table.headers.len().max(1))),
        "rows": table.rows.iter().map(|r| pipe_row(r)).collect::<Vec<_>>(),
    })
}

/// 章节树拍平为带标题级别的列表
fn flatten_sections(sections: &[ReportSection], depth: usize, out: &mut Vec<Value>) {
    let mut ordered: Vec<&ReportSection> = sections.iter().collect();
    ordered.sort_by_key(|s| s.order);
    for section in ordered {
        let hashes = "#".repeat((depth + 2).min(6));
        out.push(json!({
            "heading": format!("{} {}", hashes, section.title),
            "content": section.content,
            "tables": section.tables.iter().map(table_view).collect::<Vec<_>>(),
        }));
        flatten_sections(&section.subsections, depth + 1, out);
    }
}

fn view_model(report: &Report) -> Value {
    let content = &report.content;
    let title = if content.title.is_empty() {
        report.task.display_name().to_string()
    } else {
        content.title.clone()
    };

    let mut sections = Vec::new();
    flatten_sections(&content.sections, 0, &mut sections);

    let conclusions: Vec<Value> = content
        .conclusions
        .iter()
        .map(|c| {
            json!({
                "statement": c.statement,
                "confidence": c.confidence.map(|v| format!("{:.0}%", v * 100.0)),
            })
        })
        .collect();

    let recommendations: Vec<Value> = content
        .recommendations
        .iter()
        .enumerate()
        .map(|(i, r)| {
            json!({
                "number": i + 1,
                "action": r.action,
                "priority": r.priority.map(|p| p.as_str()),
                "rationale": r.rationale,
                "timeline": r.timeline,
            })
        })
        .collect();

    let risk = content.risk_assessment.as_ref().map(|r| {
        json!({
            "overall": r.overall_risk.map(|l| l.as_str()),
            "summary": r.summary,
            "factors": r.risk_factors.iter().map(|f| json!({
                "description": f.description,
                "severity": f.severity.map(|l| l.as_str()),
            })).collect::<Vec<_>>(),
            "mitigations": r.mitigation_strategies,
        })
    });

    let references: Vec<Value> = content
        .citations
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "source": c.source,
                "status": status_label(c.verification_status),
                "url": c.url,
            })
        })
        .collect();

    json!({
        "title": title,
        "executive_summary": content.executive_summary,
        "sections": sections,
        "conclusions": conclusions,
        "recommendations": recommendations,
        "risk": risk,
        "references": references,
        "footer": {
            "task": report.task.display_name(),
            "model": report.metadata.model_id,
            "generated_at": report.generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            "report_id": report.id.to_string(),
            "total_tokens": report.token_usage.total_tokens,
            "latency_ms": report.latency_ms,
        },
    })
}

/// 报告导出器
pub struct ReportExporter {
    registry: Arc<TemplateRegistry>,
}

impl ReportExporter {
    /// 使用独立的模板注册表
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(TemplateRegistry::new()))
    }

    /// 共享已有注册表；已存在的 `export/markdown` 模板保持不变
    pub fn with_registry(registry: Arc<TemplateRegistry>) -> Result<Self> {
        if !registry.has_template(MARKDOWN_TEMPLATE_NAME) {
            registry.register_template(MARKDOWN_TEMPLATE_NAME, MARKDOWN_TEMPLATE)?;
        }
        Ok(Self { registry })
    }

    pub fn export(&self, report: &Report, format: ExportFormat) -> Result<Vec<u8>> {
        let bytes = match format {
            ExportFormat::Json => serde_json::to_vec_pretty(report)?,
            ExportFormat::Markdown => self.to_markdown(report)?.into_bytes(),
            ExportFormat::Pdf | ExportFormat::Docx => {
                return Err(PiError::NotImplemented {
                    feature: format!("{} export", format.as_str()),
                })
            }
        };
        debug!(report_id = %report.id, format = format.as_str(), bytes = bytes.len(), "Exported report");
        Ok(bytes)
    }

    pub fn to_markdown(&self, report: &Report) -> Result<String> {
        let rendered = self
            .registry
            .render_template(MARKDOWN_TEMPLATE_NAME, &view_model(report))?;
        let collapsed = EXTRA_BLANK_LINES.replace_all(&rendered, "\n\n");
        Ok(format!("{}\n", collapsed.trim()))
    }
}

/// 使用默认版式导出
pub fn export_report(report: &Report, format: ExportFormat) -> Result<Vec<u8>> {
    ReportExporter::new()?.export(report, format)
}
