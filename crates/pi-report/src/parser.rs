//! 模型输出解析
//!
//! 三种输出格式各有一条解析路径；任何路径失败都退化为单章节报告，
//! 解析本身从不向调用方报错。

use crate::citations::extract_citations;
use once_cell::sync::Lazy;
use pi_core::{
    Conclusion, OutputFormat, Priority, Recommendation, ReportContent, ReportSection,
    ReportTable, RiskAssessment, RiskFactor, RiskLevel,
};
use pi_error::{PiError, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// 退化章节的标题
pub const FALLBACK_SECTION_TITLE: &str = "Full Analysis";

/// 首个标题之前的正文所在章节的标题
pub const PREAMBLE_SECTION_TITLE: &str = "Introduction";

const SUMMARY_FALLBACK_CHARS: usize = 500;

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").unwrap());
static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?```").unwrap());
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•·+]\s+|\d{1,3}[.)]\s+|\d{1,3}、\s*)").unwrap());

static SUMMARY_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)summary|overview|abstract|摘要|概要|概述").unwrap());
static CONCLUSION_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)conclusion|key\s+findings|结论|总结").unwrap());
static RECOMMENDATION_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)recommend|next\s+steps|action\s+items|建议|对策|行动").unwrap()
});
static RISK_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)risk|风险").unwrap());

static PRIORITY_MARK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(critical|high|medium|low)[\s-]*priority\b|\bpriority\s*[:：]?\s*\**\s*(critical|high|medium|low)\b|\[(critical|high|medium|low)\]|(紧急|高|中|低)优先级",
    )
    .unwrap()
});
static TIMELINE_MARK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bwithin\s+(?:the\s+next\s+)?\d+\s*(?:days?|weeks?|months?|years?)\b|\bQ[1-4]\s*\d{4}\b|\bimmediately\b|\d+\s*个?(?:天|周|月|年)内|立即",
    )
    .unwrap()
});
static RISK_NEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)risk(?:\s+level)?\s*(?:is|:|：)?\s*\**\s*(critical|high|medium|moderate|low)\b|\b(critical|high|medium|moderate|low)[\s-]+risk|风险(?:等级|水平)?\s*(?:为|是|:|：)?\s*(极高|高|中等?|低)|(极高|高|中等?|低)风险",
    )
    .unwrap()
});
static RISK_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(critical|high|medium|moderate|low)\b").unwrap());
static CONFIDENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:confidence|置信度)\s*[:：]?\s*(\d{1,3}(?:\.\d+)?)\s*(%)?|(?:confidence|置信度)\s*[:：]?\s*(high|medium|low|高|中|低)")
        .unwrap()
});

/// 标题分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Summary,
    Conclusion,
    Recommendation,
    Risk,
    Other,
}

/// 解析结果及是否发生了退化
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub content: ReportContent,
    /// 退化原因；`None` 表示按请求格式解析成功
    pub degraded: Option<String>,
}

/// 解析模型输出，失败时退化为单章节
pub fn parse_llm_output(raw: &str, format: OutputFormat) -> ReportContent {
    parse_llm_output_with_status(raw, format).content
}

pub fn parse_llm_output_with_status(raw: &str, format: OutputFormat) -> ParseOutcome {
    let parsed = match format {
        OutputFormat::Structured => parse_structured(raw),
        OutputFormat::Narrative => parse_narrative(raw),
        OutputFormat::BulletPoints => parse_bullets(raw),
    };

    let (mut content, degraded) = match parsed {
        Ok(content) => (content, None),
        Err(e) => {
            warn!(format = ?format, error = %e, "Model output could not be parsed, using single section");
            (fallback_content(raw), Some(e.to_string()))
        }
    };
    content.raw_output = raw.to_string();
    content.citations = extract_citations(raw);
    debug!(
        sections = content.sections.len(),
        citations = content.citations.len(),
        degraded = degraded.is_some(),
        "Parsed model output"
    );
    ParseOutcome { content, degraded }
}

/// 去掉包裹整段文本的 Markdown 代码围栏
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return trimmed;
    }
    let inner = &trimmed[3..trimmed.len() - 3];
    // 跳过语言标记行
    match inner.find('\n') {
        Some(pos) => inner[pos + 1..].trim(),
        None => inner.trim(),
    }
}

fn json_candidates(raw: &str) -> Vec<&str> {
    let mut candidates = vec![strip_code_fences(raw)];
    if let Some(caps) = FENCED_BLOCK.captures(raw) {
        if let Some(m) = caps.get(1) {
            candidates.push(m.as_str().trim());
        }
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            candidates.push(&raw[start..=end]);
        }
    }
    candidates
}

/// 枚举字段统一小写，容忍 "High" 这类写法
fn normalize_enum_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if matches!(key.as_str(), "priority" | "overall_risk" | "severity") {
                    if let Value::String(s) = v {
                        let lower = s.trim().to_lowercase();
                        *s = if lower == "moderate" { "medium".to_string() } else { lower };
                    }
                } else {
                    normalize_enum_fields(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_enum_fields),
        _ => {}
    }
}

/// 结构化输出：JSON 对象直接映射为报告正文
pub fn parse_structured(raw: &str) -> Result<ReportContent> {
    let mut last_err = None;
    for candidate in json_candidates(raw) {
        let mut value: Value = match serde_json::from_str(candidate) {
            Ok(v) => v,
            Err(e) => {
                last_err = Some(e.to_string());
                continue;
            }
        };
        if !value.is_object() {
            last_err = Some("top-level JSON value is not an object".to_string());
            continue;
        }
        normalize_enum_fields(&mut value);
        let mut content: ReportContent = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                last_err = Some(e.to_string());
                continue;
            }
        };
        if content.executive_summary.trim().is_empty() && content.sections.is_empty() {
            return Err(PiError::Validation {
                message: "structured output has neither summary nor sections".to_string(),
            });
        }
        renumber(&mut content.sections);
        return Ok(content);
    }
    Err(PiError::Serialization {
        format: "json".to_string(),
        message: last_err.unwrap_or_else(|| "empty output".to_string()),
    })
}

fn renumber(sections: &mut [ReportSection]) {
    if sections.iter().all(|s| s.order == 0) {
        for (i, s) in sections.iter_mut().enumerate() {
            s.order = i + 1;
        }
    }
}

/// 标题归类；顺序为风险、建议、结论、摘要
pub fn classify_heading(heading: &str) -> SectionKind {
    if RISK_HEADING.is_match(heading) {
        SectionKind::Risk
    } else if RECOMMENDATION_HEADING.is_match(heading) {
        SectionKind::Recommendation
    } else if CONCLUSION_HEADING.is_match(heading) {
        SectionKind::Conclusion
    } else if SUMMARY_HEADING.is_match(heading) {
        SectionKind::Summary
    } else {
        SectionKind::Other
    }
}

struct RawSection {
    level: usize,
    heading: String,
    body: String,
}

fn split_by_headings(text: &str) -> (String, Vec<RawSection>) {
    let mut preamble = String::new();
    let mut sections: Vec<RawSection> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let heading = if in_fence { None } else { HEADING.captures(line) };
        match heading {
            Some(caps) => sections.push(RawSection {
                level: caps[1].len(),
                heading: caps[2].trim().trim_matches('*').trim().to_string(),
                body: String::new(),
            }),
            None => {
                let target = match sections.last_mut() {
                    Some(s) => &mut s.body,
                    None => &mut preamble,
                };
                target.push_str(line);
                target.push('\n');
            }
        }
    }
    for s in &mut sections {
        s.body = s.body.trim().to_string();
    }
    (preamble.trim().to_string(), sections)
}

/// 叙述格式：按 Markdown 标题切分并归类
pub fn parse_narrative(raw: &str) -> Result<ReportContent> {
    let text = strip_code_fences(raw);
    if text.is_empty() {
        return Err(PiError::Validation {
            message: "model output is empty".to_string(),
        });
    }

    let (mut preamble, mut raw_sections) = split_by_headings(text);
    if raw_sections.is_empty() {
        return Err(PiError::Validation {
            message: "narrative output has no headings".to_string(),
        });
    }

    let mut content = ReportContent::default();
    // 首个一级标题作为报告标题，其正文并入前言
    if raw_sections[0].level == 1 {
        let first = raw_sections.remove(0);
        content.title = first.heading;
        if preamble.is_empty() {
            preamble = first.body;
        }
    }

    // 当前顶层章节的标题级别，更深的标题挂为子章节
    let mut parent_level: Option<usize> = None;
    for section in raw_sections {
        let kind = classify_heading(&section.heading);
        match kind {
            SectionKind::Summary if content.executive_summary.is_empty() => {
                content.executive_summary = section.body;
                parent_level = None;
            }
            SectionKind::Conclusion => {
                content.conclusions.extend(parse_conclusions(&section.body));
                parent_level = None;
            }
            SectionKind::Recommendation => {
                content.recommendations.extend(
                    list_items(&section.body)
                        .iter()
                        .map(|item| parse_recommendation_item(item.as_str())),
                );
                parent_level = None;
            }
            SectionKind::Risk if content.risk_assessment.is_none() => {
                content.risk_assessment = Some(parse_risk_assessment(&section.body));
                parent_level = None;
            }
            _ => {
                let (body, tables) = extract_tables(&section.body);
                let is_child = matches!(parent_level, Some(level) if section.level > level);
                if is_child {
                    if let Some(parent) = content.sections.last_mut() {
                        let order = parent.subsections.len() + 1;
                        let mut sub = ReportSection::new(section.heading, body, order);
                        sub.tables = tables;
                        parent.subsections.push(sub);
                        continue;
                    }
                }
                let order = content.sections.len() + 1;
                let mut top = ReportSection::new(section.heading, body, order);
                top.tables = tables;
                content.sections.push(top);
                parent_level = Some(section.level);
            }
        }
    }

    // 前言首段可充当摘要，其余前言正文单独成章，不丢弃
    let mut leading = preamble.as_str();
    if content.executive_summary.is_empty() {
        content.executive_summary = if preamble.is_empty() {
            content
                .sections
                .first()
                .map(|s| first_paragraph(&s.content))
                .unwrap_or_default()
        } else {
            leading = preamble
                .split_once("\n\n")
                .map(|(_, rest)| rest.trim())
                .unwrap_or("");
            first_paragraph(&preamble)
        };
    }
    if !leading.is_empty() {
        let (body, tables) = extract_tables(leading);
        let mut intro = ReportSection::new(PREAMBLE_SECTION_TITLE, body, 1);
        intro.tables = tables;
        content.sections.insert(0, intro);
        for (i, section) in content.sections.iter_mut().enumerate() {
            section.order = i + 1;
        }
    }

    if content.executive_summary.is_empty()
        && content.sections.is_empty()
        && content.conclusions.is_empty()
    {
        return Err(PiError::Validation {
            message: "narrative output has no usable content".to_string(),
        });
    }
    Ok(content)
}

/// 要点格式：首条为摘要，其余依次成为要点章节
pub fn parse_bullets(raw: &str) -> Result<ReportContent> {
    let text = strip_code_fences(raw);
    let mut title = String::new();
    let mut items: Vec<String> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(m) = LIST_MARKER.find(line) {
            items.push(line[m.end()..].trim().to_string());
        } else if let Some(caps) = HEADING.captures(line) {
            if title.is_empty() && items.is_empty() {
                title = caps[2].trim().to_string();
            }
        } else if let Some(last) = items.last_mut() {
            // 续行
            last.push(' ');
            last.push_str(line.trim());
        } else if title.is_empty() {
            title = line.trim().to_string();
        }
    }

    if items.is_empty() {
        return Err(PiError::Validation {
            message: "bullet output has no list items".to_string(),
        });
    }

    let mut content = ReportContent {
        title,
        executive_summary: items.remove(0),
        ..Default::default()
    };
    for (i, item) in items.into_iter().enumerate() {
        if RECOMMENDATION_HEADING.is_match(item.split([':', '：']).next().unwrap_or("")) {
            content.recommendations.push(parse_recommendation_item(&item));
        }
        content
            .sections
            .push(ReportSection::new(format!("Point {}", i + 1), item, i + 1));
    }
    Ok(content)
}

/// 退化报告：整段原文作为唯一章节
pub fn fallback_content(raw: &str) -> ReportContent {
    let text = raw.trim();
    let mut summary = first_paragraph(text);
    if summary.chars().count() > SUMMARY_FALLBACK_CHARS {
        summary = summary.chars().take(SUMMARY_FALLBACK_CHARS).collect();
    }
    ReportContent {
        executive_summary: summary,
        sections: vec![ReportSection::new(FALLBACK_SECTION_TITLE, text, 1)],
        ..Default::default()
    }
}

fn first_paragraph(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("")
        .to_string()
}

fn clean_item(item: &str) -> String {
    item.replace("**", "").trim().to_string()
}

/// 列表项；没有列表标记时按段落切分
fn list_items(body: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    let mut saw_marker = false;
    for line in body.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(m) = LIST_MARKER.find(line) {
            saw_marker = true;
            items.push(line[m.end()..].trim().to_string());
        } else if saw_marker {
            if let Some(last) = items.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
            }
        }
    }
    if saw_marker {
        return items;
    }
    body.split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_conclusions(body: &str) -> Vec<Conclusion> {
    list_items(body)
        .into_iter()
        .map(|item| Conclusion {
            confidence: parse_confidence(&item),
            supporting_evidence: extract_citations(&item)
                .into_iter()
                .map(|c| c.source)
                .collect(),
            statement: clean_item(&item),
        })
        .collect()
}

fn parse_confidence(text: &str) -> Option<f32> {
    let caps = CONFIDENCE.captures(text)?;
    if let Some(num) = caps.get(1) {
        let value: f32 = num.as_str().parse().ok()?;
        let value = if caps.get(2).is_some() || value > 1.0 {
            value / 100.0
        } else {
            value
        };
        return Some(value.clamp(0.0, 1.0));
    }
    match caps.get(3)?.as_str().to_lowercase().as_str() {
        "high" | "高" => Some(0.85),
        "medium" | "中" => Some(0.6),
        _ => Some(0.3),
    }
}

fn parse_priority(text: &str) -> Option<Priority> {
    let caps = PRIORITY_MARK.captures(text)?;
    let word = (1..=4).find_map(|i| caps.get(i))?.as_str().to_lowercase();
    match word.as_str() {
        "critical" | "紧急" => Some(Priority::Critical),
        "high" | "高" => Some(Priority::High),
        "medium" | "中" => Some(Priority::Medium),
        "low" | "低" => Some(Priority::Low),
        _ => None,
    }
}

fn split_field(part: &str) -> Option<(String, String)> {
    let pos = part.find([':', '：'])?;
    let key = part[..pos].trim().trim_matches('*').trim();
    if key.is_empty() || key.chars().count() > 16 {
        return None;
    }
    let sep_len = part[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
    Some((key.to_lowercase(), part[pos + sep_len..].trim().to_string()))
}

/// 解析一条建议，识别行动、优先级、理由与时间线
pub fn parse_recommendation_item(item: &str) -> Recommendation {
    let mut rec = Recommendation::default();

    for part in item.split([';', '；', '|']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = split_field(part) {
            match key.as_str() {
                "priority" | "优先级" => {
                    rec.priority = parse_priority(&format!("priority: {}", value))
                        .or_else(|| parse_priority(&format!("{}优先级", value)));
                    continue;
                }
                "rationale" | "reason" | "why" | "理由" | "原因" => {
                    rec.rationale = clean_item(&value);
                    continue;
                }
                "timeline" | "timeframe" | "when" | "时间" | "时限" => {
                    rec.timeline = clean_item(&value);
                    continue;
                }
                "action" | "recommendation" | "行动" | "措施" | "建议" => {
                    rec.action = clean_item(&value);
                    continue;
                }
                _ => {}
            }
        }
        let lower = part.to_lowercase();
        if rec.rationale.is_empty()
            && (lower.starts_with("because") || lower.starts_with("since") || part.starts_with("因为"))
        {
            rec.rationale = clean_item(part);
        } else if rec.action.is_empty() {
            rec.action = clean_item(part);
        } else {
            rec.action = format!("{}; {}", rec.action, clean_item(part));
        }
    }

    if rec.priority.is_none() {
        rec.priority = parse_priority(item);
    }
    if rec.timeline.is_empty() {
        if let Some(m) = TIMELINE_MARK.find(item) {
            rec.timeline = m.as_str().to_string();
        }
    }
    if rec.action.is_empty() {
        rec.action = clean_item(item);
    }
    rec
}

fn risk_word(word: &str) -> Option<RiskLevel> {
    match word.to_lowercase().as_str() {
        "critical" | "极高" => Some(RiskLevel::Critical),
        "high" | "高" => Some(RiskLevel::High),
        "medium" | "moderate" | "中" | "中等" => Some(RiskLevel::Medium),
        "low" | "低" => Some(RiskLevel::Low),
        _ => None,
    }
}

/// 从文本中识别风险等级，优先取紧邻 "risk"/"风险" 的等级词
pub fn parse_risk_level(text: &str) -> Option<RiskLevel> {
    if let Some(caps) = RISK_NEAR.captures(text) {
        if let Some(m) = (1..=4).find_map(|i| caps.get(i)) {
            return risk_word(m.as_str());
        }
    }
    RISK_WORD
        .captures(text)
        .and_then(|caps| risk_word(&caps[1]))
}

fn parse_risk_assessment(body: &str) -> RiskAssessment {
    let mut risk = RiskAssessment {
        overall_risk: parse_risk_level(body),
        ..Default::default()
    };

    let has_list = body.lines().any(|l| LIST_MARKER.is_match(l));
    if !has_list {
        risk.summary = body.trim().to_string();
        return risk;
    }

    let mut in_mitigation = false;
    let mut summary_lines: Vec<&str> = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match LIST_MARKER.find(line) {
            Some(m) => {
                let item = clean_item(&line[m.end()..]);
                let lower = item.to_lowercase();
                if in_mitigation || lower.starts_with("mitigat") || item.starts_with("缓解") {
                    risk.mitigation_strategies.push(item);
                } else {
                    risk.risk_factors.push(RiskFactor {
                        severity: parse_risk_level(&item),
                        description: item,
                    });
                }
            }
            None => {
                let lower = trimmed.to_lowercase();
                if lower.contains("mitigation") || trimmed.contains("缓解") || trimmed.contains("应对") {
                    in_mitigation = true;
                } else if risk.risk_factors.is_empty() && risk.mitigation_strategies.is_empty() {
                    summary_lines.push(trimmed);
                }
            }
        }
    }
    risk.summary = summary_lines.join(" ");
    risk
}

fn table_cells(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

fn is_separator_row(line: &str) -> bool {
    let cells = table_cells(line);
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')))
}

/// 抽出 Markdown 管道表格，返回去掉表格后的正文
fn extract_tables(body: &str) -> (String, Vec<ReportTable>) {
    let lines: Vec<&str> = body.lines().collect();
    let mut kept: Vec<&str> = Vec::new();
    let mut tables = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let is_table_start = lines[i].trim_start().starts_with('|')
            && i + 1 < lines.len()
            && is_separator_row(lines[i + 1]);
        if !is_table_start {
            kept.push(lines[i]);
            i += 1;
            continue;
        }

        // 紧挨表格上方的加粗行作为表题
        let title = match kept.last().copied() {
            Some(prev) if prev.trim().starts_with("**") && prev.trim().ends_with("**") => {
                let t = prev.trim().trim_matches('*').trim().to_string();
                kept.pop();
                t
            }
            _ => String::new(),
        };
        let headers = table_cells(lines[i]);
        i += 2;
        let mut rows = Vec::new();
        while i < lines.len() && lines[i].trim_start().starts_with('|') {
            rows.push(table_cells(lines[i]));
            i += 1;
        }
        tables.push(ReportTable {
            title,
            headers,
            rows,
        });
    }
    (kept.join("\n").trim().to_string(), tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NARRATIVE: &str = "# FTO Report

Preliminary note on scope.

## Executive Summary
The compound faces moderate exposure from US10000001B2.

## Claim Analysis
Claim 1 covers the scaffold.

### Claim 1 Elements
Element mapping follows.

| Element | Present |
| --- | --- |
| Core | Yes |

## Conclusions
- Claim 1 likely reads on the product (confidence: 80%). See US10000001B2.
- Claim 5 is probably invalid.

## Recommendations
- Commission a design-around study; Priority: High; Rationale: reduces exposure; Timeline: within 3 months
- Monitor CN112345678A prosecution

## Risk Assessment
Overall risk level: High.
- Literal infringement of claim 1 (high risk)
Mitigation:
- Design around the linker
";

    #[test]
    fn test_narrative_sections_are_classified() {
        let content = parse_llm_output(NARRATIVE, OutputFormat::Narrative);
        assert_eq!(content.title, "FTO Report");
        assert_eq!(
            content.executive_summary,
            "The compound faces moderate exposure from US10000001B2."
        );

        let titles: Vec<&str> = content.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec![PREAMBLE_SECTION_TITLE, "Claim Analysis"]);
        assert_eq!(content.sections[0].content, "Preliminary note on scope.");
        assert_eq!(content.sections[1].order, 2);
        let sub = &content.sections[1].subsections[0];
        assert_eq!(sub.title, "Claim 1 Elements");
        assert_eq!(sub.tables.len(), 1);
        assert_eq!(sub.tables[0].headers, vec!["Element", "Present"]);
        assert_eq!(sub.tables[0].rows, vec![vec!["Core", "Yes"]]);

        assert_eq!(content.conclusions.len(), 2);
        assert_eq!(content.conclusions[0].confidence, Some(0.8));
        assert_eq!(content.conclusions[0].supporting_evidence, vec!["US10000001B2"]);

        assert_eq!(content.recommendations.len(), 2);
        let rec = &content.recommendations[0];
        assert_eq!(rec.action, "Commission a design-around study");
        assert_eq!(rec.priority, Some(Priority::High));
        assert_eq!(rec.rationale, "reduces exposure");
        assert_eq!(rec.timeline, "within 3 months");

        let risk = content.risk_assessment.as_ref().unwrap();
        assert_eq!(risk.overall_risk, Some(RiskLevel::High));
        assert_eq!(risk.risk_factors.len(), 1);
        assert_eq!(risk.risk_factors[0].severity, Some(RiskLevel::High));
        assert_eq!(risk.mitigation_strategies, vec!["Design around the linker"]);

        let sources: Vec<&str> = content.citations.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["US10000001B2", "CN112345678A"]);
        assert_eq!(content.raw_output, NARRATIVE);
    }

    #[test]
    fn test_narrative_keeps_body_without_subheadings() {
        let raw = "# FTO Report\n\nOverview paragraph.\n\nDetailed analysis of claim 1.\n\nFurther discussion of claim 5.";
        let content = parse_llm_output(raw, OutputFormat::Narrative);
        assert_eq!(content.title, "FTO Report");
        assert_eq!(content.executive_summary, "Overview paragraph.");
        assert_eq!(content.sections.len(), 1);
        assert_eq!(content.sections[0].title, PREAMBLE_SECTION_TITLE);
        assert_eq!(content.sections[0].order, 1);
        assert!(content.sections[0].content.contains("Detailed analysis of claim 1."));
        assert!(content.sections[0].content.contains("Further discussion of claim 5."));
    }

    #[test]
    fn test_narrative_single_paragraph_preamble_adds_no_section() {
        let raw = "Short answer.\n\n## Analysis\nClaim 1 is narrow.";
        let content = parse_llm_output(raw, OutputFormat::Narrative);
        assert_eq!(content.executive_summary, "Short answer.");
        let titles: Vec<&str> = content.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Analysis"]);
    }

    #[test]
    fn test_chinese_headings() {
        let raw = "## 摘要\n存在一定风险。\n\n## 技术分析\n权利要求1覆盖该化合物。\n\n## 建议\n1. 开展规避设计，高优先级，6个月内完成\n";
        let content = parse_llm_output(raw, OutputFormat::Narrative);
        assert_eq!(content.executive_summary, "存在一定风险。");
        assert_eq!(content.sections[0].title, "技术分析");
        assert_eq!(content.recommendations[0].priority, Some(Priority::High));
        assert_eq!(content.recommendations[0].timeline, "6个月内");
    }

    #[test]
    fn test_structured_json_in_fence() {
        let raw = "```json\n{\"title\":\"T\",\"executive_summary\":\"S\",\"sections\":[{\"title\":\"A\",\"content\":\"x\"}],\"recommendations\":[{\"action\":\"Do\",\"priority\":\"High\"}],\"risk_assessment\":{\"overall_risk\":\"Moderate\"}}\n```";
        let outcome = parse_llm_output_with_status(raw, OutputFormat::Structured);
        assert!(outcome.degraded.is_none());
        let content = outcome.content;
        assert_eq!(content.title, "T");
        assert_eq!(content.sections[0].order, 1);
        assert_eq!(content.recommendations[0].priority, Some(Priority::High));
        assert_eq!(
            content.risk_assessment.unwrap().overall_risk,
            Some(RiskLevel::Medium)
        );
    }

    #[test]
    fn test_structured_non_json_degrades() {
        let raw = "The model ignored the format.\n\nSecond paragraph.";
        let outcome = parse_llm_output_with_status(raw, OutputFormat::Structured);
        assert!(outcome.degraded.is_some());
        let content = outcome.content;
        assert_eq!(content.sections.len(), 1);
        assert_eq!(content.sections[0].title, FALLBACK_SECTION_TITLE);
        assert_eq!(content.sections[0].content, raw);
        assert_eq!(content.executive_summary, "The model ignored the format.");
    }

    #[test]
    fn test_fallback_summary_is_capped() {
        let raw = "x".repeat(800);
        let content = parse_llm_output(&raw, OutputFormat::Narrative);
        assert_eq!(content.executive_summary.chars().count(), 500);
        assert_eq!(content.sections[0].title, FALLBACK_SECTION_TITLE);
    }

    #[test]
    fn test_bullets() {
        let raw = "Key findings\n- Overall exposure is limited\n- Claim 1 is narrow\n  and expires in 2027\n- Recommendation: file an opposition; priority: medium\n";
        let content = parse_llm_output(raw, OutputFormat::BulletPoints);
        assert_eq!(content.title, "Key findings");
        assert_eq!(content.executive_summary, "Overall exposure is limited");
        assert_eq!(content.sections.len(), 2);
        assert_eq!(content.sections[0].content, "Claim 1 is narrow and expires in 2027");
        assert_eq!(content.sections[1].order, 2);
        assert_eq!(content.recommendations.len(), 1);
        assert_eq!(content.recommendations[0].action, "file an opposition");
        assert_eq!(content.recommendations[0].priority, Some(Priority::Medium));
    }

    #[test]
    fn test_empty_output_degrades() {
        let content = parse_llm_output("", OutputFormat::BulletPoints);
        assert_eq!(content.sections.len(), 1);
        assert!(content.executive_summary.is_empty());
    }

    #[test]
    fn test_classify_heading() {
        assert_eq!(classify_heading("Executive Summary"), SectionKind::Summary);
        assert_eq!(classify_heading("Conclusions"), SectionKind::Conclusion);
        assert_eq!(classify_heading("Next Steps"), SectionKind::Recommendation);
        assert_eq!(classify_heading("Risk Summary"), SectionKind::Risk);
        assert_eq!(classify_heading("风险评估"), SectionKind::Risk);
        assert_eq!(classify_heading("Claim Construction"), SectionKind::Other);
    }

    #[test]
    fn test_parse_risk_level() {
        assert_eq!(parse_risk_level("Overall risk: LOW"), Some(RiskLevel::Low));
        assert_eq!(parse_risk_level("a moderate-risk profile"), Some(RiskLevel::Medium));
        assert_eq!(parse_risk_level("整体为高风险"), Some(RiskLevel::High));
        assert_eq!(parse_risk_level("nothing here"), None);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  plain  "), "plain");
    }
}
