//! 报告质量评分
//!
//! 总分为结构、引用、篇幅、可执行性四项的加权和，问题列表记录扣分原因。

use pi_core::{
    Citation, IssueSeverity, Recommendation, ReportContent, ValidationIssue, ValidationResult,
    VerificationStatus,
};

pub const STRUCTURE_WEIGHT: f32 = 0.3;
pub const CITATION_WEIGHT: f32 = 0.3;
pub const LENGTH_WEIGHT: f32 = 0.2;
pub const ACTIONABILITY_WEIGHT: f32 = 0.2;

/// 低于该分数且存在问题时判定为不合格
pub const PASS_SCORE: f32 = 0.5;

/// 结构完整度：缺摘要扣 0.4，缺章节扣 0.3，缺结论扣 0.3
pub fn score_structure(content: &ReportContent, issues: &mut Vec<ValidationIssue>) -> f32 {
    let mut score: f32 = 1.0;
    if content.executive_summary.trim().is_empty() {
        score -= 0.4;
        issues.push(ValidationIssue::new(
            IssueSeverity::Warning,
            "structure",
            "missing executive summary",
        ));
    }
    if content.sections.is_empty() {
        score -= 0.3;
        issues.push(ValidationIssue::new(
            IssueSeverity::Error,
            "structure",
            "report has no sections",
        ));
    }
    if content.conclusions.is_empty() {
        score -= 0.3;
        issues.push(ValidationIssue::new(
            IssueSeverity::Warning,
            "structure",
            "report has no conclusions",
        ));
    }
    score.max(0.0)
}

/// 已核验引用占比；没有引用时记 0.5
pub fn citation_ratio(citations: &[Citation], issues: &mut Vec<ValidationIssue>) -> f32 {
    if citations.is_empty() {
        issues.push(ValidationIssue::new(
            IssueSeverity::Info,
            "citations",
            "report contains no citations",
        ));
        return 0.5;
    }
    let verified = citations
        .iter()
        .filter(|c| c.verification_status == VerificationStatus::Verified)
        .count();
    let not_found = citations
        .iter()
        .filter(|c| c.verification_status == VerificationStatus::NotFound)
        .count();
    if not_found > 0 {
        issues.push(ValidationIssue::new(
            IssueSeverity::Warning,
            "citations",
            format!("{} cited patent(s) could not be found", not_found),
        ));
    }
    verified as f32 / citations.len() as f32
}

/// 按正文字符数分档
pub fn score_length(chars: usize, issues: &mut Vec<ValidationIssue>) -> f32 {
    match chars {
        0..=199 => {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                "length",
                format!("report body is very short ({} characters)", chars),
            ));
            0.2
        }
        200..=499 => 0.4,
        500..=999 => 0.6,
        1000..=1999 => 0.8,
        _ => 1.0,
    }
}

fn recommendation_score(rec: &Recommendation) -> f32 {
    [
        !rec.action.trim().is_empty(),
        rec.priority.is_some(),
        !rec.rationale.trim().is_empty(),
        !rec.timeline.trim().is_empty(),
    ]
    .iter()
    .filter(|present| **present)
    .count() as f32
        * 0.25
}

/// 建议的完整度平均分：行动、优先级、理由、时间线各 0.25
pub fn score_actionability(
    recommendations: &[Recommendation],
    issues: &mut Vec<ValidationIssue>,
) -> f32 {
    if recommendations.is_empty() {
        issues.push(ValidationIssue::new(
            IssueSeverity::Info,
            "actionability",
            "report contains no recommendations",
        ));
        return 0.0;
    }
    recommendations.iter().map(recommendation_score).sum::<f32>() / recommendations.len() as f32
}

/// 综合评分
pub fn validate_content(content: &ReportContent) -> ValidationResult {
    let mut issues = Vec::new();
    let structural_score = score_structure(content, &mut issues);
    let citation_score = citation_ratio(&content.citations, &mut issues);
    let length_score = score_length(content.text_length(), &mut issues);
    let actionability_score = score_actionability(&content.recommendations, &mut issues);

    let score = structural_score * STRUCTURE_WEIGHT
        + citation_score * CITATION_WEIGHT
        + length_score * LENGTH_WEIGHT
        + actionability_score * ACTIONABILITY_WEIGHT;

    ValidationResult {
        is_valid: issues.is_empty() || score >= PASS_SCORE,
        score,
        structural_score,
        citation_score,
        length_score,
        actionability_score,
        issues,
    }
}

/// 追加流水线中产生的问题并重新判定是否合格
pub fn append_issues(result: &mut ValidationResult, extra: Vec<ValidationIssue>) {
    if extra.is_empty() {
        return;
    }
    result.issues.extend(extra);
    result.is_valid = result.score >= PASS_SCORE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_core::{Conclusion, Priority, ReportSection};

    fn full_content() -> ReportContent {
        ReportContent {
            executive_summary: "s".repeat(600),
            sections: vec![ReportSection::new("Analysis", "a".repeat(1500), 1)],
            conclusions: vec![Conclusion {
                statement: "Low exposure".to_string(),
                ..Default::default()
            }],
            recommendations: vec![Recommendation {
                action: "Monitor".to_string(),
                priority: Some(Priority::Low),
                rationale: "Cheap".to_string(),
                timeline: "Quarterly".to_string(),
            }],
            citations: vec![Citation {
                id: "[1]".to_string(),
                source: "US10000001B2".to_string(),
                verification_status: VerificationStatus::Verified,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_complete_report_scores_full() {
        let result = validate_content(&full_content());
        assert!(result.is_valid);
        assert!(result.issues.is_empty());
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_report() {
        let result = validate_content(&ReportContent::default());
        assert!((result.structural_score - 0.0).abs() < 1e-6);
        assert!((result.citation_score - 0.5).abs() < 1e-6);
        assert!((result.length_score - 0.2).abs() < 1e-6);
        assert_eq!(result.actionability_score, 0.0);
        // 0.15 + 0.04
        assert!((result.score - 0.19).abs() < 1e-6);
        assert!(!result.is_valid);
        assert!(result
            .issues
            .iter()
            .any(|i| i.category == "citations" && i.severity == IssueSeverity::Info));
    }

    #[test]
    fn test_length_steps() {
        let mut issues = Vec::new();
        assert_eq!(score_length(199, &mut issues), 0.2);
        assert_eq!(score_length(200, &mut issues), 0.4);
        assert_eq!(score_length(999, &mut issues), 0.6);
        assert_eq!(score_length(1000, &mut issues), 0.8);
        assert_eq!(score_length(2000, &mut issues), 1.0);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_actionability_averages_fields() {
        let recs = vec![
            Recommendation {
                action: "File".to_string(),
                priority: Some(Priority::High),
                ..Default::default()
            },
            Recommendation {
                action: "Wait".to_string(),
                ..Default::default()
            },
        ];
        let mut issues = Vec::new();
        assert!((score_actionability(&recs, &mut issues) - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_citation_ratio_flags_missing_patents() {
        let mut content = full_content();
        content.citations.push(Citation {
            id: "[2]".to_string(),
            source: "US9999999B1".to_string(),
            verification_status: VerificationStatus::NotFound,
            ..Default::default()
        });
        let result = validate_content(&content);
        assert!((result.citation_score - 0.5).abs() < 1e-6);
        assert_eq!(result.issues.len(), 1);
        // 分数仍然足够高
        assert!(result.is_valid);
    }

    #[test]
    fn test_append_issues_rechecks_validity() {
        let mut result = validate_content(&ReportContent::default());
        result.is_valid = true;
        append_issues(
            &mut result,
            vec![ValidationIssue::new(IssueSeverity::Warning, "retrieval", "failed")],
        );
        assert!(!result.is_valid);
    }
}
