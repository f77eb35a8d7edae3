//! 提示词组装
//!
//! 预算 = `max_context_tokens - system - query - instruction_reserve`（下限 0）。
//! 上下文各段超出预算时按优先级从低到高截断：RAG、先前技术、专利、
//! 权利要求、分子。用户查询从不截断。

use crate::system_prompts::{self, template_name};
use crate::templates::TemplateRegistry;
use pi_core::config::PromptSettings;
use pi_core::tokens::{estimate_tokens, truncate_to_tokens};
use pi_core::{
    AnalysisTask, ChatMessage, ClaimContext, DetailLevel, MoleculeContext, OutputFormat,
    PatentContext, PriorArtContext,
};
use pi_error::{PiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, instrument};

/// 单次组装所需的全部上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptParams {
    pub molecule: Option<MoleculeContext>,
    pub patents: Vec<PatentContext>,
    pub claims: Vec<ClaimContext>,
    pub prior_art: Vec<PriorArtContext>,
    /// 已按预算拼好的检索上下文
    pub rag_context: Option<String>,
    pub query: String,
    pub output_format: OutputFormat,
    pub language: Option<String>,
    pub detail_level: DetailLevel,
    pub jurisdictions: Vec<String>,
    /// 使用已注册的自定义系统模板代替内置模板
    pub custom_system_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub estimated_tokens: usize,
    pub truncation_applied: bool,
    pub template_version: String,
}

/// 上下文段，按展示顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Molecule,
    Patents,
    Claims,
    PriorArt,
    Rag,
}

impl SectionKind {
    const DISPLAY_ORDER: [SectionKind; 5] = [
        SectionKind::Molecule,
        SectionKind::Patents,
        SectionKind::Claims,
        SectionKind::PriorArt,
        SectionKind::Rag,
    ];

    /// 截断顺序：优先级从低到高
    const TRUNCATION_ORDER: [SectionKind; 5] = [
        SectionKind::Rag,
        SectionKind::PriorArt,
        SectionKind::Patents,
        SectionKind::Claims,
        SectionKind::Molecule,
    ];

    fn label(&self) -> &'static str {
        match self {
            SectionKind::Molecule => "Molecule Context",
            SectionKind::Patents => "Patent Context",
            SectionKind::Claims => "Claims Under Analysis",
            SectionKind::PriorArt => "Prior Art",
            SectionKind::Rag => "Retrieved References",
        }
    }
}

#[derive(Debug)]
struct Section {
    kind: SectionKind,
    text: String,
    tokens: usize,
}

impl Section {
    fn new(kind: SectionKind, text: String) -> Self {
        let tokens = estimate_tokens(&text);
        Self { kind, text, tokens }
    }
}

pub struct PromptManager {
    registry: Arc<TemplateRegistry>,
    settings: PromptSettings,
}

impl PromptManager {
    pub fn new(registry: Arc<TemplateRegistry>, settings: PromptSettings) -> Self {
        Self { registry, settings }
    }

    /// 使用内置模板与默认预算
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(
            Arc::new(TemplateRegistry::with_builtins()?),
            PromptSettings::default(),
        ))
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &PromptSettings {
        &self.settings
    }

    #[instrument(skip(self, params), fields(task = %task))]
    pub fn build_prompt(&self, task: AnalysisTask, params: &PromptParams) -> Result<BuiltPrompt> {
        let system_prompt = self.render_system_prompt(task, params)?;

        let system_tokens = estimate_tokens(&system_prompt);
        let query_tokens = estimate_tokens(&params.query);
        let budget = self
            .settings
            .max_context_tokens
            .saturating_sub(system_tokens)
            .saturating_sub(query_tokens)
            .saturating_sub(self.settings.instruction_reserve);

        let mut sections = build_sections(params);
        let truncation_applied = fit_sections(&mut sections, budget);
        if truncation_applied {
            debug!(budget, "Context sections truncated to fit budget");
        }

        let instructions = build_instructions(task, params);
        let mut user_prompt = String::new();
        for section in sections.iter().filter(|s| !s.text.trim().is_empty()) {
            let _ = write!(user_prompt, "## {}\n{}\n\n", section.kind.label(), section.text);
        }
        let _ = write!(
            user_prompt,
            "## Instructions\n{}\n\n## User Query\n{}",
            instructions, params.query
        );

        let estimated_tokens = estimate_tokens(&system_prompt) + estimate_tokens(&user_prompt);
        let messages = vec![
            ChatMessage::system(system_prompt.clone()),
            ChatMessage::user(user_prompt.clone()),
        ];

        Ok(BuiltPrompt {
            system_prompt,
            user_prompt,
            messages,
            estimated_tokens,
            truncation_applied,
            template_version: self.settings.template_version.clone(),
        })
    }

    fn render_system_prompt(&self, task: AnalysisTask, params: &PromptParams) -> Result<String> {
        let name = params
            .custom_system_template
            .clone()
            .unwrap_or_else(|| template_name(task));
        if !self.registry.has_template(&name) {
            return Err(PiError::NotFound {
                resource: format!("system template {}", name),
            });
        }

        let data = json!({
            "task": task.as_str(),
            "task_name": task.display_name(),
            "jurisdictions": params.jurisdictions,
            "detail_level": params.detail_level,
            "language": params.language,
            "output_format": params.output_format,
        });
        self.registry.render_template(&name, &data)
    }
}

fn build_sections(params: &PromptParams) -> Vec<Section> {
    SectionKind::DISPLAY_ORDER
        .iter()
        .map(|kind| {
            let text = match kind {
                SectionKind::Molecule => params
                    .molecule
                    .as_ref()
                    .map(format_molecule)
                    .unwrap_or_default(),
                SectionKind::Patents => format_list(&params.patents, format_patent),
                SectionKind::Claims => format_list(&params.claims, format_claim),
                SectionKind::PriorArt => format_list(&params.prior_art, format_prior_art),
                SectionKind::Rag => params.rag_context.clone().unwrap_or_default(),
            };
            Section::new(*kind, text.trim().to_string())
        })
        .collect()
}

/// 按优先级截断各段，返回是否发生了截断
fn fit_sections(sections: &mut [Section], budget: usize) -> bool {
    let total: usize = sections.iter().map(|s| s.tokens).sum();
    if total <= budget {
        return false;
    }

    let mut excess = total - budget;
    for kind in SectionKind::TRUNCATION_ORDER {
        if excess == 0 {
            break;
        }
        let Some(section) = sections.iter_mut().find(|s| s.kind == kind) else {
            continue;
        };
        if section.tokens == 0 {
            continue;
        }

        if section.tokens <= excess {
            excess -= section.tokens;
            section.text.clear();
            section.tokens = 0;
        } else {
            let allowed = section.tokens - excess;
            let truncated = truncate_to_tokens(&section.text, allowed);
            let new_tokens = estimate_tokens(&truncated);
            excess = excess.saturating_sub(section.tokens - new_tokens);
            section.text = truncated;
            section.tokens = new_tokens;
        }
    }
    true
}

fn format_list<T>(items: &[T], f: fn(&T) -> String) -> String {
    items.iter().map(f).collect::<Vec<_>>().join("\n")
}

fn format_molecule(m: &MoleculeContext) -> String {
    let mut out = format!("Name: {}", m.name);
    if let Some(smiles) = &m.smiles {
        let _ = write!(out, "\nSMILES: {}", smiles);
    }
    if let Some(key) = &m.inchi_key {
        let _ = write!(out, "\nInChIKey: {}", key);
    }
    if let Some(mw) = m.molecular_weight {
        let _ = write!(out, "\nMolecular weight: {:.2}", mw);
    }
    if !m.targets.is_empty() {
        let _ = write!(out, "\nTargets: {}", m.targets.join(", "));
    }
    for (k, v) in &m.properties {
        let _ = write!(out, "\n{}: {}", k, v);
    }
    out
}

fn format_patent(p: &PatentContext) -> String {
    let mut out = format!("- {}: {}", p.patent_number, p.title);
    let fields = [
        ("Assignee", &p.assignee),
        ("Jurisdiction", &p.jurisdiction),
        ("Filing date", &p.filing_date),
        ("Expiry date", &p.expiry_date),
        ("Legal status", &p.legal_status),
    ];
    for (label, value) in fields {
        if let Some(v) = value {
            let _ = write!(out, "\n  {}: {}", label, v);
        }
    }
    if let Some(abs) = &p.abstract_text {
        let _ = write!(out, "\n  Abstract: {}", abs);
    }
    out
}

fn format_claim(c: &ClaimContext) -> String {
    let kind = if c.is_independent {
        "independent"
    } else {
        "dependent"
    };
    let mut out = format!(
        "Claim {} of {} ({}):\n{}",
        c.claim_number, c.patent_number, kind, c.text
    );
    if !c.elements.is_empty() {
        out.push_str("\nElements:");
        for (i, e) in c.elements.iter().enumerate() {
            let _ = write!(out, "\n  {}. {}", i + 1, e);
        }
    }
    out
}

fn format_prior_art(p: &PriorArtContext) -> String {
    let mut out = format!("- {}: {}", p.reference, p.title);
    if let Some(date) = &p.publication_date {
        let _ = write!(out, " ({})", date);
    }
    if let Some(rel) = p.relevance {
        let _ = write!(out, " [relevance {:.2}]", rel);
    }
    if !p.summary.is_empty() {
        let _ = write!(out, "\n  {}", p.summary);
    }
    out
}

fn format_instruction(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Structured => {
            "Respond with a single JSON object with the fields title, executive_summary, \
sections (title, content, order), conclusions (statement, confidence, supporting_evidence), \
recommendations (action, priority, rationale, timeline) and risk_assessment \
(overall_risk, summary, risk_factors, mitigation_strategies). Do not add prose outside the JSON."
        }
        OutputFormat::Narrative => {
            "Write a narrative report using Markdown headings: Executive Summary, one heading per \
analysis topic, Risk Assessment, Conclusions and Recommendations."
        }
        OutputFormat::BulletPoints => {
            "Respond as a bullet list. The first bullet is a one-sentence summary; each \
following bullet is one finding or recommendation."
        }
    }
}

fn language_instruction(language: Option<&str>) -> Option<String> {
    let lang = language?.trim().to_ascii_lowercase();
    match lang.as_str() {
        "" | "en" | "en-us" | "en-gb" | "english" => None,
        l if l.starts_with("zh") || l == "chinese" => {
            Some("请用中文回答。Patent numbers and legal citations stay in their original form.".to_string())
        }
        "ja" | "japanese" => Some("日本語で回答してください。".to_string()),
        other => Some(format!("Respond in the language with code \"{}\".", other)),
    }
}

fn detail_instruction(level: DetailLevel) -> &'static str {
    match level {
        DetailLevel::Brief => "Keep the analysis brief: focus on the key findings in a few paragraphs.",
        DetailLevel::Standard => "Provide a balanced level of detail suitable for a business reader.",
        DetailLevel::Detailed => {
            "Provide a detailed analysis covering every relevant claim and reference."
        }
        DetailLevel::Expert => {
            "Provide an expert-level analysis for patent practitioners, including claim construction \
and citations to the governing law."
        }
    }
}

fn jurisdiction_note(code: &str) -> Option<&'static str> {
    match code.trim().to_ascii_uppercase().as_str() {
        "US" => Some(
            "US: apply 35 U.S.C. §§ 101, 102, 103 and 112 and the MPEP; consider the doctrine of \
equivalents and prosecution history estoppel.",
        ),
        "CN" => Some(
            "CN: apply the Chinese Patent Law (Articles 22 and 26 and Article 64 on scope of \
protection) and the CNIPA Guidelines for Patent Examination.",
        ),
        "EP" => Some(
            "EP: apply the European Patent Convention (Articles 54, 56 and 69 with its Protocol) \
and the problem-solution approach.",
        ),
        "JP" => Some("JP: apply the Japanese Patent Act (Articles 29 and 70) and JPO examination guidelines."),
        "WO" => Some("WO: consider PCT national-phase entry deadlines and the international search report."),
        _ => None,
    }
}

fn build_instructions(task: AnalysisTask, params: &PromptParams) -> String {
    let mut parts: Vec<String> = vec![
        system_prompts::task_instruction(task).to_string(),
        format_instruction(params.output_format).to_string(),
    ];
    if let Some(lang) = language_instruction(params.language.as_deref()) {
        parts.push(lang);
    }
    parts.push(detail_instruction(params.detail_level).to_string());

    let notes: Vec<String> = params
        .jurisdictions
        .iter()
        .map(|code| match jurisdiction_note(code) {
            Some(note) => note.to_string(),
            None => format!("{}: apply the applicable national patent law.", code.trim()),
        })
        .collect();
    if !notes.is_empty() {
        parts.push(notes.join("\n"));
    }
    if params.jurisdictions.len() >= 2 {
        parts.push(format!(
            "Provide a comparative analysis across {}, highlighting where the outcome differs \
between jurisdictions.",
            params.jurisdictions.join(", ")
        ));
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_context_tokens: usize) -> PromptManager {
        PromptManager::new(
            Arc::new(TemplateRegistry::with_builtins().unwrap()),
            PromptSettings {
                max_context_tokens,
                ..Default::default()
            },
        )
    }

    fn params(query: &str) -> PromptParams {
        PromptParams {
            query: query.to_string(),
            ..Default::default()
        }
    }

    fn molecule() -> MoleculeContext {
        MoleculeContext {
            name: "Imatinib".to_string(),
            smiles: Some("CC1=C(C=C(C=C1)NC(=O)C2=CC=C(C=C2)CN3CCN(CC3)C)NC4=NC=CC(=N4)C5=CN=CC=C5".to_string()),
            targets: vec!["BCR-ABL".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_basic_layout() {
        let mut p = params("Can we launch in 2026?");
        p.molecule = Some(molecule());
        p.patents = vec![PatentContext {
            patent_number: "US10000001B2".to_string(),
            title: "Kinase inhibitors".to_string(),
            ..Default::default()
        }];
        let built = manager(8000)
            .build_prompt(AnalysisTask::FreedomToOperate, &p)
            .unwrap();

        assert!(!built.truncation_applied);
        assert!(built.system_prompt.contains("Freedom-to-Operate Analysis"));
        let mol = built.user_prompt.find("## Molecule Context\n").unwrap();
        let pat = built.user_prompt.find("## Patent Context\n").unwrap();
        let ins = built.user_prompt.find("## Instructions\n").unwrap();
        let q = built.user_prompt.find("## User Query\nCan we launch in 2026?").unwrap();
        assert!(mol < pat && pat < ins && ins < q);
        assert!(!built.user_prompt.contains("## Prior Art"));
        assert_eq!(built.messages.len(), 2);
        assert_eq!(built.messages[0].role, "system");
        assert_eq!(built.messages[1].content, built.user_prompt);
        assert_eq!(
            built.estimated_tokens,
            estimate_tokens(&built.system_prompt) + estimate_tokens(&built.user_prompt)
        );
        assert_eq!(built.template_version, "v1");
    }

    #[test]
    fn test_rag_heavy_context_is_truncated_first() {
        let query = "Assess FTO for compound X in the US market.";
        let mut p = params(query);
        p.molecule = Some(molecule());
        p.rag_context = Some("[Patent US1]\nRetrieved evidence sentence. ".repeat(500));
        let built = manager(1500)
            .build_prompt(AnalysisTask::FreedomToOperate, &p)
            .unwrap();

        assert!(built.truncation_applied);
        assert!(built.user_prompt.contains(query));
        assert!(built.user_prompt.contains("## Molecule Context\nName: Imatinib"));
        assert!(built.user_prompt.contains("Imatinib"));
        assert!(built.user_prompt.contains("## Retrieved References"));
        assert!(estimate_tokens(&built.user_prompt) < estimate_tokens(p.rag_context.as_ref().unwrap()));
    }

    #[test]
    fn test_molecule_is_last_to_go() {
        let mut sections = vec![
            Section::new(SectionKind::Molecule, "m".repeat(40)),
            Section::new(SectionKind::Patents, "p".repeat(40)),
            Section::new(SectionKind::Claims, "c".repeat(40)),
            Section::new(SectionKind::PriorArt, "a".repeat(40)),
            Section::new(SectionKind::Rag, "r".repeat(40)),
        ];
        // 每段 10 token，预算 15：RAG、先前技术、专利清空，权利要求部分保留
        assert!(fit_sections(&mut sections, 15));
        let tokens: Vec<usize> = sections.iter().map(|s| s.tokens).collect();
        assert_eq!(tokens, vec![10, 0, 5, 0, 0]);

        // 预算为 0 时全部清空
        let mut sections = vec![Section::new(SectionKind::Molecule, "m".repeat(40))];
        assert!(fit_sections(&mut sections, 0));
        assert_eq!(sections[0].tokens, 0);
    }

    #[test]
    fn test_zero_budget_keeps_query() {
        let query = "什么是该化合物的专利风险？";
        let mut p = params(query);
        p.molecule = Some(molecule());
        p.prior_art = vec![PriorArtContext {
            reference: "WO2015123456A1".to_string(),
            title: "Related compounds".to_string(),
            summary: "Discloses analogues.".to_string(),
            ..Default::default()
        }];
        let built = manager(10)
            .build_prompt(AnalysisTask::InfringementRisk, &p)
            .unwrap();
        assert!(built.truncation_applied);
        assert!(built.user_prompt.ends_with(query));
        assert!(!built.user_prompt.contains("## Molecule Context"));
    }

    #[test]
    fn test_language_detail_and_jurisdictions() {
        let mut p = params("分析侵权风险");
        p.language = Some("zh".to_string());
        p.detail_level = DetailLevel::Expert;
        p.jurisdictions = vec!["US".to_string(), "CN".to_string()];
        let built = manager(8000)
            .build_prompt(AnalysisTask::FreedomToOperate, &p)
            .unwrap();

        assert!(built.user_prompt.contains("请用中文回答"));
        assert!(built.user_prompt.contains("expert-level"));
        assert!(built.user_prompt.contains("35 U.S.C."));
        assert!(built.user_prompt.contains("Chinese Patent Law"));
        assert!(built.user_prompt.contains("comparative analysis"));
        assert!(built.system_prompt.contains("Jurisdictions in scope: US, CN."));
    }

    #[test]
    fn test_single_jurisdiction_has_no_comparison() {
        let mut p = params("q");
        p.jurisdictions = vec!["EP".to_string()];
        let built = manager(8000)
            .build_prompt(AnalysisTask::Landscape, &p)
            .unwrap();
        assert!(built.user_prompt.contains("European Patent Convention"));
        assert!(!built.user_prompt.contains("comparative analysis"));
    }

    #[test]
    fn test_output_format_instructions() {
        let mut p = params("q");
        p.output_format = OutputFormat::Structured;
        let built = manager(8000)
            .build_prompt(AnalysisTask::Valuation, &p)
            .unwrap();
        assert!(built.user_prompt.contains("single JSON object"));
    }

    #[test]
    fn test_custom_system_template() {
        let m = manager(8000);
        m.registry()
            .register_template("custom/fto", "Custom analyst for {{task_name}}.")
            .unwrap();
        let mut p = params("q");
        p.custom_system_template = Some("custom/fto".to_string());
        let built = m.build_prompt(AnalysisTask::FreedomToOperate, &p).unwrap();
        assert_eq!(built.system_prompt, "Custom analyst for Freedom-to-Operate Analysis.");

        p.custom_system_template = Some("custom/missing".to_string());
        assert!(matches!(
            m.build_prompt(AnalysisTask::FreedomToOperate, &p),
            Err(PiError::NotFound { .. })
        ));
    }
}
