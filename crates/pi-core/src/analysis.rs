use pi_error::PiError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// 分析任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTask {
    FreedomToOperate,
    InfringementRisk,
    Landscape,
    PortfolioStrategy,
    Valuation,
    ClaimDrafting,
    PriorArtSearch,
    OfficeActionResponse,
}

impl AnalysisTask {
    pub const ALL: [AnalysisTask; 8] = [
        AnalysisTask::FreedomToOperate,
        AnalysisTask::InfringementRisk,
        AnalysisTask::Landscape,
        AnalysisTask::PortfolioStrategy,
        AnalysisTask::Valuation,
        AnalysisTask::ClaimDrafting,
        AnalysisTask::PriorArtSearch,
        AnalysisTask::OfficeActionResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisTask::FreedomToOperate => "freedom_to_operate",
            AnalysisTask::InfringementRisk => "infringement_risk",
            AnalysisTask::Landscape => "landscape",
            AnalysisTask::PortfolioStrategy => "portfolio_strategy",
            AnalysisTask::Valuation => "valuation",
            AnalysisTask::ClaimDrafting => "claim_drafting",
            AnalysisTask::PriorArtSearch => "prior_art_search",
            AnalysisTask::OfficeActionResponse => "office_action_response",
        }
    }

    /// 报告标题使用的展示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            AnalysisTask::FreedomToOperate => "Freedom-to-Operate Analysis",
            AnalysisTask::InfringementRisk => "Infringement Risk Assessment",
            AnalysisTask::Landscape => "Patent Landscape Analysis",
            AnalysisTask::PortfolioStrategy => "Portfolio Strategy Review",
            AnalysisTask::Valuation => "Patent Valuation",
            AnalysisTask::ClaimDrafting => "Claim Drafting Proposal",
            AnalysisTask::PriorArtSearch => "Prior Art Search Report",
            AnalysisTask::OfficeActionResponse => "Office Action Response Strategy",
        }
    }
}

impl std::fmt::Display for AnalysisTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisTask {
    type Err = PiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let task = match normalized.as_str() {
            "fto" | "freedom_to_operate" => AnalysisTask::FreedomToOperate,
            "infringement" | "infringement_risk" => AnalysisTask::InfringementRisk,
            "landscape" => AnalysisTask::Landscape,
            "portfolio" | "portfolio_strategy" => AnalysisTask::PortfolioStrategy,
            "valuation" => AnalysisTask::Valuation,
            "claim_drafting" => AnalysisTask::ClaimDrafting,
            "prior_art" | "prior_art_search" => AnalysisTask::PriorArtSearch,
            "office_action" | "office_action_response" => AnalysisTask::OfficeActionResponse,
            _ => {
                return Err(PiError::InvalidRequest {
                    reason: format!("unknown analysis task: {}", s),
                })
            }
        };
        Ok(task)
    }
}

/// 模型输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Structured,
    #[default]
    Narrative,
    BulletPoints,
}

/// 分析详细程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    Brief,
    #[default]
    Standard,
    Detailed,
    Expert,
}

/// 目标分子信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoleculeContext {
    pub name: String,
    pub smiles: Option<String>,
    pub inchi_key: Option<String>,
    pub molecular_weight: Option<f64>,
    pub targets: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

/// 相关专利信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatentContext {
    pub patent_number: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub assignee: Option<String>,
    pub filing_date: Option<String>,
    pub expiry_date: Option<String>,
    pub legal_status: Option<String>,
    pub jurisdiction: Option<String>,
}

/// 待分析的权利要求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimContext {
    pub patent_number: String,
    pub claim_number: u32,
    pub text: String,
    pub is_independent: bool,
    pub elements: Vec<String>,
}

/// 现有技术文献
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorArtContext {
    pub reference: String,
    pub title: String,
    pub summary: String,
    pub publication_date: Option<String>,
    pub relevance: Option<f32>,
}
