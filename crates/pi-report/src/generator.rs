//! 报告生成流水线
//!
//! 检索 → 提示词组装 → 推理 → 解析 → 元数据 → 质量评估 → 指标。
//! 检索与评估失败只降级；提示词组装与推理失败直接返回带阶段名的错误。

use crate::citations::verify_citations;
use crate::export::ReportExporter;
use crate::parser::{parse_llm_output, parse_llm_output_with_status};
use crate::stream::{spawn_report_stream, CompletionHook, ReportStream};
use crate::validation::{append_issues, validate_content};
use chrono::Utc;
use pi_core::config::{GeneratorSettings, RagSettings};
use pi_core::tokens::estimate_tokens;
use pi_core::{
    AnalysisTask, ClaimContext, DetailLevel, ExportFormat, IssueSeverity, MetricsSink,
    MoleculeContext, NoopMetrics, OutputFormat, PatentContext, PriorArtContext, RagQuery, Report,
    ReportContent, ReportMetadata, TokenUsage, ValidationIssue, ValidationResult,
};
use pi_error::{ErrorMetadataBuilder, PiError, Result};
use pi_llm::{ModelBackend, PredictRequest, PredictResponse};
use pi_prompt::{BuiltPrompt, PromptManager, PromptParams};
use pi_rag::{build_context, RagEngine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 报告生成请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub task: AnalysisTask,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub molecule: Option<MoleculeContext>,
    #[serde(default)]
    pub patents: Vec<PatentContext>,
    #[serde(default)]
    pub claims: Vec<ClaimContext>,
    #[serde(default)]
    pub prior_art: Vec<PriorArtContext>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub detail_level: DetailLevel,
    #[serde(default)]
    pub jurisdictions: Vec<String>,
    /// 覆盖配置中的 `use_rag`
    #[serde(default)]
    pub use_rag: Option<bool>,
    /// 自定义检索条件；缺省时以 `query` 检索
    #[serde(default)]
    pub retrieval: Option<RagQuery>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub custom_system_template: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

impl ReportRequest {
    pub fn new(task: AnalysisTask, query: impl Into<String>) -> Self {
        Self {
            task,
            query: query.into(),
            molecule: None,
            patents: Vec::new(),
            claims: Vec::new(),
            prior_art: Vec::new(),
            output_format: OutputFormat::default(),
            language: None,
            detail_level: DetailLevel::default(),
            jurisdictions: Vec::new(),
            use_rag: None,
            retrieval: None,
            request_id: None,
            custom_system_template: None,
            model_name: None,
        }
    }
}

#[derive(Debug, Default)]
struct RetrievalOutcome {
    context: Option<String>,
    chunks: usize,
    reranker_applied: bool,
    error: Option<String>,
}

pub struct ReportGenerator {
    backend: Arc<dyn ModelBackend>,
    prompts: Arc<PromptManager>,
    rag: Option<Arc<RagEngine>>,
    context_budget: usize,
    exporter: ReportExporter,
    metrics: Arc<dyn MetricsSink>,
    settings: GeneratorSettings,
}

impl ReportGenerator {
    /// 导出模板注册在提示词管理器的注册表中
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        prompts: Arc<PromptManager>,
        settings: GeneratorSettings,
    ) -> Result<Self> {
        let exporter = ReportExporter::with_registry(prompts.registry().clone())?;
        Ok(Self {
            backend,
            prompts,
            rag: None,
            context_budget: RagSettings::default().context_budget,
            exporter,
            metrics: Arc::new(NoopMetrics),
            settings,
        })
    }

    pub fn with_rag(mut self, engine: Arc<RagEngine>, context_budget: usize) -> Self {
        self.rag = Some(engine);
        self.context_budget = context_budget;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    pub fn exporter(&self) -> &ReportExporter {
        &self.exporter
    }

    #[instrument(skip(self, req), fields(task = %req.task))]
    pub async fn generate_report(&self, req: &ReportRequest) -> Result<Report> {
        let started = Instant::now();
        let result = self.run_pipeline(req, started).await;
        let elapsed = started.elapsed();
        self.metrics
            .record_report(req.task.as_str(), elapsed, result.is_ok());

        match &result {
            Ok(report) => info!(
                report_id = %report.id,
                latency_ms = report.latency_ms,
                rag_chunks = report.metadata.rag_chunks_used,
                citations = report.content.citations.len(),
                score = report.validation.as_ref().map(|v| v.score),
                "Report generated"
            ),
            Err(e) => log_failure(e, "generate_report", req, elapsed),
        }
        result
    }

    async fn run_pipeline(&self, req: &ReportRequest, started: Instant) -> Result<Report> {
        let request_id = req
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let retrieval = self.retrieve_context(req).await;

        let prompt = self
            .prompts
            .build_prompt(req.task, &self.prompt_params(req, retrieval.context.clone()))
            .map_err(|e| PiError::in_stage("prompt_build", e))?;

        let model = self.model_name(req);
        let predict_req = PredictRequest::chat(
            &model,
            &prompt.messages,
            self.request_metadata(req, &request_id, false),
        )
        .map_err(|e| PiError::in_stage("prompt_build", e))?;

        let infer_started = Instant::now();
        let response = self.backend.predict(predict_req).await;
        self.metrics
            .record_inference(&model, infer_started.elapsed(), response.is_ok());
        let response = response.map_err(|e| PiError::in_stage("predict", e))?;

        let raw = response.text_output().unwrap_or_default();
        let parsed = parse_llm_output_with_status(&raw, req.output_format);
        let mut content = parsed.content;
        if content.title.trim().is_empty() {
            content.title = req.task.display_name().to_string();
        }

        let token_usage = token_usage(&response, &prompt, &raw);
        self.metrics
            .record_tokens(token_usage.prompt_tokens, token_usage.completion_tokens);

        let metadata = ReportMetadata {
            model_id: model,
            model_version: response
                .model_version
                .clone()
                .or_else(|| self.settings.model_version.clone()),
            template_version: prompt.template_version.clone(),
            request_id,
            output_format: req.output_format,
            rag_used: retrieval.chunks > 0,
            rag_chunks_used: retrieval.chunks,
            reranker_applied: retrieval.reranker_applied,
            prompt_tokens_estimated: prompt.estimated_tokens,
            truncation_applied: prompt.truncation_applied,
        };

        let mut report = Report {
            id: Uuid::new_v4(),
            task: req.task,
            content,
            metadata,
            validation: None,
            generated_at: Utc::now(),
            latency_ms: 0,
            token_usage,
        };

        if self.settings.enable_validation {
            let mut issues = Vec::new();
            if let Some(err) = retrieval.error {
                issues.push(ValidationIssue::new(
                    IssueSeverity::Warning,
                    "retrieval",
                    format!("retrieval failed, generated without references: {}", err),
                ));
            }
            if let Some(reason) = parsed.degraded {
                issues.push(ValidationIssue::new(
                    IssueSeverity::Warning,
                    "parsing",
                    format!("output kept as a single section: {}", reason),
                ));
            }
            let mut validation = self.validate_report(&mut report).await;
            append_issues(&mut validation, issues);
            report.validation = Some(validation);
        }

        report.latency_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// 流式生成；取消令牌触发后推送完成块并停止
    #[instrument(skip(self, req, cancel), fields(task = %req.task))]
    pub async fn generate_report_stream(
        &self,
        req: &ReportRequest,
        cancel: CancellationToken,
    ) -> Result<ReportStream> {
        let started = Instant::now();
        let request_id = req
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let retrieval = self.retrieve_context(req).await;
        let prompt = self
            .prompts
            .build_prompt(req.task, &self.prompt_params(req, retrieval.context))
            .map_err(|e| PiError::in_stage("prompt_build", e))?;

        let model = self.model_name(req);
        let predict_req = PredictRequest::chat(
            &model,
            &prompt.messages,
            self.request_metadata(req, &request_id, true),
        )
        .map_err(|e| PiError::in_stage("prompt_build", e))?;

        let upstream = match self.backend.predict_stream(predict_req).await {
            Ok(rx) => rx,
            Err(e) => {
                self.metrics
                    .record_inference(&model, started.elapsed(), false);
                self.metrics
                    .record_report(req.task.as_str(), started.elapsed(), false);
                let err = PiError::in_stage("predict_stream", e);
                log_failure(&err, "generate_report_stream", req, started.elapsed());
                return Err(err);
            }
        };

        let report_id = Uuid::new_v4();
        info!(report_id = %report_id, request_id = %request_id, "Report stream started");

        let metrics = self.metrics.clone();
        let task = req.task;
        let prompt_tokens = prompt.estimated_tokens as u64;
        let hook: CompletionHook = Box::new(move |outcome| {
            let elapsed = started.elapsed();
            metrics.record_inference(&model, elapsed, outcome.error.is_none());
            metrics.record_tokens(prompt_tokens, estimate_tokens(&outcome.full_text) as u64);
            metrics.record_report(
                task.as_str(),
                elapsed,
                outcome.error.is_none() && !outcome.cancelled,
            );
        });

        Ok(spawn_report_stream(
            upstream,
            report_id,
            self.settings.stream_flush_bytes,
            self.settings.stream_buffer,
            cancel,
            Some(hook),
        ))
    }

    /// 核验引用并评分，结果同时写回报告
    pub async fn validate_report(&self, report: &mut Report) -> ValidationResult {
        if let Some(engine) = &self.rag {
            verify_citations(
                &mut report.content.citations,
                engine,
                Duration::from_millis(self.settings.verification_timeout_ms),
                self.settings.verification_threshold,
            )
            .await;
        }
        let result = validate_content(&report.content);
        report.validation = Some(result.clone());
        result
    }

    pub fn parse_llm_output(&self, raw: &str, format: OutputFormat) -> ReportContent {
        parse_llm_output(raw, format)
    }

    pub fn export_report(&self, report: &Report, format: ExportFormat) -> Result<Vec<u8>> {
        self.exporter.export(report, format)
    }

    async fn retrieve_context(&self, req: &ReportRequest) -> RetrievalOutcome {
        let enabled = req.use_rag.unwrap_or(self.settings.use_rag);
        let Some(engine) = self.rag.as_ref().filter(|_| enabled) else {
            return RetrievalOutcome::default();
        };

        let query = req
            .retrieval
            .clone()
            .unwrap_or_else(|| RagQuery::new(req.query.clone()));
        let result = if engine.has_reranker() {
            engine.retrieve_and_rerank(&query).await
        } else {
            engine.retrieve(&query).await
        };

        match result {
            Ok(result) if result.chunks.is_empty() => RetrievalOutcome::default(),
            Ok(result) => RetrievalOutcome {
                context: Some(build_context(&result, self.context_budget)),
                chunks: result.chunks.len(),
                reranker_applied: result.reranker_applied,
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "Retrieval failed, continuing without references");
                RetrievalOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    fn prompt_params(&self, req: &ReportRequest, rag_context: Option<String>) -> PromptParams {
        PromptParams {
            molecule: req.molecule.clone(),
            patents: req.patents.clone(),
            claims: req.claims.clone(),
            prior_art: req.prior_art.clone(),
            rag_context,
            query: req.query.clone(),
            output_format: req.output_format,
            language: req.language.clone(),
            detail_level: req.detail_level,
            jurisdictions: req.jurisdictions.clone(),
            custom_system_template: req.custom_system_template.clone(),
        }
    }

    fn model_name(&self, req: &ReportRequest) -> String {
        req.model_name
            .clone()
            .unwrap_or_else(|| self.settings.model_name.clone())
    }

    fn request_metadata(
        &self,
        req: &ReportRequest,
        request_id: &str,
        stream: bool,
    ) -> HashMap<String, String> {
        HashMap::from([
            ("task".to_string(), req.task.as_str().to_string()),
            ("request_id".to_string(), request_id.to_string()),
            ("stream".to_string(), stream.to_string()),
        ])
    }
}

/// 按错误严重程度记录结构化日志
fn log_failure(err: &PiError, operation: &str, req: &ReportRequest, elapsed: Duration) {
    let mut builder = ErrorMetadataBuilder::new("report_generator")
        .operation(operation)
        .context("task", req.task.as_str())
        .context("latency_ms", &elapsed.as_millis().to_string())
        .context("retryable", &err.is_retryable().to_string());
    if let Some(id) = &req.request_id {
        builder = builder.request_id(id);
    }
    err.log(&builder.build(err));
}

/// 后端未返回用量时用估算值补齐
fn token_usage(resp: &PredictResponse, prompt: &BuiltPrompt, raw: &str) -> TokenUsage {
    let prompt_tokens = resp
        .usage_value("prompt_tokens")
        .unwrap_or(prompt.estimated_tokens as u64);
    let completion_tokens = resp
        .usage_value("completion_tokens")
        .unwrap_or_else(|| estimate_tokens(raw) as u64);
    let total_tokens = resp
        .usage_value("total_tokens")
        .unwrap_or(prompt_tokens + completion_tokens);
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }
}
