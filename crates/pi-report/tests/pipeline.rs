use async_trait::async_trait;
use pi_core::config::GeneratorSettings;
use pi_core::{
    AnalysisTask, Document, ExportFormat, InMemoryMetrics, MoleculeContext, OutputFormat,
    Report, SourceType, VerificationStatus,
};
use pi_error::{PiError, Result};
use pi_llm::{HashEmbedder, StaticBackend, TextEmbedder};
use pi_prompt::PromptManager;
use pi_rag::{MemoryVectorStore, RagEngine, RagEngineConfig, RerankScore, Reranker};
use pi_report::{ReportGenerator, ReportRequest, FALLBACK_SECTION_TITLE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const NARRATIVE_REPLY: &str = "# 自由实施分析

## Executive Summary
The kinase inhibitor faces moderate exposure from US10000001B2.

## Claim Mapping
Claim 1 of US10000001B2 recites the pyrimidine scaffold. See also US 10,000,001 B2.

## Conclusions
- Claim 1 likely reads on the product (confidence: 70%)

## Recommendations
- Design around the linker; Priority: High; Rationale: removes claim 1 exposure; Timeline: within 6 months

## Risk Assessment
Overall risk: medium.
";

struct BrokenReranker;

#[async_trait]
impl Reranker for BrokenReranker {
    async fn rerank(&self, _query: &str, _documents: &[String], _top_k: usize) -> Result<Vec<RerankScore>> {
        Err(PiError::Rerank {
            provider: "broken".to_string(),
            message: "service down".to_string(),
        })
    }

    fn name(&self) -> &str {
        "broken"
    }
}

struct DownEmbedder;

#[async_trait]
impl TextEmbedder for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(PiError::Network {
            operation: "embed".to_string(),
            message: "connection refused".to_string(),
        })
    }

    async fn batch_embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(PiError::Network {
            operation: "embed".to_string(),
            message: "connection refused".to_string(),
        })
    }
}

fn engine_config() -> RagEngineConfig {
    RagEngineConfig {
        similarity_threshold: 0.0,
        ..Default::default()
    }
}

async fn indexed_engine() -> RagEngine {
    let engine = RagEngine::new(
        Arc::new(HashEmbedder::default()),
        Arc::new(MemoryVectorStore::new()),
        engine_config(),
    );
    engine
        .index_document(&Document {
            id: "US10000001B2".to_string(),
            title: "Pyrimidine kinase inhibitors".to_string(),
            content: "A kinase inhibitor comprising a pyrimidine scaffold and a flexible linker."
                .to_string(),
            source_type: SourceType::Patent,
            metadata: HashMap::from([
                ("patent_number".to_string(), "US10000001B2".to_string()),
                ("jurisdiction".to_string(), "US".to_string()),
            ]),
            language: Some("en".to_string()),
        })
        .await
        .unwrap();
    engine
}

fn generator(backend: Arc<StaticBackend>, metrics: Arc<InMemoryMetrics>) -> ReportGenerator {
    ReportGenerator::new(
        backend,
        Arc::new(PromptManager::with_defaults().unwrap()),
        GeneratorSettings::default(),
    )
    .unwrap()
    .with_metrics(metrics)
}

fn fto_request() -> ReportRequest {
    let mut req = ReportRequest::new(
        AnalysisTask::FreedomToOperate,
        "Can we launch the kinase inhibitor with a pyrimidine scaffold?",
    );
    req.language = Some("zh".to_string());
    req.jurisdictions = vec!["US".to_string(), "CN".to_string()];
    req.molecule = Some(MoleculeContext {
        name: "PI-101".to_string(),
        targets: vec!["EGFR".to_string()],
        ..Default::default()
    });
    req
}

#[tokio::test]
async fn test_fto_report_in_chinese_with_retrieval() {
    let backend = Arc::new(StaticBackend::new(NARRATIVE_REPLY));
    let metrics = Arc::new(InMemoryMetrics::default());
    let generator = generator(backend.clone(), metrics.clone())
        .with_rag(Arc::new(indexed_engine().await), 3000);

    let report = generator.generate_report(&fto_request()).await.unwrap();

    let sent = backend.last_request().unwrap().messages().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].role, "system");
    assert!(sent[0].content.contains("Freedom-to-Operate Analysis"));
    assert!(sent[0].content.contains("Jurisdictions in scope: US, CN."));
    let user = &sent[1].content;
    assert!(user.contains("## Molecule Context\nName: PI-101"));
    assert!(user.contains("## Retrieved References"));
    assert!(user.contains("请用中文回答"));
    assert!(user.contains("35 U.S.C."));
    assert!(user.contains("Chinese Patent Law"));
    assert!(user.contains("Provide a comparative analysis across"));
    assert!(user.ends_with("Can we launch the kinase inhibitor with a pyrimidine scaffold?"));

    assert_eq!(report.content.title, "自由实施分析");
    assert!(report.metadata.rag_used);
    assert_eq!(report.metadata.rag_chunks_used, 1);
    assert!(!report.metadata.reranker_applied);

    // 同一专利的三种写法只保留一条引用，且在知识库中可核验
    assert_eq!(report.content.citations.len(), 1);
    let citation = &report.content.citations[0];
    assert_eq!(citation.source, "US10000001B2");
    assert_eq!(citation.verification_status, VerificationStatus::Verified);

    let validation = report.validation.as_ref().unwrap();
    assert!((validation.citation_score - 1.0).abs() < 1e-6);
    assert!((validation.actionability_score - 1.0).abs() < 1e-6);
    assert!(validation.issues.iter().all(|i| i.category != "retrieval"));

    let snap = metrics.snapshot();
    assert_eq!(snap.reports, 1);
    assert!(snap.prompt_tokens > 0);
}

#[tokio::test]
async fn test_reranker_failure_falls_back_to_vector_order() {
    let backend = Arc::new(StaticBackend::new(NARRATIVE_REPLY));
    let engine = indexed_engine().await.with_reranker(Arc::new(BrokenReranker));
    let generator = generator(backend, Arc::new(InMemoryMetrics::default()))
        .with_rag(Arc::new(engine), 3000);

    let report = generator.generate_report(&fto_request()).await.unwrap();
    assert!(report.metadata.rag_used);
    assert!(!report.metadata.reranker_applied);
}

#[tokio::test]
async fn test_retrieval_failure_is_reported_not_fatal() {
    let backend = Arc::new(StaticBackend::new(NARRATIVE_REPLY));
    let engine = RagEngine::new(
        Arc::new(DownEmbedder),
        Arc::new(MemoryVectorStore::new()),
        engine_config(),
    );
    let generator = generator(backend.clone(), Arc::new(InMemoryMetrics::default()))
        .with_rag(Arc::new(engine), 3000);

    let report = generator.generate_report(&fto_request()).await.unwrap();
    assert!(!report.metadata.rag_used);
    let sent = backend.last_request().unwrap().messages().unwrap();
    assert!(!sent[1].content.contains("## Retrieved References"));

    let validation = report.validation.unwrap();
    assert!(validation.issues.iter().any(|i| i.category == "retrieval"));
    // 核验也依赖检索，引用保持未核验
    assert_eq!(
        report.content.citations[0].verification_status,
        VerificationStatus::Unverified
    );
}

#[tokio::test]
async fn test_structured_request_with_prose_reply_degrades() {
    let backend = Arc::new(StaticBackend::new(
        "I could not produce JSON.\n\nThe product appears clear of US9876543B1.",
    ));
    let generator = generator(backend, Arc::new(InMemoryMetrics::default()));
    let mut req = ReportRequest::new(AnalysisTask::InfringementRisk, "Assess claim 1");
    req.output_format = OutputFormat::Structured;

    let report = generator.generate_report(&req).await.unwrap();
    assert_eq!(report.content.sections.len(), 1);
    assert_eq!(report.content.sections[0].title, FALLBACK_SECTION_TITLE);
    assert_eq!(report.content.executive_summary, "I could not produce JSON.");
    assert_eq!(report.content.title, "Infringement Risk Assessment");
    assert_eq!(report.content.citations[0].source, "US9876543B1");
    assert_eq!(report.metadata.output_format, OutputFormat::Structured);

    let validation = report.validation.unwrap();
    assert!(validation.issues.iter().any(|i| i.category == "parsing"));
    assert!(!validation.is_valid);
}

#[tokio::test]
async fn test_structured_reply_is_mapped() {
    let reply = r#"{"title":"Valuation of US10000001B2","executive_summary":"High value.",
"sections":[{"title":"Term","content":"Expires 2035."}],
"conclusions":[{"statement":"Strong asset","confidence":0.9}],
"recommendations":[{"action":"License in Asia","priority":"medium","rationale":"Untapped market","timeline":"2025"}]}"#;
    let generator = generator(
        Arc::new(StaticBackend::new(reply)),
        Arc::new(InMemoryMetrics::default()),
    );
    let mut req = ReportRequest::new(AnalysisTask::Valuation, "Value the patent");
    req.output_format = OutputFormat::Structured;

    let report = generator.generate_report(&req).await.unwrap();
    assert_eq!(report.content.title, "Valuation of US10000001B2");
    assert_eq!(report.content.sections[0].order, 1);
    assert_eq!(report.content.conclusions[0].confidence, Some(0.9));
    assert_eq!(report.content.citations.len(), 1);
    let validation = report.validation.unwrap();
    assert!(validation.issues.iter().all(|i| i.category != "parsing"));
}

#[tokio::test]
async fn test_export_formats() {
    let generator = generator(
        Arc::new(StaticBackend::new(NARRATIVE_REPLY)),
        Arc::new(InMemoryMetrics::default()),
    );
    let report = generator.generate_report(&fto_request()).await.unwrap();

    let json = generator.export_report(&report, ExportFormat::Json).unwrap();
    let back: Report = serde_json::from_slice(&json).unwrap();
    assert_eq!(back, report);

    let md = String::from_utf8(generator.export_report(&report, ExportFormat::Markdown).unwrap())
        .unwrap();
    assert!(md.starts_with("# 自由实施分析"));
    assert!(md.contains("## Claim Mapping"));
    assert!(md.contains("## References"));
    assert!(md.contains("US10000001B2"));

    for format in [ExportFormat::Pdf, ExportFormat::Docx] {
        assert!(matches!(
            generator.export_report(&report, format),
            Err(PiError::NotImplemented { .. })
        ));
    }
}

#[tokio::test]
async fn test_stream_delivers_whole_reply() {
    let backend = Arc::new(StaticBackend::new(NARRATIVE_REPLY).with_piece_chars(7));
    let metrics = Arc::new(InMemoryMetrics::default());
    let generator = generator(backend, metrics.clone());

    let mut stream = generator
        .generate_report_stream(&fto_request(), CancellationToken::new())
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().await {
        chunks.push(chunk);
    }
    let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, NARRATIVE_REPLY);
    assert!(chunks.last().unwrap().is_complete);
    assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.sequence, i);
        assert_eq!(chunk.report_id, stream.report_id());
    }

    let outcome = stream.finish().await.unwrap();
    assert_eq!(outcome.full_text, NARRATIVE_REPLY);
    assert_eq!(metrics.snapshot().reports, 1);
}

#[tokio::test]
async fn test_stream_setup_failure() {
    let generator = generator(
        Arc::new(StaticBackend::failing()),
        Arc::new(InMemoryMetrics::default()),
    );
    let err = match generator
        .generate_report_stream(&fto_request(), CancellationToken::new())
        .await
    {
        Ok(_) => panic!("stream should not start"),
        Err(e) => e,
    };
    assert!(matches!(err, PiError::Pipeline { ref stage, .. } if stage == "predict_stream"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_generation() {
    let metrics = Arc::new(InMemoryMetrics::default());
    let generator = Arc::new(
        generator(Arc::new(StaticBackend::new(NARRATIVE_REPLY)), metrics.clone())
            .with_rag(Arc::new(indexed_engine().await), 3000),
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let generator = generator.clone();
            tokio::spawn(async move {
                let mut req = fto_request();
                req.request_id = Some(format!("req-{}", i));
                generator.generate_report(&req).await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.metadata.request_id, format!("req-{}", i));
    }
    assert_eq!(metrics.snapshot().reports, 8);
}
