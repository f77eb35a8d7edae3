//! 命令行报告生成：读取配置与请求 JSON，输出 Markdown/JSON 报告或流式文本

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use pi_core::{AppConfig, Document, ExportFormat, InMemoryMetrics};
use pi_error::PiError;
use pi_llm::{
    HashEmbedder, ModelBackend, OpenAiCompatClient, OpenAiCompatConfig, StaticBackend, TextEmbedder,
};
use pi_prompt::{PromptManager, TemplateRegistry};
use pi_rag::{MemoryVectorStore, RagEngine, RagEngineConfig, RerankerFactory};
use pi_report::{ReportGenerator, ReportRequest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(name = "reporter", version, about = "Generate patent analysis reports", long_about = None)]
struct Cli {
    /// YAML 配置文件
    config: PathBuf,

    /// 报告请求（JSON）
    request: PathBuf,

    /// 参考文档（JSON 数组），生成前先建立索引
    #[arg(short, long)]
    corpus: Option<PathBuf>,

    /// 逐块输出推理文本
    #[arg(short, long)]
    stream: bool,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Markdown)]
    format: OutputFormat,

    /// 用文件内容作为固定回复，不访问模型服务
    #[arg(long)]
    offline_reply: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

impl From<OutputFormat> for ExportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Markdown => ExportFormat::Markdown,
            OutputFormat::Json => ExportFormat::Json,
        }
    }
}

fn init_tracing() {
    // 日志写 stderr，stdout 只留报告
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// 建立参考文档索引；部分文档失败时保留已写入的内容继续
async fn index_corpus(engine: &RagEngine, docs: &[Document]) -> anyhow::Result<()> {
    match engine.index_batch(docs).await {
        Ok(chunks) => info!(documents = docs.len(), chunks, "Corpus indexed"),
        Err(PiError::PartialFailure {
            failed,
            total,
            details,
        }) => warn!(failed, total, details = %details, "Corpus partially indexed"),
        Err(e) => return Err(anyhow::Error::new(e).context("failed to index corpus")),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    config.apply_env_overrides();
    config.validate()?;

    let request: ReportRequest = serde_json::from_str(
        &std::fs::read_to_string(&cli.request)
            .with_context(|| format!("failed to read request {}", cli.request.display()))?,
    )
    .context("invalid report request")?;

    let (backend, embedder): (Arc<dyn ModelBackend>, Arc<dyn TextEmbedder>) =
        match &cli.offline_reply {
            Some(path) => {
                let reply = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read reply {}", path.display()))?;
                (
                    Arc::new(StaticBackend::new(reply)),
                    Arc::new(HashEmbedder::default()),
                )
            }
            None => {
                let client = Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig::from(
                    &config.llm,
                )));
                (client.clone(), client)
            }
        };

    let metrics = Arc::new(InMemoryMetrics::new());
    let registry = Arc::new(TemplateRegistry::with_builtins()?);
    let prompts = Arc::new(PromptManager::new(registry, config.prompt.clone()));
    let mut generator = ReportGenerator::new(backend, prompts, config.generator.clone())?
        .with_metrics(metrics.clone());

    if let Some(path) = &cli.corpus {
        let docs: Vec<Document> = serde_json::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read corpus {}", path.display()))?,
        )
        .context("invalid corpus")?;

        let mut engine = RagEngine::new(
            embedder,
            Arc::new(MemoryVectorStore::new()),
            RagEngineConfig::from(&config.rag),
        )
        .with_metrics(metrics.clone());
        if let Some(reranker) = RerankerFactory::from_settings(config.rag.reranker.as_ref()) {
            engine = engine.with_reranker(reranker);
        }
        index_corpus(&engine, &docs).await?;
        generator = generator.with_rag(Arc::new(engine), config.rag.context_budget);
    }

    let mut stdout = std::io::stdout();
    if cli.stream {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });

        let mut stream = generator
            .generate_report_stream(&request, cancel)
            .await
            .map_err(|e| anyhow!("{}: {}", e.user_message(), e))?;
        while let Some(chunk) = stream.next_chunk().await {
            stdout.write_all(chunk.content.as_bytes())?;
            stdout.flush()?;
        }
        let outcome = stream.finish().await?;
        writeln!(stdout)?;
        if outcome.cancelled {
            warn!(report_id = %outcome.report_id, "Report stream cancelled");
        }
        if let Some(e) = outcome.error {
            bail!("report stream failed: {}", e);
        }
    } else {
        let report = generator
            .generate_report(&request)
            .await
            .map_err(|e| anyhow!("{}: {}", e.user_message(), e))?;
        if let Some(v) = &report.validation {
            info!(
                score = v.score,
                valid = v.is_valid,
                issues = v.issues.len(),
                "Report validated"
            );
        }
        let bytes = generator.export_report(&report, cli.format.into())?;
        stdout.write_all(&bytes)?;
        writeln!(stdout)?;
    }

    info!(metrics = ?metrics.snapshot(), "Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_core::SourceType;

    fn document(id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            title: id.to_string(),
            content: content.to_string(),
            source_type: SourceType::Patent,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_partial_corpus_failure_keeps_indexed_documents() {
        let store = Arc::new(MemoryVectorStore::new());
        let engine = RagEngine::new(
            Arc::new(HashEmbedder::default()),
            store.clone(),
            RagEngineConfig::default(),
        );
        let docs = vec![
            document("US10000001B2", "A kinase inhibitor with a pyrimidine scaffold."),
            document("empty", "   "),
        ];

        index_corpus(&engine, &docs).await.unwrap();
        assert!(store.len().await > 0);
    }
}
