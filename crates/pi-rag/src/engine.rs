use crate::chunker::{Chunker, ChunkerConfig};
use crate::rerank::Reranker;
use crate::store::{FilterOp, SearchFilter, VectorHit, VectorRecord, VectorStore};
use pi_core::{
    estimate_tokens, Document, MetricsSink, NoopMetrics, RagChunk, RagQuery, RagResult,
    SourceType,
};
use pi_error::{ErrorMetadataBuilder, PiError, Result};
use pi_llm::TextEmbedder;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::instrument;

/// RAG 引擎配置
#[derive(Debug, Clone)]
pub struct RagEngineConfig {
    pub default_top_k: usize,
    pub similarity_threshold: f32,
    /// 重排前的候选放大倍数
    pub rerank_multiplier: usize,
    pub index_concurrency: usize,
    pub chunker: ChunkerConfig,
}

impl Default for RagEngineConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            similarity_threshold: 0.5,
            rerank_multiplier: 3,
            index_concurrency: 8,
            chunker: ChunkerConfig::default(),
        }
    }
}

impl From<&pi_core::config::RagSettings> for RagEngineConfig {
    fn from(s: &pi_core::config::RagSettings) -> Self {
        Self {
            default_top_k: s.default_top_k,
            similarity_threshold: s.similarity_threshold,
            rerank_multiplier: s.rerank_multiplier,
            index_concurrency: s.index_concurrency,
            chunker: ChunkerConfig::from(s),
        }
    }
}

/// 检索、重排与索引的编排
pub struct RagEngine {
    embedder: Arc<dyn TextEmbedder>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    metrics: Arc<dyn MetricsSink>,
    chunker: Chunker,
    config: RagEngineConfig,
}

impl RagEngine {
    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        store: Arc<dyn VectorStore>,
        config: RagEngineConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            reranker: None,
            metrics: Arc::new(NoopMetrics),
            chunker: Chunker::new(config.chunker),
            config,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &RagEngineConfig {
        &self.config
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// 向量检索
    ///
    /// 既无查询文本也无预计算向量时返回空结果而非错误。
    #[instrument(skip(self, query), fields(query = %query.query))]
    pub async fn retrieve(&self, query: &RagQuery) -> Result<RagResult> {
        let start_time = Instant::now();

        let vector = match &query.embedding {
            Some(v) if !v.is_empty() => v.clone(),
            _ if query.query.trim().is_empty() => return Ok(RagResult::empty(&query.query)),
            _ => self
                .embedder
                .embed(&query.query)
                .await
                .map_err(|e| PiError::EmbeddingService {
                    provider: "retriever".to_string(),
                    message: e.to_string(),
                    retry_after: e.retry_after(),
                })?,
        };
        if vector.is_empty() {
            return Ok(RagResult::empty(&query.query));
        }

        let top_k = query
            .top_k
            .filter(|k| *k > 0)
            .unwrap_or(self.config.default_top_k);
        let threshold = query
            .similarity_threshold
            .unwrap_or(self.config.similarity_threshold);
        let filters = build_filters(query);

        let hits = self.store.search(&vector, top_k, &filters).await?;
        let total_found = hits.len();

        let chunks: Vec<RagChunk> = hits
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .map(hit_to_chunk)
            .filter(|chunk| {
                query.source_types.is_empty() || query.source_types.contains(&chunk.source_type)
            })
            .collect();

        let latency = start_time.elapsed();
        self.metrics.record_retrieval(chunks.len(), latency);
        tracing::debug!(
            total_found,
            kept = chunks.len(),
            latency_ms = latency.as_millis() as u64,
            "Retrieval completed"
        );

        Ok(RagResult {
            query: query.query.clone(),
            chunks,
            total_found,
            reranker_applied: false,
            latency_ms: latency.as_millis() as u64,
        })
    }

    /// 过量召回后重排；重排器缺失或失败时退化为向量序
    #[instrument(skip(self, query), fields(query = %query.query))]
    pub async fn retrieve_and_rerank(&self, query: &RagQuery) -> Result<RagResult> {
        let start_time = Instant::now();
        let top_k = query
            .top_k
            .filter(|k| *k > 0)
            .unwrap_or(self.config.default_top_k);
        let multiplier = self.config.rerank_multiplier.max(1);

        let mut candidate_query = query.clone();
        candidate_query.top_k = Some(top_k.saturating_mul(multiplier));
        let mut result = self.retrieve(&candidate_query).await?;
        if result.chunks.is_empty() {
            return Ok(result);
        }

        let Some(reranker) = &self.reranker else {
            tracing::debug!("no reranker configured, keeping vector order");
            result.chunks.truncate(top_k);
            result.latency_ms = start_time.elapsed().as_millis() as u64;
            return Ok(result);
        };

        let documents: Vec<String> = result.chunks.iter().map(|c| c.content.clone()).collect();
        match reranker.rerank(&query.query, &documents, top_k).await {
            Ok(scores) => {
                let mut reranked: Vec<RagChunk> = scores
                    .iter()
                    .filter_map(|s| {
                        result.chunks.get(s.index).map(|c| RagChunk {
                            reranker_score: Some(s.score),
                            ..c.clone()
                        })
                    })
                    .collect();

                if reranked.is_empty() {
                    tracing::warn!(
                        reranker = reranker.name(),
                        "reranker returned no usable indices, keeping vector order"
                    );
                    result.chunks.truncate(top_k);
                } else {
                    reranked.sort_by(|a, b| {
                        b.effective_score()
                            .partial_cmp(&a.effective_score())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    reranked.truncate(top_k);
                    result.chunks = reranked;
                    result.reranker_applied = true;
                }
            }
            Err(e) => {
                tracing::warn!(
                    reranker = reranker.name(),
                    error = %e,
                    "reranking failed, falling back to vector order"
                );
                result.chunks.truncate(top_k);
            }
        }

        result.latency_ms = start_time.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// 分块、批量嵌入并写入向量存储，返回写入的块数
    #[instrument(skip(self, doc), fields(document_id = %doc.id))]
    pub async fn index_document(&self, doc: &Document) -> Result<usize> {
        if doc.id.trim().is_empty() {
            return Err(PiError::InvalidRequest {
                reason: "document id must not be empty".to_string(),
            });
        }
        if doc.content.trim().is_empty() {
            return Err(PiError::InvalidRequest {
                reason: format!("document {} has empty content", doc.id),
            });
        }

        let chunks = self.chunker.chunk(doc);
        if chunks.is_empty() {
            tracing::warn!("No chunks created for document {}", doc.id);
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .batch_embed(&texts)
            .await
            .map_err(|e| PiError::EmbeddingService {
                provider: "indexer".to_string(),
                message: e.to_string(),
                retry_after: e.retry_after(),
            })?;
        if embeddings.len() != chunks.len() {
            return Err(PiError::EmbeddingService {
                provider: "indexer".to_string(),
                message: format!(
                    "expected {} embeddings, got {}",
                    chunks.len(),
                    embeddings.len()
                ),
                retry_after: None,
            });
        }

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, vector)| {
                let mut payload: HashMap<String, Value> = chunk
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                payload.insert("document_id".into(), chunk.document_id.clone().into());
                payload.insert("chunk_id".into(), chunk.chunk_id.clone().into());
                payload.insert("content".into(), chunk.content.clone().into());
                payload.insert("source_type".into(), chunk.source_type.as_str().into());
                payload.insert("token_count".into(), chunk.token_count.into());
                payload.insert("index".into(), chunk.index.into());

                VectorRecord {
                    id: chunk.chunk_id,
                    document_id: chunk.document_id,
                    vector,
                    payload,
                }
            })
            .collect();

        let count = records.len();
        self.store.batch_insert(records).await?;
        tracing::info!(chunks_added = count, "Indexed document");
        Ok(count)
    }

    /// 并发索引多个文档，单个失败不影响其他文档
    ///
    /// 全部成功时返回写入的总块数；否则返回 `PartialFailure`，
    /// 已成功写入的文档不回滚。
    #[instrument(skip(self, docs), fields(count = docs.len()))]
    pub async fn index_batch(&self, docs: &[Document]) -> Result<usize> {
        let semaphore = Arc::new(Semaphore::new(self.config.index_concurrency.max(1)));

        let tasks = docs.iter().map(|doc| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.map_err(|e| PiError::Concurrency {
                    operation: "index_batch".to_string(),
                    message: e.to_string(),
                })?;
                self.index_document(doc).await
            }
        });
        let results = futures::future::join_all(tasks).await;

        let mut indexed = 0usize;
        let mut failures = Vec::new();
        for (doc, result) in docs.iter().zip(results) {
            match result {
                Ok(n) => indexed += n,
                Err(e) => failures.push(format!("{}: {}", doc.id, e)),
            }
        }

        if failures.is_empty() {
            return Ok(indexed);
        }
        let err = PiError::PartialFailure {
            failed: failures.len(),
            total: docs.len(),
            details: failures.join("; "),
        };
        let metadata = ErrorMetadataBuilder::new("rag_engine")
            .operation("index_batch")
            .context("chunks_indexed", &indexed.to_string())
            .build(&err);
        err.log(&metadata);
        Err(err)
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if document_id.trim().is_empty() {
            return Err(PiError::InvalidRequest {
                reason: "document id must not be empty".to_string(),
            });
        }
        self.store.delete(document_id).await
    }
}

/// 由查询构建存储过滤条件
fn build_filters(query: &RagQuery) -> Vec<SearchFilter> {
    let f = &query.filters;
    let mut filters = Vec::new();

    if let Some(from) = f.date_from {
        filters.push(SearchFilter::new(
            "publication_date",
            FilterOp::Gte,
            Value::String(from.format("%Y-%m-%d").to_string()),
        ));
    }
    if let Some(to) = f.date_to {
        filters.push(SearchFilter::new(
            "publication_date",
            FilterOp::Lte,
            Value::String(to.format("%Y-%m-%d").to_string()),
        ));
    }
    for (field, values) in [
        ("jurisdiction", &f.jurisdictions),
        ("classification", &f.classifications),
        ("document_type", &f.document_types),
        ("assignee", &f.assignees),
    ] {
        if !values.is_empty() {
            filters.push(SearchFilter::any_of(field, values));
        }
    }
    if !f.exclude_document_ids.is_empty() {
        filters.push(SearchFilter::none_of(
            "document_id",
            &f.exclude_document_ids,
        ));
    }
    if !query.source_types.is_empty() {
        let labels: Vec<String> = query
            .source_types
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        filters.push(SearchFilter::new(
            "source_type",
            FilterOp::In,
            Value::from(labels),
        ));
    }
    filters
}

fn hit_to_chunk(hit: VectorHit) -> RagChunk {
    let mut payload = hit.payload;
    let mut take = |key: &str| match payload.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };

    let content = take("content");
    let document_id = take("document_id");
    let source_type = SourceType::from_label(&take("source_type"));
    payload.remove("chunk_id");
    payload.remove("token_count");
    payload.remove("index");

    let metadata = payload
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect();

    RagChunk {
        chunk_id: hit.id,
        token_count: estimate_tokens(&content),
        document_id,
        content,
        source_type,
        score: hit.score,
        reranker_score: None,
        metadata,
    }
}
