use async_trait::async_trait;
use pi_core::config::RerankerSettings;
use pi_error::{PiError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// 重排结果：候选下标与分数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

/// 重排器抽象接口
#[async_trait]
pub trait Reranker: Send + Sync {
    /// 对候选文本打分，按分数降序返回至多 `top_k` 条
    async fn rerank(&self, query: &str, documents: &[String], top_k: usize)
        -> Result<Vec<RerankScore>>;

    /// 获取重排器名称
    fn name(&self) -> &str;

    /// 健康检查
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn sort_and_truncate(mut scores: Vec<RerankScore>, top_k: usize) -> Vec<RerankScore> {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scores.truncate(top_k);
    scores
}

/// 基于关键词重叠的本地重排器
pub struct KeywordReranker {
    name: String,
    case_sensitive: bool,
    boost_factor: f32,
}

impl KeywordReranker {
    pub fn new(case_sensitive: bool, boost_factor: f32) -> Self {
        Self {
            name: "keyword".to_string(),
            case_sensitive,
            boost_factor,
        }
    }

    fn normalize(&self, text: &str) -> String {
        if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        }
    }

    /// 查询词：空白分词；含 CJK 的词再拆成相邻字对
    fn query_terms(&self, query: &str) -> Vec<String> {
        let mut terms = Vec::new();
        for word in self.normalize(query).split_whitespace() {
            let chars: Vec<char> = word.chars().collect();
            if chars.iter().any(|c| pi_core::tokens::is_cjk(*c)) && chars.len() > 2 {
                terms.extend(chars.windows(2).map(|w| w.iter().collect::<String>()));
            } else {
                terms.push(word.to_string());
            }
        }
        terms
    }

    fn keyword_score(&self, terms: &[String], text: &str) -> f32 {
        if terms.is_empty() {
            return 0.0;
        }
        let content = self.normalize(text);
        let matches = terms.iter().filter(|t| content.contains(t.as_str())).count();
        (matches as f32 / terms.len() as f32) * self.boost_factor
    }
}

impl Default for KeywordReranker {
    fn default() -> Self {
        Self::new(false, 1.0)
    }
}

#[async_trait]
impl Reranker for KeywordReranker {
    #[instrument(skip(self, documents), fields(candidates = documents.len()))]
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankScore>> {
        let terms = self.query_terms(query);
        let scores = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| RerankScore {
                index,
                score: self.keyword_score(&terms, doc),
            })
            .collect();

        let ranked = sort_and_truncate(scores, top_k);
        tracing::debug!(
            query = %query,
            results_count = ranked.len(),
            "Keyword reranking completed"
        );
        Ok(ranked)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Cohere API 重排器
pub struct CohereReranker {
    name: String,
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
}

impl CohereReranker {
    pub fn new(api_key: String, model: Option<String>) -> Self {
        Self {
            name: "cohere".to_string(),
            client: reqwest::Client::new(),
            api_key,
            model: model.unwrap_or_else(|| "rerank-multilingual-v3.0".to_string()),
            api_url: "https://api.cohere.ai/v1/rerank".to_string(),
        }
    }

    pub fn with_custom_url(mut self, url: String) -> Self {
        self.api_url = url;
        self
    }

    async fn send(&self, request: &CohereRerankRequest<'_>, operation: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("Cohere-Version", "2022-12-06")
            .json(request)
            .send()
            .await
            .map_err(|e| PiError::Network {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PiError::Rerank {
                provider: self.name.clone(),
                message: format!("status={} body={}", status, body),
            });
        }
        Ok(response)
    }
}

#[derive(Serialize)]
struct CohereRerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_documents: Option<bool>,
}

#[derive(Deserialize)]
struct CohereRerankResultItem {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct CohereRerankResponse {
    results: Vec<CohereRerankResultItem>,
}

#[async_trait]
impl Reranker for CohereReranker {
    #[instrument(skip(self, documents), fields(candidates = documents.len()))]
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankScore>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let request = CohereRerankRequest {
            model: &self.model,
            query,
            documents: documents.iter().map(String::as_str).collect(),
            top_n: Some(top_k),
            return_documents: Some(false),
        };

        let response: CohereRerankResponse = self
            .send(&request, "cohere_rerank")
            .await?
            .json()
            .await
            .map_err(|e| PiError::Serialization {
                format: "json".to_string(),
                message: e.to_string(),
            })?;

        let scores = response
            .results
            .into_iter()
            .filter(|item| item.index < documents.len())
            .map(|item| RerankScore {
                index: item.index,
                score: item.relevance_score,
            })
            .collect();
        let ranked = sort_and_truncate(scores, top_k);

        tracing::info!(
            original_count = documents.len(),
            reranked_count = ranked.len(),
            "Cohere reranking completed"
        );
        Ok(ranked)
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<()> {
        let request = CohereRerankRequest {
            model: &self.model,
            query: "test",
            documents: vec!["test document"],
            top_n: Some(1),
            return_documents: Some(false),
        };
        self.send(&request, "cohere_health_check")
            .await
            .map(|_| ())
            .map_err(|_| PiError::ServiceUnavailable {
                service: "cohere".to_string(),
                retry_after: Some(std::time::Duration::from_secs(60)),
            })
    }
}

/// 重排器工厂
pub struct RerankerFactory;

impl RerankerFactory {
    /// 根据配置创建重排器；未配置时返回 `None`
    pub fn from_settings(settings: Option<&RerankerSettings>) -> Option<Arc<dyn Reranker>> {
        match settings? {
            RerankerSettings::Cohere {
                api_key,
                model,
                api_url,
            } => {
                if api_key.is_empty() {
                    tracing::warn!("cohere reranker configured without api key, disabling");
                    return None;
                }
                let mut cohere = CohereReranker::new(api_key.clone(), model.clone());
                if let Some(url) = api_url {
                    cohere = cohere.with_custom_url(url.clone());
                }
                Some(Arc::new(cohere))
            }
            RerankerSettings::Keyword { boost_factor } => {
                Some(Arc::new(KeywordReranker::new(false, *boost_factor)))
            }
        }
    }
}
