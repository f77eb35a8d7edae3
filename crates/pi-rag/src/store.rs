use async_trait::async_trait;
use pi_error::{PiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::instrument;

/// 向量存储抽象接口
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 相似度搜索，结果按分数降序
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &[SearchFilter],
    ) -> Result<Vec<VectorHit>>;

    async fn insert(&self, record: VectorRecord) -> Result<()>;

    async fn batch_insert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// 删除某文档的全部向量，返回删除条数
    async fn delete(&self, document_id: &str) -> Result<usize>;
}

/// 存储中的一条向量记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    In,
    NotIn,
    Gte,
    Lte,
}

/// 作用于负载字段的过滤条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl SearchFilter {
    pub fn new(field: &str, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn any_of(field: &str, values: &[String]) -> Self {
        Self::new(field, FilterOp::In, Value::from(values.to_vec()))
    }

    pub fn none_of(field: &str, values: &[String]) -> Self {
        Self::new(field, FilterOp::NotIn, Value::from(values.to_vec()))
    }

    /// 判断负载是否满足条件
    ///
    /// 字段缺失时只有 `NotIn` 视为通过。字符串字段按逗号拆成多值，
    /// 任一值以过滤值开头（不区分大小写）即视为命中，便于按分类号前缀过滤。
    pub fn matches(&self, payload: &HashMap<String, Value>) -> bool {
        let Some(actual) = payload.get(&self.field) else {
            return self.op == FilterOp::NotIn;
        };

        match self.op {
            FilterOp::Eq => value_eq(actual, &self.value),
            FilterOp::In => self.candidates().iter().any(|c| value_hits(actual, c)),
            FilterOp::NotIn => !self.candidates().iter().any(|c| value_eq(actual, c)),
            FilterOp::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            FilterOp::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
        }
    }

    fn candidates(&self) -> Vec<Value> {
        match &self.value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

fn value_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => a == b,
    }
}

fn value_hits(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => {
            let b = b.to_lowercase();
            a.split(',')
                .map(|part| part.trim().to_lowercase())
                .any(|part| part.starts_with(&b))
        }
        (Value::Array(items), b) => items.iter().any(|item| value_hits(item, b)),
        (a, b) => a == b,
    }
}

/// 数字按数值比较，字符串按字典序比较（ISO 日期可直接比较）
fn compare(actual: &Value, bound: &Value) -> Option<std::cmp::Ordering> {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot_product / (norm_a.sqrt() * norm_b.sqrt())
}

/// 基于内存的向量存储
#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前存储的向量条数
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    #[instrument(skip(self, vector, filters), fields(filters = filters.len()))]
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &[SearchFilter],
    ) -> Result<Vec<VectorHit>> {
        let records = self.records.read().await;

        let mut scored: Vec<(f32, &VectorRecord)> = records
            .iter()
            .filter(|r| filters.iter().all(|f| f.matches(&r.payload)))
            .map(|r| (cosine_similarity(vector, &r.vector), r))
            .collect();

        // 按相似度排序并取 top-k
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, r)| VectorHit {
                id: r.id.clone(),
                score,
                payload: r.payload.clone(),
            })
            .collect())
    }

    async fn insert(&self, record: VectorRecord) -> Result<()> {
        self.batch_insert(vec![record]).await
    }

    async fn batch_insert(&self, new_records: Vec<VectorRecord>) -> Result<()> {
        if let Some(bad) = new_records.iter().find(|r| r.vector.is_empty()) {
            return Err(PiError::VectorStore {
                operation: "batch_insert".to_string(),
                message: format!("record {} has an empty vector", bad.id),
            });
        }

        let mut records = self.records.write().await;
        for record in new_records {
            // 同 id 覆盖，保证重复索引幂等
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
        }
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let mut records = self.records.write().await;
        let original_len = records.len();
        records.retain(|r| r.document_id != document_id);
        let removed = original_len - records.len();

        tracing::info!(document_id = %document_id, removed, "Removed document vectors");
        Ok(removed)
    }
}
