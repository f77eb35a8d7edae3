//! 指标上报接口
//!
//! 生成器实例会被多个请求并发调用，所有实现都必须是 `Send + Sync` 且无锁或短锁。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    /// 记录一次模型推理
    fn record_inference(&self, model: &str, latency: Duration, success: bool);

    /// 记录缓存命中/未命中
    fn record_cache(&self, hit: bool);

    /// 记录一次检索
    fn record_retrieval(&self, chunks: usize, latency: Duration);

    /// 记录一次报告生成
    fn record_report(&self, task: &str, latency: Duration, success: bool);

    /// 记录 token 用量
    fn record_tokens(&self, prompt_tokens: u64, completion_tokens: u64);
}

/// 不上报任何指标
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_inference(&self, _model: &str, _latency: Duration, _success: bool) {}
    fn record_cache(&self, _hit: bool) {}
    fn record_retrieval(&self, _chunks: usize, _latency: Duration) {}
    fn record_report(&self, _task: &str, _latency: Duration, _success: bool) {}
    fn record_tokens(&self, _prompt_tokens: u64, _completion_tokens: u64) {}
}

/// 进程内计数器，供测试与单机部署使用
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inferences: AtomicU64,
    inference_failures: AtomicU64,
    inference_latency_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retrievals: AtomicU64,
    retrieved_chunks: AtomicU64,
    reports: AtomicU64,
    report_failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub inferences: u64,
    pub inference_failures: u64,
    pub average_inference_latency_ms: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retrievals: u64,
    pub retrieved_chunks: u64,
    pub reports: u64,
    pub report_failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inferences = self.inferences.load(Ordering::Relaxed);
        let latency = self.inference_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            inferences,
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            average_inference_latency_ms: if inferences == 0 { 0 } else { latency / inferences },
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retrievals: self.retrievals.load(Ordering::Relaxed),
            retrieved_chunks: self.retrieved_chunks.load(Ordering::Relaxed),
            reports: self.reports.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_inference(&self, _model: &str, latency: Duration, success: bool) {
        self.inferences.fetch_add(1, Ordering::Relaxed);
        self.inference_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if !success {
            self.inference_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_retrieval(&self, chunks: usize, _latency: Duration) {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        self.retrieved_chunks
            .fetch_add(chunks as u64, Ordering::Relaxed);
    }

    fn record_report(&self, _task: &str, _latency: Duration, success: bool) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.report_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_tokens(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens
            .fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion_tokens, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_in_memory_counts_concurrently() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_inference("model", Duration::from_millis(10), i % 2 == 0);
                        m.record_cache(true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.inferences, 400);
        assert_eq!(snap.inference_failures, 200);
        assert_eq!(snap.average_inference_latency_ms, 10);
        assert_eq!(snap.cache_hits, 400);
    }

    #[test]
    fn test_noop_accepts_everything() {
        let sink: Box<dyn MetricsSink> = Box::new(NoopMetrics);
        sink.record_report("fto", Duration::from_secs(1), true);
        sink.record_tokens(1, 2);
    }
}
