//! 在 token 预算内把检索结果拼成模型上下文

use pi_core::tokens::{estimate_tokens, truncate_to_tokens};
use pi_core::{RagChunk, RagResult};

/// 剩余预算低于此值时不再追加截断条目
pub const MIN_TRUNCATION_TOKENS: usize = 20;

/// 截断条目的尾部标记
pub const TRUNCATION_MARKER: &str = "…[truncated]";

fn format_entry(chunk: &RagChunk) -> String {
    format!("[{}]\n{}\n\n", chunk.source_annotation(), chunk.content.trim())
}

/// 截断到句子边界，找不到边界时硬截断
pub fn truncate_at_sentence(text: &str, max_tokens: usize) -> String {
    truncate_to_tokens(text, max_tokens)
}

/// 按有效分数降序贪心打包
///
/// 各条目的估算值逐条累加（向上取整后的和不小于整体估算），
/// 因此结果的估算 token 不会超过 `budget`。
pub fn build_context(result: &RagResult, budget: usize) -> String {
    let mut chunks: Vec<&RagChunk> = result.chunks.iter().collect();
    chunks.sort_by(|a, b| {
        b.effective_score()
            .partial_cmp(&a.effective_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = String::new();
    let mut used = 0usize;

    for chunk in chunks {
        let entry = format_entry(chunk);
        let tokens = estimate_tokens(&entry);
        if used + tokens <= budget {
            out.push_str(&entry);
            used += tokens;
            continue;
        }

        let remaining = budget.saturating_sub(used);
        if remaining >= MIN_TRUNCATION_TOKENS {
            let header = format!("[{}]\n", chunk.source_annotation());
            let marker = format!("\n{}\n\n", TRUNCATION_MARKER);
            let allowed = remaining
                .saturating_sub(estimate_tokens(&header))
                .saturating_sub(estimate_tokens(&marker));
            let body = truncate_at_sentence(chunk.content.trim(), allowed);
            if !body.is_empty() {
                out.push_str(&header);
                out.push_str(&body);
                out.push_str(&marker);
            } else {
                tracing::debug!(chunk_id = %chunk.chunk_id, "no room for truncated entry");
            }
        }
        break;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_core::SourceType;
    use std::collections::HashMap;

    fn chunk(id: &str, content: &str, score: f32, reranker: Option<f32>) -> RagChunk {
        RagChunk {
            chunk_id: format!("{}#0", id),
            document_id: id.to_string(),
            content: content.to_string(),
            source_type: SourceType::Patent,
            score,
            reranker_score: reranker,
            token_count: estimate_tokens(content),
            metadata: HashMap::from([("patent_number".to_string(), id.to_string())]),
        }
    }

    fn result(chunks: Vec<RagChunk>) -> RagResult {
        RagResult {
            query: "q".to_string(),
            chunks,
            ..Default::default()
        }
    }

    #[test]
    fn test_entries_ordered_by_effective_score() {
        let r = result(vec![
            chunk("US1", "low similarity but high rerank", 0.2, Some(0.9)),
            chunk("US2", "high similarity", 0.8, None),
        ]);
        let ctx = build_context(&r, 1000);
        let first = ctx.find("[Patent US1]").unwrap();
        let second = ctx.find("[Patent US2]").unwrap();
        assert!(first < second);
        assert!(ctx.contains("[Patent US2]\nhigh similarity\n\n"));
    }

    #[test]
    fn test_stays_within_budget_and_marks_truncation() {
        let long = "The compound inhibits kinase activity. ".repeat(40);
        let r = result(vec![
            chunk("US1", "Short first entry.", 0.9, None),
            chunk("US2", &long, 0.8, None),
        ]);
        let budget = 120;
        let ctx = build_context(&r, budget);
        assert!(estimate_tokens(&ctx) <= budget);
        assert!(ctx.contains(TRUNCATION_MARKER));
        assert!(ctx.contains("Short first entry."));
        // 截断点落在句末
        let body_end = ctx.find(TRUNCATION_MARKER).unwrap();
        assert!(ctx[..body_end].trim_end().ends_with('.'));
    }

    #[test]
    fn test_skips_truncation_when_little_budget_remains() {
        let r = result(vec![
            chunk("US1", &"a".repeat(60), 0.9, None),
            chunk("US2", &"b".repeat(400), 0.8, None),
        ]);
        // 第一条约 20 token，剩余不足 20
        let ctx = build_context(&r, 30);
        assert!(!ctx.contains("US2"));
        assert!(!ctx.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn test_empty_result_is_empty_context() {
        assert_eq!(build_context(&RagResult::empty("q"), 100), "");
    }
}
