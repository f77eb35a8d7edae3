//! 引用抽取与核验
//!
//! 每种编号体系一条正则，按声明顺序依次扫描，首见去重。

use once_cell::sync::Lazy;
use pi_core::{Citation, CitationSourceType, RagQuery, SourceType, VerificationStatus};
use pi_rag::RagEngine;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type Normalizer = fn(&Captures) -> String;

struct CitationPattern {
    regex: Regex,
    normalize: Normalizer,
    is_patent: bool,
}

fn kind_suffix(caps: &Captures, idx: usize) -> String {
    caps.get(idx)
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default()
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn pattern(re: &str, normalize: Normalizer, is_patent: bool) -> CitationPattern {
    CitationPattern {
        regex: Regex::new(re).expect("citation pattern"),
        normalize,
        is_patent,
    }
}

static PATTERNS: Lazy<Vec<CitationPattern>> = Lazy::new(|| {
    vec![
        // US10000001B2, US 10,000,001 B2, US2019/0123456A1
        pattern(
            r"\bUS[ -]?(\d{4}/?\d{7}|\d{1,2},?\d{3},?\d{3})(?:\s?([AB][12]?))?\b",
            |c| format!("US{}{}", digits(&c[1]), kind_suffix(c, 2)),
            true,
        ),
        // CN112345678A, CN 201980012345.6
        pattern(
            r"\bCN[ -]?(\d{8,12}(?:\.\d)?)(?:\s?([ABCUY]\d?))?\b",
            |c| format!("CN{}{}", &c[1], kind_suffix(c, 2)),
            true,
        ),
        // EP1234567B1, EP 1 234 567 B1
        pattern(
            r"\bEP[ -]?(\d[ ]?\d{3}[ ]?\d{3})(?:\s?([AB]\d?))?\b",
            |c| format!("EP{}{}", digits(&c[1]), kind_suffix(c, 2)),
            true,
        ),
        // WO2015123456A1, WO 2015/123456
        pattern(
            r"\bWO[ -]?((?:19|20)\d{2})\s?/?\s?(\d{6})(?:\s?(A\d))?\b",
            |c| format!("WO{}{}{}", &c[1], &c[2], kind_suffix(c, 3)),
            true,
        ),
        // JP2015123456A, JP2015-123456, JP6123456B2
        pattern(
            r"\bJP[ -]?(\d{4}-?\d{6}|\d{7})(?:\s?([AB]\d?))?\b",
            |c| format!("JP{}{}", digits(&c[1]), kind_suffix(c, 2)),
            true,
        ),
        // MPEP §2141.01
        pattern(
            r"\bMPEP\s*(?:§+\s*)?(\d{3,4}(?:\.\d+)*(?:\([a-zA-Z0-9]+\))*)",
            |c| format!("MPEP §{}", &c[1]),
            false,
        ),
        // 35 U.S.C. § 103(a)
        pattern(
            r"\b(\d{1,2})\s*U\.\s?S\.\s?C\.?\s*(?:§+\s*)?(\d+[a-z]?(?:\([a-z0-9]+\))*)",
            |c| format!("{} U.S.C. § {}", &c[1], &c[2]),
            false,
        ),
    ]
});

fn is_patent_source(source: &str) -> bool {
    let bytes = source.as_bytes();
    bytes.len() > 2
        && ["US", "CN", "EP", "WO", "JP"]
            .iter()
            .any(|p| source.starts_with(p))
        && bytes[2].is_ascii_digit()
}

/// 从文本中抽取引用；同一规范化来源只保留一次
pub fn extract_citations(text: &str) -> Vec<Citation> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut citations = Vec::new();

    for p in PATTERNS.iter() {
        for caps in p.regex.captures_iter(text) {
            let source = (p.normalize)(&caps);
            if !seen.insert(source.clone()) {
                continue;
            }
            let url = p
                .is_patent
                .then(|| format!("https://patents.google.com/patent/{}", source));
            citations.push(Citation {
                id: format!("[{}]", citations.len() + 1),
                source_type: classify_source(&source),
                source,
                verification_status: VerificationStatus::Unverified,
                url,
            });
        }
    }
    citations
}

/// 按前缀与内容判断来源类型
pub fn classify_source(source: &str) -> CitationSourceType {
    let lower = source.to_lowercase();
    if is_patent_source(source) {
        CitationSourceType::Patent
    } else if lower.contains("mpep") || lower.contains("guideline") || source.contains("审查指南")
    {
        CitationSourceType::ExaminationGuideline
    } else if lower.contains("u.s.c.")
        || lower.contains("patent law")
        || lower.contains("patent act")
        || lower.contains("article")
        || source.contains("专利法")
    {
        CitationSourceType::Statute
    } else if lower.contains(" v. ") || lower.contains(" vs. ") {
        CitationSourceType::CaseLaw
    } else if lower.contains("doi") || lower.contains("et al") || lower.contains("journal") {
        CitationSourceType::Literature
    } else {
        CitationSourceType::Other
    }
}

fn chunk_mentions(chunk: &pi_core::RagChunk, source: &str) -> bool {
    let compact: String = source.chars().filter(|c| !c.is_whitespace()).collect();
    chunk.document_id.eq_ignore_ascii_case(&compact)
        || chunk
            .metadata
            .get("patent_number")
            .is_some_and(|n| n.eq_ignore_ascii_case(&compact))
}

/// 并发核验引用
///
/// 每条引用独立检索并各自限时；检索命中分数不低于 `threshold`
/// 或命中同号专利即视为已核验。专利未命中标记为 `NotFound`，
/// 其他来源保持 `Unverified`。检索出错或超时不改变状态。
/// 返回已核验的条数。
pub async fn verify_citations(
    citations: &mut [Citation],
    engine: &RagEngine,
    timeout: Duration,
    threshold: f32,
) -> usize {
    if citations.is_empty() {
        return 0;
    }

    let outcomes: Arc<Mutex<HashMap<usize, VerificationStatus>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let lookups = citations.iter().enumerate().map(|(i, citation)| {
        let outcomes = outcomes.clone();
        let source = citation.source.clone();
        let is_patent = citation.source_type == CitationSourceType::Patent;
        async move {
            let mut query = RagQuery::new(source.clone()).with_top_k(3);
            query.similarity_threshold = Some(0.0);
            if is_patent {
                query.source_types = vec![SourceType::Patent];
            }

            let status = match tokio::time::timeout(timeout, engine.retrieve(&query)).await {
                Ok(Ok(result)) => {
                    let found = result
                        .chunks
                        .iter()
                        .any(|c| c.score >= threshold || chunk_mentions(c, &source));
                    if found {
                        VerificationStatus::Verified
                    } else if is_patent {
                        VerificationStatus::NotFound
                    } else {
                        VerificationStatus::Unverified
                    }
                }
                Ok(Err(e)) => {
                    warn!(source = %source, error = %e, "citation lookup failed");
                    return;
                }
                Err(_) => {
                    warn!(source = %source, timeout_ms = timeout.as_millis() as u64, "citation lookup timed out");
                    return;
                }
            };
            outcomes.lock().await.insert(i, status);
        }
    });
    futures::future::join_all(lookups).await;

    let outcomes = outcomes.lock().await;
    for (i, status) in outcomes.iter() {
        if let Some(citation) = citations.get_mut(*i) {
            citation.verification_status.advance(*status);
        }
    }

    let verified = citations
        .iter()
        .filter(|c| c.verification_status == VerificationStatus::Verified)
        .count();
    debug!(verified, total = citations.len(), "Citation verification completed");
    verified
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_core::Document;
    use pi_llm::HashEmbedder;
    use pi_rag::{MemoryVectorStore, RagEngineConfig};
    use std::collections::HashMap as Map;

    fn sources(text: &str) -> Vec<String> {
        extract_citations(text).into_iter().map(|c| c.source).collect()
    }

    #[test]
    fn test_extracts_each_scheme() {
        let text = "See US10000001B2, CN112345678A, EP1234567B1, WO2015/123456 A1 and JP2015-123456A. \
Also MPEP §2141.01 and 35 U.S.C. § 103(a).";
        assert_eq!(
            sources(text),
            vec![
                "US10000001B2",
                "CN112345678A",
                "EP1234567B1",
                "WO2015123456A1",
                "JP2015123456A",
                "MPEP §2141.01",
                "35 U.S.C. § 103(a)",
            ]
        );
    }

    #[test]
    fn test_dedup_and_idempotent() {
        let text = "US10000001B2 is cited twice: US10000001B2. Also US 10,000,001 B2.";
        let first = extract_citations(text);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "[1]");
        assert_eq!(
            first[0].url.as_deref(),
            Some("https://patents.google.com/patent/US10000001B2")
        );
        assert_eq!(extract_citations(text), first);
    }

    #[test]
    fn test_ids_are_sequential_and_no_match_is_empty() {
        let cites = extract_citations("35 U.S.C. 102 and US9876543B1");
        let ids: Vec<&str> = cites.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["[1]", "[2]"]);
        assert_eq!(cites[0].source, "US9876543B1");
        assert!(extract_citations("no references here").is_empty());
    }

    #[test]
    fn test_classify_source() {
        assert_eq!(classify_source("US10000001B2"), CitationSourceType::Patent);
        assert_eq!(classify_source("MPEP §2141"), CitationSourceType::ExaminationGuideline);
        assert_eq!(classify_source("35 U.S.C. § 103"), CitationSourceType::Statute);
        assert_eq!(classify_source("KSR v. Teleflex"), CitationSourceType::CaseLaw);
        assert_eq!(classify_source("Smith et al., 2019"), CitationSourceType::Literature);
        assert_eq!(classify_source("USPTO memo"), CitationSourceType::Other);
    }

    #[tokio::test]
    async fn test_verify_marks_patents() {
        let engine = RagEngine::new(
            Arc::new(HashEmbedder::default()),
            Arc::new(MemoryVectorStore::new()),
            RagEngineConfig::default(),
        );
        engine
            .index_document(&Document {
                id: "US10000001B2".to_string(),
                title: "Kinase inhibitors".to_string(),
                content: "A kinase inhibitor compound.".to_string(),
                source_type: SourceType::Patent,
                metadata: Map::from([("patent_number".to_string(), "US10000001B2".to_string())]),
                language: None,
            })
            .await
            .unwrap();

        let mut cites = extract_citations("US10000001B2 and US9999999B1 and MPEP §2141");
        let verified =
            verify_citations(&mut cites, &engine, Duration::from_secs(3), 0.99).await;
        assert_eq!(verified, 1);
        assert_eq!(cites[0].verification_status, VerificationStatus::Verified);
        assert_eq!(cites[1].verification_status, VerificationStatus::NotFound);
        assert_eq!(cites[2].verification_status, VerificationStatus::Unverified);

        // 已核验状态不会回退
        let again = verify_citations(&mut cites[..1], &engine, Duration::from_secs(3), 0.99).await;
        assert_eq!(again, 1);
    }
}
