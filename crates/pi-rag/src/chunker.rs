//! 文档分块
//!
//! 专利文档先定位权利要求书，说明书按段落打包，权利要求逐条成块；
//! 其他文档按段落打包，超长段落再按句子拆分。所有大小都以
//! [`estimate_tokens`] 计量。

use once_cell::sync::Lazy;
use pi_core::tokens::{estimate_tokens, is_cjk, longest_prefix_within};
use pi_core::{Document, DocumentChunk, SourceType};
use regex::Regex;
use std::collections::HashMap;

/// 权利要求书起始标记（整行匹配，忽略行尾冒号）
const CLAIMS_MARKERS: [&str; 7] = [
    "What is claimed is",
    "We claim",
    "I claim",
    "权利要求书",
    "权利要求",
    "CLAIMS",
    "Claims",
];

/// 行首的权利要求编号：`1.` `1)` `1、` `1．`，分隔符后可直接接正文；
/// 分隔符后紧跟数字（`1.5 mg`）不算编号
static CLAIM_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d{1,3})\s*(?:[.)．:：](?:$|[^\d])|、)").expect("claim number pattern")
});

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// 目标块大小（估算 token）
    pub chunk_size: usize,
    /// 相邻块之间携带的重叠 token
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 64,
        }
    }
}

impl From<&pi_core::config::RagSettings> for ChunkerConfig {
    fn from(s: &pi_core::config::RagSettings) -> Self {
        Self {
            chunk_size: s.chunk_size,
            chunk_overlap: s.chunk_overlap,
        }
    }
}

/// 单个待输出片段及其附加标注
struct Piece {
    content: String,
    annotations: Vec<(&'static str, String)>,
}

impl Piece {
    fn plain(content: String) -> Self {
        Self {
            content,
            annotations: Vec::new(),
        }
    }

    fn section(content: String, section: &str) -> Self {
        Self {
            content,
            annotations: vec![("section", section.to_string())],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        // 重叠不能吞掉整块，否则永远无法前进
        let chunk_overlap = config.chunk_overlap.min(chunk_size / 2);
        Self {
            config: ChunkerConfig {
                chunk_size,
                chunk_overlap,
            },
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// 将文档切分为块；空内容返回空列表
    pub fn chunk(&self, doc: &Document) -> Vec<DocumentChunk> {
        let content = doc.content.replace("\r\n", "\n");
        if content.trim().is_empty() {
            return Vec::new();
        }

        let pieces = match doc.source_type {
            SourceType::Patent => self.chunk_patent(&content),
            _ => self
                .chunk_text(&content)
                .into_iter()
                .map(Piece::plain)
                .collect(),
        };

        pieces
            .into_iter()
            .filter(|p| !p.content.trim().is_empty())
            .enumerate()
            .map(|(index, piece)| self.build_chunk(doc, index, piece))
            .collect()
    }

    fn build_chunk(&self, doc: &Document, index: usize, piece: Piece) -> DocumentChunk {
        let mut metadata: HashMap<String, String> = doc.metadata.clone();
        if !doc.title.is_empty() {
            metadata.insert("title".to_string(), doc.title.clone());
        }
        if let Some(lang) = doc.language.as_ref().filter(|l| !l.is_empty()) {
            metadata.insert("language".to_string(), lang.clone());
        }
        for (key, value) in piece.annotations {
            metadata.insert(key.to_string(), value);
        }
        metadata.insert("chunk_index".to_string(), index.to_string());

        DocumentChunk {
            chunk_id: format!("{}#{}", doc.id, index),
            document_id: doc.id.clone(),
            token_count: estimate_tokens(&piece.content),
            content: piece.content,
            source_type: doc.source_type,
            index,
            metadata,
        }
    }

    fn chunk_patent(&self, content: &str) -> Vec<Piece> {
        let Some((heading_start, body_start)) = find_claims_start(content) else {
            return self
                .chunk_text(content)
                .into_iter()
                .map(|c| Piece::section(c, "description"))
                .collect();
        };

        let mut pieces: Vec<Piece> = self
            .chunk_text(&content[..heading_start])
            .into_iter()
            .map(|c| Piece::section(c, "description"))
            .collect();

        for (number, text) in split_claims(&content[body_start..]) {
            pieces.push(Piece {
                content: text,
                annotations: vec![
                    ("section", "claims".to_string()),
                    ("claim_number", number.to_string()),
                ],
            });
        }
        pieces
    }

    /// 段落打包，超长段落按句子拆分
    fn chunk_text(&self, text: &str) -> Vec<String> {
        let mut packer = Packer::new(self.config.chunk_size, self.config.chunk_overlap);
        for paragraph in split_paragraphs(text) {
            if estimate_tokens(&paragraph) > self.config.chunk_size {
                for sentence in split_sentences(&paragraph) {
                    let sep = if sentence.chars().next().is_some_and(is_cjk) {
                        ""
                    } else {
                        " "
                    };
                    packer.push(&sentence, sep);
                }
            } else {
                packer.push(&paragraph, "\n\n");
            }
        }
        packer.finish()
    }
}

/// 累积片段直到超出预算，然后输出并以尾部重叠作为下一块的种子
struct Packer {
    size: usize,
    overlap: usize,
    chunks: Vec<String>,
    current: String,
    /// `current` 是否含有尚未输出的新内容（不只是重叠种子）
    fresh: bool,
}

impl Packer {
    fn new(size: usize, overlap: usize) -> Self {
        Self {
            size,
            overlap,
            chunks: Vec::new(),
            current: String::new(),
            fresh: false,
        }
    }

    fn push(&mut self, piece: &str, sep: &str) {
        if estimate_tokens(piece) > self.size {
            for part in hard_split(piece, self.size) {
                self.push_fitting(&part, sep);
            }
        } else {
            self.push_fitting(piece, sep);
        }
    }

    fn push_fitting(&mut self, piece: &str, sep: &str) {
        if self.current.is_empty() {
            self.current = piece.to_string();
            self.fresh = true;
            return;
        }

        let candidate = format!("{}{}{}", self.current, sep, piece);
        if estimate_tokens(&candidate) <= self.size {
            self.current = candidate;
            self.fresh = true;
            return;
        }

        if self.fresh {
            self.flush();
        }

        let seeded = if self.current.is_empty() {
            piece.to_string()
        } else {
            format!("{}{}{}", self.current, sep, piece)
        };
        // 种子放不下时丢弃种子
        self.current = if estimate_tokens(&seeded) <= self.size {
            seeded
        } else {
            piece.to_string()
        };
        self.fresh = true;
    }

    fn flush(&mut self) {
        let text = self.current.trim().to_string();
        self.current = overlap_tail(&text, self.overlap);
        if !text.is_empty() {
            self.chunks.push(text);
        }
        self.fresh = false;
    }

    fn finish(mut self) -> Vec<String> {
        if self.fresh {
            let text = self.current.trim().to_string();
            if !text.is_empty() {
                self.chunks.push(text);
            }
        }
        self.chunks
    }
}

/// 取估算 token 不超过 `overlap` 的最长后缀，并对齐到词边界
fn overlap_tail(text: &str, overlap: usize) -> String {
    if overlap == 0 || text.is_empty() {
        return String::new();
    }

    let offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let (mut lo, mut hi) = (0usize, offsets.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if estimate_tokens(&text[offsets[mid]..]) <= overlap {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    if lo >= offsets.len() {
        return String::new();
    }

    let mut tail = &text[offsets[lo]..];
    let cut_mid_word = lo > 0
        && text[..offsets[lo]]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() && !is_cjk(c))
        && tail.chars().next().is_some_and(|c| c.is_alphanumeric() && !is_cjk(c));
    if cut_mid_word {
        if let Some(pos) = tail.find(char::is_whitespace) {
            tail = &tail[pos..];
        }
    }
    tail.trim().to_string()
}

/// 单个句子仍超预算时按字符硬切
fn hard_split(text: &str, size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let keep = longest_prefix_within(rest, size).max(1);
        let end = rest
            .char_indices()
            .nth(keep)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        out.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    out
}

/// 按空行分段
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}

/// 按句末标点拆句
///
/// 半角 `.` `!` `?` 需后接空白或文本结尾；全角 `。` `！` `？` 本身即为边界。
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = match c {
            '。' | '！' | '？' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |n| n.is_whitespace()),
            _ => false,
        };
        if boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// 返回 (标题行起点, 正文起点)
fn find_claims_start(text: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let heading = line
            .trim()
            .trim_end_matches([':', '：'])
            .trim_end();
        if CLAIMS_MARKERS.iter().any(|m| heading == *m) {
            return Some((offset, offset + line.len()));
        }
        offset += line.len();
    }
    None
}

/// 拆分权利要求；没有编号时退化为按空行拆分并顺序编号
pub fn split_claims(text: &str) -> Vec<(u32, String)> {
    let mut claims: Vec<(u32, String)> = Vec::new();
    let mut current: Option<(u32, String)> = None;

    for line in text.lines() {
        if let Some(number) = CLAIM_START
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            if let Some(done) = current.take() {
                claims.push(done);
            }
            current = Some((number, line.trim().to_string()));
        } else if let Some((_, body)) = current.as_mut() {
            let line = line.trim();
            if !line.is_empty() {
                body.push('\n');
                body.push_str(line);
            }
        }
    }
    if let Some(done) = current {
        claims.push(done);
    }

    if claims.is_empty() {
        return split_paragraphs(text)
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i as u32 + 1, p))
            .collect();
    }
    claims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(source_type: SourceType, content: &str) -> Document {
        Document {
            id: "doc-1".to_string(),
            title: "Kinase inhibitors".to_string(),
            content: content.to_string(),
            source_type,
            metadata: HashMap::from([("jurisdiction".to_string(), "US".to_string())]),
            language: Some("en".to_string()),
        }
    }

    fn small() -> Chunker {
        Chunker::new(ChunkerConfig {
            chunk_size: 20,
            chunk_overlap: 4,
        })
    }

    #[test]
    fn test_empty_content_yields_no_chunks() {
        let chunker = Chunker::default();
        assert!(chunker.chunk(&doc(SourceType::Paper, "")).is_empty());
        assert!(chunker.chunk(&doc(SourceType::Patent, "  \n\n ")).is_empty());
    }

    #[test]
    fn test_patent_claims_are_numbered_in_order() {
        let content = "Field of the invention.\n\nThe compounds inhibit kinase activity.\n\n\
What is claimed is:\n\
1. A compound of formula (I).\n\
2. The compound of claim 1, wherein R1 is methyl.\n\
wherein the salt is crystalline.\n\
3. A pharmaceutical composition comprising the compound of claim 1.\n";
        let chunks = Chunker::default().chunk(&doc(SourceType::Patent, content));

        let claims: Vec<&DocumentChunk> = chunks
            .iter()
            .filter(|c| c.metadata.get("section").map(String::as_str) == Some("claims"))
            .collect();
        assert_eq!(claims.len(), 3);
        let numbers: Vec<&str> = claims
            .iter()
            .map(|c| c.metadata["claim_number"].as_str())
            .collect();
        assert_eq!(numbers, vec!["1", "2", "3"]);
        assert!(claims[1].content.contains("crystalline"));

        let description: Vec<&DocumentChunk> = chunks
            .iter()
            .filter(|c| c.metadata.get("section").map(String::as_str) == Some("description"))
            .collect();
        assert_eq!(description.len(), 1);
        assert!(!description[0].content.contains("claimed"));
    }

    #[test]
    fn test_chinese_claims_markers_and_separators() {
        let content = "本发明涉及一种化合物。\n\n权利要求书\n1、一种式(I)化合物。\n2、根据权利要求1所述的化合物，其中R1为甲基。\n";
        let chunks = Chunker::default().chunk(&doc(SourceType::Patent, content));
        let numbers: Vec<&str> = chunks
            .iter()
            .filter_map(|c| c.metadata.get("claim_number").map(String::as_str))
            .collect();
        assert_eq!(numbers, vec!["1", "2"]);
    }

    #[test]
    fn test_claims_without_space_after_separator() {
        let content = "本发明涉及一种化合物。\n\n权利要求书\n1．一种式(I)化合物。\n2．根据权利要求1所述的化合物，其中R1为甲基。\n3．一种药物组合物。\n";
        let chunks = Chunker::default().chunk(&doc(SourceType::Patent, content));
        let numbers: Vec<&str> = chunks
            .iter()
            .filter_map(|c| c.metadata.get("claim_number").map(String::as_str))
            .collect();
        assert_eq!(numbers, vec!["1", "2", "3"]);

        let claims = split_claims("1.A compound.\n2.一种方法。\n3.The kit of claim 1 with 1.5 mg.");
        assert_eq!(
            claims.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(claims[2].1.contains("1.5 mg"));
    }

    #[test]
    fn test_unnumbered_claims_fall_back_to_blank_lines() {
        let content = "Background.\n\nClaims\nA compound.\n\nA method of treatment.\n";
        let chunks = Chunker::default().chunk(&doc(SourceType::Patent, content));
        let claims: Vec<&DocumentChunk> = chunks
            .iter()
            .filter(|c| c.metadata.contains_key("claim_number"))
            .collect();
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[1].metadata["claim_number"], "2");
        assert_eq!(claims[1].content, "A method of treatment.");
    }

    #[test]
    fn test_chunk_ids_and_indices_are_contiguous() {
        let content = (0..12)
            .map(|i| format!("Paragraph {} talks about the compound in some detail.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = small().chunk(&doc(SourceType::Paper, &content));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.chunk_id, format!("doc-1#{}", i));
            assert_eq!(c.token_count, estimate_tokens(&c.content));
            assert_eq!(c.metadata["title"], "Kinase inhibitors");
            assert_eq!(c.metadata["language"], "en");
            assert_eq!(c.metadata["jurisdiction"], "US");
        }
    }

    #[test]
    fn test_chunks_respect_chunk_size() {
        let long_paragraph = "The compound binds the receptor. ".repeat(30);
        let chunks = small().chunk(&doc(SourceType::Paper, &long_paragraph));
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.token_count <= 20));
    }

    #[test]
    fn test_overlap_seeds_next_chunk() {
        let content = "alpha beta gamma delta epsilon zeta eta theta.\n\n\
iota kappa lambda mu nu xi omicron pi rho.\n\n\
sigma tau upsilon phi chi psi omega end.";
        let chunks = small().chunk(&doc(SourceType::Other, content));
        assert!(chunks.len() >= 2);
        let first_tail = chunks[0].content.split_whitespace().last().unwrap();
        assert!(chunks[1].content.contains(first_tail));
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let content = "段落一。包含若干句子！\n\n段落二? 还有更多内容。";
        let a = small().chunk(&doc(SourceType::Paper, content));
        let b = small().chunk(&doc(SourceType::Paper, content));
        assert_eq!(a, b);
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("First one. Second one! Version 1.5 is out? 中文句子。第二句");
        assert_eq!(
            s,
            vec![
                "First one.",
                "Second one!",
                "Version 1.5 is out?",
                "中文句子。",
                "第二句"
            ]
        );
    }

    #[test]
    fn test_claim_pattern_ignores_decimals() {
        let claims = split_claims("1. A dose of\n1.5 mg per day.\n2) A kit.");
        assert_eq!(claims.len(), 2);
        assert!(claims[0].1.contains("1.5 mg"));
        assert_eq!(claims[1].0, 2);
    }

    #[test]
    fn test_claims_marker_must_be_whole_line() {
        assert!(find_claims_start("Claims priority to a provisional.\nText").is_none());
        assert_eq!(find_claims_start("Intro\nCLAIMS:\n1. X"), Some((6, 14)));
    }
}
