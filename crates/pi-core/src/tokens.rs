//! 统一的 token 估算
//!
//! 分块器、上下文预算器与提示词组装器都必须调用同一个 [`estimate_tokens`]，
//! 否则三处的预算会相互漂移。

/// CJK 字符的 token 权重
const CJK_TOKENS_PER_CHAR: f64 = 0.67;
/// 其他字符的 token 权重
const OTHER_TOKENS_PER_CHAR: f64 = 0.25;

/// 判断字符是否属于 CJK 相关区段
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF        // CJK 统一表意文字
        | 0x3400..=0x4DBF      // 扩展 A
        | 0x20000..=0x2A6DF    // 扩展 B
        | 0x2A700..=0x2B73F    // 扩展 C
        | 0x2B740..=0x2B81F    // 扩展 D
        | 0x2B820..=0x2CEAF    // 扩展 E
        | 0x2CEB0..=0x2EBEF    // 扩展 F
        | 0xF900..=0xFAFF      // 兼容表意文字
        | 0x2F800..=0x2FA1F    // 兼容表意文字补充
        | 0x3000..=0x303F      // CJK 符号和标点
        | 0x3040..=0x30FF      // 平假名 / 片假名
        | 0xAC00..=0xD7AF      // 韩文音节
        | 0xFF00..=0xFFEF      // 半角及全角形式
    )
}

/// 估算文本的 token 数量
///
/// 空字符串返回 0，任何非空文本至少返回 1。
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });

    let estimate = cjk as f64 * CJK_TOKENS_PER_CHAR + other as f64 * OTHER_TOKENS_PER_CHAR;
    (estimate.ceil() as usize).max(1)
}

/// 截断后保留的句子边界字符
const BOUNDARY_CHARS: [char; 7] = ['.', '。', '!', '?', '！', '？', '\n'];

/// 估算不超过 `max_tokens` 的最长前缀所含字符数（二分查找）
pub fn longest_prefix_within(text: &str, max_tokens: usize) -> usize {
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = offsets.len() - 1;

    let (mut lo, mut hi) = (0usize, total_chars);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if estimate_tokens(&text[..offsets[mid]]) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

/// 将文本截断到 `max_tokens` 以内
///
/// 先二分出最长合规前缀，再回退到前缀后半段内最后一个句子/换行边界；
/// 找不到边界时硬截断。
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    if max_tokens == 0 {
        return String::new();
    }

    let keep = longest_prefix_within(text, max_tokens);
    let prefix: Vec<char> = text.chars().take(keep).collect();
    let half = keep / 2;

    let cut = prefix
        .iter()
        .rposition(|c| BOUNDARY_CHARS.contains(c))
        .map(|p| p + 1)
        .filter(|end| *end >= half)
        .unwrap_or(keep);

    prefix[..cut].iter().collect::<String>().trim_end().to_string()
}
