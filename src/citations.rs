//! Citation sentinel parsing and groundedness validation.
//!
//! The answer model marks verbatim quotes as `[CITE:C<n>]quoted text[/CITE]`,
//! where `C<n>` identifies one of the passages supplied in the prompt. This
//! module owns the three operations built on that form:
//!
//! - **Parsing** the streamed text into `(id, span)` pairs, rejecting nested
//!   markers and tolerating malformed ones (treated as plain text).
//! - **Hold-back** for the streaming path: computing how much of a text
//!   buffer must be withheld because its tail could still turn into a
//!   sentinel, so markers are never split across emitted events.
//! - **Validation** of each span against its referenced passage: verbatim
//!   containment modulo whitespace, else a best-window word-level
//!   subsequence ratio with the extra requirement that every numeric token
//!   of the span occurs in the passage. Numbers are what regulatory answers
//!   get wrong first, so a paraphrase that drifts on a figure is rejected
//!   no matter how close the rest is.

const OPEN_PREFIX: &str = "[CITE:C";
const CLOSE: &str = "[/CITE]";
const MAX_ID_DIGITS: usize = 6;

/// A citation parsed out of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCitation {
    /// 1-based passage identifier (the `n` of `C<n>`).
    pub id: usize,
    pub span: String,
}

/// How a span matched its referenced passage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CitationMatch {
    Exact,
    /// Accepted by similarity; carries the best-window ratio.
    Fuzzy(f64),
    Invalid,
}

/// Extract all well-formed citations, in order of appearance.
///
/// A `[CITE:C<n>]` whose body runs into another open marker before its
/// close is rejected as nested: the outer marker is treated as plain text
/// and scanning resumes at the inner one.
pub fn extract_citations(text: &str) -> Vec<ParsedCitation> {
    let mut out = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find(OPEN_PREFIX) {
        let open_at = cursor + rel;
        let Some((id, body_start)) = parse_open_marker(&text[open_at..]) else {
            cursor = open_at + 1;
            continue;
        };
        let body_start = open_at + body_start;

        let close_rel = text[body_start..].find(CLOSE);
        let inner_rel = text[body_start..].find(OPEN_PREFIX);

        match (close_rel, inner_rel) {
            (Some(close), inner) if inner.map(|i| close < i).unwrap_or(true) => {
                let span = text[body_start..body_start + close].trim();
                if !span.is_empty() {
                    out.push(ParsedCitation {
                        id,
                        span: span.to_string(),
                    });
                }
                cursor = body_start + close + CLOSE.len();
            }
            (_, Some(inner)) => {
                // Nested open marker: drop the outer, rescan at the inner.
                cursor = body_start + inner;
            }
            (None, None) => break,
            (Some(_), None) => unreachable!("guard above is always true when inner is None"),
        }
    }

    out
}

/// Parse `[CITE:C<digits>]` at the start of `text`. Returns the id and the
/// byte offset just past the closing bracket.
fn parse_open_marker(text: &str) -> Option<(usize, usize)> {
    let rest = text.strip_prefix(OPEN_PREFIX)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > MAX_ID_DIGITS {
        return None;
    }
    if !rest[digits.len()..].starts_with(']') {
        return None;
    }
    let id: usize = digits.parse().ok()?;
    (id >= 1).then_some((id, OPEN_PREFIX.len() + digits.len() + 1))
}

/// Number of trailing bytes of `buffer` that must be withheld from emission
/// because they could still be the start of a sentinel marker.
pub fn hold_back_len(buffer: &str) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    // A sentinel prefix is at most "[CITE:C" + digits; scan only a bounded
    // tail for the last open bracket.
    let window_start = buffer.len().saturating_sub(OPEN_PREFIX.len() + MAX_ID_DIGITS + 2);
    let tail_start = (window_start..=buffer.len().saturating_sub(1))
        .rev()
        .filter(|&i| buffer.is_char_boundary(i))
        .find(|&i| buffer.as_bytes()[i] == b'[');

    let Some(bracket) = tail_start else { return 0 };
    let suffix = &buffer[bracket..];
    if could_become_sentinel(suffix) {
        buffer.len() - bracket
    } else {
        0
    }
}

/// True when `suffix` (which starts with `[`) is a proper prefix of an open
/// or close marker — i.e. more input could complete it.
fn could_become_sentinel(suffix: &str) -> bool {
    // Proper prefix of the close marker.
    if suffix.len() < CLOSE.len() && CLOSE.starts_with(suffix) {
        return true;
    }
    // Proper prefix of "[CITE:C".
    if suffix.len() < OPEN_PREFIX.len() {
        return OPEN_PREFIX.starts_with(suffix);
    }
    // "[CITE:C" followed by digits still awaiting the closing bracket.
    if let Some(rest) = suffix.strip_prefix(OPEN_PREFIX) {
        return rest.len() <= MAX_ID_DIGITS && rest.bytes().all(|b| b.is_ascii_digit());
    }
    false
}

/// Validate a cited span against the passage it references.
pub fn validate_span(span: &str, passage: &str, fuzzy_accept: f64) -> CitationMatch {
    let span_norm = normalize_whitespace(span);
    let passage_norm = normalize_whitespace(passage);
    if span_norm.is_empty() {
        return CitationMatch::Invalid;
    }

    if passage_norm.contains(&span_norm) {
        return CitationMatch::Exact;
    }

    // Every numeric token of the span must appear in the passage; a close
    // paraphrase with a drifted figure is a hallucination, not a fuzz.
    let passage_words: Vec<&str> = passage_norm.split(' ').collect();
    for word in span_norm.split(' ') {
        if word.bytes().any(|b| b.is_ascii_digit()) && !passage_words.contains(&word) {
            return CitationMatch::Invalid;
        }
    }

    let ratio = best_window_ratio(&span_norm, &passage_norm);
    if ratio >= fuzzy_accept {
        CitationMatch::Fuzzy(ratio)
    } else {
        CitationMatch::Invalid
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best word-level subsequence ratio between the span and any span-sized
/// window of the passage.
fn best_window_ratio(span: &str, passage: &str) -> f64 {
    let a: Vec<&str> = span.split(' ').collect();
    let b: Vec<&str> = passage.split(' ').collect();

    if b.len() <= a.len() {
        return subsequence_ratio(&a, &b);
    }

    let window = a.len();
    let stride = (window / 4).max(1);
    let mut best: f64 = 0.0;
    let mut start = 0;
    loop {
        let end = (start + window).min(b.len());
        best = best.max(subsequence_ratio(&a, &b[start..end]));
        if end == b.len() {
            break;
        }
        start += stride;
    }
    best
}

/// `2 * LCS / (|a| + |b|)` over word sequences.
fn subsequence_ratio(a: &[&str], b: &[&str]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for wa in a {
        for (j, wb) in b.iter().enumerate() {
            row[j + 1] = if wa == wb {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
        row.fill(0);
    }
    let lcs = prev[b.len()];
    2.0 * lcs as f64 / (a.len() + b.len()) as f64
}
