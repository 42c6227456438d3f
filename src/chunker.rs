//! Token-based hierarchical chunker for regulatory text.
//!
//! Pages are concatenated into one string while recording each page's byte
//! offset; the splitter then works on byte ranges of that string, so every
//! produced chunk knows where it starts and can be attributed to the page
//! covering that offset. Splitting walks an ordered list of separators from
//! strongest (triple newline, `ARTICLE`/`Section`/`Chapitre` headings) to
//! weakest (single space), only descending a level when the stronger one
//! cannot keep pieces under the target token count. Adjacent pieces are then
//! merged up to the target size with a trailing token window replicated into
//! the next chunk.
//!
//! The chunker never fails on valid input: a document with no extractable
//! text simply produces zero chunks, which the ingestion coordinator reports
//! upstream.

use crate::config::ChunkingConfig;
use crate::extract::Extraction;
use crate::models::{ChunkMetadata, PreparedChunk};
use crate::tokenizer;

/// Split separators in descending semantic strength. The empty string is the
/// terminal level: split anywhere.
const SEPARATORS: [&str; 13] = [
    "\n\n\n",
    "\nARTICLE ",
    "\nSection ",
    "\nChapitre ",
    "\n\n",
    "\n",
    ". ",
    "! ",
    "? ",
    "; ",
    ", ",
    " ",
    "",
];

/// Keywords whose presence in a line's uppercase form marks it as a heading.
const SECTION_KEYWORDS: [&str; 13] = [
    "ARTICLE",
    "CHAPITRE",
    "SECTION",
    "TITRE",
    "PARTIE",
    "ANNEXE",
    "APPENDIX",
    "INTRODUCTION",
    "CONCLUSION",
    "DÉFINITIONS",
    "DEFINITIONS",
    "GLOSSAIRE",
    "GLOSSARY",
];

/// Maximum length of a detected section title.
const SECTION_MAX_CHARS: usize = 150;

/// Fraction of a chunk's length scanned for boundary fragment cleanup.
const BOUNDARY_FRACTION: f64 = 0.30;

struct PageBoundary {
    offset: usize,
    physical_position: u32,
    recovered_page: Option<u32>,
}

/// Split one document's extracted pages into prospective chunks.
pub fn chunk_document(
    extraction: &Extraction,
    document_name: &str,
    cfg: &ChunkingConfig,
) -> Vec<PreparedChunk> {
    let (full_text, boundaries) = concatenate_pages(extraction);
    if full_text.trim().is_empty() {
        return Vec::new();
    }

    let mut pieces = Vec::new();
    split_range(
        &full_text,
        0,
        full_text.len(),
        &SEPARATORS,
        cfg.chunk_size_tokens,
        &mut pieces,
    );

    let raw_chunks = merge_pieces(
        &full_text,
        &pieces,
        cfg.chunk_size_tokens,
        cfg.chunk_overlap_tokens,
    );

    let mut out = Vec::new();
    for (start, end) in raw_chunks {
        let Some((content, content_start)) = clean_boundaries(&full_text, start, end) else {
            continue;
        };
        let token_count = tokenizer::count_tokens(&content);
        if token_count < cfg.chunk_min_tokens {
            continue;
        }

        let boundary = page_for_offset(&boundaries, content_start);
        let (page, page_extracted) = match boundary.recovered_page {
            Some(n) => (n, true),
            None => (boundary.physical_position, false),
        };

        out.push(PreparedChunk {
            metadata: ChunkMetadata {
                page,
                page_extracted,
                physical_position: boundary.physical_position,
                section: detect_section(&content),
                document_name: document_name.to_string(),
                extra: serde_json::Map::new(),
            },
            token_count,
            content,
        });
    }
    out
}

fn concatenate_pages(extraction: &Extraction) -> (String, Vec<PageBoundary>) {
    let mut full = String::new();
    let mut boundaries = Vec::with_capacity(extraction.pages.len());
    for (i, page) in extraction.pages.iter().enumerate() {
        boundaries.push(PageBoundary {
            offset: full.len(),
            physical_position: page.physical_position,
            recovered_page: page.recovered_page,
        });
        full.push_str(&page.text);
        if i + 1 < extraction.pages.len() {
            full.push_str("\n\n");
        }
    }
    (full, boundaries)
}

fn page_for_offset(boundaries: &[PageBoundary], offset: usize) -> &PageBoundary {
    let idx = match boundaries.binary_search_by(|b| b.offset.cmp(&offset)) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    };
    &boundaries[idx]
}

/// Recursively split `full[start..end]` into pieces at or under
/// `chunk_size` tokens, preferring the strongest separator that occurs in
/// the range. Separators stay attached to the head of the following piece
/// so headings like `ARTICLE 4` open their chunk.
fn split_range(
    full: &str,
    start: usize,
    end: usize,
    seps: &[&str],
    chunk_size: usize,
    out: &mut Vec<(usize, usize)>,
) {
    let text = &full[start..end];
    if text.is_empty() {
        return;
    }
    if tokenizer::count_tokens(text) <= chunk_size {
        out.push((start, end));
        return;
    }

    let Some((sep, rest)) = seps.split_first() else {
        out.push((start, end));
        return;
    };

    if sep.is_empty() {
        hard_split(full, start, end, chunk_size, out);
        return;
    }

    // Collect split points: each occurrence of the separator starts a new
    // piece. Skip a match at offset 0 (it would produce an empty piece).
    let mut cut_points = Vec::new();
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(sep) {
        let abs = search_from + pos;
        if abs > 0 {
            cut_points.push(abs);
        }
        search_from = abs + sep.len().max(1);
        if search_from >= text.len() {
            break;
        }
    }

    if cut_points.is_empty() {
        split_range(full, start, end, rest, chunk_size, out);
        return;
    }

    let mut piece_start = start;
    for cut in cut_points {
        split_range(full, piece_start, start + cut, rest, chunk_size, out);
        piece_start = start + cut;
    }
    split_range(full, piece_start, end, rest, chunk_size, out);
}

/// Last-resort split for separator-free runs: binary-search the longest
/// char-aligned prefix that stays under the token budget.
fn hard_split(full: &str, start: usize, end: usize, chunk_size: usize, out: &mut Vec<(usize, usize)>) {
    let boundaries: Vec<usize> = full[start..end]
        .char_indices()
        .map(|(i, _)| start + i)
        .chain(std::iter::once(end))
        .collect();

    let mut from_idx = 0;
    while from_idx + 1 < boundaries.len() {
        let from = boundaries[from_idx];
        let mut lo = from_idx + 1;
        let mut hi = boundaries.len() - 1;
        // Largest boundary index whose slice fits the budget; always accept
        // at least one character to guarantee progress.
        let mut best = from_idx + 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            if tokenizer::count_tokens(&full[from..boundaries[mid]]) <= chunk_size {
                best = mid;
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }
        out.push((from, boundaries[best]));
        from_idx = best;
    }
}

/// Merge consecutive pieces into chunks bounded by `chunk_size` tokens,
/// replicating a trailing window of roughly `overlap` tokens into the next
/// chunk. Every chunk is a contiguous byte range of the full text.
fn merge_pieces(
    full: &str,
    pieces: &[(usize, usize)],
    chunk_size: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let counts: Vec<usize> = pieces
        .iter()
        .map(|&(s, e)| tokenizer::count_tokens(&full[s..e]))
        .collect();

    let mut chunks = Vec::new();
    let mut window: Vec<usize> = Vec::new(); // indices into `pieces`
    let mut window_tokens = 0usize;

    for (i, &count) in counts.iter().enumerate() {
        if !window.is_empty() && window_tokens + count > chunk_size {
            let first = window[0];
            let last = *window.last().unwrap();
            chunks.push((pieces[first].0, pieces[last].1));

            // Retain the trailing pieces that fit the overlap budget.
            while !window.is_empty()
                && (window_tokens + count > chunk_size || window_tokens > overlap)
            {
                let dropped = window.remove(0);
                window_tokens -= counts[dropped];
            }
        }
        window.push(i);
        window_tokens += count;
    }

    if let (Some(&first), Some(&last)) = (window.first(), window.last()) {
        let range = (pieces[first].0, pieces[last].1);
        // The retained overlap alone can be a strict suffix of the previous
        // chunk; emitting it again would duplicate content.
        if chunks.last() != Some(&range) {
            let covered = chunks
                .last()
                .map(|&(_, prev_end)| prev_end >= range.1)
                .unwrap_or(false);
            if !covered {
                chunks.push(range);
            }
        }
    }

    chunks
}

/// Drop dangling sentence fragments at chunk edges. Returns the cleaned
/// content and the byte offset its first character had in the full text,
/// or `None` when nothing survives.
fn clean_boundaries(full: &str, start: usize, end: usize) -> Option<(String, usize)> {
    let mut s = start;
    let mut e = end;

    // Skip leading whitespace before inspecting the first character.
    while s < e && full[s..].starts_with(|c: char| c.is_whitespace()) {
        s += full[s..].chars().next().map(char::len_utf8).unwrap_or(1);
    }
    if s >= e {
        return None;
    }

    let len = e - s;
    let head_window = floor_char_boundary(
        full,
        (s + ((len as f64 * BOUNDARY_FRACTION) as usize).max(1)).min(e),
    );
    let first_char = full[s..].chars().next().unwrap();
    if first_char.is_lowercase() {
        if let Some(term) = find_terminator(full, s, head_window) {
            s = term + 1;
            while s < e && full[s..].starts_with(|c: char| c.is_whitespace()) {
                s += full[s..].chars().next().map(char::len_utf8).unwrap_or(1);
            }
        }
    }
    if s >= e {
        return None;
    }

    let trimmed_end = s + full[s..e].trim_end().len();
    if trimmed_end <= s {
        return None;
    }
    let last_char = full[s..trimmed_end].chars().next_back().unwrap();
    if !matches!(last_char, '.' | '!' | '?' | '\n') {
        let tail_len = trimmed_end - s;
        let tail_window = trimmed_end - ((tail_len as f64 * BOUNDARY_FRACTION) as usize).max(1);
        if let Some(term) = rfind_terminator(full, s, trimmed_end) {
            if term >= tail_window {
                e = term + 1;
            }
        }
    }

    let content = full[s..e.min(trimmed_end.max(s))].trim();
    if content.is_empty() {
        return None;
    }
    // Trimming only removes leading whitespace already skipped above, so the
    // content start offset is `s`.
    Some((content.to_string(), s))
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn find_terminator(full: &str, from: usize, to: usize) -> Option<usize> {
    full[from..to]
        .bytes()
        .position(|b| matches!(b, b'.' | b'!' | b'?'))
        .map(|p| from + p)
}

fn rfind_terminator(full: &str, from: usize, to: usize) -> Option<usize> {
    full[from..to]
        .bytes()
        .rposition(|b| matches!(b, b'.' | b'!' | b'?'))
        .map(|p| from + p)
}

/// Detect a section title among the chunk's first five non-empty lines.
pub fn detect_section(content: &str) -> Option<String> {
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()).take(5) {
        if is_numbered_heading(line)
            || contains_section_keyword(line)
            || is_decimal_heading(line)
            || is_all_caps_heading(line)
        {
            return Some(truncate_chars(line, SECTION_MAX_CHARS));
        }
    }
    None
}

/// `^[IVX\d]+[.)]\s+[A-Z]` — roman or arabic ordinal headings.
fn is_numbered_heading(line: &str) -> bool {
    let mut chars = line.chars().peekable();
    let mut ordinal_len = 0;
    while let Some(&c) = chars.peek() {
        if matches!(c, 'I' | 'V' | 'X') || c.is_ascii_digit() {
            ordinal_len += 1;
            chars.next();
        } else {
            break;
        }
    }
    if ordinal_len == 0 {
        return false;
    }
    if !matches!(chars.next(), Some('.') | Some(')')) {
        return false;
    }
    let mut saw_space = false;
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            saw_space = true;
            chars.next();
        } else {
            break;
        }
    }
    saw_space && chars.next().map(|c| c.is_uppercase()).unwrap_or(false)
}

fn contains_section_keyword(line: &str) -> bool {
    let upper = line.to_uppercase();
    SECTION_KEYWORDS.iter().any(|kw| upper.contains(kw))
}

/// `^\d+(\.\d+)*\s+[A-Z]` — decimal-numbered headings like `4.2 Own funds`.
fn is_decimal_heading(line: &str) -> bool {
    let mut rest = line;
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    rest = &rest[digits..];
    while let Some(tail) = rest.strip_prefix('.') {
        let digits = tail.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        rest = &tail[digits..];
    }
    let trimmed = rest.trim_start();
    trimmed.len() < rest.len() && trimmed.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
}

/// A line of at least ten characters, no lowercase letters, not ending in
/// a period — typical all-caps headings.
fn is_all_caps_heading(line: &str) -> bool {
    line.chars().count() >= 10
        && line.chars().any(|c| c.is_alphabetic())
        && !line.chars().any(|c| c.is_lowercase())
        && !line.ends_with('.')
}

fn truncate_chars(line: &str, max: usize) -> String {
    line.chars().take(max).collect()
}
