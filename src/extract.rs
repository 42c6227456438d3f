//! Text extraction for uploaded document binaries (PDF, DOCX, plain text).
//!
//! PDF pages are enumerated in document order and each page's text layer is
//! extracted separately so that chunks can be attributed to pages. Regulatory
//! PDFs carry front matter (cover, table of contents) that shifts the
//! physical page index relative to the printed page number, so the extractor
//! also attempts to recover the human-visible number from page content; the
//! recovered number is strictly preferred when citing.
//!
//! All output text is UTF-8 with Unix line endings. A page whose text layer
//! is empty is still emitted; the chunker drops empties.

use std::io::Read;

use crate::error::{RagError, Result};
use crate::models::FileKind;

/// Maximum decompressed bytes read from a single OOXML ZIP entry
/// (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// How many lines at each page edge are scanned for a page-number footer.
const PAGE_NUMBER_SCAN_LINES: usize = 3;

/// One extracted page.
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based position in the source file.
    pub physical_position: u32,
    /// Human-visible page number recovered from the page content, if any.
    pub recovered_page: Option<u32>,
    pub text: String,
}

/// Ordered page sequence for one document.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub pages: Vec<PageText>,
}

impl Extraction {
    /// True when no page carries any non-whitespace text.
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.text.trim().is_empty())
    }
}

/// Extract the page sequence from a document binary.
pub fn extract(bytes: &[u8], kind: FileKind) -> Result<Extraction> {
    match kind {
        FileKind::Pdf => extract_pdf(bytes),
        FileKind::Docx => extract_docx(bytes),
        FileKind::Text => extract_plain_text(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Extraction> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| RagError::ExtractionFailed(format!("unreadable PDF: {}", e)))?;

    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
        return Err(RagError::ExtractionFailed("PDF has no pages".to_string()));
    }

    let mut pages = Vec::with_capacity(page_numbers.len());
    for (position, page_no) in page_numbers.iter().enumerate() {
        // A page with a broken content stream yields empty text rather than
        // failing the whole document.
        let raw = doc.extract_text(&[*page_no]).unwrap_or_default();
        let text = normalize_line_endings(&raw);
        let recovered_page = recover_page_number(&text);
        pages.push(PageText {
            physical_position: position as u32 + 1,
            recovered_page,
            text,
        });
    }

    Ok(Extraction { pages })
}

fn extract_docx(bytes: &[u8]) -> Result<Extraction> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| RagError::ExtractionFailed(format!("unreadable DOCX: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| RagError::ExtractionFailed("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| RagError::ExtractionFailed(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(RagError::ExtractionFailed(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    let text = extract_docx_paragraphs(&doc_xml)?;
    Ok(Extraction {
        pages: vec![PageText {
            physical_position: 1,
            recovered_page: None,
            text: normalize_line_endings(&text),
        }],
    })
}

/// Collect `w:t` runs, emitting a blank line at each paragraph boundary so
/// the chunker sees paragraph structure.
fn extract_docx_paragraphs(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text_run = false;
                } else if name.as_ref() == b"p" {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(RagError::ExtractionFailed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

fn extract_plain_text(bytes: &[u8]) -> Result<Extraction> {
    let text = match String::from_utf8(bytes.to_vec()) {
        Ok(s) => s,
        // Latin-1 fallback: every byte maps to the code point of its value.
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };
    Ok(Extraction {
        pages: vec![PageText {
            physical_position: 1,
            recovered_page: None,
            text: normalize_line_endings(&text),
        }],
    })
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Recover the printed page number from the page text, scanning the first
/// and last [`PAGE_NUMBER_SCAN_LINES`] lines for, in priority order:
///
/// 1. `PAGE <n>` (case-insensitive),
/// 2. `<n>/<m>` page-of-pages footers,
/// 3. `- <n> -` dashed footers,
/// 4. an isolated numeric line.
pub fn recover_page_number(text: &str) -> Option<u32> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let mut candidates: Vec<&str> = Vec::new();
    for line in lines.iter().take(PAGE_NUMBER_SCAN_LINES) {
        candidates.push(line.trim());
    }
    let tail_start = lines.len().saturating_sub(PAGE_NUMBER_SCAN_LINES);
    for (i, line) in lines.iter().enumerate().skip(tail_start) {
        if i >= PAGE_NUMBER_SCAN_LINES {
            candidates.push(line.trim());
        }
    }

    type Matcher = fn(&str) -> Option<u32>;
    let matchers: [Matcher; 4] = [
        match_page_prefix,
        match_page_of_pages,
        match_dashed_footer,
        match_isolated_number,
    ];

    for matcher in matchers {
        for line in &candidates {
            if let Some(n) = matcher(line) {
                return Some(n);
            }
        }
    }
    None
}

fn parse_page_value(digits: &str) -> Option<u32> {
    if digits.is_empty() || digits.len() > 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u32 = digits.parse().ok()?;
    (n >= 1).then_some(n)
}

/// `PAGE <n>`, case-insensitive, as the whole line.
fn match_page_prefix(line: &str) -> Option<u32> {
    let lower = line.to_ascii_lowercase();
    let rest = lower.strip_prefix("page")?;
    let rest = rest.trim_start();
    if rest.len() == lower.len() - 4 {
        // No whitespace after the keyword ("pagexyz"): not a footer.
        return None;
    }
    parse_page_value(rest.trim())
}

/// `<n>/<m>` page-of-pages footer.
fn match_page_of_pages(line: &str) -> Option<u32> {
    let (left, right) = line.split_once('/')?;
    let n = parse_page_value(left.trim())?;
    parse_page_value(right.trim())?;
    Some(n)
}

/// `- <n> -` dashed footer.
fn match_dashed_footer(line: &str) -> Option<u32> {
    let inner = line.strip_prefix('-')?.strip_suffix('-')?;
    parse_page_value(inner.trim())
}

/// A line that is nothing but a small number.
fn match_isolated_number(line: &str) -> Option<u32> {
    parse_page_value(line)
}
