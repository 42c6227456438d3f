//! Process-wide canonical tokenizer.
//!
//! Token counts must agree everywhere they are used (chunk sizing, the
//! stored `token_count`, prompt budgeting, fallback usage metrics), so a
//! single `cl100k_base` encoder is initialized once and shared. Call
//! [`init`] before the HTTP server starts accepting requests to avoid a
//! first-request latency spike.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

static BPE: OnceLock<CoreBPE> = OnceLock::new();

fn bpe() -> &'static CoreBPE {
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tables are bundled"))
}

/// Eagerly load the encoder. Idempotent.
pub fn init() {
    let _ = bpe();
}

/// Count tokens in a string with the canonical encoder.
pub fn count_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}

/// Estimate the token count of a message list, including per-message
/// structural overhead (role and separators).
pub fn count_message_tokens(messages: &[crate::models::ChatMessage]) -> usize {
    let mut total = 0;
    for message in messages {
        total += 4 + count_tokens(&message.content);
    }
    total + 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_stable() {
        let text = "The minimum CET1 ratio is 4.5%.";
        assert_eq!(count_tokens(text), count_tokens(text));
        assert!(count_tokens(text) > 0);
    }

    #[test]
    fn empty_string_counts_zero() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn longer_text_counts_more() {
        let short = "capital buffer";
        let long = "capital buffer requirements for systemically important institutions";
        assert!(count_tokens(long) > count_tokens(short));
    }
}
