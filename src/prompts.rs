//! Prompt templates for expansion and grounded answering.

use crate::models::{ChatMessage, Role, ScoredChunk};

/// System policy for the answering model. The citation discipline here must
/// stay in lockstep with the parser in `citations`: `[CITE:C<n>]` opens a
/// verbatim quote from source `C<n>` and `[/CITE]` closes it.
pub const SYSTEM_PROMPT: &str = "\
You are an internal assistant for a bank's risk and compliance function. You read, \
interpret, and summarise prudential regulations (ACPR, ECB, EBA, EU) and map them to \
internal policies.

Always respond in English, even when the source passages are in French or another \
language.

GROUNDING AND CITATIONS:
Answer strictly from the numbered source passages supplied below. When you quote a \
source verbatim, wrap the quoted words as [CITE:C<n>]quoted words[/CITE], where C<n> \
is the identifier of the passage the words come from. The quote between the markers \
must be copied character-for-character from that passage. Do not cite passages that \
were not supplied. Do not nest citation markers.

For complex questions involving several mechanisms or interacting requirements, write \
800-1200 words and include 6-10 citations. For simple factual questions, write \
300-500 words and include 2-4 citations.

If the passages do not contain the answer, say so plainly instead of speculating.

Be precise and professional, and focus on actionable compliance insight.";

/// Instructional prompt for hypothetical-document expansion. The model
/// writes a short passage in the corpus register; embedding that passage
/// lands the query vector in the document region of the space.
pub fn expansion_prompt(question: &str) -> String {
    format!(
        "Write a 3-4 sentence excerpt, as if taken from a banking regulation or an \
         internal compliance policy, that would contain the answer to the question \
         below. Use the formal terminology such a document would use. Do not address \
         the reader, do not mention the question, output only the excerpt.\n\n\
         Question: {}",
        question
    )
}

/// Render the retrieved passages as the context block, one labelled source
/// per passage: `Source C<n>: [name, p.<page>, §<section>]`.
pub fn context_block(chunks: &[ScoredChunk]) -> String {
    let mut block = String::new();
    for (i, scored) in chunks.iter().enumerate() {
        let meta = &scored.chunk.metadata;
        block.push_str(&format!(
            "Source C{}: [{}, p.{}",
            i + 1,
            meta.document_name,
            meta.page
        ));
        if let Some(section) = &meta.section {
            block.push_str(&format!(", §{}", section));
        }
        block.push_str("]\n");
        block.push_str(&scored.chunk.content);
        block.push_str("\n\n");
    }
    block
}

/// Assemble the full message list: system policy, trimmed history, then the
/// context block and question as the final user turn.
pub fn build_messages(
    question: &str,
    history: &[ChatMessage],
    chunks: &[ScoredChunk],
    history_turns: usize,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage {
        role: Role::System,
        content: SYSTEM_PROMPT.to_string(),
    }];

    let keep = history.len().saturating_sub(history_turns);
    for turn in &history[keep..] {
        messages.push(turn.clone());
    }

    messages.push(ChatMessage {
        role: Role::User,
        content: format!(
            "Context from regulatory documents and policies:\n\n{}\
             User question: {}\n\n\
             Answer from the context above, marking verbatim quotes with the \
             [CITE:C<n>]...[/CITE] form.",
            context_block(chunks),
            question
        ),
    });

    messages
}

/// Canned reply when retrieval finds nothing relevant.
pub const NO_CONTEXT_ANSWER: &str = "I couldn't find any relevant information in the \
uploaded documents to answer your question. Please make sure the relevant documents \
have been uploaded, or try rephrasing the question.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};
    use uuid::Uuid;

    fn scored(name: &str, page: u32, section: Option<&str>, content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                chunk_index: 0,
                content: content.to_string(),
                token_count: 10,
                embedding: vec![],
                metadata: ChunkMetadata {
                    page,
                    page_extracted: true,
                    physical_position: page,
                    section: section.map(|s| s.to_string()),
                    document_name: name.to_string(),
                    extra: serde_json::Map::new(),
                },
            },
            score: 1.0,
            similarity: 1.0,
        }
    }

    #[test]
    fn context_block_labels_sources_in_order() {
        let chunks = vec![
            scored("crr.pdf", 12, Some("Article 92"), "First passage."),
            scored("crd.pdf", 3, None, "Second passage."),
        ];
        let block = context_block(&chunks);
        assert!(block.contains("Source C1: [crr.pdf, p.12, §Article 92]"));
        assert!(block.contains("Source C2: [crd.pdf, p.3]"));
        let c1 = block.find("Source C1").unwrap();
        let c2 = block.find("Source C2").unwrap();
        assert!(c1 < c2);
    }

    #[test]
    fn history_is_trimmed_to_last_turns() {
        let history: Vec<ChatMessage> = (0..10)
            .map(|i| ChatMessage {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("turn {}", i),
            })
            .collect();
        let chunks = vec![scored("a.pdf", 1, None, "Passage.")];
        let messages = build_messages("question?", &history, &chunks, 4);

        // System + 4 history turns + final user turn.
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[1].content, "turn 6");
        assert!(messages.last().unwrap().content.contains("question?"));
    }

    #[test]
    fn expansion_prompt_embeds_question() {
        let prompt = expansion_prompt("What is the minimum CET1 ratio?");
        assert!(prompt.contains("What is the minimum CET1 ratio?"));
        assert!(prompt.contains("3-4 sentence"));
    }
}
