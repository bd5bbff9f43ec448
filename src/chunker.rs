//! Paragraph-aligned text chunking.
//!
//! Extracted text is split on the blank-line separator and consecutive
//! paragraphs are packed greedily into chunks of at most `max_chunk_size`
//! characters. A paragraph that is longer than the limit on its own is
//! emitted whole as a single oversized chunk rather than being cut
//! mid-sentence.
//!
//! Joining the chunk contents with [`PARAGRAPH_SEPARATOR`] gives back the
//! input byte for byte, which is why separator-only paragraphs survive as
//! (possibly empty) chunk content.

use crate::models::Chunk;

pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

const SEPARATOR_LEN: usize = 2;

/// Split `text` into ordered chunks. Pure and deterministic: the same input
/// and limit always produce the same chunks with the same ids.
pub fn chunk(text: &str, max_chunk_size: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if text.is_empty() {
        return chunks;
    }

    let mut paragraphs = text.split(PARAGRAPH_SEPARATOR);
    // split() on a non-empty string always yields at least one item
    let first = paragraphs.next().unwrap_or_default();
    let mut buffer = first.to_string();
    let mut buffer_len = first.chars().count();

    for paragraph in paragraphs {
        let len = paragraph.chars().count();

        if buffer_len + SEPARATOR_LEN + len <= max_chunk_size {
            buffer.push_str(PARAGRAPH_SEPARATOR);
            buffer.push_str(paragraph);
            buffer_len += SEPARATOR_LEN + len;
        } else {
            seal(&mut chunks, std::mem::take(&mut buffer));
            buffer.push_str(paragraph);
            buffer_len = len;
        }
    }

    seal(&mut chunks, buffer);
    chunks
}

fn seal(chunks: &mut Vec<Chunk>, content: String) {
    chunks.push(Chunk {
        id: chunks.len(),
        content,
    });
}

/// Inverse of [`chunk`].
pub fn reassemble(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join(PARAGRAPH_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    /// Every chunk fits, or it is a single paragraph that could not fit anywhere.
    fn assert_bounded(chunks: &[Chunk], max: usize) {
        for chunk in chunks {
            if char_len(&chunk.content) > max {
                assert!(
                    !chunk.content.contains(PARAGRAPH_SEPARATOR),
                    "oversized chunk {} holds more than one paragraph",
                    chunk.id
                );
            }
        }
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        for max in [1, 10, 1000] {
            assert!(chunk("", max).is_empty());
        }
    }

    #[test]
    fn test_packs_paragraphs_greedily() {
        let text = "aaaa\n\nbbbb\n\ncccc\n\ndddd";
        let chunks = chunk(text, 10);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "aaaa\n\nbbbb");
        assert_eq!(chunks[1].content, "cccc\n\ndddd");
        assert_eq!(chunks[0].id, 0);
        assert_eq!(chunks[1].id, 1);
    }

    #[test]
    fn test_long_paragraph_is_emitted_whole() {
        let long = "x".repeat(50);
        let text = format!("short\n\n{}\n\ntail", long);
        let chunks = chunk(&text, 20);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "short");
        assert_eq!(chunks[1].content, long);
        assert_eq!(chunks[2].content, "tail");
        assert_bounded(&chunks, 20);
    }

    #[test]
    fn test_single_lines_stay_in_one_paragraph() {
        let text = "line one\nline two\nline three";
        let chunks = chunk(text, 5);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
    }

    #[test]
    fn test_limit_counts_characters_not_bytes() {
        let text = "ééééé\n\nüüüüü";
        let chunks = chunk(text, 12);
        assert_eq!(chunks.len(), 1);
        let chunks = chunk(text, 11);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let samples = [
            "one paragraph",
            "a\n\nb",
            "a\n\n\nb",
            "\n\nleading separator",
            "trailing separator\n\n",
            "\n\n",
            "\n\n\n\n\n",
            "mixed\r\n\r\nline endings\n\nand  spaces \n\n end",
            "Ünïcödé paragraph\n\n第二段落\n\n🙂",
        ];

        for text in samples {
            for max in [1, 2, 3, 7, 16, 64, 4096] {
                let chunks = chunk(text, max);
                assert_eq!(reassemble(&chunks), text, "text {:?} max {}", text, max);
                assert_bounded(&chunks, max);
            }
        }
    }

    #[test]
    fn test_round_trip_on_generated_text() {
        // small deterministic LCG so the corpus is stable across runs
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        for _ in 0..200 {
            let paragraphs = next(12) as usize;
            let mut text = String::new();
            for p in 0..paragraphs {
                if p > 0 {
                    text.push_str(if next(4) == 0 { "\n\n\n" } else { "\n\n" });
                }
                let words = next(30);
                for w in 0..words {
                    if w > 0 {
                        text.push(if next(10) == 0 { '\n' } else { ' ' });
                    }
                    text.push_str(&"lorem".repeat(1 + next(3) as usize));
                }
            }

            let max = 1 + next(200) as usize;
            let chunks = chunk(&text, max);
            assert_eq!(reassemble(&chunks), text);
            assert_bounded(&chunks, max);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.id, i);
            }
            assert_eq!(chunks, chunk(&text, max));
        }
    }
}
