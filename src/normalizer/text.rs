// Plain text decoding and fixed-width reflow

const TAB_WIDTH: usize = 4;

/// Decode bytes as UTF-8, dropping a leading byte-order mark and replacing
/// invalid sequences.
pub fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Word-wrap `text` to lines of at most `width` characters.
///
/// Source line breaks are kept, blank lines included. Words longer than the
/// width are split hard.
pub fn reflow(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();

    for source_line in text.lines() {
        let expanded = source_line.replace('\t', &" ".repeat(TAB_WIDTH));
        let mut current = String::new();
        let mut current_len = 0;

        for word in expanded.split_whitespace() {
            let word_len = word.chars().count();

            if word_len > width {
                if current_len > 0 {
                    lines.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let mut pieces = hard_split(word, width);
                // the tail of an overlong word can still take following words
                if let Some(last) = pieces.pop() {
                    lines.extend(pieces);
                    current_len = last.chars().count();
                    current = last;
                }
                continue;
            }

            let needed = if current_len == 0 { word_len } else { current_len + 1 + word_len };
            if needed > width {
                lines.push(std::mem::take(&mut current));
                current.push_str(word);
                current_len = word_len;
            } else {
                if current_len > 0 {
                    current.push(' ');
                }
                current.push_str(word);
                current_len = needed;
            }
        }

        lines.push(current);
    }

    lines
}

/// Split `line` into pieces of exactly `width` characters (the last may be
/// shorter).
pub fn hard_split(line: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let chars: Vec<char> = line.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars.chunks(width).map(|c| c.iter().collect()).collect()
}
