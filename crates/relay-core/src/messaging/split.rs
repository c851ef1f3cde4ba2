/// Split `text` into chunks of at most `max_chars` characters.
///
/// A chunk ends after the last newline that fits, else after the last
/// whitespace, else at the character limit. Separators stay attached to the
/// chunk they end, so the chunks concatenate back to `text` exactly.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        // Byte offset just past the first `max_chars` characters, if the rest is longer.
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest.to_string());
            break;
        };
        let window = &rest[..limit];

        let cut = window
            .rfind('\n')
            .map(|i| i + 1)
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(i, c)| i + c.len_utf8())
            })
            .unwrap_or(limit);

        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid(text: &str, max: usize) -> Vec<String> {
        let chunks = split_message(text, max);
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            assert!(c.chars().count() <= max, "chunk too long: {c:?}");
            assert!(!c.is_empty());
        }
        chunks
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
        assert!(split_message("", 10).is_empty());
    }

    #[test]
    fn prefers_newline_then_whitespace() {
        let chunks = assert_valid("first line\nsecond line here", 15);
        assert_eq!(chunks[0], "first line\n");

        let chunks = assert_valid("alpha beta gamma", 12);
        assert_eq!(chunks, vec!["alpha beta ", "gamma"]);
    }

    #[test]
    fn hard_splits_without_separators() {
        let chunks = assert_valid(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "xxxxx");
    }

    #[test]
    fn never_splits_inside_a_character() {
        let text = "é".repeat(7) + "日本語テキスト";
        let chunks = assert_valid(&text, 4);
        assert_eq!(chunks[0], "éééé");
    }

    #[test]
    fn long_reply_fits_telegram_limit() {
        let para = "word ".repeat(300) + "\n";
        let text = para.repeat(10);
        let chunks = assert_valid(&text, 4000);
        assert!(chunks.len() >= 4);
    }
}
