//! Sentence and word arithmetic for the editing protocol.
//!
//! A *sentence* is a maximal run of text terminated by exactly one of
//! `.` `!` `?` (or by the end of the document). A delimiter that touches
//! another delimiter does not terminate anything: runs like `...` stay
//! inside their sentence as ordinary word material. Whitespace between
//! sentences belongs to neither. A *word* is a maximal run of
//! non-whitespace characters within a sentence.
//!
//! Sentences keep their trailing terminator, so joining the parsed list
//! with single spaces reproduces the document modulo whitespace; parsing
//! is a left-inverse of that join.

/// Sentence-terminating characters.
const DELIMITERS: [char; 3] = ['.', '!', '?'];

fn is_delimiter(c: char) -> bool {
    DELIMITERS.contains(&c)
}

/// True when the sentence ends with a terminator, which is what makes the
/// slot after it appendable.
pub fn is_terminated(sentence: &str) -> bool {
    sentence.chars().next_back().is_some_and(is_delimiter)
}

/// Splits a document into sentences.
///
/// A delimiter is a boundary only when neither neighbour is a delimiter;
/// the boundary character stays with its sentence. Inter-sentence
/// whitespace is eaten. A trailing non-terminated run counts as one final
/// sentence.
pub fn parse_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if current.is_empty() && c.is_whitespace() {
            continue;
        }
        current.push(c);
        if is_delimiter(c) {
            let prev_delim = i > 0 && is_delimiter(chars[i - 1]);
            let next_delim = i + 1 < chars.len() && is_delimiter(chars[i + 1]);
            if !prev_delim && !next_delim {
                sentences.push(std::mem::take(&mut current));
            }
        }
    }
    let trailing = current.trim_end();
    if !trailing.is_empty() {
        sentences.push(trailing.to_string());
    }
    sentences
}

/// Joins sentences back into a document with single spaces between them.
pub fn join_sentences(sentences: &[String]) -> String {
    sentences.join(" ")
}

/// Splits a sentence into its words.
pub fn words_of(sentence: &str) -> Vec<String> {
    sentence.split_whitespace().map(str::to_string).collect()
}

/// Number of words in a sentence.
pub fn word_count(sentence: &str) -> usize {
    sentence.split_whitespace().count()
}

/// Document statistics as reported by INFO: byte size, word count, and
/// character count excluding `\n` and `\r`.
pub fn document_stats(bytes: &[u8]) -> (u64, u64, u64) {
    let text = String::from_utf8_lossy(bytes);
    let words = text.split_whitespace().count() as u64;
    let chars = text.chars().filter(|&c| c != '\n' && c != '\r').count() as u64;
    (bytes.len() as u64, words, chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<String> {
        parse_sentences(text)
    }

    #[test]
    fn splits_on_single_delimiters() {
        assert_eq!(parse("Hello world. Again!"), vec!["Hello world.", "Again!"]);
    }

    #[test]
    fn keeps_delimiter_runs_inside_sentences() {
        assert_eq!(parse("Wait... what"), vec!["Wait... what"]);
        assert_eq!(parse("Really!? Yes."), vec!["Really!? Yes."]);
    }

    #[test]
    fn trailing_run_is_one_sentence() {
        assert_eq!(parse("no terminator here"), vec!["no terminator here"]);
        assert_eq!(parse("done. trailing words"), vec!["done.", "trailing words"]);
    }

    #[test]
    fn eats_inter_sentence_whitespace() {
        assert_eq!(parse("A.   B.\n\nC."), vec!["A.", "B.", "C."]);
    }

    #[test]
    fn empty_and_blank_documents_have_no_sentences() {
        assert!(parse("").is_empty());
        assert!(parse("  \n\t ").is_empty());
    }

    #[test]
    fn parse_is_left_inverse_of_join() {
        for text in ["Hello world there. Again", "One. Two! Three?", "Wait... what. Sure."] {
            let parsed = parse(text);
            assert_eq!(parse(&join_sentences(&parsed)), parsed, "round trip of {text:?}");
        }
    }

    #[test]
    fn terminator_detection() {
        assert!(is_terminated("Hello."));
        assert!(is_terminated("Hello..."));
        assert!(!is_terminated("Hello"));
        assert!(!is_terminated(""));
    }

    #[test]
    fn stats_count_words_and_visible_chars() {
        let (size, words, chars) = document_stats(b"two words\nnext line\r\n");
        assert_eq!(size, 21);
        assert_eq!(words, 4);
        // "two words" + "next line" without the line endings
        assert_eq!(chars, 18);
    }

    #[test]
    fn stats_on_empty_document() {
        assert_eq!(document_stats(b""), (0, 0, 0));
    }
}
