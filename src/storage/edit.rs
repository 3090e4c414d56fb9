//! In-memory state of one sentence editing session.
//!
//! [`EditBuffer`] holds the parsed sentence list and the index being
//! edited; the data handler drives it through the session states
//! (parse, validate, word-mutation loop, commit). The buffer is pure
//! state (locking, I/O and wire traffic stay in the handler), which is
//! what makes the mutation rules testable in isolation.
//!
//! Mutations are insert-only: a payload is tokenised on whitespace and
//! each token is inserted in order at the requested word index, shifting
//! prior occupants right. If the recomposed sentence then contains
//! sentence delimiters it is re-parsed; the first piece stays at the
//! current index and the remainder is spliced in directly after it.

use crate::protocol::ops::{OpError, OpResult, Status};
use crate::storage::sentence::{
    is_terminated, join_sentences, parse_sentences, word_count, words_of,
};

/// One open editing session over a parsed document.
#[derive(Debug)]
pub struct EditBuffer {
    sentences: Vec<String>,
    current: usize,
}

impl EditBuffer {
    /// Parses the document and validates the target sentence index.
    ///
    /// Index rules:
    /// - an empty document accepts only index 0, materialising one empty
    ///   sentence;
    /// - the index one past the end is an append slot, legal only when
    ///   the last sentence is terminated;
    /// - anything else out of range reports the last valid index (or the
    ///   count, when overshooting past the append slot) as the bound.
    pub fn open(text: &str, sentence_num: i64) -> OpResult<Self> {
        let mut sentences = parse_sentences(text);
        let count = sentences.len() as i64;
        if sentence_num < 0 {
            return Err(OpError::new(
                Status::SentenceOutOfRange,
                format!("sentence index {sentence_num} is negative"),
            )
            .with_bound(count));
        }
        if sentences.is_empty() {
            if sentence_num != 0 {
                return Err(OpError::new(
                    Status::SentenceOutOfRange,
                    "document is empty, only sentence 0 may be edited",
                )
                .with_bound(0));
            }
            sentences.push(String::new());
            return Ok(Self { sentences, current: 0 });
        }
        if sentence_num < count {
            return Ok(Self { sentences, current: sentence_num as usize });
        }
        if sentence_num == count {
            let last = sentences.last().expect("non-empty sentence list");
            if !is_terminated(last) {
                return Err(OpError::new(
                    Status::SentenceOutOfRange,
                    format!("sentence {} is not terminated yet", count - 1),
                )
                .with_bound(count - 1));
            }
            sentences.push(String::new());
            return Ok(Self { sentences, current: sentence_num as usize });
        }
        Err(OpError::new(
            Status::SentenceOutOfRange,
            format!("sentence index {sentence_num} exceeds count {count}"),
        )
        .with_bound(count))
    }

    /// Index of the sentence under edit.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Text of the sentence under edit.
    pub fn current_sentence(&self) -> &str {
        &self.sentences[self.current]
    }

    /// Word count of the sentence under edit.
    pub fn current_word_count(&self) -> usize {
        word_count(self.current_sentence())
    }

    /// Inserts the payload's tokens at `word_index`.
    ///
    /// A payload with no tokens leaves the buffer unchanged. A word index
    /// outside `0..=word_count` is a range error carrying the bound; the
    /// session continues. An insert spanning delimiters may grow the
    /// sentence list.
    pub fn insert(&mut self, word_index: i64, payload: &str) -> OpResult<()> {
        let tokens: Vec<String> = payload.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return Ok(());
        }
        let mut words = words_of(self.current_sentence());
        let bound = words.len() as i64;
        if word_index < 0 || word_index > bound {
            return Err(OpError::new(
                Status::WordOutOfRange,
                format!("word index {word_index} outside 0..={bound}"),
            )
            .with_bound(bound));
        }
        words.splice(word_index as usize..word_index as usize, tokens);
        let recomposed = words.join(" ");

        let mut pieces = parse_sentences(&recomposed);
        if pieces.is_empty() {
            pieces.push(String::new());
        }
        self.sentences[self.current] = pieces.remove(0);
        if !pieces.is_empty() {
            let splice_at = self.current + 1;
            self.sentences.splice(splice_at..splice_at, pieces);
        }
        Ok(())
    }

    /// The full document as committed: sentences joined by single spaces
    /// with a trailing newline (empty when nothing was ever written).
    pub fn document(&self) -> String {
        let joined = join_sentences(&self.sentences);
        let body = joined.trim_end();
        if body.is_empty() {
            String::new()
        } else {
            format!("{body}\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_materialises_sentence_zero() {
        let buf = EditBuffer::open("", 0).expect("open empty");
        assert_eq!(buf.current_sentence(), "");
        assert_eq!(buf.current_word_count(), 0);
    }

    #[test]
    fn empty_document_rejects_other_indices() {
        let err = EditBuffer::open("", 1).expect_err("index 1 on empty");
        assert_eq!(err.status, Status::SentenceOutOfRange);
        assert_eq!(err.bound, Some(0));
    }

    #[test]
    fn append_slot_requires_terminated_predecessor() {
        let err = EditBuffer::open("Hello world", 1).expect_err("append after open sentence");
        assert_eq!(err.status, Status::SentenceOutOfRange);
        assert_eq!(err.bound, Some(0));

        let buf = EditBuffer::open("Hello world.", 1).expect("append after terminator");
        assert_eq!(buf.current_sentence(), "");
    }

    #[test]
    fn overshoot_reports_the_count() {
        let err = EditBuffer::open("One. Two.", 5).expect_err("overshoot");
        assert_eq!(err.status, Status::SentenceOutOfRange);
        assert_eq!(err.bound, Some(2));
    }

    #[test]
    fn negative_index_is_out_of_range() {
        let err = EditBuffer::open("One.", -1).expect_err("negative");
        assert_eq!(err.status, Status::SentenceOutOfRange);
    }

    #[test]
    fn insert_appends_at_word_count() {
        let mut buf = EditBuffer::open("Hello world", 0).expect("open");
        buf.insert(2, "again").expect("append word");
        assert_eq!(buf.current_sentence(), "Hello world again");
        assert_eq!(buf.current_word_count(), 3);
    }

    #[test]
    fn insert_shifts_right_never_replaces() {
        let mut buf = EditBuffer::open("a c", 0).expect("open");
        buf.insert(1, "b").expect("insert middle");
        assert_eq!(buf.current_sentence(), "a b c");
    }

    #[test]
    fn insert_with_delimiter_splits_the_sentence() {
        // The worked example: "Hello world" + {index 2, "there. Again"}.
        let mut buf = EditBuffer::open("Hello world", 0).expect("open");
        buf.insert(2, "there. Again").expect("splitting insert");
        assert_eq!(buf.current_sentence(), "Hello world there.");
        assert_eq!(buf.current_word_count(), 3);
        assert_eq!(buf.document(), "Hello world there. Again\n");
    }

    #[test]
    fn insert_spanning_multiple_delimiters_grows_the_list() {
        let mut buf = EditBuffer::open("start", 0).expect("open");
        buf.insert(1, "one. two! three").expect("multi-delimiter insert");
        assert_eq!(buf.current_sentence(), "start one.");
        assert_eq!(buf.document(), "start one. two! three\n");
    }

    #[test]
    fn empty_payload_changes_nothing() {
        let mut buf = EditBuffer::open("Hello world.", 0).expect("open");
        buf.insert(0, "   ").expect("whitespace payload");
        assert_eq!(buf.current_sentence(), "Hello world.");
    }

    #[test]
    fn word_index_out_of_range_keeps_the_session_usable() {
        let mut buf = EditBuffer::open("Hello world", 0).expect("open");
        let err = buf.insert(3, "nope").expect_err("past the end");
        assert_eq!(err.status, Status::WordOutOfRange);
        assert_eq!(err.bound, Some(2));
        buf.insert(2, "fine").expect("session continues");
        assert_eq!(buf.current_sentence(), "Hello world fine");
    }

    #[test]
    fn edits_to_a_middle_sentence_keep_neighbours() {
        let mut buf = EditBuffer::open("One. Two three. Four.", 1).expect("open middle");
        buf.insert(1, "and").expect("insert");
        assert_eq!(buf.current_sentence(), "Two and three.");
        assert_eq!(buf.document(), "One. Two and three. Four.\n");
    }

    #[test]
    fn insert_after_a_terminator_splits_instead_of_merging() {
        let mut buf = EditBuffer::open("One. Two. Three.", 1).expect("open middle");
        buf.insert(1, "tail").expect("insert after terminator");
        assert_eq!(buf.current_sentence(), "Two.");
        assert_eq!(buf.document(), "One. Two. tail Three.\n");
    }
}
