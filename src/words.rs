//! Word reconciliation
//!
//! Turns raw recognition candidates into displayable words with stable ids
//! and overlay colors.

use serde::Serialize;
use uuid::Uuid;

use crate::vision::{BoundingBox, WordCandidate};

/// Overlay colors, assigned round-robin in word order
pub const PALETTE: [&str; 10] = [
    "#FD3419", "#4AA7FF", "#8AD97F", "#FFB84D", "#B07CFF", "#00C4B3", "#FF6FB5", "#C9D14A",
    "#5B6CFF", "#FF8A3D",
];

/// A recognized word with a stable identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word {
    pub id: Uuid,
    pub bbox: BoundingBox,
    /// Text tokens in reading order
    pub tokens: Vec<String>,
    pub confidence: f32,
    /// Hex overlay color
    pub color: &'static str,
    /// Highlighted in the list and on the image
    pub is_active: bool,
}

impl Word {
    /// Tokens joined with spaces
    pub fn text(&self) -> String {
        self.tokens.join(" ")
    }
}

/// Assign ids and colors to candidates, preserving their order
pub fn reconcile(candidates: Vec<WordCandidate>) -> Vec<Word> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| Word {
            id: Uuid::new_v4(),
            bbox: candidate.bbox,
            tokens: candidate.tokens,
            confidence: candidate.confidence,
            color: PALETTE[index % PALETTE.len()],
            is_active: false,
        })
        .collect()
}

/// Scroll target for one entry of the word list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHandle {
    pub index: usize,
    pub id: Uuid,
}

/// One handle per word, in list order
pub fn field_handles(words: &[Word]) -> Vec<FieldHandle> {
    words
        .iter()
        .enumerate()
        .map(|(index, word)| FieldHandle { index, id: word.id })
        .collect()
}

/// List position of the word with `id`
pub fn position_of(words: &[Word], id: Uuid) -> Option<usize> {
    words.iter().position(|word| word.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn candidate(text: &str, y: f32) -> WordCandidate {
        WordCandidate {
            bbox: BoundingBox::new(0.1, y, 0.5, y + 0.05),
            tokens: vec![text.to_string()],
            confidence: 0.8,
        }
    }

    #[test]
    fn test_two_candidates() {
        let words = reconcile(vec![candidate("A", 0.1), candidate("B", 0.3)]);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text(), "A");
        assert_eq!(words[1].text(), "B");
        assert_ne!(words[0].id, words[1].id);
        assert_ne!(words[0].color, words[1].color);
        assert!(words.iter().all(|w| !w.is_active));
    }

    #[test]
    fn test_colors_wrap_around_palette() {
        let candidates = (0..PALETTE.len() + 2)
            .map(|i| candidate(&i.to_string(), 0.0))
            .collect();
        let words = reconcile(candidates);
        assert_eq!(words[0].color, PALETTE[0]);
        assert_eq!(words[PALETTE.len()].color, PALETTE[0]);
        assert_eq!(words[PALETTE.len() + 1].color, PALETTE[1]);
    }

    #[test]
    fn test_reconcile_keeps_order_and_duplicates() {
        let input = vec![candidate("same", 0.1), candidate("same", 0.1), candidate("other", 0.5)];
        let first = reconcile(input.clone());
        let second = reconcile(input);

        let texts = |words: &[Word]| words.iter().map(Word::text).collect::<Vec<_>>();
        assert_eq!(texts(&first), vec!["same", "same", "other"]);
        assert_eq!(texts(&first), texts(&second));

        // Fresh ids on every call
        let ids: HashSet<_> = first.iter().chain(second.iter()).map(|w| w.id).collect();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(reconcile(Vec::new()).is_empty());
        assert!(field_handles(&[]).is_empty());
    }

    #[test]
    fn test_field_handles_and_lookup() {
        let words = reconcile(vec![candidate("x", 0.1), candidate("y", 0.2), candidate("z", 0.3)]);
        let handles = field_handles(&words);
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[2], FieldHandle { index: 2, id: words[2].id });

        assert_eq!(position_of(&words, words[1].id), Some(1));
        assert_eq!(position_of(&words, Uuid::new_v4()), None);
    }
}
