//! Dataset rows and their template-wrapped form.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Label of an example whose gold label is unknown (e.g. the CB test split).
pub const NO_LABEL: i64 = -1;

/// One dataset row: premise, hypothesis, label index and row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputExample {
    /// Row id within its split.
    pub guid: i64,
    /// Label index, or [`NO_LABEL`].
    pub label: i64,
    /// First text, the premise.
    pub text_a: String,
    /// Second text, the hypothesis.
    pub text_b: String,
}

impl InputExample {
    /// Create an example.
    pub fn new(text_a: impl Into<String>, text_b: impl Into<String>, label: i64, guid: i64) -> Self {
        Self {
            guid,
            label,
            text_a: text_a.into(),
            text_b: text_b.into(),
        }
    }

    /// Whether the example carries a gold label.
    #[must_use]
    pub fn has_label(&self) -> bool {
        self.label >= 0
    }
}

impl fmt::Display for InputExample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// One slot of a wrapped example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedPiece {
    /// Literal text (empty for soft and mask slots).
    pub text: String,
    /// 0 for ordinary text, `k` for the `k`-th soft embedding row.
    pub soft_token_id: u32,
    /// Whether the slot is the prediction position.
    pub is_mask: bool,
    /// Whether truncation may remove tokens from this slot.
    pub shortenable: bool,
}

impl WrappedPiece {
    /// Literal text slot.
    pub fn text(text: impl Into<String>, shortenable: bool) -> Self {
        Self {
            text: text.into(),
            soft_token_id: 0,
            is_mask: false,
            shortenable,
        }
    }

    /// Soft slot bound to row `soft_token_id` of the soft embedding.
    #[must_use]
    pub fn soft(soft_token_id: u32) -> Self {
        Self {
            text: String::new(),
            soft_token_id,
            is_mask: false,
            shortenable: false,
        }
    }

    /// Mask slot.
    #[must_use]
    pub fn mask() -> Self {
        Self {
            text: String::new(),
            soft_token_id: 0,
            is_mask: true,
            shortenable: false,
        }
    }

    /// Whether the slot is a soft token.
    #[must_use]
    pub fn is_soft(&self) -> bool {
        self.soft_token_id > 0
    }
}

/// An example after template binding: ordered slots plus label and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedExample {
    /// Slots in template order.
    pub pieces: Vec<WrappedPiece>,
    /// Label index carried over from the example.
    pub label: i64,
    /// Row id carried over from the example.
    pub guid: i64,
}

impl WrappedExample {
    /// Number of soft slots.
    #[must_use]
    pub fn num_soft(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_soft()).count()
    }

    /// Number of mask slots.
    #[must_use]
    pub fn num_masks(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_mask).count()
    }
}

impl fmt::Display for WrappedExample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, piece) in self.pieces.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if piece.is_mask {
                write!(f, "<mask>")?;
            } else if piece.is_soft() {
                write!(f, "<soft:{}>", piece.soft_token_id)?;
            } else {
                write!(f, "{:?}", piece.text)?;
            }
        }
        write!(f, "] label={} guid={}", self.label, self.guid)
    }
}
