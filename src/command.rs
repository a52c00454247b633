//! Client commands, key spans, and the interference relation.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Abstract key in the keyspace. Keys are opaque byte strings compared
/// lexicographically.
pub type Key = Vec<u8>;

/// Unique client-assigned command identifier.
pub type CommandId = u64;

/// Span of keys covered by a command: either a single key (empty `end_key`)
/// or the half-open range `[key, end_key)`.
#[derive(
    Debug, PartialEq, Eq, Default, Clone, Serialize, Deserialize, Hash,
)]
pub struct Span {
    /// Start key, or the single key addressed if `end_key` is empty.
    pub key: Key,

    /// Exclusive end key; empty for a single-key span.
    pub end_key: Key,
}

impl Span {
    /// Creates a single-key span.
    pub fn point(key: impl Into<Key>) -> Self {
        Span {
            key: key.into(),
            end_key: Key::new(),
        }
    }

    /// Creates a half-open `[key, end_key)` span.
    pub fn range(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Span {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    /// Returns whether the two spans overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        if self.end_key.is_empty() && other.end_key.is_empty() {
            self.key == other.key
        } else if self.end_key.is_empty() {
            self.key >= other.key && self.key < other.end_key
        } else if other.end_key.is_empty() {
            other.key >= self.key && other.key < self.end_key
        } else {
            self.end_key > other.key && self.key < other.end_key
        }
    }

    /// Materializes the span as a half-open key range. A single-key span
    /// `[k]` becomes `[k, k+\0)` so that it composes with range groups.
    pub(crate) fn as_range(&self) -> Range<Key> {
        let end = if self.end_key.is_empty() {
            let mut end = self.key.clone();
            end.push(0);
            end
        } else {
            self.end_key.clone()
        };
        self.key.clone()..end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.end_key.is_empty() {
            write!(f, "[{}]", String::from_utf8_lossy(&self.key))
        } else {
            write!(
                f,
                "[{}-{})",
                String::from_utf8_lossy(&self.key),
                String::from_utf8_lossy(&self.end_key)
            )
        }
    }
}

/// A client-submitted operation to be ordered by the replication protocol.
/// The `data` payload is opaque to the core; only the span and the writing
/// flag participate in interference checks.
#[derive(
    Debug, PartialEq, Eq, Default, Clone, Serialize, Deserialize, Hash,
)]
pub struct Command {
    /// Globally unique command identifier.
    pub id: CommandId,

    /// Key span addressed by this command.
    pub span: Span,

    /// Whether this command mutates state.
    pub writing: bool,

    /// Opaque payload interpreted by the application state machine.
    pub data: Vec<u8>,
}

impl Command {
    /// Returns whether the two commands interfere: at least one of them is
    /// writing and their spans overlap. Read-read pairs never interfere.
    pub fn interferes(&self, other: &Command) -> bool {
        (self.writing || other.writing) && self.span.overlaps(&other.span)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prefix = if self.writing { "writing" } else { "reading" };
        write!(f, "{{{:#x} {} {}}}", self.id, prefix, self.span)
    }
}

#[cfg(test)]
mod command_tests {
    use super::*;

    #[test]
    fn span_overlaps() {
        let s_a = Span::point("a");
        let s_d = Span::point("d");
        let s_a_to_c = Span::range("a", "c");
        let s_b_to_d = Span::range("b", "d");

        for (s1, s2, overlaps) in [
            (&s_a, &s_a, true),
            (&s_a, &s_d, false),
            (&s_a, &s_b_to_d, false),
            (&s_d, &s_b_to_d, false),
            (&s_a, &s_a_to_c, true),
            (&s_a_to_c, &s_a_to_c, true),
            (&s_a_to_c, &s_b_to_d, true),
        ] {
            assert_eq!(s1.overlaps(s2), overlaps, "{} vs. {}", s1, s2);
            assert_eq!(s2.overlaps(s1), overlaps, "{} vs. {}", s2, s1);
        }
    }

    #[test]
    fn command_interferes() {
        let cmd = |writing, span: &Span| Command {
            id: 0,
            span: span.clone(),
            writing,
            data: vec![],
        };
        let s_a = Span::point("a");
        let s_d = Span::point("d");
        let s_a_to_c = Span::range("a", "c");
        let s_b_to_d = Span::range("b", "d");

        let r_a = cmd(false, &s_a);
        let w_a = cmd(true, &s_a);
        let r_d = cmd(false, &s_d);
        let w_d = cmd(true, &s_d);
        let r_a_to_c = cmd(false, &s_a_to_c);
        let w_a_to_c = cmd(true, &s_a_to_c);
        let r_b_to_d = cmd(false, &s_b_to_d);
        let w_b_to_d = cmd(true, &s_b_to_d);

        for (c1, c2, interferes) in [
            (&r_a, &r_a, false),
            (&r_a, &w_a, true),
            (&r_a, &r_d, false),
            (&r_a, &w_d, false),
            (&r_a, &r_b_to_d, false),
            (&r_a, &w_b_to_d, false),
            (&r_a, &r_a_to_c, false),
            (&r_a, &w_a_to_c, true),
            (&w_a, &w_a, true),
            (&w_a, &r_d, false),
            (&w_a, &w_d, false),
            (&w_a, &r_b_to_d, false),
            (&w_a, &w_b_to_d, false),
            (&w_a, &r_a_to_c, true),
            (&w_a, &w_a_to_c, true),
        ] {
            assert_eq!(c1.interferes(c2), interferes, "{} vs. {}", c1, c2);
            assert_eq!(c2.interferes(c1), interferes, "{} vs. {}", c2, c1);
        }
    }

    #[test]
    fn span_as_range() {
        let point = Span::point("k");
        let range = point.as_range();
        assert_eq!(range.start, b"k".to_vec());
        assert_eq!(range.end, b"k\0".to_vec());

        let wide = Span::range("a", "z").as_range();
        assert_eq!(wide.start, b"a".to_vec());
        assert_eq!(wide.end, b"z".to_vec());
    }
}
