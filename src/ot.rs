//! The operational-transform engine.
//!
//! Everything in here is pure and deterministic: a [`Bundle`] is a normalized
//! sequence of retain/insert/delete steps that rewrites one document state
//! into another, and the free functions relate bundles to each other so that
//! concurrent edits converge.
//!
//! All positions and lengths are UTF-16 code units, matching what editors
//! report. Splitting a surrogate pair is an error, not a panic.

use std::cmp::Ordering;

use dissimilar::Chunk;
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A single step of a [`Bundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextOperation {
    /// Advance over `n` existing code units.
    Retain(usize),
    /// Insert the string at the current position.
    Insert(String),
    /// Remove `n` code units ahead of the current position.
    Delete(usize),
}

/// Which side's insert is ordered first when two bundles insert at the same
/// position. [`TieBreak::Left`] gives the first `transform` argument
/// priority; the document coordinator passes the already-accepted server
/// operation there, which is how the server wins ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    Left,
    Right,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("bundle applies to length {expected}, but the text has length {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("operation boundary at code unit {0} splits a surrogate pair")]
    SurrogateBoundary(usize),
    #[error("cannot compose: first bundle produces length {produced}, second consumes {consumed}")]
    ComposeMismatch { produced: usize, consumed: usize },
    #[error("cannot transform bundles with base lengths {left} and {right}")]
    TransformMismatch { left: usize, right: usize },
}

/// A normalized operation sequence.
///
/// The builder methods keep the normal form as an invariant: no zero-length
/// steps, no two consecutive steps of the same tag, and an insert directly
/// adjacent to a delete is always ordered insert-first. `base_len` and
/// `target_len` are maintained incrementally so validation is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bundle {
    ops: Vec<TextOperation>,
    base_len: usize,
    target_len: usize,
}

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Splits `s` after `n` UTF-16 code units.
fn split_at_utf16(s: &str, n: usize) -> Result<(&str, &str), OtError> {
    let mut units = 0;
    for (index, c) in s.char_indices() {
        match units.cmp(&n) {
            Ordering::Equal => return Ok(s.split_at(index)),
            Ordering::Greater => return Err(OtError::SurrogateBoundary(n)),
            Ordering::Less => units += c.len_utf16(),
        }
    }
    match units.cmp(&n) {
        Ordering::Equal => Ok((s, "")),
        Ordering::Greater => Err(OtError::SurrogateBoundary(n)),
        Ordering::Less => Err(OtError::LengthMismatch {
            expected: n,
            actual: units,
        }),
    }
}

impl Bundle {
    pub fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(TextOperation::Retain(m)) = self.ops.last_mut() {
            *m += n;
        } else {
            self.ops.push(TextOperation::Retain(n));
        }
    }

    pub fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(TextOperation::Delete(m)) = self.ops.last_mut() {
            *m += n;
        } else {
            self.ops.push(TextOperation::Delete(n));
        }
    }

    pub fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.target_len += utf16_len(s);
        match self.ops.as_mut_slice() {
            [.., TextOperation::Insert(prev)] => prev.push_str(s),
            [.., TextOperation::Insert(prev), TextOperation::Delete(_)] => prev.push_str(s),
            [.., last @ TextOperation::Delete(_)] => {
                let delete = std::mem::replace(last, TextOperation::Insert(s.to_string()));
                self.ops.push(delete);
            }
            _ => self.ops.push(TextOperation::Insert(s.to_string())),
        }
    }

    pub fn ops(&self) -> &[TextOperation] {
        &self.ops
    }

    /// Code units the bundle consumes (sum of retains and deletes).
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Code units the bundle produces (sum of retains and inserts).
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// An empty bundle is the identity on the empty document.
    pub fn is_identity(&self) -> bool {
        self.ops.is_empty()
    }

    /// True iff the bundle only retains, i.e. changes nothing.
    pub fn is_noop(&self) -> bool {
        self.ops
            .iter()
            .all(|op| matches!(op, TextOperation::Retain(_)))
    }

    /// Rebuilds the bundle through the normalizing builder. Idempotent.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut normalized = Self::default();
        for op in &self.ops {
            match op {
                TextOperation::Retain(n) => normalized.retain(*n),
                TextOperation::Insert(s) => normalized.insert(s),
                TextOperation::Delete(n) => normalized.delete(*n),
            }
        }
        normalized
    }

    /// Whether the bundle is applicable to a text of `len` code units.
    pub fn is_valid_for(&self, len: usize) -> bool {
        self.base_len == len
    }

    /// Applies the bundle to `text`, producing the new document content.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        let actual = utf16_len(text);
        if self.base_len != actual {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }
        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        for op in &self.ops {
            match op {
                TextOperation::Retain(n) => {
                    let (kept, tail) = split_at_utf16(rest, *n)?;
                    result.push_str(kept);
                    rest = tail;
                }
                TextOperation::Delete(n) => {
                    let (_, tail) = split_at_utf16(rest, *n)?;
                    rest = tail;
                }
                TextOperation::Insert(s) => result.push_str(s),
            }
        }
        debug_assert!(rest.is_empty(), "base length accounted for all input");
        Ok(result)
    }

    /// Produces the bundle that undoes `self` when applied to its result.
    ///
    /// `text` must be the content the bundle applies to, because a delete's
    /// inverse has to re-insert the removed text:
    /// `invert(a, t).apply(a.apply(t)) == t`.
    pub fn invert(&self, text: &str) -> Result<Self, OtError> {
        let actual = utf16_len(text);
        if self.base_len != actual {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }
        let mut inverse = Self::default();
        let mut rest = text;
        for op in &self.ops {
            match op {
                TextOperation::Retain(n) => {
                    let (_, tail) = split_at_utf16(rest, *n)?;
                    inverse.retain(*n);
                    rest = tail;
                }
                TextOperation::Insert(s) => inverse.delete(utf16_len(s)),
                TextOperation::Delete(n) => {
                    let (removed, tail) = split_at_utf16(rest, *n)?;
                    inverse.insert(removed);
                    rest = tail;
                }
            }
        }
        Ok(inverse)
    }

    /// Produces a single bundle with the effect of `self` followed by
    /// `other`: `apply(apply(t, self), other) == apply(t, compose(self, other))`.
    pub fn compose(&self, other: &Self) -> Result<Self, OtError> {
        if self.target_len != other.base_len {
            return Err(OtError::ComposeMismatch {
                produced: self.target_len,
                consumed: other.base_len,
            });
        }
        let mut result = Self::default();
        let mut first = self.ops.iter().cloned();
        let mut second = other.ops.iter().cloned();
        let mut head_a = first.next();
        let mut head_b = second.next();
        loop {
            match (head_a.take(), head_b.take()) {
                (None, None) => break,
                // Deletes of the first bundle act on text the second one
                // never sees; pass them through.
                (Some(TextOperation::Delete(n)), b) => {
                    result.delete(n);
                    head_a = first.next();
                    head_b = b;
                }
                // Inserts of the second bundle are not consumed by the first.
                (a, Some(TextOperation::Insert(s))) => {
                    result.insert(&s);
                    head_a = a;
                    head_b = second.next();
                }
                (Some(TextOperation::Retain(n)), Some(TextOperation::Retain(m))) => {
                    let step = n.min(m);
                    result.retain(step);
                    head_a = leftover_or_next(n - step, &mut first);
                    head_b = leftover_or_next(m - step, &mut second);
                }
                (Some(TextOperation::Retain(n)), Some(TextOperation::Delete(m))) => {
                    let step = n.min(m);
                    result.delete(step);
                    head_a = leftover_or_next(n - step, &mut first);
                    head_b = leftover_delete_or_next(m - step, &mut second);
                }
                (Some(TextOperation::Insert(s)), Some(TextOperation::Retain(m))) => {
                    let len = utf16_len(&s);
                    if len <= m {
                        result.insert(&s);
                        head_a = first.next();
                        head_b = leftover_or_next(m - len, &mut second);
                    } else {
                        let (kept, remainder) = split_at_utf16(&s, m)?;
                        result.insert(kept);
                        head_a = Some(TextOperation::Insert(remainder.to_string()));
                        head_b = second.next();
                    }
                }
                (Some(TextOperation::Insert(s)), Some(TextOperation::Delete(m))) => {
                    let len = utf16_len(&s);
                    if len <= m {
                        head_a = first.next();
                        head_b = leftover_delete_or_next(m - len, &mut second);
                    } else {
                        let (_, remainder) = split_at_utf16(&s, m)?;
                        head_a = Some(TextOperation::Insert(remainder.to_string()));
                        head_b = second.next();
                    }
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::ComposeMismatch {
                        produced: self.target_len,
                        consumed: other.base_len,
                    });
                }
            }
        }
        Ok(result)
    }
}

fn leftover_or_next(
    leftover: usize,
    rest: &mut impl Iterator<Item = TextOperation>,
) -> Option<TextOperation> {
    if leftover == 0 {
        rest.next()
    } else {
        Some(TextOperation::Retain(leftover))
    }
}

fn leftover_delete_or_next(
    leftover: usize,
    rest: &mut impl Iterator<Item = TextOperation>,
) -> Option<TextOperation> {
    if leftover == 0 {
        rest.next()
    } else {
        Some(TextOperation::Delete(leftover))
    }
}

/// Transforms two bundles with the same base so that applying them in either
/// order converges:
///
/// ```text
///        a
///     * ----> *
///     |       |
///   b |       | b'
///     v  a'   v
///     * ----> *
/// ```
///
/// `apply(apply(t, a), b') == apply(apply(t, b), a')` for every `t` both
/// sides apply to. `tie` decides whose insert comes first when both insert
/// at the same position.
pub fn transform(a: &Bundle, b: &Bundle, tie: TieBreak) -> Result<(Bundle, Bundle), OtError> {
    if a.base_len != b.base_len {
        return Err(OtError::TransformMismatch {
            left: a.base_len,
            right: b.base_len,
        });
    }
    let mut a_prime = Bundle::default();
    let mut b_prime = Bundle::default();
    let mut left = a.ops.iter().cloned();
    let mut right = b.ops.iter().cloned();
    let mut head_a = left.next();
    let mut head_b = right.next();
    loop {
        let a_wins_insert = match (&head_a, &head_b) {
            (Some(TextOperation::Insert(_)), Some(TextOperation::Insert(_))) => {
                tie == TieBreak::Left
            }
            (Some(TextOperation::Insert(_)), _) => true,
            _ => false,
        };
        match (head_a.take(), head_b.take()) {
            (None, None) => break,
            (Some(TextOperation::Insert(s)), b_head) if a_wins_insert => {
                b_prime.retain(utf16_len(&s));
                a_prime.insert(&s);
                head_a = left.next();
                head_b = b_head;
            }
            (a_head, Some(TextOperation::Insert(s))) => {
                a_prime.retain(utf16_len(&s));
                b_prime.insert(&s);
                head_a = a_head;
                head_b = right.next();
            }
            (Some(TextOperation::Retain(n)), Some(TextOperation::Retain(m))) => {
                let step = n.min(m);
                a_prime.retain(step);
                b_prime.retain(step);
                head_a = leftover_or_next(n - step, &mut left);
                head_b = leftover_or_next(m - step, &mut right);
            }
            // Both deleted the same region; there is nothing left for either
            // transformed bundle to touch.
            (Some(TextOperation::Delete(n)), Some(TextOperation::Delete(m))) => {
                let step = n.min(m);
                head_a = leftover_delete_or_next(n - step, &mut left);
                head_b = leftover_delete_or_next(m - step, &mut right);
            }
            (Some(TextOperation::Delete(n)), Some(TextOperation::Retain(m))) => {
                let step = n.min(m);
                a_prime.delete(step);
                head_a = leftover_delete_or_next(n - step, &mut left);
                head_b = leftover_or_next(m - step, &mut right);
            }
            (Some(TextOperation::Retain(n)), Some(TextOperation::Delete(m))) => {
                let step = n.min(m);
                b_prime.delete(step);
                head_a = leftover_or_next(n - step, &mut left);
                head_b = leftover_delete_or_next(m - step, &mut right);
            }
            (None, Some(_)) | (Some(_), None) => {
                return Err(OtError::TransformMismatch {
                    left: a.base_len,
                    right: b.base_len,
                });
            }
            (Some(TextOperation::Insert(_)), Some(TextOperation::Retain(_)))
            | (Some(TextOperation::Insert(_)), Some(TextOperation::Delete(_))) => {
                unreachable!("a_wins_insert is always true when head_a is Insert and head_b is not Insert")
            }
        }
    }
    Ok((a_prime, b_prime))
}

/// Adjusts a 0-based cursor position for an accepted bundle.
///
/// Retains move past the cursor unchanged; an insert at or before the cursor
/// shifts it by the inserted length (`own` inserts only shift when strictly
/// before, so the author's cursor stays put right after typing); a deleted
/// range containing the cursor clamps it to the start of the range.
pub fn transform_cursor(position: usize, bundle: &Bundle, own: bool) -> usize {
    let mut adjusted = position;
    let mut scanned = 0;
    for op in &bundle.ops {
        match op {
            TextOperation::Retain(n) => scanned += n,
            TextOperation::Insert(s) => {
                if scanned < position || (scanned == position && !own) {
                    adjusted += utf16_len(s);
                }
            }
            TextOperation::Delete(n) => {
                if scanned < position {
                    adjusted -= *n.min(&(position - scanned));
                }
                scanned += n;
            }
        }
    }
    adjusted
}

/// Synthesizes a bundle turning `old` into `new`.
///
/// Deterministic but not guaranteed minimal; `apply(old, diff(old, new))`
/// always equals `new`.
pub fn diff(old: &str, new: &str) -> Bundle {
    let mut bundle = Bundle::default();
    for chunk in dissimilar::diff(old, new) {
        match chunk {
            Chunk::Equal(s) => bundle.retain(utf16_len(s)),
            Chunk::Delete(s) => bundle.delete(utf16_len(s)),
            Chunk::Insert(s) => bundle.insert(s),
        }
    }
    bundle
}

// Wire form shared with the stored payloads: a JSON array where a positive
// integer retains, a negative integer deletes, and a string inserts.
impl Serialize for Bundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.ops.len()))?;
        for op in &self.ops {
            match op {
                TextOperation::Retain(n) => seq.serialize_element(&(*n as i64))?,
                TextOperation::Delete(n) => seq.serialize_element(&-(*n as i64))?,
                TextOperation::Insert(s) => seq.serialize_element(s)?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Bundle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BundleVisitor;

        impl<'de> Visitor<'de> for BundleVisitor {
            type Value = Bundle;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a sequence of integers and strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bundle, A::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum RawOp {
                    Count(i64),
                    Text(String),
                }

                let mut bundle = Bundle::default();
                while let Some(raw) = seq.next_element::<RawOp>()? {
                    match raw {
                        RawOp::Count(n) if n >= 0 => bundle.retain(n as usize),
                        RawOp::Count(n) => bundle.delete(n.unsigned_abs() as usize),
                        RawOp::Text(s) => bundle.insert(&s),
                    }
                }
                Ok(bundle)
            }
        }

        deserializer.deserialize_seq(BundleVisitor)
    }
}

/// Build helpers used across the crate's tests.
pub mod factories {
    use super::Bundle;

    pub fn identity() -> Bundle {
        Bundle::default()
    }

    pub fn insert(at: usize, s: &str) -> Bundle {
        let mut bundle = Bundle::default();
        bundle.retain(at);
        bundle.insert(s);
        bundle
    }

    pub fn delete(from: usize, length: usize) -> Bundle {
        let mut bundle = Bundle::default();
        bundle.retain(from);
        bundle.delete(length);
        bundle
    }

    pub fn replace(from: usize, length: usize, s: &str) -> Bundle {
        let mut bundle = Bundle::default();
        bundle.retain(from);
        bundle.delete(length);
        bundle.insert(s);
        bundle
    }

    /// Pads a bundle with a trailing retain up to the given base length.
    pub fn padded(mut bundle: Bundle, base_len: usize) -> Bundle {
        if bundle.base_len() < base_len {
            bundle.retain(base_len - bundle.base_len());
        }
        bundle
    }
}
