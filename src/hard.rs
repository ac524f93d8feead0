//! Hard (Viterbi) decoding bookkeeping shared by both parsers.
//!
//! Next to the relaxed recursion, each parser runs the exact max-plus recursion over the same
//! items. For every item it stores the best hard score and the split point achieving it
//! (the backpointer, lowest split index on ties). After the inside pass, usage counts are pushed
//! top-down from the full span along the backpointers: an item has a nonzero count iff it belongs
//! to the single best derivation.
//!
//! Items are grouped by "sign" (four for the Eisner chart, one for the binary-phrase chart), each
//! sign being an `n x n` table.

use std::ops::Range;

use crate::arena::Lease;
use crate::chart::Buffer;
use crate::error::Result;

/// Best scores, backpointers and usage counts for `signs` tables of `n x n` items.
///
/// Scores are always owned; the two index tables (backpointers, usage counts) can live in
/// caller memory or in an arena lease.
#[derive(Debug)]
pub struct HardChart<'a> {
    n: usize,
    signs: usize,
    scores: Vec<f64>,
    indices: Buffer<'a, usize>,
}

impl HardChart<'static> {
    /// Owned, zero-filled chart.
    pub fn new(n: usize, signs: usize) -> Self {
        Self {
            n,
            signs,
            scores: vec![0.0; signs * n * n],
            indices: Buffer::zeros(Self::required_cells(n, signs)),
        }
    }
}

impl<'a> HardChart<'a> {
    /// Index cells needed: one backpointer table and one usage table per sign.
    pub fn required_cells(n: usize, signs: usize) -> usize {
        2 * signs * n * n
    }

    /// Index tables written into caller memory.
    pub fn in_memory(n: usize, signs: usize, memory: &'a mut [usize]) -> Result<Self> {
        Ok(Self {
            n,
            signs,
            scores: vec![0.0; signs * n * n],
            indices: Buffer::in_memory(Self::required_cells(n, signs), memory)?,
        })
    }

    /// Index tables backed by an arena lease.
    pub fn leased(n: usize, signs: usize, lease: Lease<'a, usize>) -> Result<Self> {
        Ok(Self {
            n,
            signs,
            scores: vec![0.0; signs * n * n],
            indices: Buffer::leased(Self::required_cells(n, signs), lease)?,
        })
    }

    /// Side length of each table.
    pub fn size(&self) -> usize {
        self.n
    }

    /// Reset scores, backpointers and usage counts.
    pub fn zero(&mut self) {
        let cells = Self::required_cells(self.n, self.signs);
        self.scores.fill(0.0);
        self.indices[..cells].fill(0);
    }

    fn cell(&self, sign: usize, i: usize, j: usize) -> usize {
        debug_assert!(sign < self.signs && i < self.n && j < self.n);
        (sign * self.n + i) * self.n + j
    }

    fn usage_cell(&self, sign: usize, i: usize, j: usize) -> usize {
        self.signs * self.n * self.n + self.cell(sign, i, j)
    }

    /// Best hard score of item `(i, j)`.
    pub fn score(&self, sign: usize, i: usize, j: usize) -> f64 {
        self.scores[self.cell(sign, i, j)]
    }

    /// Split point recorded for item `(i, j)`.
    pub fn backptr(&self, sign: usize, i: usize, j: usize) -> usize {
        self.indices[self.cell(sign, i, j)]
    }

    /// Number of times item `(i, j)` is used by the best derivation.
    pub fn usage(&self, sign: usize, i: usize, j: usize) -> usize {
        self.indices[self.usage_cell(sign, i, j)]
    }

    /// Store the best score and its split point for item `(i, j)`.
    pub fn set(&mut self, sign: usize, i: usize, j: usize, score: f64, backptr: usize) {
        let cell = self.cell(sign, i, j);
        self.scores[cell] = score;
        self.indices[cell] = backptr;
    }

    /// Add `count` uses to item `(i, j)`.
    pub fn add_usage(&mut self, sign: usize, i: usize, j: usize, count: usize) {
        let cell = self.usage_cell(sign, i, j);
        self.indices[cell] += count;
    }
}

/// Split point in `splits` (non-empty) with the largest `score`, and that score.
///
/// Later splits only win on a strict improvement, so ties go to the lowest split index.
pub fn best_split(splits: Range<usize>, score: impl Fn(usize) -> f64) -> (usize, f64) {
    debug_assert!(!splits.is_empty());
    let mut best = (splits.start, score(splits.start));
    for k in splits.skip(1) {
        let s = score(k);
        if s > best.1 {
            best = (k, s);
        }
    }
    best
}
