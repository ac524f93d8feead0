//! Differentiable CKY-style recursion over unlabeled binary phrase-structure trees.
//!
//! Positions `0..n` are the leaves. A span `(i, j)` with `i < j` is a constituent covering
//! leaves `i..=j`; its value is
//!
//! `weight(i, j) = w(i, j) + ⊕_{k∈[i, j)} weight(i, k) + weight(k+1, j)`
//!
//! with leaf spans `(i, i)` at zero. `weight(0, n-1)` is the value of the whole structure; the
//! backtracking pass pushes a unit of soft-selection mass from it down to every span.

use crate::arena::{ChartArena, Lease};
use crate::chart::{carve, Buffer, Matrix, Tensor3};
use crate::deduction::{
    backtrack, backtrack_adjoint, ArgmaxSoftmax, DeductionRule, EntropyRegularized, Relaxation,
};
use crate::error::{ensure_finite, Error, Result};
use crate::hard::{best_split, HardChart};
use crate::math;

/// Mutable views over every table of a [`BinaryPhraseChart`].
#[derive(Debug)]
pub struct PhraseTables<'c> {
    /// Combination score of each split point.
    pub split: Tensor3<'c>,
    /// Softmax weight of each split point.
    pub softmax: Tensor3<'c>,
    /// Span values.
    pub weight: Matrix<'c>,
    /// Soft-selection mass reaching each span.
    pub soft: Matrix<'c>,
}

/// Two `n^3` split tables and two `n^2` span tables in one contiguous block.
#[derive(Debug)]
pub struct BinaryPhraseChart<'a> {
    n: usize,
    memory: Buffer<'a, f64>,
}

impl BinaryPhraseChart<'static> {
    /// Owned, zero-filled chart.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            memory: Buffer::zeros(Self::required_cells(n)),
        }
    }
}

impl<'a> BinaryPhraseChart<'a> {
    /// Float cells needed for a chart of size `n`.
    pub fn required_cells(n: usize) -> usize {
        2 * Tensor3::required_cells(n) + 2 * Matrix::<f64>::required_cells(n)
    }

    /// Chart written into caller memory.
    pub fn in_memory(n: usize, memory: &'a mut [f64]) -> Result<Self> {
        Ok(Self {
            n,
            memory: Buffer::in_memory(Self::required_cells(n), memory)?,
        })
    }

    /// Chart backed by an arena lease.
    pub fn leased(n: usize, lease: Lease<'a, f64>) -> Result<Self> {
        Ok(Self {
            n,
            memory: Buffer::leased(Self::required_cells(n), lease)?,
        })
    }

    /// Number of leaves.
    pub fn size(&self) -> usize {
        self.n
    }

    /// Reset every table.
    pub fn zero(&mut self) {
        let cells = Self::required_cells(self.n);
        self.memory[..cells].fill(0.0);
    }

    /// Split the block into its four tables.
    pub fn tables(&mut self) -> PhraseTables<'_> {
        let n = self.n;
        let (n3, n2) = (Tensor3::required_cells(n), Matrix::<f64>::required_cells(n));
        let mut rest: &mut [f64] = &mut self.memory;
        PhraseTables {
            split: Tensor3::view(n, carve(&mut rest, n3)),
            softmax: Tensor3::view(n, carve(&mut rest, n3)),
            weight: Matrix::view(n, carve(&mut rest, n2)),
            soft: Matrix::view(n, carve(&mut rest, n2)),
        }
    }

    /// Value of span `(i, j)`.
    pub fn weight(&self, i: usize, j: usize) -> f64 {
        let n = self.n;
        self.memory[2 * n * n * n + i * n + j]
    }

    /// Soft-selection mass of span `(i, j)`.
    pub fn soft(&self, i: usize, j: usize) -> f64 {
        let n = self.n;
        self.memory[2 * n * n * n + n * n + i * n + j]
    }
}

/// Differentiable binary phrase-structure parser over `n` leaves.
#[derive(Debug)]
pub struct BinaryPhrase<'a, R = Relaxation> {
    rule: R,
    n: usize,
    forward_chart: BinaryPhraseChart<'a>,
    backward_chart: BinaryPhraseChart<'a>,
    hard: HardChart<'a>,
    forwarded: bool,
}

/// Binary phrase parser relaxed with the softmax-weighted argmax.
pub type AlgorithmicDifferentiableBinaryPhrase<'a> = BinaryPhrase<'a, ArgmaxSoftmax>;

/// Binary phrase parser relaxed with entropy regularization.
pub type EntropyRegularizedBinaryPhrase<'a> = BinaryPhrase<'a, EntropyRegularized>;

impl<R: DeductionRule> BinaryPhrase<'static, R> {
    /// Parser with owned charts.
    pub fn new(n: usize, rule: R) -> Result<Self> {
        if n == 0 {
            return Err(Error::EmptyChart);
        }
        Ok(Self::assemble(
            rule,
            BinaryPhraseChart::new(n),
            BinaryPhraseChart::new(n),
            HardChart::new(n, 1),
        ))
    }
}

impl<'a, R: DeductionRule> BinaryPhrase<'a, R> {
    /// Float cells [`BinaryPhrase::in_memory`] needs.
    pub fn required_float_cells(n: usize) -> usize {
        2 * BinaryPhraseChart::required_cells(n)
    }

    /// Index cells [`BinaryPhrase::in_memory`] needs.
    pub fn required_index_cells(n: usize) -> usize {
        HardChart::required_cells(n, 1)
    }

    /// Parser whose charts live in caller memory.
    pub fn in_memory(
        n: usize,
        rule: R,
        floats: &'a mut [f64],
        indices: &'a mut [usize],
    ) -> Result<Self> {
        if n == 0 {
            return Err(Error::EmptyChart);
        }
        let required = Self::required_float_cells(n);
        if floats.len() < required {
            return Err(Error::MemoryTooSmall {
                provided: floats.len(),
                required,
            });
        }
        let (forward, backward) = floats.split_at_mut(BinaryPhraseChart::required_cells(n));
        Ok(Self::assemble(
            rule,
            BinaryPhraseChart::in_memory(n, forward)?,
            BinaryPhraseChart::in_memory(n, backward)?,
            HardChart::in_memory(n, 1, indices)?,
        ))
    }

    /// Parser whose charts are leased from `arena`.
    pub fn leased(n: usize, rule: R, arena: &'a ChartArena) -> Result<Self> {
        let cells = BinaryPhraseChart::required_cells(n);
        let forward = BinaryPhraseChart::leased(n, arena.lease_floats(n, cells)?)?;
        let backward = BinaryPhraseChart::leased(n, arena.lease_floats(n, cells)?)?;
        let hard = HardChart::leased(n, 1, arena.lease_indices(n, Self::required_index_cells(n))?)?;
        Ok(Self::assemble(rule, forward, backward, hard))
    }

    fn assemble(
        rule: R,
        forward_chart: BinaryPhraseChart<'a>,
        backward_chart: BinaryPhraseChart<'a>,
        hard: HardChart<'a>,
    ) -> Self {
        let n = forward_chart.size();
        log::debug!(
            "binary phrase parser of size {} ({} float cells)",
            n,
            Self::required_float_cells(n)
        );
        Self {
            rule,
            n,
            forward_chart,
            backward_chart,
            hard,
            forwarded: false,
        }
    }

    /// Number of leaves.
    pub fn size(&self) -> usize {
        self.n
    }

    /// The deduction rule in use.
    pub fn rule(&self) -> &R {
        &self.rule
    }

    fn check_span(&self, left: usize, right: usize) -> Result<()> {
        if !self.forwarded {
            return Err(Error::NotForwarded);
        }
        if left >= right || right >= self.n {
            return Err(Error::IllegalSpan {
                left,
                right,
                size: self.n,
            });
        }
        Ok(())
    }

    /// Inside pass, soft backtracking and hard decoding.
    ///
    /// `weight(left, right)` is called once per span `left < right`.
    pub fn forward<F>(&mut self, mut weight: F) -> Result<()>
    where
        F: FnMut(usize, usize) -> f64,
    {
        self.forwarded = false;
        let n = self.n;
        self.forward_chart.zero();
        self.hard.zero();
        {
            let mut t = self.forward_chart.tables();
            for (left, right) in spans(n) {
                let w = ensure_finite("score", left, right, weight(left, right))?;
                t.weight.set(left, right, w);
            }

            for l in 1..n {
                for i in 0..n - l {
                    let j = i + l;
                    let w = t.weight.get(i, j);
                    let c = self.rule.forward(
                        &t.weight.row(i, i, l),
                        &t.weight.column(i + 1, j, l),
                        &mut t.split.splits_mut(i, j, i, l),
                        &mut t.softmax.splits_mut(i, j, i, l),
                    );
                    t.weight.set(i, j, w + c);
                    let hard = &self.hard;
                    let (k, best) =
                        best_split(i..j, |k| hard.score(0, i, k) + hard.score(0, k + 1, j));
                    self.hard.set(0, i, j, w + best, k);
                }
            }

            t.soft.set(0, n - 1, 1.0);
            for l in (1..n).rev() {
                for i in 0..n - l {
                    let j = i + l;
                    let s = t.soft.get(i, j);
                    let b = t.softmax.splits(i, j, i, l);
                    backtrack(&mut t.soft.row_mut(i, i, l), &b, s);
                    backtrack(&mut t.soft.column_mut(i + 1, j, l), &b, s);
                }
            }
        }

        self.hard.add_usage(0, 0, n - 1, 1);
        for l in (1..n).rev() {
            for i in 0..n - l {
                let j = i + l;
                let u = self.hard.usage(0, i, j);
                if u > 0 {
                    let k = self.hard.backptr(0, i, j);
                    self.hard.add_usage(0, i, k, u);
                    self.hard.add_usage(0, k + 1, j, u);
                }
            }
        }

        for (left, right) in spans(n) {
            ensure_finite("output", left, right, self.output(left, right))?;
        }
        self.forwarded = true;
        log::trace!("binary phrase forward done (n = {}, value = {})", n, self.value());
        Ok(())
    }

    /// Reverse pass; `gradient(left, right)` is the loss gradient w.r.t.
    /// [`BinaryPhrase::output`].
    pub fn backward<F>(&mut self, mut gradient: F) -> Result<()>
    where
        F: FnMut(usize, usize) -> f64,
    {
        if !self.forwarded {
            return Err(Error::NotForwarded);
        }
        let n = self.n;
        self.backward_chart.zero();
        {
            let f = self.forward_chart.tables();
            let mut g = self.backward_chart.tables();
            for (left, right) in spans(n) {
                let v = ensure_finite("incoming gradient", left, right, gradient(left, right))?;
                g.soft.set(left, right, v);
            }

            for l in 1..n {
                for i in 0..n - l {
                    let j = i + l;
                    let s = f.soft.get(i, j);
                    let b = f.softmax.splits(i, j, i, l);
                    let mut gb = g.softmax.splits_mut(i, j, i, l);
                    let gc = backtrack_adjoint(&b, s, &g.soft.row(i, i, l), &mut gb)
                        + backtrack_adjoint(&b, s, &g.soft.column(i + 1, j, l), &mut gb);
                    *g.soft.at_mut(i, j) += gc;
                }
            }

            for l in (1..n).rev() {
                for i in 0..n - l {
                    let j = i + l;
                    self.rule.backward(
                        &f.split.splits(i, j, i, l),
                        &f.softmax.splits(i, j, i, l),
                        g.weight.get(i, j),
                        &mut g.split.splits_mut(i, j, i, l),
                        &mut g.softmax.splits_mut(i, j, i, l),
                    );
                    let gs = g.split.splits(i, j, i, l);
                    math::add(&mut g.weight.row_mut(i, i, l), &gs);
                    math::add(&mut g.weight.column_mut(i + 1, j, l), &gs);
                }
            }
        }

        for (left, right) in spans(n) {
            ensure_finite("gradient", left, right, self.gradient(left, right))?;
        }
        log::trace!("binary phrase backward done (n = {})", n);
        Ok(())
    }

    /// Soft selection of span `(left, right)`.
    ///
    /// Panics if an index is out of range.
    pub fn output(&self, left: usize, right: usize) -> f64 {
        self.forward_chart.soft(left, right)
    }

    /// Gradient w.r.t. the weight of span `(left, right)`, after [`BinaryPhrase::backward`].
    pub fn gradient(&self, left: usize, right: usize) -> f64 {
        self.backward_chart.weight(left, right)
    }

    /// Soft selection of a legal span.
    pub fn span_value(&self, left: usize, right: usize) -> Result<f64> {
        self.check_span(left, right)?;
        Ok(self.output(left, right))
    }

    /// 1.0 if the span belongs to the best tree, 0.0 otherwise.
    pub fn discrete_span_value(&self, left: usize, right: usize) -> Result<f64> {
        self.check_span(left, right)?;
        Ok(if self.hard.usage(0, left, right) > 0 { 1.0 } else { 0.0 })
    }

    /// Constituents (`left < right`) of the best tree, in row-major order; empty when the last
    /// [`BinaryPhrase::forward`] failed.
    pub fn hard_spans(&self) -> Vec<(usize, usize)> {
        if !self.forwarded {
            return Vec::new();
        }
        spans(self.n).filter(|&(i, j)| self.hard.usage(0, i, j) > 0).collect()
    }

    /// Total weight of the best tree.
    pub fn best_score(&self) -> f64 {
        self.hard.score(0, 0, self.n - 1)
    }

    /// Relaxed value of the whole structure, `weight(0, n-1)`.
    pub fn value(&self) -> f64 {
        self.forward_chart.weight(0, self.n - 1)
    }
}

/// Every span `(left, right)` with `left < right < n`, row-major.
fn spans(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).flat_map(move |left| (left + 1..n).map(move |right| (left, right)))
}
