//! Differentiable Eisner algorithm for projective dependency trees.
//!
//! Position 0 is the artificial root; it may head any number of words but is never a modifier.
//! For a span `(i, j)`, `l = j - i`, the inside recursion combines four kinds of items:
//!
//! - `uright(i, j) = w(i, j) + ⊕_{k∈[i, j)} cright(i, k) + cleft(k+1, j)` (arc `i -> j`)
//! - `uleft(i, j)  = w(j, i) + ⊕_{k∈[i, j)} cright(i, k) + cleft(k+1, j)` (arc `j -> i`, `i > 0`)
//! - `cright(i, j) = ⊕_{k∈(i, j]} uright(i, k) + cright(k, j)`
//! - `cleft(i, j)  = ⊕_{k∈[i, j)} cleft(i, k) + uleft(k, j)` (`i > 0`)
//!
//! where `⊕` is the relaxed max of the chosen [`DeductionRule`]. `cright(0, n-1)` is the value of
//! the whole structure. The backtracking pass then pushes a unit of soft-selection mass from
//! `cright(0, n-1)` down to every item; the mass reaching `uright(h, m)` / `uleft(m, h)` is the
//! soft output of arc `h -> m`.
//!
//! The exact max-plus recursion runs alongside the relaxed one and yields the single best tree
//! (see [`crate::hard`]).

use crate::arena::{ChartArena, Lease};
use crate::chart::{carve, Buffer, Matrix, Tensor3};
use crate::deduction::{
    backtrack, backtrack_adjoint, ArgmaxSoftmax, DeductionRule, EntropyRegularized, Relaxation,
};
use crate::error::{ensure_finite, Error, Result};
use crate::hard::{best_split, HardChart};
use crate::math;

/// The four item kinds of the Eisner chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    /// Complete span headed at its right end.
    CLeft,
    /// Complete span headed at its left end.
    CRight,
    /// Incomplete span: arc from the right end to the left end.
    ULeft,
    /// Incomplete span: arc from the left end to the right end.
    URight,
}

const SIGNS: usize = 4;
const CLEFT: usize = Sign::CLeft as usize;
const CRIGHT: usize = Sign::CRight as usize;
const ULEFT: usize = Sign::ULeft as usize;
const URIGHT: usize = Sign::URight as usize;

/// One table per [`Sign`].
#[derive(Debug)]
pub struct Signs<T> {
    /// Complete, headed right.
    pub cleft: T,
    /// Complete, headed left.
    pub cright: T,
    /// Incomplete, arc pointing left.
    pub uleft: T,
    /// Incomplete, arc pointing right.
    pub uright: T,
}

/// Mutable views over every table of an [`EisnerChart`].
#[derive(Debug)]
pub struct EisnerTables<'c> {
    /// Combination score of each split point.
    pub split: Signs<Tensor3<'c>>,
    /// Softmax weight of each split point.
    pub softmax: Signs<Tensor3<'c>>,
    /// Item values.
    pub value: Signs<Matrix<'c>>,
    /// Soft-selection mass reaching each item.
    pub soft: Signs<Matrix<'c>>,
}

fn tensors<'c>(n: usize, rest: &mut &'c mut [f64]) -> Signs<Tensor3<'c>> {
    let cells = Tensor3::required_cells(n);
    Signs {
        cleft: Tensor3::view(n, carve(rest, cells)),
        cright: Tensor3::view(n, carve(rest, cells)),
        uleft: Tensor3::view(n, carve(rest, cells)),
        uright: Tensor3::view(n, carve(rest, cells)),
    }
}

fn matrices<'c>(n: usize, rest: &mut &'c mut [f64]) -> Signs<Matrix<'c>> {
    let cells = Matrix::<f64>::required_cells(n);
    Signs {
        cleft: Matrix::view(n, carve(rest, cells)),
        cright: Matrix::view(n, carve(rest, cells)),
        uleft: Matrix::view(n, carve(rest, cells)),
        uright: Matrix::view(n, carve(rest, cells)),
    }
}

/// Eight `n^3` split tables and eight `n^2` item tables in one contiguous block.
#[derive(Debug)]
pub struct EisnerChart<'a> {
    n: usize,
    memory: Buffer<'a, f64>,
}

impl EisnerChart<'static> {
    /// Owned, zero-filled chart.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            memory: Buffer::zeros(Self::required_cells(n)),
        }
    }
}

impl<'a> EisnerChart<'a> {
    /// Float cells needed for a chart of size `n`.
    pub fn required_cells(n: usize) -> usize {
        8 * Tensor3::required_cells(n) + 8 * Matrix::<f64>::required_cells(n)
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

    /// Sentence length, root included.
    pub fn size(&self) -> usize {
        self.n
    }

    /// Reset every table.
    pub fn zero(&mut self) {
        let cells = Self::required_cells(self.n);
        self.memory[..cells].fill(0.0);
    }

    /// Split the block into its sixteen tables.
    pub fn tables(&mut self) -> EisnerTables<'_> {
        let n = self.n;
        let mut rest: &mut [f64] = &mut self.memory;
        EisnerTables {
            split: tensors(n, &mut rest),
            softmax: tensors(n, &mut rest),
            value: matrices(n, &mut rest),
            soft: matrices(n, &mut rest),
        }
    }

    fn item(&self, table: usize, sign: Sign, i: usize, j: usize) -> f64 {
        let n = self.n;
        self.memory[8 * n * n * n + (table * SIGNS + sign as usize) * n * n + i * n + j]
    }

    /// Value of item `(i, j)`.
    pub fn value(&self, sign: Sign, i: usize, j: usize) -> f64 {
        self.item(0, sign, i, j)
    }

    /// Soft-selection mass of item `(i, j)`.
    pub fn soft(&self, sign: Sign, i: usize, j: usize) -> f64 {
        self.item(1, sign, i, j)
    }
}

/// Differentiable Eisner parser over a sentence of `n` positions (root included).
///
/// Owns a forward chart, a backward chart and the hard-decoding tables. Gradients go to the
/// backward chart, so the forward results stay valid across several `backward` calls.
#[derive(Debug)]
pub struct Eisner<'a, R = Relaxation> {
    rule: R,
    n: usize,
    forward_chart: EisnerChart<'a>,
    backward_chart: EisnerChart<'a>,
    hard: HardChart<'a>,
    heads: Vec<Option<usize>>,
    forwarded: bool,
}

/// Eisner parser relaxed with the softmax-weighted argmax.
pub type AlgorithmicDifferentiableEisner<'a> = Eisner<'a, ArgmaxSoftmax>;

/// Eisner parser relaxed with entropy regularization (log-partition recursion).
pub type EntropyRegularizedEisner<'a> = Eisner<'a, EntropyRegularized>;

impl<R: DeductionRule> Eisner<'static, R> {
    /// Parser with owned charts.
    pub fn new(n: usize, rule: R) -> Result<Self> {
        if n == 0 {
            return Err(Error::EmptyChart);
        }
        Ok(Self::assemble(
            rule,
            EisnerChart::new(n),
            EisnerChart::new(n),
            HardChart::new(n, SIGNS),
        ))
    }
}

impl<'a, R: DeductionRule> Eisner<'a, R> {
    /// Float cells [`Eisner::in_memory`] needs (forward and backward charts).
    pub fn required_float_cells(n: usize) -> usize {
        2 * EisnerChart::required_cells(n)
    }

    /// Index cells [`Eisner::in_memory`] needs (backpointers and usage counts).
    pub fn required_index_cells(n: usize) -> usize {
        HardChart::required_cells(n, SIGNS)
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
        let (forward, backward) = floats.split_at_mut(EisnerChart::required_cells(n));
        Ok(Self::assemble(
            rule,
            EisnerChart::in_memory(n, forward)?,
            EisnerChart::in_memory(n, backward)?,
            HardChart::in_memory(n, SIGNS, indices)?,
        ))
    }

    /// Parser whose charts are leased from `arena`: two float slots and one index slot, returned
    /// when the parser is dropped.
    pub fn leased(n: usize, rule: R, arena: &'a ChartArena) -> Result<Self> {
        let cells = EisnerChart::required_cells(n);
        let forward = EisnerChart::leased(n, arena.lease_floats(n, cells)?)?;
        let backward = EisnerChart::leased(n, arena.lease_floats(n, cells)?)?;
        let indices = arena.lease_indices(n, Self::required_index_cells(n))?;
        let hard = HardChart::leased(n, SIGNS, indices)?;
        Ok(Self::assemble(rule, forward, backward, hard))
    }

    fn assemble(
        rule: R,
        forward_chart: EisnerChart<'a>,
        backward_chart: EisnerChart<'a>,
        hard: HardChart<'a>,
    ) -> Self {
        let n = forward_chart.size();
        log::debug!(
            "eisner parser of size {} ({} float cells)",
            n,
            Self::required_float_cells(n)
        );
        Self {
            rule,
            n,
            forward_chart,
            backward_chart,
            hard,
            heads: vec![None; n],
            forwarded: false,
        }
    }

    /// Sentence length, root included.
    pub fn size(&self) -> usize {
        self.n
    }

    /// The deduction rule in use.
    pub fn rule(&self) -> &R {
        &self.rule
    }

    /// The forward chart, as filled by the last [`Eisner::forward`].
    pub fn forward_chart(&self) -> &EisnerChart<'a> {
        &self.forward_chart
    }

    fn check_arc(&self, head: usize, modifier: usize) -> Result<()> {
        if !self.forwarded {
            return Err(Error::NotForwarded);
        }
        if modifier == 0 || head == modifier || head >= self.n || modifier >= self.n {
            return Err(Error::IllegalArc {
                head,
                modifier,
                size: self.n,
            });
        }
        Ok(())
    }

    /// Inside pass, soft backtracking and hard decoding.
    ///
    /// `weight(head, modifier)` is called once per legal arc (modifier `>= 1`, head `!=`
    /// modifier). Fails on a non-finite weight or output.
    pub fn forward<F>(&mut self, mut weight: F) -> Result<()>
    where
        F: FnMut(usize, usize) -> f64,
    {
        self.forwarded = false;
        let n = self.n;
        self.forward_chart.zero();
        self.hard.zero();
        self.heads.clear();
        self.heads.resize(n, None);
        {
            let mut tables = self.forward_chart.tables();
            for head in 0..n {
                for modifier in (1..n).filter(|&m| m != head) {
                    let w = ensure_finite("score", head, modifier, weight(head, modifier))?;
                    if head < modifier {
                        tables.value.uright.set(head, modifier, w);
                    } else {
                        tables.value.uleft.set(modifier, head, w);
                    }
                }
            }
            inside(&self.rule, &mut tables, &mut self.hard);
            tables.soft.cright.set(0, n - 1, 1.0);
            backtracking(&mut tables);
        }
        for (head, modifier) in legal_arcs(n) {
            ensure_finite("output", head, modifier, self.output(head, modifier))?;
        }

        push_usage(&mut self.hard);
        for i in 0..n {
            for j in i + 1..n {
                if self.hard.usage(URIGHT, i, j) > 0 {
                    self.heads[j] = Some(i);
                }
                if i > 0 && self.hard.usage(ULEFT, i, j) > 0 {
                    self.heads[i] = Some(j);
                }
            }
        }
        self.forwarded = true;
        log::trace!("eisner forward done (n = {}, value = {})", n, self.value());
        Ok(())
    }

    /// Reverse pass: gradient of a loss w.r.t. every arc weight.
    ///
    /// `gradient(head, modifier)` gives the loss gradient w.r.t. [`Eisner::output`] and is called
    /// once per legal arc. Results are read with [`Eisner::gradient`].
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
            let forward = self.forward_chart.tables();
            let mut backward = self.backward_chart.tables();
            for head in 0..n {
                for modifier in (1..n).filter(|&m| m != head) {
                    let g = gradient(head, modifier);
                    let g = ensure_finite("incoming gradient", head, modifier, g)?;
                    if head < modifier {
                        backward.soft.uright.set(head, modifier, g);
                    } else {
                        backward.soft.uleft.set(modifier, head, g);
                    }
                }
            }
            backtracking_adjoint(&forward, &mut backward);
            inside_adjoint(&self.rule, &forward, &mut backward);
        }

        for (head, modifier) in legal_arcs(self.n) {
            ensure_finite("gradient", head, modifier, self.gradient(head, modifier))?;
        }
        log::trace!("eisner backward done (n = {})", n);
        Ok(())
    }

    /// Soft output of arc `head -> modifier`; NaN for `head == modifier`.
    ///
    /// Panics if an index is out of range.
    pub fn output(&self, head: usize, modifier: usize) -> f64 {
        if head < modifier {
            self.forward_chart.soft(Sign::URight, head, modifier)
        } else if head > modifier {
            self.forward_chart.soft(Sign::ULeft, modifier, head)
        } else {
            f64::NAN
        }
    }

    /// Gradient w.r.t. the weight of arc `head -> modifier`, after [`Eisner::backward`];
    /// NaN for `head == modifier`.
    pub fn gradient(&self, head: usize, modifier: usize) -> f64 {
        if head < modifier {
            self.backward_chart.value(Sign::URight, head, modifier)
        } else if head > modifier {
            self.backward_chart.value(Sign::ULeft, modifier, head)
        } else {
            f64::NAN
        }
    }

    /// Soft output of a legal arc; fails unless the last [`Eisner::forward`] succeeded.
    pub fn arc_value(&self, head: usize, modifier: usize) -> Result<f64> {
        self.check_arc(head, modifier)?;
        Ok(self.output(head, modifier))
    }

    /// 1.0 if the arc belongs to the best tree, 0.0 otherwise.
    pub fn discrete_arc_value(&self, head: usize, modifier: usize) -> Result<f64> {
        self.check_arc(head, modifier)?;
        let used = if head < modifier {
            self.hard.usage(URIGHT, head, modifier)
        } else {
            self.hard.usage(ULEFT, modifier, head)
        };
        Ok(if used > 0 { 1.0 } else { 0.0 })
    }

    /// Head of every position in the best tree, indexed by modifier; `None` for the root.
    ///
    /// All `None` when the last [`Eisner::forward`] failed.
    pub fn hard_heads(&self) -> &[Option<usize>] {
        &self.heads
    }

    /// Total weight of the best tree.
    pub fn best_score(&self) -> f64 {
        self.hard.score(CRIGHT, 0, self.n - 1)
    }

    /// Relaxed value of the whole structure, `cright(0, n-1)`.
    pub fn value(&self) -> f64 {
        self.forward_chart.value(Sign::CRight, 0, self.n - 1)
    }
}

/// Every `(head, modifier)` with `modifier >= 1` and `head != modifier`.
fn legal_arcs(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).flat_map(move |head| (1..n).filter(move |&m| m != head).map(move |m| (head, m)))
}

fn inside<R: DeductionRule>(rule: &R, t: &mut EisnerTables<'_>, hard: &mut HardChart<'_>) {
    let n = hard.size();
    for l in 1..n {
        for i in 0..n - l {
            let j = i + l;

            // Arc weights are already in place.
            let w = t.value.uright.get(i, j);
            let c = rule.forward(
                &t.value.cright.row(i, i, l),
                &t.value.cleft.column(i + 1, j, l),
                &mut t.split.uright.splits_mut(i, j, i, l),
                &mut t.softmax.uright.splits_mut(i, j, i, l),
            );
            t.value.uright.set(i, j, w + c);
            let (k, best) =
                best_split(i..j, |k| hard.score(CRIGHT, i, k) + hard.score(CLEFT, k + 1, j));
            hard.set(URIGHT, i, j, w + best, k);

            if i > 0 {
                let w = t.value.uleft.get(i, j);
                let c = rule.forward(
                    &t.value.cright.row(i, i, l),
                    &t.value.cleft.column(i + 1, j, l),
                    &mut t.split.uleft.splits_mut(i, j, i, l),
                    &mut t.softmax.uleft.splits_mut(i, j, i, l),
                );
                t.value.uleft.set(i, j, w + c);
                hard.set(ULEFT, i, j, w + best, k);
            }

            let c = rule.forward(
                &t.value.uright.row(i, i + 1, l),
                &t.value.cright.column(i + 1, j, l),
                &mut t.split.cright.splits_mut(i, j, i + 1, l),
                &mut t.softmax.cright.splits_mut(i, j, i + 1, l),
            );
            t.value.cright.set(i, j, c);
            let (k, best) =
                best_split(i + 1..j + 1, |k| hard.score(URIGHT, i, k) + hard.score(CRIGHT, k, j));
            hard.set(CRIGHT, i, j, best, k);

            if i > 0 {
                let c = rule.forward(
                    &t.value.cleft.row(i, i, l),
                    &t.value.uleft.column(i, j, l),
                    &mut t.split.cleft.splits_mut(i, j, i, l),
                    &mut t.softmax.cleft.splits_mut(i, j, i, l),
                );
                t.value.cleft.set(i, j, c);
                let (k, best) =
                    best_split(i..j, |k| hard.score(CLEFT, i, k) + hard.score(ULEFT, k, j));
                hard.set(CLEFT, i, j, best, k);
            }
        }
    }
}

fn backtracking(t: &mut EisnerTables<'_>) {
    let n = t.value.cright.size();
    for l in (1..n).rev() {
        for i in 0..n - l {
            let j = i + l;

            let s = t.soft.cright.get(i, j);
            let b = t.softmax.cright.splits(i, j, i + 1, l);
            backtrack(&mut t.soft.uright.row_mut(i, i + 1, l), &b, s);
            backtrack(&mut t.soft.cright.column_mut(i + 1, j, l), &b, s);

            if i > 0 {
                let s = t.soft.cleft.get(i, j);
                let b = t.softmax.cleft.splits(i, j, i, l);
                backtrack(&mut t.soft.cleft.row_mut(i, i, l), &b, s);
                backtrack(&mut t.soft.uleft.column_mut(i, j, l), &b, s);
            }

            let s = t.soft.uright.get(i, j);
            let b = t.softmax.uright.splits(i, j, i, l);
            backtrack(&mut t.soft.cright.row_mut(i, i, l), &b, s);
            backtrack(&mut t.soft.cleft.column_mut(i + 1, j, l), &b, s);

            if i > 0 {
                let s = t.soft.uleft.get(i, j);
                let b = t.softmax.uleft.splits(i, j, i, l);
                backtrack(&mut t.soft.cright.row_mut(i, i, l), &b, s);
                backtrack(&mut t.soft.cleft.column_mut(i + 1, j, l), &b, s);
            }
        }
    }
}

fn push_usage(hard: &mut HardChart<'_>) {
    let n = hard.size();
    hard.add_usage(CRIGHT, 0, n - 1, 1);
    for l in (1..n).rev() {
        for i in 0..n - l {
            let j = i + l;

            let u = hard.usage(CRIGHT, i, j);
            if u > 0 {
                let k = hard.backptr(CRIGHT, i, j);
                hard.add_usage(URIGHT, i, k, u);
                hard.add_usage(CRIGHT, k, j, u);
            }
            if i > 0 {
                let u = hard.usage(CLEFT, i, j);
                if u > 0 {
                    let k = hard.backptr(CLEFT, i, j);
                    hard.add_usage(CLEFT, i, k, u);
                    hard.add_usage(ULEFT, k, j, u);
                }
            }
            for sign in [URIGHT, ULEFT] {
                let u = hard.usage(sign, i, j);
                if u > 0 {
                    let k = hard.backptr(sign, i, j);
                    hard.add_usage(CRIGHT, i, k, u);
                    hard.add_usage(CLEFT, k + 1, j, u);
                }
            }
        }
    }
}

/// Reverse of [`backtracking`]: spans from short to long, items in reverse order.
fn backtracking_adjoint(f: &EisnerTables<'_>, g: &mut EisnerTables<'_>) {
    let n = f.value.cright.size();
    for l in 1..n {
        for i in 0..n - l {
            let j = i + l;

            if i > 0 {
                let s = f.soft.uleft.get(i, j);
                let b = f.softmax.uleft.splits(i, j, i, l);
                let mut gb = g.softmax.uleft.splits_mut(i, j, i, l);
                let gc = backtrack_adjoint(&b, s, &g.soft.cright.row(i, i, l), &mut gb)
                    + backtrack_adjoint(&b, s, &g.soft.cleft.column(i + 1, j, l), &mut gb);
                *g.soft.uleft.at_mut(i, j) += gc;
            }

            let s = f.soft.uright.get(i, j);
            let b = f.softmax.uright.splits(i, j, i, l);
            let mut gb = g.softmax.uright.splits_mut(i, j, i, l);
            let gc = backtrack_adjoint(&b, s, &g.soft.cright.row(i, i, l), &mut gb)
                + backtrack_adjoint(&b, s, &g.soft.cleft.column(i + 1, j, l), &mut gb);
            *g.soft.uright.at_mut(i, j) += gc;

            if i > 0 {
                let s = f.soft.cleft.get(i, j);
                let b = f.softmax.cleft.splits(i, j, i, l);
                let mut gb = g.softmax.cleft.splits_mut(i, j, i, l);
                let gc = backtrack_adjoint(&b, s, &g.soft.cleft.row(i, i, l), &mut gb)
                    + backtrack_adjoint(&b, s, &g.soft.uleft.column(i, j, l), &mut gb);
                *g.soft.cleft.at_mut(i, j) += gc;
            }

            let s = f.soft.cright.get(i, j);
            let b = f.softmax.cright.splits(i, j, i + 1, l);
            let mut gb = g.softmax.cright.splits_mut(i, j, i + 1, l);
            let gc = backtrack_adjoint(&b, s, &g.soft.uright.row(i, i + 1, l), &mut gb)
                + backtrack_adjoint(&b, s, &g.soft.cright.column(i + 1, j, l), &mut gb);
            *g.soft.cright.at_mut(i, j) += gc;
        }
    }
}

/// Reverse of [`inside`]: spans from long to short.
///
/// `g.value` of an item is complete once every longer item (and the items of the same span
/// processed before it) has been visited; it is then split over the antecedents through the
/// rule's adjoint. For `uright`/`uleft` the arc weight enters additively, so its gradient is
/// the item's gradient.
fn inside_adjoint<R: DeductionRule>(rule: &R, f: &EisnerTables<'_>, g: &mut EisnerTables<'_>) {
    let n = f.value.cright.size();
    for l in (1..n).rev() {
        for i in 0..n - l {
            let j = i + l;

            if i > 0 {
                rule.backward(
                    &f.split.cleft.splits(i, j, i, l),
                    &f.softmax.cleft.splits(i, j, i, l),
                    g.value.cleft.get(i, j),
                    &mut g.split.cleft.splits_mut(i, j, i, l),
                    &mut g.softmax.cleft.splits_mut(i, j, i, l),
                );
                let gs = g.split.cleft.splits(i, j, i, l);
                math::add(&mut g.value.cleft.row_mut(i, i, l), &gs);
                math::add(&mut g.value.uleft.column_mut(i, j, l), &gs);
            }

            rule.backward(
                &f.split.cright.splits(i, j, i + 1, l),
                &f.softmax.cright.splits(i, j, i + 1, l),
                g.value.cright.get(i, j),
                &mut g.split.cright.splits_mut(i, j, i + 1, l),
                &mut g.softmax.cright.splits_mut(i, j, i + 1, l),
            );
            let gs = g.split.cright.splits(i, j, i + 1, l);
            math::add(&mut g.value.uright.row_mut(i, i + 1, l), &gs);
            math::add(&mut g.value.cright.column_mut(i + 1, j, l), &gs);

            if i > 0 {
                rule.backward(
                    &f.split.uleft.splits(i, j, i, l),
                    &f.softmax.uleft.splits(i, j, i, l),
                    g.value.uleft.get(i, j),
                    &mut g.split.uleft.splits_mut(i, j, i, l),
                    &mut g.softmax.uleft.splits_mut(i, j, i, l),
                );
                let gs = g.split.uleft.splits(i, j, i, l);
                math::add(&mut g.value.cright.row_mut(i, i, l), &gs);
                math::add(&mut g.value.cleft.column_mut(i + 1, j, l), &gs);
            }

            rule.backward(
                &f.split.uright.splits(i, j, i, l),
                &f.softmax.uright.splits(i, j, i, l),
                g.value.uright.get(i, j),
                &mut g.split.uright.splits_mut(i, j, i, l),
                &mut g.softmax.uright.splits_mut(i, j, i, l),
            );
            let gs = g.split.uright.splits(i, j, i, l);
            math::add(&mut g.value.cright.row_mut(i, i, l), &gs);
            math::add(&mut g.value.cleft.column_mut(i + 1, j, l), &gs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;
    use crate::math::check_grad;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Dense `n x n` weights, indexed `[head * n + modifier]`.
    fn weights(n: usize, values: &[f64]) -> impl Fn(usize, usize) -> f64 + '_ {
        move |h, m| values[h * n + m]
    }

    fn scenario() -> Vec<f64> {
        // weights[0->1] = 1, weights[0->2] = 4, weights[1->2] = 1, weights[2->1] = 1.
        let mut w = vec![0.0; 9];
        w[1] = 1.0;
        w[2] = 4.0;
        w[3 + 2] = 1.0;
        w[6 + 1] = 1.0;
        w
    }

    fn check_gradient<R: DeductionRule + Copy>(
        rule: R,
        n: usize,
        w: &[f64],
        g: &[f64],
    ) -> std::result::Result<(), TestCaseError> {
        let loss = |w: &[f64]| {
            let mut parser = Eisner::new(n, rule).unwrap();
            parser.forward(weights(n, w)).unwrap();
            legal_arcs(n).map(|(h, m)| g[h * n + m] * parser.output(h, m)).sum::<f64>()
        };

        let mut parser = Eisner::new(n, rule).unwrap();
        parser.forward(weights(n, w)).unwrap();
        parser.backward(weights(n, g)).unwrap();

        let h = 1e-3;
        for (head, modifier) in legal_arcs(n) {
            let mut plus = w.to_vec();
            plus[head * n + modifier] += h;
            let mut minus = w.to_vec();
            minus[head * n + modifier] -= h;
            let estimated = (loss(&plus) - loss(&minus)) / (2.0 * h);
            let analytic = parser.gradient(head, modifier);
            prop_assert!(
                check_grad(analytic, estimated),
                "arc {}->{}: analytic {} vs estimated {}",
                head,
                modifier,
                analytic,
                estimated
            );
        }
        Ok(())
    }

    #[test]
    fn scenario_best_tree_attaches_the_second_word_to_the_root() {
        let w = scenario();
        let mut parser =
            AlgorithmicDifferentiableEisner::new(3, ArgmaxSoftmax::default()).unwrap();
        parser.forward(weights(3, &w)).unwrap();

        assert_eq!(parser.discrete_arc_value(0, 2).unwrap(), 1.0);
        assert_eq!(parser.discrete_arc_value(2, 1).unwrap(), 1.0);
        assert_eq!(parser.discrete_arc_value(0, 1).unwrap(), 0.0);
        assert_eq!(parser.discrete_arc_value(1, 2).unwrap(), 0.0);
        assert_eq!(parser.hard_heads(), &[None, Some(2), Some(0)]);
        assert_relative_eq!(parser.best_score(), 5.0);
        assert!(parser.output(0, 2) > parser.output(0, 1));
    }

    #[test]
    fn self_arcs_are_undefined_and_the_root_gets_no_mass() {
        let w: Vec<f64> = (0..25).map(|x| (x as f64 * 0.37).sin()).collect();
        let mut parser = EntropyRegularizedEisner::new(5, Default::default()).unwrap();
        parser.forward(weights(5, &w)).unwrap();
        for h in 0..5 {
            assert!(parser.output(h, h).is_nan());
        }
        for h in 1..5 {
            assert_eq!(parser.output(h, 0), 0.0);
        }
        assert!(parser.arc_value(2, 2).is_err());
        assert_eq!(
            parser.discrete_arc_value(3, 0).unwrap_err(),
            Error::IllegalArc {
                head: 3,
                modifier: 0,
                size: 5
            }
        );
        assert!(parser.arc_value(0, 5).is_err());
    }

    #[test]
    fn backward_needs_a_forward_pass() {
        let mut parser = Eisner::new(3, Relaxation::default()).unwrap();
        assert_eq!(parser.backward(|_, _| 1.0).unwrap_err(), Error::NotForwarded);
        let empty = Eisner::new(0, Relaxation::default());
        assert_eq!(empty.unwrap_err(), Error::EmptyChart);
    }

    #[test]
    fn non_finite_weights_and_gradients_abort() {
        let mut parser = Eisner::new(3, ArgmaxSoftmax::default()).unwrap();
        let err = parser
            .forward(|h, m| if (h, m) == (1, 2) { f64::NAN } else { 0.0 })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NonFinite {
                quantity: "score",
                first: 1,
                second: 2,
                ..
            }
        ));
        assert_eq!(parser.backward(|_, _| 0.0).unwrap_err(), Error::NotForwarded);

        parser.forward(|_, _| 0.5).unwrap();
        let err = parser.backward(|_, _| f64::INFINITY).unwrap_err();
        assert!(matches!(err, Error::NonFinite { quantity: "incoming gradient", .. }));
    }

    #[test]
    fn failed_forward_hides_the_previous_tree() {
        let w = scenario();
        let mut parser = Eisner::new(3, ArgmaxSoftmax::default()).unwrap();
        parser.forward(weights(3, &w)).unwrap();
        assert_eq!(parser.hard_heads(), &[None, Some(2), Some(0)]);

        let inf_at_2_1 = |h: usize, m: usize| {
            if (h, m) == (2, 1) {
                f64::INFINITY
            } else {
                0.0
            }
        };
        assert!(parser.forward(inf_at_2_1).is_err());
        assert_eq!(parser.hard_heads(), &[None, None, None]);
        assert_eq!(parser.arc_value(0, 2).unwrap_err(), Error::NotForwarded);
        assert_eq!(parser.discrete_arc_value(0, 2).unwrap_err(), Error::NotForwarded);
    }

    #[test]
    fn suppliers_are_called_once_per_legal_arc() {
        for n in 1..7 {
            let arcs = (n - 1) * (n - 1);
            let legal = |&(h, m): &(usize, usize)| h != m && m != 0 && h < n && m < n;
            let mut parser = Eisner::new(n, ArgmaxSoftmax::default()).unwrap();

            let mut calls = 0;
            let mut seen = HashSet::new();
            parser
                .forward(|h, m| {
                    calls += 1;
                    seen.insert((h, m));
                    0.1 * (h + 2 * m) as f64
                })
                .unwrap();
            assert_eq!(calls, arcs);
            assert_eq!(seen.len(), arcs);
            assert!(seen.iter().all(legal));

            let mut calls = 0;
            let mut seen = HashSet::new();
            parser
                .backward(|h, m| {
                    calls += 1;
                    seen.insert((h, m));
                    1.0
                })
                .unwrap();
            assert_eq!(calls, arcs);
            assert_eq!(seen.len(), arcs);
            assert!(seen.iter().all(legal));
        }
    }

    #[test]
    fn repeated_backward_calls_reuse_the_forward_charts() {
        let n = 5;
        let w: Vec<f64> = (0..n * n).map(|x| (x as f64 * 0.61).sin()).collect();
        let g1: Vec<f64> = (0..n * n).map(|x| (x as f64 * 0.23).cos()).collect();
        let g2: Vec<f64> = (0..n * n).map(|x| (x as f64 * 1.7).sin()).collect();
        for rule in [Relaxation::default(), Relaxation::entropy_regularized(0.8).unwrap()] {
            let mut parser = Eisner::new(n, rule).unwrap();
            parser.forward(weights(n, &w)).unwrap();
            let before: Vec<f64> = legal_arcs(n).map(|(h, m)| parser.output(h, m)).collect();
            parser.backward(weights(n, &g1)).unwrap();
            parser.backward(weights(n, &g2)).unwrap();
            let after: Vec<f64> = legal_arcs(n).map(|(h, m)| parser.output(h, m)).collect();
            assert_eq!(before, after);

            let mut fresh = Eisner::new(n, rule).unwrap();
            fresh.forward(weights(n, &w)).unwrap();
            fresh.backward(weights(n, &g2)).unwrap();
            for (h, m) in legal_arcs(n) {
                assert_eq!(parser.gradient(h, m), fresh.gradient(h, m));
            }
        }
    }

    #[test]
    fn single_position_chart_is_just_the_root() {
        let mut parser = Eisner::new(1, EntropyRegularized::default()).unwrap();
        parser.forward(|_, _| unreachable!()).unwrap();
        assert_eq!(parser.value(), 0.0);
        assert_eq!(parser.hard_heads(), &[None]);
        parser.backward(|_, _| unreachable!()).unwrap();
    }

    #[test]
    fn forward_is_idempotent() {
        let n = 6;
        let w: Vec<f64> = (0..n * n).map(|x| (x as f64 * 1.3).cos()).collect();
        let mut parser = Eisner::new(n, ArgmaxSoftmax::new(0.5).unwrap()).unwrap();
        parser.forward(weights(n, &w)).unwrap();
        let first: Vec<f64> = legal_arcs(n).map(|(h, m)| parser.output(h, m)).collect();
        let value = parser.value();
        parser.forward(weights(n, &w)).unwrap();
        let second: Vec<f64> = legal_arcs(n).map(|(h, m)| parser.output(h, m)).collect();
        assert_eq!(first, second);
        assert_eq!(value, parser.value());
    }

    #[test]
    fn all_construction_modes_agree() {
        let n = 5;
        let w: Vec<f64> = (0..n * n).map(|x| ((x * 7 % 11) as f64) / 5.0 - 1.0).collect();
        let rule = EntropyRegularized::new(0.7).unwrap();

        let mut owned = Eisner::new(n, rule).unwrap();
        owned.forward(weights(n, &w)).unwrap();

        let mut floats = vec![1.0; Eisner::<EntropyRegularized>::required_float_cells(n) + 3];
        let mut indices = vec![9; Eisner::<EntropyRegularized>::required_index_cells(n)];
        let mut borrowed = Eisner::in_memory(n, rule, &mut floats, &mut indices).unwrap();
        borrowed.forward(weights(n, &w)).unwrap();

        let arena = ChartArena::new(ArenaConfig {
            max_size: 8,
            float_slots: 2,
            index_slots: 1,
        });
        let mut leased = Eisner::leased(n, rule, &arena).unwrap();
        leased.forward(weights(n, &w)).unwrap();
        assert_eq!(arena.free_float_slots(), 0);
        assert!(matches!(
            Eisner::leased(n, rule, &arena).unwrap_err(),
            Error::ArenaExhausted { pool: "float", .. }
        ));

        for (h, m) in legal_arcs(n) {
            assert_eq!(owned.output(h, m), borrowed.output(h, m));
            assert_eq!(owned.output(h, m), leased.output(h, m));
        }
        assert_eq!(owned.hard_heads(), leased.hard_heads());
        drop(leased);
        assert_eq!(arena.free_float_slots(), 2);
        assert_eq!(arena.free_index_slots(), 1);

        let mut short = vec![0.0; 10];
        let mut indices = vec![0; Eisner::<EntropyRegularized>::required_index_cells(n)];
        assert!(matches!(
            Eisner::in_memory(n, rule, &mut short, &mut indices).unwrap_err(),
            Error::MemoryTooSmall { provided: 10, .. }
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn argmax_softmax_gradient_matches_finite_differences(
            n in 2usize..6,
            w in prop::collection::vec(-1.0f64..1.0, 36),
            g in prop::collection::vec(-1.0f64..1.0, 36),
        ) {
            check_gradient(ArgmaxSoftmax::default(), n, &w[..n * n], &g[..n * n])?;
        }

        #[test]
        fn entropy_regularized_gradient_matches_finite_differences(
            n in 2usize..6,
            temperature in 0.5f64..2.0,
            w in prop::collection::vec(-1.0f64..1.0, 36),
            g in prop::collection::vec(-1.0f64..1.0, 36),
        ) {
            let rule = EntropyRegularized::new(temperature).unwrap();
            check_gradient(rule, n, &w[..n * n], &g[..n * n])?;
        }

        #[test]
        fn entropy_outputs_are_derivatives_of_the_value(
            n in 2usize..6,
            w in prop::collection::vec(-2.0f64..2.0, 36),
        ) {
            let w = &w[..n * n];
            let value = |w: &[f64]| {
                let mut parser = EntropyRegularizedEisner::new(n, Default::default()).unwrap();
                parser.forward(weights(n, w)).unwrap();
                parser.value()
            };
            let mut parser = EntropyRegularizedEisner::new(n, Default::default()).unwrap();
            parser.forward(weights(n, w)).unwrap();
            let h = 1e-3;
            for (head, modifier) in legal_arcs(n) {
                let mut plus = w.to_vec();
                plus[head * n + modifier] += h;
                let mut minus = w.to_vec();
                minus[head * n + modifier] -= h;
                let estimated = (value(&plus) - value(&minus)) / (2.0 * h);
                prop_assert!(check_grad(parser.output(head, modifier), estimated));
            }
        }

        #[test]
        fn every_modifier_has_one_unit_of_head_mass(
            n in 2usize..8,
            entropy in any::<bool>(),
            w in prop::collection::vec(-3.0f64..3.0, 49),
        ) {
            let rule = if entropy {
                Relaxation::entropy_regularized(1.0)
            } else {
                Relaxation::argmax_softmax(1.0)
            };
            let mut parser = Eisner::new(n, rule.unwrap()).unwrap();
            parser.forward(weights(n, &w[..n * n])).unwrap();
            for modifier in 1..n {
                let mass: f64 = (0..n)
                    .filter(|&h| h != modifier)
                    .map(|h| parser.output(h, modifier))
                    .sum();
                prop_assert!((mass - 1.0).abs() < 1e-9, "modifier {} has mass {}", modifier, mass);
            }
        }

        #[test]
        fn hard_tree_is_a_tree_scoring_the_best_score(
            n in 2usize..8,
            w in prop::collection::vec(-3.0f64..3.0, 49),
        ) {
            let w = &w[..n * n];
            let mut parser = Eisner::new(n, ArgmaxSoftmax::default()).unwrap();
            parser.forward(weights(n, w)).unwrap();
            let heads = parser.hard_heads().to_vec();
            prop_assert_eq!(heads[0], None);

            let mut score = 0.0;
            for (modifier, head) in heads.iter().enumerate().skip(1) {
                let head = head.expect("every word has a head");
                prop_assert_ne!(head, modifier);
                prop_assert_eq!(parser.discrete_arc_value(head, modifier).unwrap(), 1.0);
                score += w[head * n + modifier];

                // Following heads reaches the root without a cycle.
                let mut at = modifier;
                for _ in 0..n {
                    match heads[at] {
                        Some(h) => at = h,
                        None => break,
                    }
                }
                prop_assert_eq!(at, 0);
            }
            prop_assert!((score - parser.best_score()).abs() < 1e-9);
            let used = legal_arcs(n)
                .filter(|&(h, m)| parser.discrete_arc_value(h, m).unwrap() == 1.0)
                .count();
            prop_assert_eq!(used, n - 1);
        }
    }
}
