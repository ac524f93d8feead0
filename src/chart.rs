//! Dense chart storage.
//!
//! Charts are flat, row-major arrays addressed by `(i, j)` ([`Matrix`]) or `(i, j, k)`
//! ([`Tensor3`]). The recurrences read whole lines of a chart at once: a row segment
//! (`(i, j..j+len)`, stride 1), a column segment (`(i..i+len, j)`, stride `n`) or a run of split
//! points (`(i, j, k..k+len)`). Those lines are exposed as [`Line`]/[`LineMut`] cursors, which the
//! vector primitives in [`crate::math`] accept through the [`Cursor`]/[`CursorMut`] traits, so a
//! row and a column are interchangeable arguments.

use std::ops::{Deref, DerefMut};

use crate::arena::Lease;
use crate::error::{Error, Result};

/// Backing memory of a chart: owned, borrowed from the caller, or leased from an arena.
#[derive(Debug)]
pub enum Buffer<'a, T: Copy + Default> {
    /// Allocated and freed by the chart itself.
    Owned(Vec<T>),
    /// Caller-supplied memory; the chart only writes into it.
    Borrowed(&'a mut [T]),
    /// A slot of a [`crate::arena::ChartArena`], returned on drop.
    Leased(Lease<'a, T>),
}

impl<T: Copy + Default> Deref for Buffer<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Borrowed(s) => s,
            Buffer::Leased(l) => l,
        }
    }
}

impl<T: Copy + Default> DerefMut for Buffer<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Borrowed(s) => s,
            Buffer::Leased(l) => l,
        }
    }
}

impl<'a, T: Copy + Default> Buffer<'a, T> {
    /// Zero-filled owned buffer.
    pub fn zeros(cells: usize) -> Self {
        Buffer::Owned(vec![T::default(); cells])
    }

    /// Borrow the first `cells` cells of `memory`, zero-filling them.
    pub fn in_memory(cells: usize, memory: &'a mut [T]) -> Result<Self> {
        if memory.len() < cells {
            return Err(Error::MemoryTooSmall {
                provided: memory.len(),
                required: cells,
            });
        }
        let memory = &mut memory[..cells];
        memory.fill(T::default());
        Ok(Buffer::Borrowed(memory))
    }

    /// Wrap an arena lease, which must hold at least `cells` cells.
    pub fn leased(cells: usize, lease: Lease<'a, T>) -> Result<Self> {
        if lease.len() < cells {
            return Err(Error::MemoryTooSmall {
                provided: lease.len(),
                required: cells,
            });
        }
        Ok(Buffer::Leased(lease))
    }

    /// Whether this buffer frees its memory itself.
    pub fn is_owned(&self) -> bool {
        matches!(self, Buffer::Owned(_))
    }
}

/// Cut the first `len` cells off `rest`.
pub(crate) fn carve<'s, T>(rest: &mut &'s mut [T], len: usize) -> &'s mut [T] {
    let (head, tail) = std::mem::take(rest).split_at_mut(len);
    *rest = tail;
    head
}

/// Read-only sequence of chart cells, consumed by the vector primitives.
pub trait Cursor {
    /// Number of cells.
    fn len(&self) -> usize;

    /// Cell values in order.
    fn values(&self) -> impl Iterator<Item = f64> + '_;

    /// Whether the sequence is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writable sequence of chart cells.
pub trait CursorMut: Cursor {
    /// Mutable references to the cells, in order.
    fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_;
}

impl Cursor for [f64] {
    fn len(&self) -> usize {
        <[f64]>::len(self)
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.iter().copied()
    }
}

impl CursorMut for [f64] {
    fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.iter_mut()
    }
}

/// Strided read-only view of `len` cells.
#[derive(Debug, Clone, Copy)]
pub struct Line<'s> {
    data: &'s [f64],
    stride: usize,
    len: usize,
}

impl<'s> Line<'s> {
    fn new(data: &'s [f64], start: usize, stride: usize, len: usize) -> Self {
        debug_assert!(len == 0 || start + (len - 1) * stride < data.len());
        Self {
            data: &data[start.min(data.len())..],
            stride,
            len,
        }
    }

    /// The `k`-th cell of the line.
    pub fn get(&self, k: usize) -> f64 {
        debug_assert!(k < self.len);
        self.data[k * self.stride]
    }
}

impl Cursor for Line<'_> {
    fn len(&self) -> usize {
        self.len
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().step_by(self.stride).take(self.len).copied()
    }
}

/// Strided writable view of `len` cells.
#[derive(Debug)]
pub struct LineMut<'s> {
    data: &'s mut [f64],
    stride: usize,
    len: usize,
}

impl<'s> LineMut<'s> {
    fn new(data: &'s mut [f64], start: usize, stride: usize, len: usize) -> Self {
        debug_assert!(len == 0 || start + (len - 1) * stride < data.len());
        let start = start.min(data.len());
        Self {
            data: &mut data[start..],
            stride,
            len,
        }
    }

    /// The `k`-th cell of the line.
    pub fn get(&self, k: usize) -> f64 {
        debug_assert!(k < self.len);
        self.data[k * self.stride]
    }
}

impl Cursor for LineMut<'_> {
    fn len(&self) -> usize {
        self.len
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().step_by(self.stride).take(self.len).copied()
    }
}

impl CursorMut for LineMut<'_> {
    fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.data.iter_mut().step_by(self.stride).take(self.len)
    }
}

/// `n x n` chart, row-major.
#[derive(Debug)]
pub struct Matrix<'a, T: Copy + Default = f64> {
    n: usize,
    data: Buffer<'a, T>,
}

impl<T: Copy + Default> Matrix<'static, T> {
    /// Owned, zero-filled matrix.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            data: Buffer::zeros(Self::required_cells(n)),
        }
    }
}

impl<'a, T: Copy + Default> Matrix<'a, T> {
    /// Cells needed for an `n x n` matrix.
    pub fn required_cells(n: usize) -> usize {
        n * n
    }

    /// Matrix written into caller memory; the used prefix is zero-filled.
    pub fn in_memory(n: usize, memory: &'a mut [T]) -> Result<Self> {
        Ok(Self {
            n,
            data: Buffer::in_memory(Self::required_cells(n), memory)?,
        })
    }

    /// View over memory already owned by a larger chart; no zero-filling.
    pub(crate) fn view(n: usize, memory: &'a mut [T]) -> Self {
        debug_assert_eq!(memory.len(), Self::required_cells(n));
        Self {
            n,
            data: Buffer::Borrowed(memory),
        }
    }

    /// Side length.
    pub fn size(&self) -> usize {
        self.n
    }

    /// Cell `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[i * self.n + j]
    }

    /// Overwrite cell `(i, j)`.
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        self.data[i * self.n + j] = value;
    }

    /// Mutable reference to cell `(i, j)`.
    pub fn at_mut(&mut self, i: usize, j: usize) -> &mut T {
        &mut self.data[i * self.n + j]
    }

    /// Reset every cell to `T::default()`.
    pub fn zero(&mut self) {
        self.data.fill(T::default());
    }
}

impl Matrix<'_, f64> {
    /// Cells `(i, j), (i, j+1), ..., (i, j+len-1)`.
    pub fn row(&self, i: usize, j: usize, len: usize) -> Line<'_> {
        Line::new(&self.data, i * self.n + j, 1, len)
    }

    /// Cells `(i, j), (i+1, j), ..., (i+len-1, j)`.
    pub fn column(&self, i: usize, j: usize, len: usize) -> Line<'_> {
        Line::new(&self.data, i * self.n + j, self.n, len)
    }

    /// Writable [`Matrix::row`].
    pub fn row_mut(&mut self, i: usize, j: usize, len: usize) -> LineMut<'_> {
        let start = i * self.n + j;
        LineMut::new(&mut self.data, start, 1, len)
    }

    /// Writable [`Matrix::column`].
    pub fn column_mut(&mut self, i: usize, j: usize, len: usize) -> LineMut<'_> {
        let (start, stride) = (i * self.n + j, self.n);
        LineMut::new(&mut self.data, start, stride, len)
    }
}

/// `n x n x n` chart, row-major in the last index.
#[derive(Debug)]
pub struct Tensor3<'a> {
    n: usize,
    data: Buffer<'a, f64>,
}

impl Tensor3<'static> {
    /// Owned, zero-filled tensor.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            data: Buffer::zeros(Self::required_cells(n)),
        }
    }
}

impl<'a> Tensor3<'a> {
    /// Cells needed for an `n x n x n` tensor.
    pub fn required_cells(n: usize) -> usize {
        n * n * n
    }

    /// Tensor written into caller memory; the used prefix is zero-filled.
    pub fn in_memory(n: usize, memory: &'a mut [f64]) -> Result<Self> {
        Ok(Self {
            n,
            data: Buffer::in_memory(Self::required_cells(n), memory)?,
        })
    }

    pub(crate) fn view(n: usize, memory: &'a mut [f64]) -> Self {
        debug_assert_eq!(memory.len(), Self::required_cells(n));
        Self {
            n,
            data: Buffer::Borrowed(memory),
        }
    }

    /// Side length.
    pub fn size(&self) -> usize {
        self.n
    }

    fn offset(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.n + j) * self.n + k
    }

    /// Cell `(i, j, k)`.
    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.data[self.offset(i, j, k)]
    }

    /// Overwrite cell `(i, j, k)`.
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: f64) {
        let offset = self.offset(i, j, k);
        self.data[offset] = value;
    }

    /// Split points `(i, j, k), ..., (i, j, k+len-1)`.
    pub fn splits(&self, i: usize, j: usize, k: usize, len: usize) -> Line<'_> {
        Line::new(&self.data, self.offset(i, j, k), 1, len)
    }

    /// Writable [`Tensor3::splits`].
    pub fn splits_mut(&mut self, i: usize, j: usize, k: usize, len: usize) -> LineMut<'_> {
        let start = self.offset(i, j, k);
        LineMut::new(&mut self.data, start, 1, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_and_columns_follow_row_major_layout() {
        let mut m = Matrix::new(4);
        for i in 0..4 {
            for j in 0..4 {
                m.set(i, j, (10 * i + j) as f64);
            }
        }
        let row: Vec<f64> = m.row(1, 1, 3).values().collect();
        assert_eq!(row, vec![11.0, 12.0, 13.0]);
        let col: Vec<f64> = m.column(1, 3, 3).values().collect();
        assert_eq!(col, vec![13.0, 23.0, 33.0]);
        assert_eq!(m.column(0, 2, 4).get(3), 32.0);

        m.column_mut(2, 0, 2).values_mut().for_each(|x| *x = -1.0);
        assert_eq!(m.get(2, 0), -1.0);
        assert_eq!(m.get(3, 0), -1.0);
        assert_eq!(m.get(1, 0), 10.0);
    }

    #[test]
    fn tensor_split_lines_are_contiguous() {
        let mut t = Tensor3::new(3);
        t.set(1, 2, 0, 1.0);
        t.set(1, 2, 1, 2.0);
        t.set(1, 2, 2, 3.0);
        let s: Vec<f64> = t.splits(1, 2, 1, 2).values().collect();
        assert_eq!(s, vec![2.0, 3.0]);
        t.splits_mut(1, 2, 0, 3).values_mut().for_each(|x| *x *= 2.0);
        assert_eq!(t.get(1, 2, 2), 6.0);
        assert_eq!(t.get(0, 0, 0), 0.0);
    }

    #[test]
    fn borrowed_construction_zero_fills_and_checks_length() {
        let mut memory = vec![5.0; 10];
        {
            let m = Matrix::in_memory(3, &mut memory).unwrap();
            assert_eq!(m.get(2, 2), 0.0);
        }
        assert_eq!(memory[9], 5.0);
        assert!(memory[..9].iter().all(|&x| x == 0.0));

        let mut short = vec![0.0; 7];
        assert_eq!(
            Tensor3::in_memory(2, &mut short).unwrap_err(),
            Error::MemoryTooSmall {
                provided: 7,
                required: 8
            }
        );
    }

    #[test]
    fn index_matrices_share_the_layout() {
        let mut m: Matrix<'_, usize> = Matrix::new(3);
        *m.at_mut(2, 1) += 4;
        assert_eq!(m.get(2, 1), 4);
        m.zero();
        assert_eq!(m.get(2, 1), 0);
    }

    #[test]
    fn buffers_know_who_owns_them() {
        let arena = crate::arena::ChartArena::default();
        let mut memory = vec![1.0; 6];
        assert!(Buffer::<f64>::zeros(4).is_owned());
        assert!(!Buffer::in_memory(4, &mut memory).unwrap().is_owned());

        let leased = Buffer::leased(4, arena.lease_floats(2, 4).unwrap()).unwrap();
        assert!(!leased.is_owned());
        assert_eq!(leased.len(), 4);
    }

    #[test]
    fn carve_splits_disjoint_prefixes() {
        let mut memory = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut rest: &mut [f64] = &mut memory;
        let a = carve(&mut rest, 2);
        let b = carve(&mut rest, 3);
        a[0] = 0.0;
        b[2] = 0.0;
        assert_eq!(memory, [0.0, 2.0, 3.0, 4.0, 0.0]);
    }
}
