//! Errors shared by every chart operator in this crate.

/// Errors for chart allocation, parsing passes and the dense-matrix adapters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A chart needs at least one position (the root).
    #[error("chart size must be at least 1")]
    EmptyChart,
    /// Requested chart is larger than what the arena was configured for.
    #[error("chart of size {size} exceeds the arena capacity ({max_size})")]
    ChartTooLarge {
        /// Requested sentence length (including the root position).
        size: usize,
        /// Largest size the arena slots were configured for.
        max_size: usize,
    },
    /// Every slot of an arena pool is currently leased.
    #[error("no free slot left in the {pool} pool ({slots} slots, all leased)")]
    ArenaExhausted {
        /// Which pool ran out (`"float"` or `"index"`).
        pool: &'static str,
        /// Number of slots in that pool.
        slots: usize,
    },
    /// A lease asked for more cells than the chart size can need.
    #[error("lease of {cells} cells exceeds the slot capacity ({capacity})")]
    LeaseTooLarge {
        /// Requested number of cells.
        cells: usize,
        /// Largest chart, in cells, of the requested size.
        capacity: usize,
    },
    /// Caller-supplied memory cannot hold the chart.
    #[error("memory block has {provided} cells, chart needs {required}")]
    MemoryTooSmall {
        /// Length of the provided slice.
        provided: usize,
        /// Cells required for the requested chart size.
        required: usize,
    },
    /// Smoothing temperature must be positive and finite.
    #[error("temperature must be positive and finite, got {0}")]
    InvalidTemperature(f64),
    /// The arc cannot exist in a dependency tree of this size.
    #[error("illegal arc {head} -> {modifier} for a chart of size {size}")]
    IllegalArc {
        /// Head index.
        head: usize,
        /// Modifier index.
        modifier: usize,
        /// Chart size (root included).
        size: usize,
    },
    /// The span cannot exist in a binary tree of this size.
    #[error("illegal span ({left}, {right}) for a chart of size {size}")]
    IllegalSpan {
        /// Left boundary.
        left: usize,
        /// Right boundary.
        right: usize,
        /// Chart size.
        size: usize,
    },
    /// A weight, output or gradient is NaN or infinite.
    #[error("non-finite {quantity} at ({first}, {second}): {value}")]
    NonFinite {
        /// What was being checked (`"score"`, `"output"`, `"incoming gradient"`, `"gradient"`).
        quantity: &'static str,
        /// First index (head or left boundary).
        first: usize,
        /// Second index (modifier or right boundary).
        second: usize,
        /// The offending value.
        value: f64,
    },
    /// `backward` needs the charts filled by a previous `forward`.
    #[error("backward called before forward")]
    NotForwarded,
    /// A batched backward call got a different number of matrices than the forward call.
    #[error("got {provided} matrices, the forward pass had {expected}")]
    BatchMismatch {
        /// Number of matrices passed to `backward`.
        provided: usize,
        /// Number of sentences of the last `forward`.
        expected: usize,
    },
    /// Dense matrix handed to an adapter has the wrong shape.
    #[error("matrix has shape {rows}x{cols}, expected {expected}x{expected}")]
    ShapeMismatch {
        /// Rows of the provided matrix.
        rows: usize,
        /// Columns of the provided matrix.
        cols: usize,
        /// Expected (square) dimension.
        expected: usize,
    },
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn ensure_finite(
    quantity: &'static str,
    first: usize,
    second: usize,
    value: f64,
) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        log::warn!("non-finite {quantity} at ({first}, {second}): {value}");
        Err(Error::NonFinite {
            quantity,
            first,
            second,
            value,
        })
    }
}
