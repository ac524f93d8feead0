//! Differentiable chart parsers with hand-derived gradients.
//!
//! Two classical dynamic programs, relaxed so that their output is a smooth function of the
//! input scores:
//!
//! - [`eisner`]: Eisner's algorithm for projective dependency trees (root at position 0).
//! - [`phrase`]: a CKY-style recursion over unlabeled binary phrase-structure trees.
//!
//! Each parser runs an inside pass, a top-down backtracking pass giving a soft selection weight
//! per arc/span, and a reverse pass giving the gradient of any downstream loss w.r.t. the input
//! scores. The `max` of each recursion step is replaced by a [`deduction::DeductionRule`]:
//! a softmax-weighted argmax ([`ArgmaxSoftmax`]) or log-sum-exp ([`EntropyRegularized`]). The
//! exact Viterbi tree is decoded alongside ([`hard`]).
//!
//! Public invariants (must not change):
//! - Gradients are closed-form adjoints of each recursion step; there is no autodiff tape.
//! - Numeric code is deterministic (no RNG anywhere).
//! - Temperatures are explicit and validated; non-finite scores, outputs and gradients are errors.
//! - A chart instance is single-threaded; independent charts may run on different threads, each
//!   with its own arena slot.
//!
//! ```
//! use diffparse::{ArgmaxSoftmax, Eisner};
//!
//! // weights[head][modifier], position 0 is the root.
//! let w = [[0.0, 1.0, 4.0], [0.0, 0.0, 1.0], [0.0, 2.0, 0.0]];
//! let mut parser = Eisner::new(3, ArgmaxSoftmax::default())?;
//! parser.forward(|h, m| w[h][m])?;
//! assert_eq!(parser.hard_heads(), &[None, Some(2), Some(0)]);
//! assert!(parser.output(0, 2) > parser.output(0, 1));
//!
//! parser.backward(|h, m| if (h, m) == (0, 2) { 1.0 } else { 0.0 })?;
//! assert!(parser.gradient(0, 1).is_finite());
//! # Ok::<(), diffparse::Error>(())
//! ```

pub mod arena;
pub mod chart;
pub mod deduction;
pub mod eisner;
pub mod error;
pub mod hard;
pub mod math;
pub mod phrase;
pub mod relax;

pub use arena::{ArenaConfig, ChartArena};
pub use deduction::{ArgmaxSoftmax, DeductionRule, EntropyRegularized, Relaxation};
pub use eisner::{AlgorithmicDifferentiableEisner, Eisner, EntropyRegularizedEisner};
pub use error::{Error, Result};
pub use phrase::{
    AlgorithmicDifferentiableBinaryPhrase, BinaryPhrase, EntropyRegularizedBinaryPhrase,
};
pub use relax::{
    convert, from_adjacency, from_compact, DependencyLayer, DependencySettings, DiscreteMode,
    GraphMode, PhraseLayer, PhraseSettings,
};
