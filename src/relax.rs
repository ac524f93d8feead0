//! Dense-matrix adapters around the parsers.
//!
//! These layers take one square score matrix per sentence, run one parser per sentence (in
//! parallel across sentences) and return one matrix per sentence, keeping the parsers around
//! for the matching `backward` call.
//!
//! Dependency arcs come in two matrix conventions ([`GraphMode`]):
//!
//! - **Adjacency**: `n x n`, entry `(head, modifier)`, row/column 0 is the root. Column 0 and the
//!   diagonal are meaningless.
//! - **Compact**: `(n-1) x (n-1)`, words only; the diagonal entry `(m, m)` holds the root arc
//!   `0 -> m+1`, and `(h, m)` with `h != m` holds the arc `h+1 -> m+1`.

use ndarray::Array2;
use rayon::prelude::*;

use crate::arena::ChartArena;
use crate::deduction::Relaxation;
use crate::eisner::Eisner;
use crate::error::{ensure_finite, Error, Result};
use crate::phrase::BinaryPhrase;

/// What a layer outputs and how gradients flow back through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscreteMode {
    /// Hard structure forward, no gradient backward.
    Null,
    /// Hard structure forward, incoming gradient copied unchanged backward.
    StraightThrough,
    /// Relaxed structure forward, its exact gradient backward.
    #[default]
    ForwardRegularized,
    /// Hard structure forward, gradient of the relaxation backward.
    BackwardRegularized,
}

/// Matrix convention for dependency arcs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphMode {
    /// Square matrix over root and words.
    #[default]
    Adjacency,
    /// Square matrix over words only, root arcs on the diagonal.
    Compact,
}

/// Position of the adjacency arc `(head, modifier)` in a matrix using `mode`.
///
/// # Panics
///
/// Panics when `mode` is [`GraphMode::Compact`] and `modifier` is 0: the root is never a
/// modifier, so that arc has no compact position.
pub fn from_adjacency((head, modifier): (usize, usize), mode: GraphMode) -> (usize, usize) {
    match mode {
        GraphMode::Adjacency => (head, modifier),
        GraphMode::Compact => {
            assert!(modifier >= 1, "root arc ({head}, 0) has no compact position");
            let modifier = modifier - 1;
            if head == 0 {
                (modifier, modifier)
            } else {
                (head - 1, modifier)
            }
        }
    }
}

/// Position of the compact arc `(head, modifier)` in a matrix using `mode`.
pub fn from_compact((head, modifier): (usize, usize), mode: GraphMode) -> (usize, usize) {
    match mode {
        GraphMode::Compact => (head, modifier),
        GraphMode::Adjacency if head == modifier => (0, modifier + 1),
        GraphMode::Adjacency => (head + 1, modifier + 1),
    }
}

/// Move an arc position from convention `from` to convention `to`.
pub fn convert(arc: (usize, usize), from: GraphMode, to: GraphMode) -> (usize, usize) {
    match from {
        GraphMode::Adjacency => from_adjacency(arc, to),
        GraphMode::Compact => from_compact(arc, to),
    }
}

/// Settings of a [`DependencyLayer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DependencySettings {
    /// Relaxation of the Eisner recursion.
    pub relaxation: Relaxation,
    /// Output and gradient behaviour.
    pub mode: DiscreteMode,
    /// Convention of the score matrices.
    pub input_graph: GraphMode,
    /// Convention of the output matrices (and of the incoming gradients).
    pub output_graph: GraphMode,
    /// When false, root arcs score 0, are reported as 0 and receive no gradient.
    pub with_root_arcs: bool,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            relaxation: Relaxation::default(),
            mode: DiscreteMode::default(),
            input_graph: GraphMode::Adjacency,
            output_graph: GraphMode::Adjacency,
            with_root_arcs: true,
        }
    }
}

/// Settings of a [`PhraseLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhraseSettings {
    /// Relaxation of the CKY recursion.
    pub relaxation: Relaxation,
    /// Output and gradient behaviour.
    pub mode: DiscreteMode,
}

fn square(matrix: &Array2<f64>) -> Result<usize> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(Error::ShapeMismatch {
            rows,
            cols,
            expected: rows,
        });
    }
    Ok(rows)
}

fn expect_square(matrix: &Array2<f64>, expected: usize) -> Result<()> {
    let (rows, cols) = matrix.dim();
    if rows != expected || cols != expected {
        return Err(Error::ShapeMismatch { rows, cols, expected });
    }
    Ok(())
}

/// Batched Eisner layer over dense arc-score matrices.
///
/// Parsers own their charts, or lease them from an arena given at construction (two float
/// slots and one index slot per sentence, held until the next `forward` or until the layer is
/// dropped).
#[derive(Debug)]
pub struct DependencyLayer<'a> {
    settings: DependencySettings,
    arena: Option<&'a ChartArena>,
    parsers: Vec<Eisner<'a>>,
    forwarded: bool,
}

impl DependencyLayer<'static> {
    /// Layer whose parsers allocate their own charts.
    pub fn new(settings: DependencySettings) -> Self {
        Self {
            settings,
            arena: None,
            parsers: Vec::new(),
            forwarded: false,
        }
    }
}

impl<'a> DependencyLayer<'a> {
    /// Layer whose parsers lease their charts from `arena`.
    pub fn with_arena(settings: DependencySettings, arena: &'a ChartArena) -> Self {
        Self {
            settings,
            arena: Some(arena),
            parsers: Vec::new(),
            forwarded: false,
        }
    }

    /// Layer settings.
    pub fn settings(&self) -> &DependencySettings {
        &self.settings
    }

    /// Parsers of the last forward pass, one per sentence.
    pub fn parsers(&self) -> &[Eisner<'a>] {
        &self.parsers
    }

    /// Parse every sentence; returns one arc matrix per sentence in the output convention.
    pub fn forward(&mut self, inputs: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        self.forwarded = false;
        // Release leases before asking for new ones.
        self.parsers.clear();

        let settings = self.settings;
        let arena = self.arena;
        let parsed: Vec<_> = inputs
            .par_iter()
            .map(|input| -> Result<(Eisner<'a>, Array2<f64>)> {
                let rows = square(input)?;
                let n = match settings.input_graph {
                    GraphMode::Adjacency => rows,
                    GraphMode::Compact => rows + 1,
                };
                let mut parser = match arena {
                    Some(arena) => Eisner::leased(n, settings.relaxation, arena)?,
                    None => Eisner::new(n, settings.relaxation)?,
                };
                parser.forward(|head, modifier| {
                    if head == 0 && !settings.with_root_arcs {
                        0.0
                    } else {
                        input[from_adjacency((head, modifier), settings.input_graph)]
                    }
                })?;
                let output = dependency_output(&parser, &settings)?;
                Ok((parser, output))
            })
            .collect::<Result<_>>()?;

        let (parsers, outputs): (Vec<_>, Vec<_>) = parsed.into_iter().unzip();
        self.parsers = parsers;
        self.forwarded = true;
        log::trace!("dependency layer forward over {} sentences", outputs.len());
        Ok(outputs)
    }

    /// Gradient w.r.t. the score matrices, given the gradient w.r.t. the last outputs.
    pub fn backward(&mut self, gradients: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        if !self.forwarded {
            return Err(Error::NotForwarded);
        }
        if gradients.len() != self.parsers.len() {
            return Err(Error::BatchMismatch {
                provided: gradients.len(),
                expected: self.parsers.len(),
            });
        }

        let settings = self.settings;
        let counted = |head: usize| head != 0 || settings.with_root_arcs;
        self.parsers
            .par_iter_mut()
            .zip(gradients)
            .map(|(parser, incoming)| -> Result<Array2<f64>> {
                let n = parser.size();
                expect_square(incoming, graph_side(n, settings.output_graph))?;
                let side = graph_side(n, settings.input_graph);
                let mut gradient = Array2::zeros((side, side));
                match settings.mode {
                    DiscreteMode::Null => {}
                    DiscreteMode::StraightThrough => {
                        for (head, modifier) in arcs(n).filter(|&(h, _)| counted(h)) {
                            let arc = (head, modifier);
                            let g = incoming[from_adjacency(arc, settings.output_graph)];
                            let g = ensure_finite("incoming gradient", head, modifier, g)?;
                            gradient[from_adjacency(arc, settings.input_graph)] += g;
                        }
                    }
                    DiscreteMode::ForwardRegularized | DiscreteMode::BackwardRegularized => {
                        parser.backward(|head, modifier| {
                            if counted(head) {
                                incoming[from_adjacency((head, modifier), settings.output_graph)]
                            } else {
                                0.0
                            }
                        })?;
                        for (head, modifier) in arcs(n).filter(|&(h, _)| counted(h)) {
                            let at = from_adjacency((head, modifier), settings.input_graph);
                            gradient[at] += parser.gradient(head, modifier);
                        }
                    }
                }
                Ok(gradient)
            })
            .collect()
    }
}

/// Matrix side for a chart of `n` positions in convention `mode`.
fn graph_side(n: usize, mode: GraphMode) -> usize {
    match mode {
        GraphMode::Adjacency => n,
        GraphMode::Compact => n - 1,
    }
}

fn arcs(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).flat_map(move |head| (1..n).filter(move |&m| m != head).map(move |m| (head, m)))
}

fn spans(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).flat_map(move |left| (left + 1..n).map(move |right| (left, right)))
}

fn dependency_output(parser: &Eisner<'_>, settings: &DependencySettings) -> Result<Array2<f64>> {
    let n = parser.size();
    let side = graph_side(n, settings.output_graph);
    let mut output = Array2::zeros((side, side));
    for (head, modifier) in arcs(n) {
        if head == 0 && !settings.with_root_arcs {
            continue;
        }
        let value = match settings.mode {
            DiscreteMode::ForwardRegularized => parser.arc_value(head, modifier)?,
            _ => parser.discrete_arc_value(head, modifier)?,
        };
        output[from_adjacency((head, modifier), settings.output_graph)] = value;
    }
    Ok(output)
}

/// Batched binary-phrase layer over dense span-score matrices (upper triangle used).
#[derive(Debug)]
pub struct PhraseLayer<'a> {
    settings: PhraseSettings,
    arena: Option<&'a ChartArena>,
    parsers: Vec<BinaryPhrase<'a>>,
    forwarded: bool,
}

impl PhraseLayer<'static> {
    /// Layer whose parsers allocate their own charts.
    pub fn new(settings: PhraseSettings) -> Self {
        Self {
            settings,
            arena: None,
            parsers: Vec::new(),
            forwarded: false,
        }
    }
}

impl<'a> PhraseLayer<'a> {
    /// Layer whose parsers lease their charts from `arena`.
    pub fn with_arena(settings: PhraseSettings, arena: &'a ChartArena) -> Self {
        Self {
            settings,
            arena: Some(arena),
            parsers: Vec::new(),
            forwarded: false,
        }
    }

    /// Layer settings.
    pub fn settings(&self) -> &PhraseSettings {
        &self.settings
    }

    /// Parsers of the last forward pass, one per sentence.
    pub fn parsers(&self) -> &[BinaryPhrase<'a>] {
        &self.parsers
    }

    /// Parse every sentence; returns one span matrix per sentence.
    pub fn forward(&mut self, inputs: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        self.forwarded = false;
        self.parsers.clear();

        let settings = self.settings;
        let arena = self.arena;
        let parsed: Vec<_> = inputs
            .par_iter()
            .map(|input| -> Result<(BinaryPhrase<'a>, Array2<f64>)> {
                let n = square(input)?;
                let mut parser = match arena {
                    Some(arena) => BinaryPhrase::leased(n, settings.relaxation, arena)?,
                    None => BinaryPhrase::new(n, settings.relaxation)?,
                };
                parser.forward(|left, right| input[(left, right)])?;
                let mut output = Array2::zeros((n, n));
                for (left, right) in spans(n) {
                    output[(left, right)] = match settings.mode {
                        DiscreteMode::ForwardRegularized => parser.span_value(left, right)?,
                        _ => parser.discrete_span_value(left, right)?,
                    };
                }
                Ok((parser, output))
            })
            .collect::<Result<_>>()?;

        let (parsers, outputs): (Vec<_>, Vec<_>) = parsed.into_iter().unzip();
        self.parsers = parsers;
        self.forwarded = true;
        log::trace!("phrase layer forward over {} sentences", outputs.len());
        Ok(outputs)
    }

    /// Gradient w.r.t. the span-score matrices.
    pub fn backward(&mut self, gradients: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        if !self.forwarded {
            return Err(Error::NotForwarded);
        }
        if gradients.len() != self.parsers.len() {
            return Err(Error::BatchMismatch {
                provided: gradients.len(),
                expected: self.parsers.len(),
            });
        }

        let mode = self.settings.mode;
        self.parsers
            .par_iter_mut()
            .zip(gradients)
            .map(|(parser, incoming)| -> Result<Array2<f64>> {
                let n = parser.size();
                expect_square(incoming, n)?;
                let mut gradient = Array2::zeros((n, n));
                match mode {
                    DiscreteMode::Null => {}
                    DiscreteMode::StraightThrough => {
                        for (left, right) in spans(n) {
                            let g = incoming[(left, right)];
                            let g = ensure_finite("incoming gradient", left, right, g)?;
                            gradient[(left, right)] = g;
                        }
                    }
                    DiscreteMode::ForwardRegularized | DiscreteMode::BackwardRegularized => {
                        parser.backward(|left, right| incoming[(left, right)])?;
                        for (left, right) in spans(n) {
                            gradient[(left, right)] = parser.gradient(left, right);
                        }
                    }
                }
                Ok(gradient)
            })
            .collect()
    }
}
