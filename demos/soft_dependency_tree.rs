//! Learning arc scores through a relaxed Eisner parser.
//!
//! A toy setup:
//! - Arc scores for a short sentence come from a hand-written "model" (a few heuristics).
//! - The gold tree disagrees with the heuristics on one attachment.
//! - We run the batched [`DependencyLayer`] forward (soft arcs), take a squared loss against
//!   the gold adjacency matrix, and do a few gradient steps directly on the score matrix.
//!
//! The soft arc matrix moves toward the gold tree, and the hard decode flips once the
//! gold attachment wins.

use diffparse::{DependencyLayer, DependencySettings, Relaxation};
use ndarray::Array2;

fn print_heads(words: &[&str], heads: &[Option<usize>]) {
    for (m, head) in heads.iter().enumerate().skip(1) {
        let h = head.unwrap_or(0);
        println!("  {:>6} <- {}", words[m], words[h]);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let words = ["<root>", "she", "saw", "stars", "tonight"];
    let n = words.len();

    // scores[head][modifier]; the verb is the obvious root child.
    let mut scores = Array2::<f64>::zeros((n, n));
    scores[[0, 2]] = 3.0;
    scores[[2, 1]] = 2.0;
    scores[[2, 3]] = 2.0;
    // The heuristic prefers attaching "tonight" to the nearest noun.
    scores[[3, 4]] = 1.5;
    scores[[2, 4]] = 1.0;

    let mut gold = Array2::<f64>::zeros((n, n));
    for (h, m) in [(0, 2), (2, 1), (2, 3), (2, 4)] {
        gold[[h, m]] = 1.0;
    }

    let settings = DependencySettings {
        relaxation: Relaxation::entropy_regularized(0.5)?,
        ..DependencySettings::default()
    };
    let mut layer = DependencyLayer::new(settings);

    let learning_rate = 0.5;
    for step in 0..8 {
        let outputs = layer.forward(std::slice::from_ref(&scores))?;
        let soft = &outputs[0];

        let diff = soft - &gold;
        let loss = 0.5 * diff.iter().map(|d| d * d).sum::<f64>();
        println!("step {step}: loss = {loss:.4}, p(saw -> tonight) = {:.3}", soft[[2, 4]]);
        if step == 0 || step == 7 {
            print_heads(&words, layer.parsers()[0].hard_heads());
        }

        let gradients = layer.backward(&[diff])?;
        scores.scaled_add(-learning_rate, &gradients[0]);
    }

    Ok(())
}
