//! Soft bracketing of a short phrase.
//!
//! Span scores come from a toy "constituent detector" (a few hand-picked spans get a bonus).
//! We decode the best binary bracketing, then show how the entropy-regularized span marginals
//! sharpen toward it as the temperature goes down. The last part checks that the marginals
//! are the gradient of the relaxed value, which is what makes them usable as attention
//! weights over spans.

use diffparse::{BinaryPhrase, EntropyRegularized, PhraseLayer, PhraseSettings, Relaxation};
use ndarray::Array2;

fn bracketing(words: &[&str], spans: &[(usize, usize)]) -> String {
    spans
        .iter()
        .map(|&(i, j)| format!("[{}]", words[i..=j].join(" ")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let words = ["the", "old", "man", "the", "boats"];
    let n = words.len();

    let mut scores = Array2::<f64>::zeros((n, n));
    scores[[0, 2]] = 2.0; // the old man
    scores[[1, 2]] = 1.0; // old man
    scores[[3, 4]] = 2.0; // the boats
    scores[[2, 4]] = 1.5; // man the boats (garden-path reading)
    scores[[0, 1]] = 0.5; // the old

    let mut layer = PhraseLayer::new(PhraseSettings::default());
    layer.forward(std::slice::from_ref(&scores))?;
    let best = layer.parsers()[0].hard_spans();
    println!("best bracketing: {}", bracketing(&words, &best));
    println!("best score = {}", layer.parsers()[0].best_score());

    for temperature in [2.0, 1.0, 0.25] {
        let mut parser = BinaryPhrase::new(n, EntropyRegularized::new(temperature)?)?;
        parser.forward(|i, j| scores[[i, j]])?;
        println!(
            "T = {temperature}: p([the old man]) = {:.3}, p([man the boats]) = {:.3}",
            parser.output(0, 2),
            parser.output(2, 4)
        );
    }

    // d value / d score(i, j) == marginal(i, j) for the entropy relaxation.
    let settings = PhraseSettings {
        relaxation: Relaxation::entropy_regularized(1.0)?,
        ..PhraseSettings::default()
    };
    let mut layer = PhraseLayer::new(settings);
    let marginals = layer.forward(std::slice::from_ref(&scores))?;
    let value = layer.parsers()[0].value();

    let h = 1e-5;
    let mut bumped = scores.clone();
    bumped[[3, 4]] += h;
    let mut parser = BinaryPhrase::new(n, Relaxation::entropy_regularized(1.0)?)?;
    parser.forward(|i, j| bumped[[i, j]])?;
    println!(
        "marginal [the boats] = {:.5}, finite difference = {:.5}",
        marginals[0][[3, 4]],
        (parser.value() - value) / h
    );

    Ok(())
}
