//! Element-wise vector primitives over [`Cursor`]s.
//!
//! All inputs of one call must have the same length (checked in debug builds).

use crate::chart::{Cursor, CursorMut};

/// `output[k] = a[k] + b[k]`.
pub fn cwise_add<O, A, B>(output: &mut O, a: &A, b: &B)
where
    O: CursorMut + ?Sized,
    A: Cursor + ?Sized,
    B: Cursor + ?Sized,
{
    debug_assert!(output.len() == a.len() && a.len() == b.len());
    for ((o, x), y) in output.values_mut().zip(a.values()).zip(b.values()) {
        *o = x + y;
    }
}

/// `output[k] += input[k]`.
pub fn add<O, I>(output: &mut O, input: &I)
where
    O: CursorMut + ?Sized,
    I: Cursor + ?Sized,
{
    debug_assert_eq!(output.len(), input.len());
    for (o, x) in output.values_mut().zip(input.values()) {
        *o += x;
    }
}

/// `output[k] += input[k] * scale`.
pub fn add_scaled<O, I>(output: &mut O, input: &I, scale: f64)
where
    O: CursorMut + ?Sized,
    I: Cursor + ?Sized,
{
    debug_assert_eq!(output.len(), input.len());
    for (o, x) in output.values_mut().zip(input.values()) {
        *o += x * scale;
    }
}

/// Largest element, `-inf` for an empty input.
pub fn max<I: Cursor + ?Sized>(input: &I) -> f64 {
    input.values().fold(f64::NEG_INFINITY, f64::max)
}

/// `Σ a[k] * b[k]`.
pub fn dot<A, B>(a: &A, b: &B) -> f64
where
    A: Cursor + ?Sized,
    B: Cursor + ?Sized,
{
    debug_assert_eq!(a.len(), b.len());
    a.values().zip(b.values()).map(|(x, y)| x * y).sum()
}

/// `output = softmax(input / temperature)`, shifted by the maximum for stability.
pub fn softmax<O, I>(output: &mut O, input: &I, temperature: f64)
where
    O: CursorMut + ?Sized,
    I: Cursor + ?Sized,
{
    debug_assert_eq!(output.len(), input.len());
    let m = max(input);
    let mut z = 0.0;
    for (o, x) in output.values_mut().zip(input.values()) {
        *o = ((x - m) / temperature).exp();
        z += *o;
    }
    for o in output.values_mut() {
        *o /= z;
    }
}

/// `temperature * log Σ exp(input / temperature)`, shifted by the maximum for stability.
pub fn log_sum_exp<I: Cursor + ?Sized>(input: &I, temperature: f64) -> f64 {
    let m = max(input);
    if !m.is_finite() {
        return m;
    }
    let s: f64 = input.values().map(|x| ((x - m) / temperature).exp()).sum();
    m + temperature * s.ln()
}

/// Adjoint of [`softmax`].
///
/// Given `output = softmax(input / temperature)` and the gradient `gradient_output` of the loss
/// w.r.t. `output`, accumulates `output[k] * (gradient_output[k] - s) / temperature` into
/// `gradient_input[k]`, where `s = Σ_m gradient_output[m] * output[m]`.
pub fn backprop_softmax<G, D, O>(
    gradient_input: &mut G,
    gradient_output: &D,
    output: &O,
    temperature: f64,
) where
    G: CursorMut + ?Sized,
    D: Cursor + ?Sized,
    O: Cursor + ?Sized,
{
    debug_assert_eq!(gradient_input.len(), output.len());
    debug_assert_eq!(output.len(), gradient_output.len());
    let s = dot(gradient_output, output);
    for ((g, d), y) in gradient_input
        .values_mut()
        .zip(gradient_output.values())
        .zip(output.values())
    {
        *g += y * (d - s) / temperature;
    }
}

/// Relative-or-absolute agreement test used for finite-difference checks.
#[cfg(test)]
pub(crate) fn check_grad(analytic: f64, estimated: f64) -> bool {
    let mut f = (analytic - estimated).abs();
    let m = analytic.abs().max(estimated.abs());
    if f > 1e-2 && m > 0.0 {
        f /= m;
    }
    f <= 1e-2
}
