//! Deduction rules: one binary combination step of a chart recursion, relaxed.
//!
//! A consequent item `(i, j)` is built from a left and a right antecedent at every split point
//! `k` of its range. With hard selection the consequent would be
//! \(\max_k\, \mathrm{left}_k + \mathrm{right}_k\). Each [`DeductionRule`] replaces that `max` by
//! a smooth surrogate and also provides its reverse-mode adjoint:
//!
//! - [`ArgmaxSoftmax`]: `split = left + right`, `backptr = softmax(split / T)`, consequent
//!   `= <split, backptr>` (the expected split score under the relaxed argmax).
//! - [`EntropyRegularized`]: same `split`/`backptr`, consequent `= T log Σ exp(split / T)`;
//!   the whole recursion then computes a (scaled) log-partition function.
//!
//! Both rules store `split` and `backptr` in the chart so that the top-down
//! [`backtrack`]/[`backtrack_adjoint`] pair and the backward pass can reuse them.
//!
//! Backward functions never write into the antecedents: they accumulate the gradient w.r.t.
//! `split`, which equals the gradient w.r.t. each antecedent line (`split = left + right`), and
//! the caller adds it into both antecedent lines.

use crate::chart::{Cursor, CursorMut};
use crate::error::{Error, Result};
use crate::math;

/// Forward/backward pair of a relaxed `max` over split points.
pub trait DeductionRule {
    /// Fills `split` and `backptr`, returns the consequent's contribution.
    fn forward<L, R, S, B>(&self, left: &L, right: &R, split: &mut S, backptr: &mut B) -> f64
    where
        L: Cursor + ?Sized,
        R: Cursor + ?Sized,
        S: CursorMut + ?Sized,
        B: CursorMut + ?Sized;

    /// Reverse-mode step.
    ///
    /// `split` and `backptr` are the forward values, `gradient_consequent` the gradient of the
    /// consequent. `gradient_backptr` may already hold gradient coming from backtracking; it is
    /// updated in place. The gradient w.r.t. `split` is accumulated into `gradient_split`.
    fn backward<S, B, GS, GB>(
        &self,
        split: &S,
        backptr: &B,
        gradient_consequent: f64,
        gradient_split: &mut GS,
        gradient_backptr: &mut GB,
    ) where
        S: Cursor + ?Sized,
        B: Cursor + ?Sized,
        GS: CursorMut + ?Sized,
        GB: CursorMut + ?Sized;
}

fn validate_temperature(temperature: f64) -> Result<f64> {
    if temperature <= 0.0 || !temperature.is_finite() {
        return Err(Error::InvalidTemperature(temperature));
    }
    Ok(temperature)
}

/// Softmax-weighted surrogate of the argmax ("algorithmic differentiation" of the max).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgmaxSoftmax {
    temperature: f64,
}

impl Default for ArgmaxSoftmax {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

impl ArgmaxSoftmax {
    /// Rule with the given softmax temperature.
    pub fn new(temperature: f64) -> Result<Self> {
        Ok(Self {
            temperature: validate_temperature(temperature)?,
        })
    }

    /// Softmax temperature.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}

impl DeductionRule for ArgmaxSoftmax {
    fn forward<L, R, S, B>(&self, left: &L, right: &R, split: &mut S, backptr: &mut B) -> f64
    where
        L: Cursor + ?Sized,
        R: Cursor + ?Sized,
        S: CursorMut + ?Sized,
        B: CursorMut + ?Sized,
    {
        math::cwise_add(split, left, right);
        math::softmax(backptr, split, self.temperature);
        math::dot(split, backptr)
    }

    fn backward<S, B, GS, GB>(
        &self,
        split: &S,
        backptr: &B,
        gradient_consequent: f64,
        gradient_split: &mut GS,
        gradient_backptr: &mut GB,
    ) where
        S: Cursor + ?Sized,
        B: Cursor + ?Sized,
        GS: CursorMut + ?Sized,
        GB: CursorMut + ?Sized,
    {
        // consequent = <split, backptr>: both factors receive gradient.
        math::add_scaled(gradient_backptr, split, gradient_consequent);
        math::add_scaled(gradient_split, backptr, gradient_consequent);
        math::backprop_softmax(gradient_split, gradient_backptr, backptr, self.temperature);
    }
}

/// Log-sum-exp surrogate of the max (entropy regularization).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyRegularized {
    temperature: f64,
}

impl Default for EntropyRegularized {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

impl EntropyRegularized {
    /// Rule with the given regularization strength.
    pub fn new(temperature: f64) -> Result<Self> {
        Ok(Self {
            temperature: validate_temperature(temperature)?,
        })
    }

    /// Regularization strength.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}

impl DeductionRule for EntropyRegularized {
    fn forward<L, R, S, B>(&self, left: &L, right: &R, split: &mut S, backptr: &mut B) -> f64
    where
        L: Cursor + ?Sized,
        R: Cursor + ?Sized,
        S: CursorMut + ?Sized,
        B: CursorMut + ?Sized,
    {
        math::cwise_add(split, left, right);
        math::softmax(backptr, split, self.temperature);
        math::log_sum_exp(split, self.temperature)
    }

    fn backward<S, B, GS, GB>(
        &self,
        _split: &S,
        backptr: &B,
        gradient_consequent: f64,
        gradient_split: &mut GS,
        gradient_backptr: &mut GB,
    ) where
        S: Cursor + ?Sized,
        B: Cursor + ?Sized,
        GS: CursorMut + ?Sized,
        GB: CursorMut + ?Sized,
    {
        // d(T log Σ exp(split / T)) / d split = backptr.
        math::add_scaled(gradient_split, backptr, gradient_consequent);
        math::backprop_softmax(gradient_split, gradient_backptr, backptr, self.temperature);
    }
}

/// Runtime choice between the two relaxations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Relaxation {
    /// See [`ArgmaxSoftmax`].
    ArgmaxSoftmax(ArgmaxSoftmax),
    /// See [`EntropyRegularized`].
    EntropyRegularized(EntropyRegularized),
}

impl Default for Relaxation {
    fn default() -> Self {
        Relaxation::ArgmaxSoftmax(ArgmaxSoftmax::default())
    }
}

impl Relaxation {
    /// Argmax-softmax surrogate at `temperature`.
    pub fn argmax_softmax(temperature: f64) -> Result<Self> {
        ArgmaxSoftmax::new(temperature).map(Relaxation::ArgmaxSoftmax)
    }

    /// Entropy-regularized surrogate at `temperature`.
    pub fn entropy_regularized(temperature: f64) -> Result<Self> {
        EntropyRegularized::new(temperature).map(Relaxation::EntropyRegularized)
    }
}

impl DeductionRule for Relaxation {
    fn forward<L, R, S, B>(&self, left: &L, right: &R, split: &mut S, backptr: &mut B) -> f64
    where
        L: Cursor + ?Sized,
        R: Cursor + ?Sized,
        S: CursorMut + ?Sized,
        B: CursorMut + ?Sized,
    {
        match self {
            Relaxation::ArgmaxSoftmax(rule) => rule.forward(left, right, split, backptr),
            Relaxation::EntropyRegularized(rule) => rule.forward(left, right, split, backptr),
        }
    }

    fn backward<S, B, GS, GB>(
        &self,
        split: &S,
        backptr: &B,
        gradient_consequent: f64,
        gradient_split: &mut GS,
        gradient_backptr: &mut GB,
    ) where
        S: Cursor + ?Sized,
        B: Cursor + ?Sized,
        GS: CursorMut + ?Sized,
        GB: CursorMut + ?Sized,
    {
        match self {
            Relaxation::ArgmaxSoftmax(rule) => {
                rule.backward(split, backptr, gradient_consequent, gradient_split, gradient_backptr)
            }
            Relaxation::EntropyRegularized(rule) => {
                rule.backward(split, backptr, gradient_consequent, gradient_split, gradient_backptr)
            }
        }
    }
}

/// Push a consequent's soft-selection mass down to one antecedent line:
/// `antecedent[k] += backptr[k] * consequent`.
pub fn backtrack<A, B>(antecedent: &mut A, backptr: &B, consequent: f64)
where
    A: CursorMut + ?Sized,
    B: Cursor + ?Sized,
{
    math::add_scaled(antecedent, backptr, consequent);
}

/// Adjoint of [`backtrack`] for one antecedent line.
///
/// Accumulates `consequent * gradient_antecedent` into `gradient_backptr` and returns
/// `<backptr, gradient_antecedent>`, the contribution to the consequent's gradient.
pub fn backtrack_adjoint<B, GA, GB>(
    backptr: &B,
    consequent: f64,
    gradient_antecedent: &GA,
    gradient_backptr: &mut GB,
) -> f64
where
    B: Cursor + ?Sized,
    GA: Cursor + ?Sized,
    GB: CursorMut + ?Sized,
{
    math::add_scaled(gradient_backptr, gradient_antecedent, consequent);
    math::dot(backptr, gradient_antecedent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::check_grad;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    /// Scalar loss used for gradient checks: `w_c * consequent + <w_b, backptr>`.
    fn loss<D: DeductionRule>(rule: &D, left: &[f64], right: &[f64], w_c: f64, w_b: &[f64]) -> f64 {
        let mut split = vec![0.0; left.len()];
        let mut backptr = vec![0.0; left.len()];
        let c = rule.forward(left, right, split.as_mut_slice(), backptr.as_mut_slice());
        w_c * c + math::dot(w_b, backptr.as_slice())
    }

    fn check_rule<D: DeductionRule>(
        rule: &D,
        left: &[f64],
        right: &[f64],
        w_c: f64,
        w_b: &[f64],
    ) -> std::result::Result<(), TestCaseError> {
        let n = left.len();
        let mut split = vec![0.0; n];
        let mut backptr = vec![0.0; n];
        rule.forward(left, right, split.as_mut_slice(), backptr.as_mut_slice());

        let mut gradient_split = vec![0.0; n];
        let mut gradient_backptr = w_b.to_vec();
        rule.backward(
            split.as_slice(),
            backptr.as_slice(),
            w_c,
            gradient_split.as_mut_slice(),
            gradient_backptr.as_mut_slice(),
        );

        let h = 1e-3;
        for k in 0..n {
            let mut plus = left.to_vec();
            plus[k] += h;
            let mut minus = left.to_vec();
            minus[k] -= h;
            let up = loss(rule, &plus, right, w_c, w_b);
            let down = loss(rule, &minus, right, w_c, w_b);
            let estimated = (up - down) / (2.0 * h);
            prop_assert!(
                check_grad(gradient_split[k], estimated),
                "k={} analytic={} estimated={}",
                k,
                gradient_split[k],
                estimated
            );
        }
        Ok(())
    }

    #[test]
    fn argmax_softmax_returns_expected_split_score() {
        let rule = ArgmaxSoftmax::default();
        let left = [0.0, 1.0];
        let right = [1.0, 1.0];
        let mut split = [0.0; 2];
        let mut backptr = [0.0; 2];
        let c = rule.forward(
            left.as_slice(),
            right.as_slice(),
            split.as_mut_slice(),
            backptr.as_mut_slice(),
        );
        let p = 1.0 / (1.0 + 1.0f64.exp());
        assert_eq!(split, [1.0, 2.0]);
        assert_relative_eq!(backptr[0], p, epsilon = 1e-12);
        assert_relative_eq!(c, p * 1.0 + (1.0 - p) * 2.0, epsilon = 1e-12);
    }

    #[test]
    fn entropy_regularized_returns_log_sum_exp() {
        let rule = EntropyRegularized::new(0.5).unwrap();
        let left = [0.0, 1.0, -1.0];
        let right = [0.0, 0.0, 2.0];
        let mut split = [0.0; 3];
        let mut backptr = [0.0; 3];
        let c = rule.forward(
            left.as_slice(),
            right.as_slice(),
            split.as_mut_slice(),
            backptr.as_mut_slice(),
        );
        let expected =
            0.5 * ((0.0f64 / 0.5).exp() + (1.0f64 / 0.5).exp() + (1.0f64 / 0.5).exp()).ln();
        assert_relative_eq!(c, expected, epsilon = 1e-12);
        assert_relative_eq!(backptr.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn temperature_is_validated() {
        let cold = ArgmaxSoftmax::new(0.0);
        assert_eq!(cold.unwrap_err(), Error::InvalidTemperature(0.0));
        assert!(EntropyRegularized::new(f64::INFINITY).is_err());
        assert!(Relaxation::entropy_regularized(-1.0).is_err());
        assert!(Relaxation::argmax_softmax(0.3).is_ok());
    }

    #[test]
    fn backtracking_adjoint_matches_its_forward() {
        // out = Σ_k g[k] * (a[k] + backptr[k] * c)
        // d out / d c = <backptr, g>, d out / d backptr = c * g.
        let backptr = [0.2, 0.5, 0.3];
        let g = [1.0, -2.0, 0.5];
        let mut gradient_backptr = [0.0; 3];
        let gc = backtrack_adjoint(
            backptr.as_slice(),
            2.0,
            g.as_slice(),
            gradient_backptr.as_mut_slice(),
        );
        assert_relative_eq!(gc, 0.2 - 1.0 + 0.15, epsilon = 1e-12);
        assert_eq!(gradient_backptr, [2.0, -4.0, 1.0]);

        let mut antecedent = [1.0, 1.0, 1.0];
        backtrack(antecedent.as_mut_slice(), backptr.as_slice(), 2.0);
        for (a, e) in antecedent.iter().zip([1.4, 2.0, 1.6]) {
            assert_relative_eq!(*a, e, epsilon = 1e-12);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn argmax_softmax_backward_matches_finite_differences(
            left in prop::collection::vec(-2.0f64..2.0, 1..6),
            w_c in -1.0f64..1.0,
            temperature in 0.3f64..3.0,
            seed in prop::collection::vec(-1.0f64..1.0, 6),
        ) {
            let n = left.len();
            let right: Vec<f64> = seed[..n].iter().map(|x| x * 1.5).collect();
            let w_b: Vec<f64> = seed[..n].iter().rev().copied().collect();
            check_rule(&ArgmaxSoftmax::new(temperature).unwrap(), &left, &right, w_c, &w_b)?;
        }

        #[test]
        fn entropy_regularized_backward_matches_finite_differences(
            left in prop::collection::vec(-2.0f64..2.0, 1..6),
            w_c in -1.0f64..1.0,
            temperature in 0.3f64..3.0,
            seed in prop::collection::vec(-1.0f64..1.0, 6),
        ) {
            let n = left.len();
            let right: Vec<f64> = seed[..n].iter().map(|x| x * 1.5).collect();
            let w_b: Vec<f64> = seed[..n].iter().rev().copied().collect();
            check_rule(&EntropyRegularized::new(temperature).unwrap(), &left, &right, w_c, &w_b)?;
        }
    }
}
