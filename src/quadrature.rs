//! Gauss quadrature rules and their mapping onto parametric elements.

use crate::basis::ParamRange;
use crate::Real;
use num::Zero;
use numeric_literals::replace_float_literals;
use std::ops::{AddAssign, Mul};

/// Gauss-Legendre rule with `points` abscissae on the reference interval
/// `[-1, 1]`, exact for polynomials of degree `2 * points - 1`.
///
/// Returns `(weights, abscissae)` with abscissae in ascending order. The
/// roots of the Legendre polynomial are found by Newton iteration on the
/// standard recurrence.
///
/// # Panics
///
/// Panics if `points == 0`.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn gauss<T: Real>(points: usize) -> (Vec<T>, Vec<T>) {
    assert!(points > 0, "a Gauss rule needs at least one point");
    let n = points;
    let mut weights = vec![T::zero(); n];
    let mut abscissae = vec![T::zero(); n];

    // The roots are symmetric about the origin; compute the non-negative
    // half and mirror.
    let half = (n + 1) / 2;
    for i in 0..half {
        // Chebyshev-based initial guess for the i-th root (descending).
        let guess = (T::pi() * (T::from_usize(i).unwrap() + 0.75)
            / (T::from_usize(n).unwrap() + 0.5))
            .cos();
        let mut x = guess;
        for _ in 0..100 {
            let (p, dp) = legendre_value_and_derivative(n, x);
            let dx = p / dp;
            x -= dx;
            if dx.abs() <= 1e-15 {
                break;
            }
        }
        // One final evaluation at the converged root for the weight.
        let (_, dp) = legendre_value_and_derivative(n, x);

        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        abscissae[n - 1 - i] = x;
        abscissae[i] = -x;
        weights[n - 1 - i] = w;
        weights[i] = w;
    }

    (weights, abscissae)
}

/// Value and derivative of the Legendre polynomial `P_n` at `x` through the
/// three-term recurrence. The derivative formula is undefined at
/// `|x| == 1`, which never holds for a Gauss root.
fn legendre_value_and_derivative<T: Real>(n: usize, x: T) -> (T, T) {
    let mut p1 = T::one();
    let mut p2 = T::zero();
    for m in 1..=n {
        let m = T::from_usize(m).unwrap();
        let two = T::one() + T::one();
        let p3 = p2;
        p2 = p1;
        p1 = ((two * m - T::one()) * x * p2 - (m - T::one()) * p3) / m;
    }
    let n_t = T::from_usize(n).unwrap();
    let dp = n_t * (x * p1 - p2) / (x * x - T::one());
    (p1, dp)
}

/// Map reference abscissae onto one parametric direction of an element:
/// `0.5 * ((max - min) * xi + max + min)`.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn element_gauss_parameters<T: Real>(
    domain: &ParamRange<T>,
    direction: usize,
    abscissae: &[T],
) -> Vec<T> {
    let (lo, hi) = match direction {
        0 => (domain.umin, domain.umax),
        _ => (domain.vmin, domain.vmax),
    };
    abscissae
        .iter()
        .map(|&xi| 0.5 * ((hi - lo) * xi + hi + lo))
        .collect()
}

/// Approximate `\int_{-1}^{1} f` with a one-dimensional rule.
pub fn integrate<T, U, F>(weights: &[T], abscissae: &[T], f: F) -> U
where
    T: Real,
    U: Zero + Mul<T, Output = U> + AddAssign<U>,
    F: Fn(T) -> U,
{
    let mut integral = U::zero();
    for (&w, &x) in weights.iter().zip(abscissae) {
        integral += f(x) * w;
    }
    integral
}
