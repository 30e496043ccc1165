//! # Shapiro-Wilk Normality Test
//!
//! Royston's approximation (Applied Statistics algorithm AS R94) of the Shapiro-Wilk
//! W statistic and its p-value, valid for samples of 3 to 5000 values.
//!
//! Curb inference uses it to decide whether a group of pickups' distances from the
//! street centerline look like one cluster (one side of the street) or several.
//!
//! ```rust
//! use rubbish_geo::normality::shapiro_wilk;
//!
//! let result = shapiro_wilk(&[1.0, 2.0, 3.0]).unwrap();
//! assert!((result.w - 1.0).abs() < 1e-9);
//! assert!(result.p_value > 0.99);
//! ```

use statrs::function::erf::{erfc, erfc_inv};
use std::f64::consts::PI;
use thiserror::Error;

const SMALL: f64 = 1e-19;

// Polynomial coefficients, lowest order first
const G: [f64; 2] = [-2.273, 0.459];
const C1: [f64; 6] = [0.0, 0.221157, -0.147981, -2.071190, 4.434685, -2.706056];
const C2: [f64; 6] = [0.0, 0.042981, -0.293762, -1.752461, 5.682633, -3.582633];
const C3: [f64; 4] = [0.5440, -0.39978, 0.025054, -6.714e-4];
const C4: [f64; 4] = [1.3822, -0.77857, 0.062767, -0.0020322];
const C5: [f64; 4] = [-1.5861, -0.31082, -0.083751, 0.0038915];
const C6: [f64; 3] = [-0.4803, -0.082676, 0.0030302];

/// Outcome of a Shapiro-Wilk test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapiroWilk {
    /// W statistic in `[0, 1]`; values near 1 indicate normality
    pub w: f64,
    /// Probability of a W at least this small under the normal hypothesis
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalityError {
    #[error("need at least 3 values, got {0}")]
    TooFewValues(usize),
    #[error("sample contains a non-finite value")]
    NonFinite,
    /// Every value is (numerically) identical.
    #[error("sample has zero range")]
    ZeroRange,
}

/// Run the Shapiro-Wilk test on `sample` (any order).
pub fn shapiro_wilk(sample: &[f64]) -> Result<ShapiroWilk, NormalityError> {
    let n = sample.len();
    if n < 3 {
        return Err(NormalityError::TooFewValues(n));
    }
    if sample.iter().any(|v| !v.is_finite()) {
        return Err(NormalityError::NonFinite);
    }

    let mut x = sample.to_vec();
    x.sort_by(|a, b| a.total_cmp(b));

    let range = x[n - 1] - x[0];
    if range < SMALL {
        return Err(NormalityError::ZeroRange);
    }

    // Scale by the range to keep the sums well conditioned
    let x: Vec<f64> = x.iter().map(|v| v / range).collect();
    let a = coefficients(n);

    let numerator: f64 = a
        .iter()
        .enumerate()
        .map(|(i, ai)| ai * (x[n - 1 - i] - x[i]))
        .sum();
    let mean = x.iter().sum::<f64>() / n as f64;
    let ssq: f64 = x.iter().map(|v| (v - mean) * (v - mean)).sum();

    let w = (numerator * numerator / ssq).clamp(0.0, 1.0);
    Ok(ShapiroWilk {
        w,
        p_value: p_value(w, n),
    })
}

/// Antisymmetric coefficients `a_1..a_{n/2}` for the ordered sample.
fn coefficients(n: usize) -> Vec<f64> {
    let half = n / 2;
    if n == 3 {
        return vec![0.5_f64.sqrt()];
    }

    let an = n as f64;
    let an25 = an + 0.25;
    let m: Vec<f64> = (1..=half)
        .map(|i| normal_quantile((i as f64 - 0.375) / an25))
        .collect();

    let summ2 = 2.0 * m.iter().map(|v| v * v).sum::<f64>();
    let ssumm2 = summ2.sqrt();
    let rsn = 1.0 / an.sqrt();
    let a1 = poly(&C1, rsn) - m[0] / ssumm2;

    let mut a = vec![0.0; half];
    let (first_free, fac) = if n > 5 {
        let a2 = -m[1] / ssumm2 + poly(&C2, rsn);
        let fac = ((summ2 - 2.0 * m[0] * m[0] - 2.0 * m[1] * m[1])
            / (1.0 - 2.0 * a1 * a1 - 2.0 * a2 * a2))
            .sqrt();
        a[1] = a2;
        (2, fac)
    } else {
        let fac = ((summ2 - 2.0 * m[0] * m[0]) / (1.0 - 2.0 * a1 * a1)).sqrt();
        (1, fac)
    };
    a[0] = a1;
    for i in first_free..half {
        a[i] = -m[i] / fac;
    }
    a
}

fn p_value(w: f64, n: usize) -> f64 {
    if n == 3 {
        let pw = 6.0 / PI * (w.sqrt().asin() - PI / 3.0);
        return pw.clamp(0.0, 1.0);
    }

    let an = n as f64;
    let mut y = (1.0 - w).ln();
    let (m, s) = if n <= 11 {
        let gamma = poly(&G, an);
        if y >= gamma {
            return 0.0;
        }
        y = -(gamma - y).ln();
        (poly(&C3, an), poly(&C4, an).exp())
    } else {
        let ln_n = an.ln();
        (poly(&C5, ln_n), poly(&C6, ln_n).exp())
    };

    normal_upper_tail((y - m) / s)
}

#[inline]
fn poly(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// P(Z > z) for a standard normal Z.
fn normal_upper_tail(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Standard normal quantile.
fn normal_quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_normal_quantile_known_values() {
        assert!(approx_eq(normal_quantile(0.5), 0.0, 1e-12));
        assert!(approx_eq(normal_quantile(0.975), 1.959_963_984_540_054, 1e-9));
        assert!(approx_eq(normal_quantile(0.025), -1.959_963_984_540_054, 1e-9));
        assert!(approx_eq(normal_quantile(1e-6), -4.753_424_308_822_899, 1e-8));
    }

    #[test]
    fn test_normal_upper_tail() {
        assert!(approx_eq(normal_upper_tail(0.0), 0.5, 1e-12));
        assert!(approx_eq(normal_upper_tail(1.959_963_984_540_054), 0.025, 1e-12));
        assert!(approx_eq(normal_upper_tail(-1.959_963_984_540_054), 0.975, 1e-12));
        assert!(approx_eq(normal_upper_tail(f64::NEG_INFINITY), 1.0, 1e-12));
    }

    #[test]
    fn test_coefficients_are_normalized() {
        for n in [4, 5, 6, 11, 12, 50] {
            let a = coefficients(n);
            let sum_sq = 2.0 * a.iter().map(|v| v * v).sum::<f64>();
            assert!(approx_eq(sum_sq, 1.0, 1e-6), "n={} sum={}", n, sum_sq);
            assert!(a.iter().all(|&v| v > 0.0));
        }
    }

    #[test]
    fn test_evenly_spaced_three() {
        let result = shapiro_wilk(&[0.09, 0.10, 0.11]).unwrap();
        assert!(approx_eq(result.w, 1.0, 1e-9));
        assert!(result.p_value > 0.99);
    }

    #[test]
    fn test_most_skewed_three() {
        let result = shapiro_wilk(&[0.0, 0.0, 1.0]).unwrap();
        assert!(approx_eq(result.w, 0.75, 1e-9));
        assert!(result.p_value < 1e-6);
    }

    #[test]
    fn test_normal_quantiles_look_normal() {
        for n in [8, 20, 60] {
            let sample: Vec<f64> = (1..=n)
                .map(|i| normal_quantile((i as f64 - 0.5) / n as f64))
                .collect();
            let result = shapiro_wilk(&sample).unwrap();
            assert!(result.w > 0.95, "n={} w={}", n, result.w);
            assert!(result.p_value > 0.05, "n={} p={}", n, result.p_value);
        }
    }

    #[test]
    fn test_two_clusters_reject_normality() {
        let small = [0.0, 0.0, 0.1, 0.1, 0.2, 5.0, 5.1, 5.1, 5.2, 5.2];
        let result = shapiro_wilk(&small).unwrap();
        assert!(result.p_value < 0.05, "p={}", result.p_value);

        let large: Vec<f64> = (0..10)
            .map(|i| i as f64 * 0.1)
            .chain((0..10).map(|i| 10.0 + i as f64 * 0.1))
            .collect();
        let result = shapiro_wilk(&large).unwrap();
        assert!(result.w < 0.9);
        assert!(result.p_value < 0.05, "p={}", result.p_value);
    }

    #[test]
    fn test_order_does_not_matter() {
        let a = shapiro_wilk(&[3.0, 1.0, 2.0, 7.0, 4.0]).unwrap();
        let b = shapiro_wilk(&[1.0, 2.0, 3.0, 4.0, 7.0]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_samples() {
        assert_eq!(shapiro_wilk(&[1.0, 2.0]), Err(NormalityError::TooFewValues(2)));
        assert_eq!(shapiro_wilk(&[4.0; 5]), Err(NormalityError::ZeroRange));
        assert_eq!(
            shapiro_wilk(&[1.0, f64::NAN, 2.0]),
            Err(NormalityError::NonFinite)
        );
    }
}
