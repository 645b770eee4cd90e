//! Empirical-Bayes moderation of per-gene residual variances.
//!
//! The residual variances of all genes are treated as draws from a scaled
//! inverse chi-squared prior whose degrees of freedom `d0` and scale `s0²` are
//! estimated by the method of moments on `log(s²)`. Each gene's variance is
//! then shrunk towards `s0²`, which stabilises tests with few samples.

use statrs::function::gamma::digamma;

/// Estimated prior of the residual variances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariancePrior {
    /// Prior degrees of freedom; infinite when the variances show no excess spread
    pub df_prior: f64,
    /// Prior (typical) variance
    pub var_prior: f64,
}

/// Posterior variances and total degrees of freedom for every gene.
#[derive(Debug, Clone)]
pub struct ModeratedVariances {
    pub prior: Option<VariancePrior>,
    pub var_post: Vec<f64>,
    pub df_total: Vec<f64>,
}

/// Fit the scaled F prior to sample variances `s²` with `df` residual degrees of freedom.
///
/// Entries with non-positive degrees of freedom or non-finite variance are
/// ignored. Returns `None` when fewer than two usable genes remain.
pub fn fit_f_dist(variances: &[f64], df: &[f64]) -> Option<VariancePrior> {
    let usable: Vec<(f64, f64)> = variances
        .iter()
        .zip(df)
        .filter(|(v, d)| v.is_finite() && **v >= 0.0 && **d > 0.0 && d.is_finite())
        .map(|(&v, &d)| (v, d))
        .collect();
    if usable.len() < 2 {
        return None;
    }

    // zero variances would send log(s²) to -inf
    let mut sorted: Vec<f64> = usable.iter().map(|(v, _)| *v).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = sorted[sorted.len() / 2];
    let floor = if median > 0.0 { 1e-5 * median } else { 1e-12 };

    let n = usable.len() as f64;
    let e: Vec<f64> = usable
        .iter()
        .map(|&(v, d)| v.max(floor).ln() - digamma(d / 2.0) + (d / 2.0).ln())
        .collect();
    let e_mean = e.iter().sum::<f64>() / n;
    let e_var = e.iter().map(|x| (x - e_mean).powi(2)).sum::<f64>() / (n - 1.0)
        - usable.iter().map(|&(_, d)| trigamma(d / 2.0)).sum::<f64>() / n;

    if e_var > 0.0 {
        let df_prior = 2.0 * trigamma_inverse(e_var);
        let var_prior = (e_mean + digamma(df_prior / 2.0) - (df_prior / 2.0).ln()).exp();
        Some(VariancePrior {
            df_prior,
            var_prior,
        })
    } else {
        Some(VariancePrior {
            df_prior: f64::INFINITY,
            var_prior: e_mean.exp(),
        })
    }
}

/// Shrink every variance towards the fitted prior.
///
/// Without a usable prior the variances are returned unchanged with their own
/// degrees of freedom. Total degrees of freedom are capped at the pooled
/// residual degrees of freedom of all genes.
pub fn squeeze_variances(variances: &[f64], df: &[f64]) -> ModeratedVariances {
    let prior = fit_f_dist(variances, df);
    let df_pooled: f64 = df.iter().filter(|d| d.is_finite() && **d > 0.0).sum();

    let (var_post, df_total) = variances
        .iter()
        .zip(df)
        .map(|(&v, &d)| match prior {
            Some(VariancePrior {
                df_prior,
                var_prior,
            }) => {
                let post = if df_prior.is_infinite() {
                    var_prior
                } else {
                    (d * v + df_prior * var_prior) / (d + df_prior)
                };
                (post, (d + df_prior).min(df_pooled))
            }
            None => (v, d),
        })
        .unzip();

    ModeratedVariances {
        prior,
        var_post,
        df_total,
    }
}

/// Trigamma function, the second derivative of `ln Γ(x)`, for `x > 0`.
pub fn trigamma(x: f64) -> f64 {
    let mut x = x;
    let mut result = 0.0;
    // trigamma(x) = trigamma(x + 1) + 1/x²
    while x < 6.0 {
        result += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = x * x;
    let inv = 1.0 / x;
    let inv2 = 1.0 / x2;
    result
        + inv
        + inv2 / 2.0
        + inv * inv2 * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 / 30.0)))
}

/// Tetragamma function, the third derivative of `ln Γ(x)`, for `x > 0`.
fn tetragamma(x: f64) -> f64 {
    let mut x = x;
    let mut result = 0.0;
    // tetragamma(x) = tetragamma(x + 1) - 2/x³
    while x < 6.0 {
        result -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let inv2 = 1.0 / (x * x);
    result
        - inv2
        - inv2 / x
        - inv2 * inv2 * (0.5 - inv2 * (1.0 / 6.0 - inv2 * (1.0 / 6.0 - inv2 * 0.3)))
}

/// Solve `trigamma(y) = x` for `y` by Newton iteration.
pub fn trigamma_inverse(x: f64) -> f64 {
    if x > 1e7 {
        return 1.0 / x.sqrt();
    }
    if x < 1e-6 {
        return 1.0 / x;
    }
    let mut y = 0.5 + 1.0 / x;
    for _ in 0..50 {
        let tri = trigamma(y);
        let dif = tri * (1.0 - tri / x) / tetragamma(y);
        y += dif;
        if -dif / y < 1e-8 {
            break;
        }
    }
    y
}
