//! Small dense regression solvers shared by the contrast back-ends.
//!
//! Designs here have a handful of columns (intercept, group indicator and at
//! most a few covariates), so normal equations with a Cholesky factorization
//! are accurate enough and cheap.

use nalgebra::{DMatrix, DVector, linalg::Cholesky};

/// Column of the group indicator in every design built by [`group_design`].
pub const GROUP_COLUMN: usize = 1;

const SINGULAR_TOLERANCE: f64 = 1e-10;

/// Design `[intercept, group, covariates...]`.
///
/// Covariates that are constant over the rows are dropped, since they are
/// aliased with the intercept. Returns `None` when the group indicator itself
/// is constant and the contrast is not estimable.
pub fn group_design(group: &[f64], covariates: &[&[f64]]) -> Option<DMatrix<f64>> {
    let n = group.len();
    if is_constant(group) {
        return None;
    }
    let kept: Vec<&[f64]> = covariates
        .iter()
        .copied()
        .filter(|c| c.len() == n && !is_constant(c))
        .collect();

    let p = 2 + kept.len();
    Some(DMatrix::from_fn(n, p, |row, col| match col {
        0 => 1.0,
        GROUP_COLUMN => group[row],
        _ => kept[col - 2][row],
    }))
}

/// Whether `covariate` is constant within each arm of the 0/1 `group`
/// indicator, which puts it in the span of the intercept and the group.
pub fn aliased_with_group(group: &[f64], covariate: &[f64]) -> bool {
    [0.0, 1.0].iter().all(|&arm| {
        let values: Vec<f64> = covariate
            .iter()
            .zip(group)
            .filter(|&(_, &g)| g == arm)
            .map(|(&c, _)| c)
            .collect();
        match values.first() {
            Some(&first) => {
                let tolerance = 1e-12 * first.abs().max(1.0);
                values.iter().all(|&v| (v - first).abs() <= tolerance)
            }
            None => true,
        }
    })
}

fn is_constant(values: &[f64]) -> bool {
    match values.first() {
        Some(&first) => values.iter().all(|&v| (v - first).abs() <= f64::EPSILON),
        None => true,
    }
}

/// Cholesky factor of a symmetric positive definite matrix, rejecting
/// numerically singular ones.
fn factorize(m: DMatrix<f64>) -> Option<Cholesky<f64, nalgebra::Dyn>> {
    let max_diag = m.diagonal().iter().cloned().fold(0.0_f64, f64::max);
    let chol = m.cholesky()?;
    let l = chol.l();
    let min_pivot = l.diagonal().iter().map(|d| d * d).fold(f64::INFINITY, f64::min);
    if max_diag <= 0.0 || min_pivot <= SINGULAR_TOLERANCE * max_diag {
        return None;
    }
    Some(chol)
}

/// Ordinary least squares against one fixed design.
///
/// The factorization of `XᵀX` is computed once and reused for every response,
/// which is how the microarray model fits all genes against a shared design.
pub struct LeastSquares {
    design: DMatrix<f64>,
    design_t: DMatrix<f64>,
    chol: Cholesky<f64, nalgebra::Dyn>,
    unscaled_cov: DMatrix<f64>,
}

/// Coefficients and residual summary of one least-squares fit.
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    pub coefficients: DVector<f64>,
    pub rss: f64,
    pub df_residual: usize,
}

impl LeastSquares {
    /// `None` if the design is rank deficient.
    pub fn new(design: DMatrix<f64>) -> Option<Self> {
        let design_t = design.transpose();
        let chol = factorize(&design_t * &design)?;
        let unscaled_cov = chol.inverse();
        Some(LeastSquares {
            design,
            design_t,
            chol,
            unscaled_cov,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.design.nrows()
    }

    pub fn n_coef(&self) -> usize {
        self.design.ncols()
    }

    /// Unscaled standard deviation of coefficient `j`, i.e. `sqrt((XᵀX)⁻¹[j,j])`.
    pub fn stdev_unscaled(&self, j: usize) -> f64 {
        self.unscaled_cov[(j, j)].sqrt()
    }

    pub fn fit(&self, y: &[f64]) -> LeastSquaresFit {
        let y = DVector::from_column_slice(y);
        let coefficients = self.chol.solve(&(&self.design_t * &y));
        let residuals = &y - &self.design * &coefficients;
        LeastSquaresFit {
            coefficients,
            rss: residuals.norm_squared(),
            df_residual: self.n_obs().saturating_sub(self.n_coef()),
        }
    }
}

/// Result of a penalized logistic regression.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub coefficients: DVector<f64>,
    /// Unpenalized binomial deviance at the fitted coefficients
    pub deviance: f64,
    pub converged: bool,
    pub iterations: usize,
}

/// Logistic regression with a Gaussian prior on the coefficients, fitted by IRLS.
///
/// `prior_precision[j]` is `1 / scale²` for coefficient `j`. The prior keeps the
/// estimates finite under complete separation, which is common for sparse genes.
/// Returns `None` if a penalized system turns out singular.
pub fn penalized_logistic(
    x: &DMatrix<f64>,
    y: &[f64],
    prior_precision: &[f64],
    max_iter: usize,
    tol: f64,
) -> Option<LogisticFit> {
    let n = x.nrows();
    let p = x.ncols();
    let x_t = x.transpose();
    let penalty = DMatrix::from_diagonal(&DVector::from_iterator(
        p,
        (0..p).map(|j| prior_precision.get(j).copied().unwrap_or(0.0)),
    ));

    let mut beta = DVector::zeros(p);
    let mean_y = y.iter().sum::<f64>() / n.max(1) as f64;
    let mean_y = mean_y.clamp(1e-4, 1.0 - 1e-4);
    beta[0] = (mean_y / (1.0 - mean_y)).ln();

    let mut converged = false;
    let mut iterations = 0;
    for _ in 0..max_iter {
        iterations += 1;
        let eta = x * &beta;
        let mut xtw = x_t.clone();
        let mut z = DVector::zeros(n);
        for i in 0..n {
            let mu = clamp_prob(sigmoid(eta[i]));
            let w = mu * (1.0 - mu);
            z[i] = eta[i] + (y[i] - mu) / w;
            xtw.column_mut(i).scale_mut(w);
        }
        let chol = factorize(&xtw * x + &penalty)?;
        let next = chol.solve(&(&xtw * &z));
        let delta = (&next - &beta).amax();
        beta = next;
        if delta < tol {
            converged = true;
            break;
        }
    }

    let eta = x * &beta;
    let deviance = binomial_deviance(y, eta.iter().map(|&e| sigmoid(e)));
    Some(LogisticFit {
        coefficients: beta,
        deviance,
        converged,
        iterations,
    })
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

fn clamp_prob(mu: f64) -> f64 {
    mu.clamp(1e-10, 1.0 - 1e-10)
}

fn binomial_deviance(y: &[f64], mu: impl Iterator<Item = f64>) -> f64 {
    -2.0 * y
        .iter()
        .zip(mu)
        .map(|(&yi, mi)| {
            let mi = clamp_prob(mi);
            yi * mi.ln() + (1.0 - yi) * (1.0 - mi).ln()
        })
        .sum::<f64>()
}
