//! Covariance backends for the mixture components.
//!
//! Four parameterizations of a multivariate Gaussian covariance share one
//! capability set: log-density evaluation, closed-form MMSE shrinkage under
//! additive white noise, and the M-step update from weighted sufficient
//! statistics. The backend is selected once at model construction and never
//! switched at runtime.
//!
//! Structure-specific solves replace generic inversion throughout: the Full
//! backend factorizes with Cholesky, the Factor backend goes through the
//! Woodbury identity on its H x H core, and Isotropic/Diagonal reduce to
//! scalar and per-dimension gains.

use ndarray::{Array1, Array2, ArrayView1};

use crate::config::CovarianceKind;
use crate::error::{GmmError, Result};
use crate::float_trait::GmmFloat;
use crate::linalg::{
    cholesky_log_det, cholesky_lower, cholesky_solve, forward_substitute,
};

/// Inner fixed-point iterations of the Factor M-step. The loadings/noise
/// pair has no joint closed form; a handful of alternations against the
/// fixed scatter is enough inside an outer EM loop.
const FACTOR_FIXED_POINT_ITERS: usize = 8;

// =============================================================================
// Sufficient statistics
// =============================================================================

/// Centered second-moment statistics consumed by the M-step update.
///
/// Isotropic/Diagonal backends only need per-dimension moments; Factor/Full
/// need the full centered scatter. The fitter accumulates the matching shape
/// so no D x D allocation happens for the cheap backends.
#[derive(Debug, Clone)]
pub enum CovStats<F: GmmFloat> {
    /// Per-dimension centered second moments: sum_n w_n * (x_n - mu)^2.
    Moments {
        weight: F,
        centered_sq: Array1<F>,
    },
    /// Full centered scatter: sum_n w_n * (x_n - mu)(x_n - mu)^T.
    Scatter {
        weight: F,
        centered: Array2<F>,
    },
}

impl<F: GmmFloat> CovStats<F> {
    /// Total responsibility mass behind these statistics.
    pub fn weight(&self) -> F {
        match self {
            CovStats::Moments { weight, .. } => *weight,
            CovStats::Scatter { weight, .. } => *weight,
        }
    }

    /// Pool another component's statistics into this one (shared mode).
    pub fn merge(&mut self, other: &CovStats<F>) {
        match (self, other) {
            (
                CovStats::Moments { weight, centered_sq },
                CovStats::Moments {
                    weight: w2,
                    centered_sq: sq2,
                },
            ) => {
                *weight += *w2;
                *centered_sq += sq2;
            }
            (
                CovStats::Scatter { weight, centered },
                CovStats::Scatter {
                    weight: w2,
                    centered: c2,
                },
            ) => {
                *weight += *w2;
                *centered += c2;
            }
            _ => unreachable!("mismatched sufficient-statistic shapes"),
        }
    }
}

// =============================================================================
// Shrinkage operators
// =============================================================================

/// Precomputed MMSE shrinkage operator for one covariance object at a fixed
/// observation noise variance.
///
/// Applies `mu + Sigma (Sigma + noise_var I)^{-1} (x - mu)` through the
/// backend's structural solve. Prepared once per component by the estimator,
/// then applied across patches.
#[derive(Debug, Clone)]
pub enum ShrinkOp<F: GmmFloat> {
    /// Isotropic: single scalar gain sigma^2 / (sigma^2 + noise_var).
    Gain { gain: F },
    /// Diagonal: per-dimension gain v_d / (v_d + noise_var).
    DiagGain { gain: Array1<F> },
    /// Factor: Woodbury solve against the noise-inflated diagonal
    /// psi' = psi + noise_var, followed by multiplication with the implied
    /// covariance A A^T + diag(psi).
    Factor {
        loading: Array2<F>,
        noise: Array1<F>,
        psi_prime_inv: Array1<F>,
        psi_prime_inv_loading: Array2<F>,
        core_chol: Array2<F>,
    },
    /// Full: Cholesky solve of (Sigma + noise_var I), multiply by Sigma.
    Full {
        sigma: Array2<F>,
        chol: Array2<F>,
    },
}

impl<F: GmmFloat> ShrinkOp<F> {
    /// Conditional-mean estimate of the clean signal for one noisy patch.
    pub fn apply(&self, x: ArrayView1<F>, mu: ArrayView1<F>) -> Array1<F> {
        match self {
            ShrinkOp::Gain { gain } => {
                let g = *gain;
                ndarray::Zip::from(&x).and(&mu).map_collect(|&xi, &mi| mi + g * (xi - mi))
            }
            ShrinkOp::DiagGain { gain } => ndarray::Zip::from(&x)
                .and(&mu)
                .and(gain)
                .map_collect(|&xi, &mi, &g| mi + g * (xi - mi)),
            ShrinkOp::Factor {
                loading,
                noise,
                psi_prime_inv,
                psi_prime_inv_loading,
                core_chol,
            } => {
                let r = &x - &mu;
                // u = (Sigma + noise_var I)^{-1} r via Woodbury.
                let t = psi_prime_inv_loading.t().dot(&r);
                let w = cholesky_solve(core_chol, t.view());
                let mut u = &r * psi_prime_inv;
                u -= &psi_prime_inv_loading.dot(&w);
                // out = mu + (A A^T + diag(psi)) u
                let v = loading.t().dot(&u);
                let mut out = loading.dot(&v);
                out += &(&u * noise);
                out += &mu;
                out
            }
            ShrinkOp::Full { sigma, chol } => {
                let r = &x - &mu;
                let y = cholesky_solve(chol, r.view());
                let mut out = sigma.dot(&y);
                out += &mu;
                out
            }
        }
    }
}

// =============================================================================
// Backend variants
// =============================================================================

/// Isotropic covariance: sigma^2 * I.
#[derive(Debug, Clone)]
pub struct IsotropicCov<F: GmmFloat> {
    var: F,
    log_det: F,
}

/// Diagonal covariance: diag(v), v in R^D.
#[derive(Debug, Clone)]
pub struct DiagonalCov<F: GmmFloat> {
    var: Array1<F>,
    log_det: F,
}

/// Factor (MFA) covariance: A A^T + diag(psi), A in R^{D x H}.
///
/// The dense matrix is never materialized; density evaluation caches the
/// Cholesky factor of the Woodbury core M = I_H + A^T psi^{-1} A.
#[derive(Debug, Clone)]
pub struct FactorCov<F: GmmFloat> {
    loading: Array2<F>,
    noise: Array1<F>,
    psi_inv_loading: Array2<F>,
    core_chol: Array2<F>,
    log_det: F,
}

/// Full covariance: dense SPD D x D matrix with cached Cholesky factor.
#[derive(Debug, Clone)]
pub struct FullCov<F: GmmFloat> {
    sigma: Array2<F>,
    chol: Array2<F>,
    log_det: F,
}

/// Per-component covariance object, polymorphic over the four backends.
#[derive(Debug, Clone)]
pub enum Covariance<F: GmmFloat> {
    Isotropic(IsotropicCov<F>),
    Diagonal(DiagonalCov<F>),
    Factor(FactorCov<F>),
    Full(FullCov<F>),
}

fn instability(message: impl Into<String>) -> GmmError {
    GmmError::NumericalInstability {
        component: None,
        message: message.into(),
    }
}

impl<F: GmmFloat> Covariance<F> {
    /// Isotropic backend with scalar variance `var` over `dim` dimensions.
    pub fn isotropic(dim: usize, var: F) -> Result<Self> {
        if !(var > F::zero()) || !var.is_finite() {
            return Err(instability("isotropic variance must be positive"));
        }
        Ok(Covariance::Isotropic(IsotropicCov {
            var,
            log_det: F::usize_as(dim) * var.ln(),
        }))
    }

    /// Diagonal backend from per-dimension variances.
    pub fn diagonal(var: Array1<F>) -> Result<Self> {
        if var.iter().any(|&v| !(v > F::zero()) || !v.is_finite()) {
            return Err(instability("diagonal variances must be positive"));
        }
        let log_det = var.iter().map(|&v| v.ln()).sum();
        Ok(Covariance::Diagonal(DiagonalCov { var, log_det }))
    }

    /// Factor backend from loadings A (D x H) and diagonal noise psi.
    pub fn factor(loading: Array2<F>, noise: Array1<F>) -> Result<Self> {
        if loading.nrows() != noise.len() {
            return Err(instability("loading rows must match noise length"));
        }
        if noise.iter().any(|&v| !(v > F::zero()) || !v.is_finite()) {
            return Err(instability("factor noise must be positive"));
        }
        let (psi_inv_loading, core_chol, log_det) =
            factor_cache(&loading, &noise)?;
        Ok(Covariance::Factor(FactorCov {
            loading,
            noise,
            psi_inv_loading,
            core_chol,
            log_det,
        }))
    }

    /// Full backend from a dense SPD matrix.
    pub fn full(sigma: Array2<F>) -> Result<Self> {
        let chol = cholesky_lower(sigma.view())
            .ok_or_else(|| instability("full covariance is not positive definite"))?;
        let log_det = cholesky_log_det(&chol);
        Ok(Covariance::Full(FullCov {
            sigma,
            chol,
            log_det,
        }))
    }

    /// Which of the four parameterizations this object carries.
    pub fn kind(&self) -> CovarianceKind {
        match self {
            Covariance::Isotropic(_) => CovarianceKind::Isotropic,
            Covariance::Diagonal(_) => CovarianceKind::Diagonal,
            Covariance::Factor(_) => CovarianceKind::Factor,
            Covariance::Full(_) => CovarianceKind::Full,
        }
    }

    /// Multivariate Gaussian log-density at `x` with mean `mu`.
    pub fn log_density(&self, x: ArrayView1<F>, mu: ArrayView1<F>) -> F {
        let half = F::from_f64_c(0.5);
        let d = F::usize_as(x.len());
        let (log_det, maha) = match self {
            Covariance::Isotropic(c) => {
                let mut sq = F::zero();
                for (&xi, &mi) in x.iter().zip(mu.iter()) {
                    let r = xi - mi;
                    sq += r * r;
                }
                (c.log_det, sq / c.var)
            }
            Covariance::Diagonal(c) => {
                let mut maha = F::zero();
                for ((&xi, &mi), &v) in x.iter().zip(mu.iter()).zip(c.var.iter()) {
                    let r = xi - mi;
                    maha += r * r / v;
                }
                (c.log_det, maha)
            }
            Covariance::Factor(c) => {
                let r = &x - &mu;
                let mut direct = F::zero();
                for (&ri, &psi) in r.iter().zip(c.noise.iter()) {
                    direct += ri * ri / psi;
                }
                let u = c.psi_inv_loading.t().dot(&r);
                let z = forward_substitute(&c.core_chol, u.view());
                (c.log_det, direct - z.dot(&z))
            }
            Covariance::Full(c) => {
                let r = &x - &mu;
                let z = forward_substitute(&c.chol, r.view());
                (c.log_det, z.dot(&z))
            }
        };
        -half * (d * F::LN_TWO_PI + log_det + maha)
    }

    /// Build the MMSE shrinkage operator for observation noise `noise_var`.
    pub fn shrink_op(&self, noise_var: F) -> Result<ShrinkOp<F>> {
        if noise_var < F::zero() {
            return Err(instability("noise variance must be >= 0"));
        }
        match self {
            Covariance::Isotropic(c) => Ok(ShrinkOp::Gain {
                gain: c.var / (c.var + noise_var),
            }),
            Covariance::Diagonal(c) => Ok(ShrinkOp::DiagGain {
                gain: c.var.mapv(|v| v / (v + noise_var)),
            }),
            Covariance::Factor(c) => {
                let psi_prime = c.noise.mapv(|v| v + noise_var);
                let psi_prime_inv = psi_prime.mapv(|v| F::one() / v);
                let mut psi_prime_inv_loading = c.loading.clone();
                for (mut row, &pi) in psi_prime_inv_loading
                    .rows_mut()
                    .into_iter()
                    .zip(psi_prime_inv.iter())
                {
                    row.mapv_inplace(|a| a * pi);
                }
                let h = c.loading.ncols();
                let mut core = c.loading.t().dot(&psi_prime_inv_loading);
                for i in 0..h {
                    core[[i, i]] += F::one();
                }
                let core_chol = cholesky_lower(core.view())
                    .ok_or_else(|| instability("factor shrinkage core not positive definite"))?;
                Ok(ShrinkOp::Factor {
                    loading: c.loading.clone(),
                    noise: c.noise.clone(),
                    psi_prime_inv,
                    psi_prime_inv_loading,
                    core_chol,
                })
            }
            Covariance::Full(c) => {
                let mut inflated = c.sigma.clone();
                let d = inflated.nrows();
                for i in 0..d {
                    inflated[[i, i]] += noise_var;
                }
                let chol = cholesky_lower(inflated.view())
                    .ok_or_else(|| instability("inflated covariance not positive definite"))?;
                Ok(ShrinkOp::Full {
                    sigma: c.sigma.clone(),
                    chol,
                })
            }
        }
    }

    /// Convenience one-shot shrinkage; the estimator prepares the operator
    /// once per component instead.
    pub fn mmse_shrink(
        &self,
        x: ArrayView1<F>,
        mu: ArrayView1<F>,
        noise_var: F,
    ) -> Result<Array1<F>> {
        Ok(self.shrink_op(noise_var)?.apply(x, mu))
    }

    /// M-step update from centered sufficient statistics.
    ///
    /// `reg_covar` is added to variances / diagonals before refactorization.
    /// A covariance that is singular even after regularization is an error;
    /// it is never clamped further.
    pub fn update_from_stats(&mut self, stats: &CovStats<F>, reg_covar: F) -> Result<()> {
        match (self, stats) {
            (
                Covariance::Isotropic(c),
                CovStats::Moments { weight, centered_sq },
            ) => {
                let d = F::usize_as(centered_sq.len());
                let var = centered_sq.sum() / (*weight * d) + reg_covar;
                if !(var > F::zero()) || !var.is_finite() {
                    return Err(instability("isotropic variance collapsed"));
                }
                c.var = var;
                c.log_det = d * var.ln();
                Ok(())
            }
            (
                Covariance::Diagonal(c),
                CovStats::Moments { weight, centered_sq },
            ) => {
                let w = *weight;
                let var = centered_sq.mapv(|s| s / w + reg_covar);
                if var.iter().any(|&v| !(v > F::zero()) || !v.is_finite()) {
                    return Err(instability("diagonal variance collapsed"));
                }
                c.log_det = var.iter().map(|&v| v.ln()).sum();
                c.var = var;
                Ok(())
            }
            (Covariance::Factor(c), CovStats::Scatter { weight, centered }) => {
                let w = *weight;
                let mut scatter = centered.mapv(|s| s / w);
                symmetrize(&mut scatter);
                factor_fixed_point(c, &scatter, reg_covar)
            }
            (Covariance::Full(c), CovStats::Scatter { weight, centered }) => {
                let w = *weight;
                let mut sigma = centered.mapv(|s| s / w);
                symmetrize(&mut sigma);
                let d = sigma.nrows();
                for i in 0..d {
                    sigma[[i, i]] += reg_covar;
                }
                let chol = cholesky_lower(sigma.view()).ok_or_else(|| {
                    instability("full covariance not positive definite after regularization")
                })?;
                c.log_det = cholesky_log_det(&chol);
                c.chol = chol;
                c.sigma = sigma;
                Ok(())
            }
            _ => Err(instability("sufficient statistics do not match backend")),
        }
    }

    /// Materialize the (implied) dense covariance. Test and diagnostics
    /// helper; the Factor backend never uses this on the hot path.
    pub fn dense(&self, dim: usize) -> Array2<F> {
        match self {
            Covariance::Isotropic(c) => {
                let mut m = Array2::zeros((dim, dim));
                for i in 0..dim {
                    m[[i, i]] = c.var;
                }
                m
            }
            Covariance::Diagonal(c) => {
                let mut m = Array2::zeros((dim, dim));
                for i in 0..dim {
                    m[[i, i]] = c.var[i];
                }
                m
            }
            Covariance::Factor(c) => {
                let mut m = c.loading.dot(&c.loading.t());
                for i in 0..dim {
                    m[[i, i]] += c.noise[i];
                }
                m
            }
            Covariance::Full(c) => c.sigma.clone(),
        }
    }

    /// Scalar variance accessor (isotropic only), for diagnostics and tests.
    pub fn isotropic_variance(&self) -> Option<F> {
        match self {
            Covariance::Isotropic(c) => Some(c.var),
            _ => None,
        }
    }
}

/// Average out the asymmetry that accumulating outer products row by row
/// leaves behind.
fn symmetrize<F: GmmFloat>(m: &mut Array2<F>) {
    let half = F::from_f64_c(0.5);
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = (m[[i, j]] + m[[j, i]]) * half;
            m[[i, j]] = avg;
            m[[j, i]] = avg;
        }
    }
}

/// Recompute the Woodbury cache of a Factor covariance:
/// psi^{-1} A, the Cholesky factor of M = I_H + A^T psi^{-1} A, and
/// log|Sigma| = log|M| + sum(ln psi).
fn factor_cache<F: GmmFloat>(
    loading: &Array2<F>,
    noise: &Array1<F>,
) -> Result<(Array2<F>, Array2<F>, F)> {
    let h = loading.ncols();
    let mut psi_inv_loading = loading.clone();
    for (mut row, &psi) in psi_inv_loading.rows_mut().into_iter().zip(noise.iter()) {
        row.mapv_inplace(|a| a / psi);
    }
    let mut core = loading.t().dot(&psi_inv_loading);
    for i in 0..h {
        core[[i, i]] += F::one();
    }
    let core_chol = cholesky_lower(core.view())
        .ok_or_else(|| instability("factor Woodbury core not positive definite"))?;
    let log_det = cholesky_log_det(&core_chol) + noise.iter().map(|&v| v.ln()).sum();
    Ok((psi_inv_loading, core_chol, log_det))
}

/// EM-within-EM update of the Factor backend against a fixed weighted
/// scatter S: alternate the closed-form loading and noise updates for a few
/// fixed-point iterations, then refresh the Woodbury cache.
fn factor_fixed_point<F: GmmFloat>(
    c: &mut FactorCov<F>,
    scatter: &Array2<F>,
    reg_covar: F,
) -> Result<()> {
    let d = scatter.nrows();
    let h = c.loading.ncols();

    for _ in 0..FACTOR_FIXED_POINT_ITERS {
        let (psi_inv_loading, core_chol, _) = factor_cache(&c.loading, &c.noise)?;

        // beta = M^{-1} A^T psi^{-1}  (H x D), one core solve per column.
        let mut beta = Array2::zeros((h, d));
        for j in 0..d {
            let col = psi_inv_loading.row(j);
            // Row j of psi^{-1} A is column j of its transpose.
            let solved = cholesky_solve(&core_chol, col.view());
            for i in 0..h {
                beta[[i, j]] = solved[i];
            }
        }

        // Posterior factor moments averaged over the data.
        let sb = scatter.dot(&beta.t()); // S beta^T (D x H)
        let mut ezz = beta.dot(&sb); // beta S beta^T
        let ba = beta.dot(&c.loading); // beta A (H x H)
        for i in 0..h {
            for j in 0..h {
                ezz[[i, j]] -= ba[[i, j]];
            }
            ezz[[i, i]] += F::one();
        }
        symmetrize(&mut ezz);
        let ezz_chol = cholesky_lower(ezz.view())
            .ok_or_else(|| instability("factor moment matrix not positive definite"))?;

        // A_new = S beta^T Ezz^{-1}: one H-sized solve per data dimension.
        let mut loading_new = Array2::zeros((d, h));
        for j in 0..d {
            let solved = cholesky_solve(&ezz_chol, sb.row(j));
            for i in 0..h {
                loading_new[[j, i]] = solved[i];
            }
        }

        // psi_new = diag(S - A_new beta S) + reg.
        let beta_s = beta.dot(scatter); // (H x D)
        let mut noise_new = Array1::zeros(d);
        for j in 0..d {
            let cross = loading_new.row(j).dot(&beta_s.column(j));
            let val = scatter[[j, j]] - cross + reg_covar;
            if !(val > F::zero()) || !val.is_finite() {
                return Err(instability(
                    "factor noise collapsed after regularization",
                ));
            }
            noise_new[j] = val;
        }

        c.loading = loading_new;
        c.noise = noise_new;
    }

    let (psi_inv_loading, core_chol, log_det) = factor_cache(&c.loading, &c.noise)?;
    c.psi_inv_loading = psi_inv_loading;
    c.core_chol = core_chol;
    c.log_det = log_det;
    Ok(())
}
