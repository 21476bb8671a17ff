//! Configuration surface for model construction, fitting, and denoising.
//!
//! Every config carries a `validate()` that is checked before any iteration
//! starts, so configuration errors never surface mid-fit.

use ndarray::{Array1, Array2, Array3};

use crate::error::{GmmError, Result};
use crate::float_trait::GmmFloat;

// =============================================================================
// Constants
// =============================================================================

/// Default number of mixture components.
const DEFAULT_COMPONENTS: usize = 100;

/// Default factor dimensionality H (Factor covariance only).
const DEFAULT_FACTOR_DIM: usize = 5;

/// Default covariance regularization strength.
const DEFAULT_REG_COVAR: f64 = 1e-3;

/// Default convergence threshold on the relative free-energy change.
const DEFAULT_EPS: f64 = 1e-4;

/// Default truncation width C' of the per-patch candidate sets.
pub(crate) const DEFAULT_TRUNCATION: usize = 3;

/// Default candidate-refresh period G, in outer iterations.
const DEFAULT_REFRESH_PERIOD: usize = 15;

/// Default number of E/M epochs per outer iteration.
const DEFAULT_INNER_EPOCHS: usize = 1;

/// Default patch shape (rows, cols) for the denoising pipeline.
const DEFAULT_PATCH_SHAPE: (usize, usize) = (12, 12);

/// Default shift between neighboring patches.
const DEFAULT_PATCH_SHIFT: usize = 1;

// =============================================================================
// Enums
// =============================================================================

/// Covariance parameterization of the mixture components.
///
/// Selected once at model construction and never switched at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CovarianceKind {
    /// Single scalar variance per component.
    Isotropic,
    /// One positive variance per dimension.
    #[default]
    Diagonal,
    /// Low-rank factor loadings plus diagonal noise (mixture of factor
    /// analyzers): the implied covariance A*A^T + diag(psi) is never
    /// materialized.
    Factor,
    /// Dense symmetric positive-definite D x D matrix.
    Full,
}

impl CovarianceKind {
    /// Whether the M-step needs full weighted outer products, or
    /// per-dimension second moments suffice.
    pub fn needs_scatter(self) -> bool {
        matches!(self, CovarianceKind::Factor | CovarianceKind::Full)
    }
}

/// Similarity measure used to rank components during candidate refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimMeasure {
    /// KL divergence from the patch's Dirac measure to the component
    /// predictive distribution. Reduces to ranking by the component
    /// log-density, priors ignored.
    #[default]
    Kl,
    /// Faster proxy: rank by the unnormalized log-posterior
    /// log(pi_k) + log N(x | k).
    Posterior,
}

/// Aggregation strategy for overlapping patch reconstructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Per-pixel arithmetic mean of all overlapping reconstructions.
    Mean,
    /// Per-pixel median of all overlapping reconstructions.
    #[default]
    Median,
}

// =============================================================================
// Initialization overrides
// =============================================================================

/// Initial mixture priors: a strategy tag or a precomputed array.
#[derive(Debug, Clone, Default)]
pub enum PriorInit<F: GmmFloat> {
    /// Uniform 1/C priors.
    #[default]
    Flat,
    /// Estimated from the hard assignment counts of the sampled seeds.
    SeedCounts,
    /// Caller-provided priors of length C (will be normalized).
    Given(Array1<F>),
}

/// Initial component means: a strategy tag or a precomputed array.
#[derive(Debug, Clone, Default)]
pub enum MeanInit<F: GmmFloat> {
    /// Assumption-free K-MC^2 seeding (Markov-chain approximate
    /// farthest-point sampling).
    #[default]
    Afkmc2,
    /// Caller-provided C x D mean matrix.
    Given(Array2<F>),
}

/// Initial factor loadings (Factor covariance only).
#[derive(Debug, Clone, Default)]
pub enum LoadingInit<F: GmmFloat> {
    /// Uniform in [-1, 1], scaled to the data's empirical variance.
    #[default]
    ScaledUniform,
    /// Caller-provided C x D x H loading tensor.
    Given(Array3<F>),
}

/// Initial variances: a strategy tag or a precomputed array.
#[derive(Debug, Clone, Default)]
pub enum VarianceInit<F: GmmFloat> {
    /// Empirical per-dimension variance of the dataset (its mean for the
    /// isotropic backend).
    #[default]
    DataVariance,
    /// Caller-provided per-dimension variances of length D.
    Given(Array1<F>),
}

// =============================================================================
// Configs
// =============================================================================

/// Structural configuration of the mixture model.
#[derive(Debug, Clone)]
pub struct ModelConfig<F: GmmFloat> {
    /// Number of mixture components C. Default: 100
    pub components: usize,
    /// Covariance parameterization. Default: Diagonal
    pub covariance: CovarianceKind,
    /// Factor dimensionality H, used only by the Factor backend. Default: 5
    pub factor_dim: usize,
    /// When true all components alias one covariance object; only means and
    /// priors vary per component. Default: false
    pub shared: bool,
    /// Regularization added to variances / diagonals before factorization.
    /// Default: 1e-3
    pub reg_covar: F,
    /// Prior initialization strategy or values.
    pub prior_init: PriorInit<F>,
    /// Mean initialization strategy or values.
    pub mean_init: MeanInit<F>,
    /// Loading initialization strategy or values (Factor only).
    pub loading_init: LoadingInit<F>,
    /// Variance initialization strategy or values.
    pub variance_init: VarianceInit<F>,
}

impl<F: GmmFloat> Default for ModelConfig<F> {
    fn default() -> Self {
        Self {
            components: DEFAULT_COMPONENTS,
            covariance: CovarianceKind::default(),
            factor_dim: DEFAULT_FACTOR_DIM,
            shared: false,
            reg_covar: F::from_f64_c(DEFAULT_REG_COVAR),
            prior_init: PriorInit::default(),
            mean_init: MeanInit::default(),
            loading_init: LoadingInit::default(),
            variance_init: VarianceInit::default(),
        }
    }
}

impl<F: GmmFloat> ModelConfig<F> {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate against the data dimensionality D.
    pub fn validate(&self, dim: usize) -> Result<()> {
        if self.components == 0 {
            return Err(invalid("components", "must be > 0"));
        }
        if dim == 0 {
            return Err(invalid("dim", "patch dimensionality must be > 0"));
        }
        if self.covariance == CovarianceKind::Factor {
            if self.factor_dim == 0 {
                return Err(invalid("factor_dim", "must be > 0"));
            }
            if self.factor_dim >= dim {
                return Err(invalid(
                    "factor_dim",
                    "must be smaller than the patch dimensionality",
                ));
            }
        }
        if self.reg_covar < F::zero() {
            return Err(invalid("reg_covar", "must be >= 0"));
        }
        if let PriorInit::Given(p) = &self.prior_init {
            if p.len() != self.components {
                return Err(invalid("prior_init", "length must equal components"));
            }
            if p.iter().any(|&v| v < F::zero()) || p.sum() <= F::zero() {
                return Err(invalid("prior_init", "must be non-negative with positive sum"));
            }
        }
        if let MeanInit::Given(m) = &self.mean_init {
            if m.dim() != (self.components, dim) {
                return Err(invalid("mean_init", "shape must be (components, dim)"));
            }
        }
        if let LoadingInit::Given(a) = &self.loading_init {
            if a.dim() != (self.components, dim, self.factor_dim) {
                return Err(invalid(
                    "loading_init",
                    "shape must be (components, dim, factor_dim)",
                ));
            }
        }
        if let VarianceInit::Given(v) = &self.variance_init {
            if v.len() != dim {
                return Err(invalid("variance_init", "length must equal dim"));
            }
            if v.iter().any(|&x| x <= F::zero()) {
                return Err(invalid("variance_init", "must be strictly positive"));
            }
        }
        Ok(())
    }
}

/// Configuration of the truncated variational EM fitter.
#[derive(Debug, Clone)]
pub struct FitConfig<F: GmmFloat> {
    /// Convergence threshold on the relative free-energy change. Default: 1e-4
    pub eps: F,
    /// Outer iteration limit; None runs until eps-convergence only.
    /// Default: None
    pub limit: Option<usize>,
    /// Truncation width C' of the per-patch candidate sets. Default: 3
    pub truncation: usize,
    /// Candidate-refresh period G, in outer iterations. Default: 15
    pub refresh_period: usize,
    /// Number of E/M epochs per outer iteration. Default: 1
    pub inner_epochs: usize,
    /// Winner-take-all responsibilities instead of the softmax. Default: false
    pub hard: bool,
    /// Similarity measure for candidate refresh. Default: Kl
    pub sim_measure: SimMeasure,
    /// Run a cheaper reduced pass first to seed the main fit. Default: false
    pub use_pretrainer: bool,
    /// Seed for all randomness of the fit. Default: 0
    pub seed: u64,
    /// Print per-iteration free energy to stderr. Default: false
    pub verbose: bool,
}

impl<F: GmmFloat> Default for FitConfig<F> {
    fn default() -> Self {
        Self {
            eps: F::from_f64_c(DEFAULT_EPS),
            limit: None,
            truncation: DEFAULT_TRUNCATION,
            refresh_period: DEFAULT_REFRESH_PERIOD,
            inner_epochs: DEFAULT_INNER_EPOCHS,
            hard: false,
            sim_measure: SimMeasure::default(),
            use_pretrainer: false,
            seed: 0,
            verbose: false,
        }
    }
}

impl<F: GmmFloat> FitConfig<F> {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate against the component count C.
    pub fn validate(&self, components: usize) -> Result<()> {
        if self.eps <= F::zero() {
            return Err(invalid("eps", "must be > 0"));
        }
        if self.truncation == 0 {
            return Err(invalid("truncation", "must be > 0"));
        }
        if self.truncation > components {
            return Err(invalid(
                "truncation",
                "must not exceed the component count",
            ));
        }
        if self.refresh_period == 0 {
            return Err(invalid("refresh_period", "must be > 0"));
        }
        if self.inner_epochs == 0 {
            return Err(invalid("inner_epochs", "must be > 0"));
        }
        if let Some(limit) = self.limit {
            if limit == 0 {
                return Err(invalid("limit", "must be > 0 when set"));
            }
        }
        Ok(())
    }
}

/// Configuration of the patch pipeline around the estimator.
#[derive(Debug, Clone)]
pub struct DenoiseConfig<F: GmmFloat> {
    /// Patch shape (rows, cols). Default: (12, 12)
    pub patch_shape: (usize, usize),
    /// Shift between neighboring patches. Default: 1
    pub shift: usize,
    /// Observation noise standard deviation; None estimates it from the
    /// noisy image. Default: None
    pub noise_sigma: Option<F>,
    /// Overlap aggregation strategy. Default: Median
    pub merge: MergeStrategy,
}

impl<F: GmmFloat> Default for DenoiseConfig<F> {
    fn default() -> Self {
        Self {
            patch_shape: DEFAULT_PATCH_SHAPE,
            shift: DEFAULT_PATCH_SHIFT,
            noise_sigma: None,
            merge: MergeStrategy::default(),
        }
    }
}

impl<F: GmmFloat> DenoiseConfig<F> {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the pipeline parameters.
    pub fn validate(&self) -> Result<()> {
        let (ph, pw) = self.patch_shape;
        if ph == 0 || pw == 0 {
            return Err(invalid("patch_shape", "both dimensions must be > 0"));
        }
        if self.shift == 0 {
            return Err(invalid("shift", "must be > 0"));
        }
        if let Some(sigma) = self.noise_sigma {
            if sigma < F::zero() {
                return Err(invalid("noise_sigma", "must be >= 0"));
            }
        }
        Ok(())
    }
}

fn invalid(parameter: &str, message: &str) -> GmmError {
    GmmError::InvalidConfig {
        parameter: parameter.into(),
        message: message.into(),
    }
}
