//! Patch-based image denoising with truncated variational Gaussian
//! mixtures.
//!
//! The crate fits a Gaussian mixture model to overlapping image patches
//! with a truncated variational EM algorithm: every patch tracks only its
//! `C'` most plausible components, refreshed periodically, which keeps the
//! per-iteration cost at O(N * C') instead of O(N * C). Four covariance
//! parameterizations are supported (isotropic, diagonal, factor, full),
//! optionally shared across all components. Denoising is MMSE shrinkage of
//! each patch toward its posterior components.
//!
//! The typical entry points are [`orchestration::fit_denoise`] for whole
//! images and [`fitter::fit_model`] / [`estimator::estimate`] for working
//! with patch matrices directly.

pub mod config;
pub mod covariance;
pub mod error;
pub mod estimator;
pub mod fitter;
pub mod float_trait;
pub mod init;
pub mod linalg;
pub mod model;
pub mod orchestration;
pub mod patches;

pub use config::{
    CovarianceKind, DenoiseConfig, FitConfig, LoadingInit, MeanInit, MergeStrategy,
    ModelConfig, PriorInit, SimMeasure, VarianceInit,
};
pub use error::{GmmError, Result};
pub use estimator::{estimate, estimate_truncated};
pub use fitter::{
    fit, fit_model, fit_model_with_cancel, fit_with_cancel, Candidate, CandidateSet,
    FitReport, FitStatus,
};
pub use float_trait::GmmFloat;
pub use init::initialize;
pub use model::MixtureModel;
pub use orchestration::{fit_denoise, fit_denoise_with_cancel};
pub use patches::{estimate_noise_sigma, extract_patches, merge_patches};
