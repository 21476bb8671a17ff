//! One-call denoising pipeline.
//!
//! Ties the stages together: extract overlapping patches, fit the mixture
//! model on them, shrink every patch toward its posterior components, and
//! merge the reconstructions back into an image. Each stage is also usable
//! on its own through its module.

use ndarray::{Array2, ArrayView2};
use std::sync::atomic::AtomicBool;

use crate::config::{DenoiseConfig, FitConfig, ModelConfig};
use crate::error::Result;
use crate::estimator;
use crate::fitter::{self, FitReport};
use crate::float_trait::GmmFloat;
use crate::model::MixtureModel;
use crate::patches;

/// Denoise a grayscale image end to end.
///
/// Returns the denoised image together with the fitted model and the fit
/// report, so callers can inspect convergence or reuse the model on further
/// images. When `denoise_config.noise_sigma` is `None` the noise level is
/// estimated from the image itself.
pub fn fit_denoise<F: GmmFloat>(
    image: ArrayView2<F>,
    model_config: &ModelConfig<F>,
    fit_config: &FitConfig<F>,
    denoise_config: &DenoiseConfig<F>,
) -> Result<(Array2<F>, MixtureModel<F>, FitReport<F>)> {
    fit_denoise_with_cancel(image, model_config, fit_config, denoise_config, None)
}

/// [`fit_denoise`] with an external cancellation flag, polled between fit
/// iterations. A cancelled fit still denoises with the best model so far.
pub fn fit_denoise_with_cancel<F: GmmFloat>(
    image: ArrayView2<F>,
    model_config: &ModelConfig<F>,
    fit_config: &FitConfig<F>,
    denoise_config: &DenoiseConfig<F>,
    cancel: Option<&AtomicBool>,
) -> Result<(Array2<F>, MixtureModel<F>, FitReport<F>)> {
    denoise_config.validate()?;

    let patch_matrix =
        patches::extract_patches(image, denoise_config.patch_shape, denoise_config.shift)?;

    let (model, report) =
        fitter::fit_model_with_cancel(patch_matrix.view(), model_config, fit_config, cancel)?;

    let sigma = match denoise_config.noise_sigma {
        Some(s) => s,
        None => patches::estimate_noise_sigma(image),
    };
    let denoised_patches = estimator::estimate_truncated(
        &model,
        patch_matrix.view(),
        sigma * sigma,
        fit_config.truncation,
        fit_config.sim_measure,
    )?;

    let denoised = patches::merge_patches(
        denoised_patches.view(),
        image.dim(),
        denoise_config.patch_shape,
        denoise_config.shift,
        denoise_config.merge,
    )?;
    Ok((denoised, model, report))
}
