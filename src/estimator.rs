//! MMSE patch estimator.
//!
//! Given a fitted model and the observation noise variance, each noisy patch
//! is denoised by one non-iterative truncated E-step followed by
//! responsibility-weighted conditional-mean shrinkage toward the candidate
//! components. The shrinkage operator of every covariance slot is prepared
//! once and reused across all patches.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::config::{SimMeasure, DEFAULT_TRUNCATION};
use crate::covariance::ShrinkOp;
use crate::error::{GmmError, Result};
use crate::fitter::{posterior_candidates, PATCH_CHUNK_LEN};
use crate::float_trait::GmmFloat;
use crate::model::MixtureModel;

/// Denoise patches with the default truncation width and similarity measure.
pub fn estimate<F: GmmFloat>(
    model: &MixtureModel<F>,
    patches: ArrayView2<F>,
    noise_var: F,
) -> Result<Array2<F>> {
    estimate_truncated(
        model,
        patches,
        noise_var,
        DEFAULT_TRUNCATION,
        SimMeasure::default(),
    )
}

/// Denoise patches, keeping only the top `c_prime` components per patch.
///
/// `patches` need not be the patches the model was fitted on; candidate
/// sets are computed fresh under the final parameters. Deactivated
/// components never enter a candidate set. As `noise_var` approaches zero
/// the output approaches the input; as it grows the output approaches the
/// responsibility-weighted component means.
pub fn estimate_truncated<F: GmmFloat>(
    model: &MixtureModel<F>,
    patches: ArrayView2<F>,
    noise_var: F,
    c_prime: usize,
    sim: SimMeasure,
) -> Result<Array2<F>> {
    let (n, d) = patches.dim();
    if d != model.dim() {
        return Err(GmmError::DimensionMismatch {
            expected: model.dim(),
            actual: d,
        });
    }
    if c_prime == 0 {
        return Err(GmmError::InvalidConfig {
            parameter: "c_prime".into(),
            message: "truncation width must be at least 1".into(),
        });
    }
    if n == 0 {
        return Ok(Array2::zeros((0, d)));
    }

    // One operator per covariance slot; shared mode prepares exactly one.
    let ops: Vec<ShrinkOp<F>> = (0..model.num_cov_slots())
        .map(|slot| model.covariance(slot).shrink_op(noise_var))
        .collect::<Result<_>>()?;

    let mut out = Array2::zeros((n, d));
    out.axis_chunks_iter_mut(Axis(0), PATCH_CHUNK_LEN)
        .into_par_iter()
        .enumerate()
        .for_each(|(ci, mut chunk)| {
            for (i, mut row) in chunk.rows_mut().into_iter().enumerate() {
                let x = patches.row(ci * PATCH_CHUNK_LEN + i);
                let set = posterior_candidates(model, x, c_prime, sim);
                if set.is_empty() {
                    // No usable component; pass the observation through.
                    row.assign(&x);
                    continue;
                }
                let mut acc: Array1<F> = Array1::zeros(d);
                for cand in &set {
                    let mu = model.means().row(cand.component);
                    let shrunk = ops[model.cov_slot(cand.component)].apply(x, mu);
                    acc.scaled_add(cand.responsibility, &shrunk);
                }
                row.assign(&acc);
            }
        });

    Ok(out)
}
