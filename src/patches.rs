//! Overlapping-patch extraction, merging, and noise estimation.
//!
//! Patches are scanned row-major over a grid of window offsets. The grid
//! always includes the final offset along each axis even when the image
//! extent is not a multiple of the shift, so every pixel is covered by at
//! least one patch and `merge_patches` can reconstruct the full image.

use ndarray::{Array2, ArrayView2};

use crate::config::MergeStrategy;
use crate::error::{GmmError, Result};
use crate::float_trait::GmmFloat;

/// Scale from the median absolute deviation to the standard deviation of a
/// Gaussian.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Window offsets along one axis: multiples of `shift`, plus the final
/// offset `extent - window` when the stride does not land on it.
fn grid_positions(extent: usize, window: usize, shift: usize) -> Vec<usize> {
    let last = extent - window;
    let mut positions: Vec<usize> = (0..=last).step_by(shift).collect();
    if *positions.last().unwrap() != last {
        positions.push(last);
    }
    positions
}

fn validate_geometry(
    image_shape: (usize, usize),
    patch_shape: (usize, usize),
    shift: usize,
) -> Result<()> {
    if shift == 0 {
        return Err(GmmError::InvalidConfig {
            parameter: "shift".into(),
            message: "patch shift must be at least 1".into(),
        });
    }
    if patch_shape.0 == 0 || patch_shape.1 == 0 {
        return Err(GmmError::InvalidConfig {
            parameter: "patch_shape".into(),
            message: "patch dimensions must be nonzero".into(),
        });
    }
    if patch_shape.0 > image_shape.0 || patch_shape.1 > image_shape.1 {
        return Err(GmmError::InvalidConfig {
            parameter: "patch_shape".into(),
            message: format!(
                "patch {}x{} exceeds image {}x{}",
                patch_shape.0, patch_shape.1, image_shape.0, image_shape.1
            ),
        });
    }
    Ok(())
}

/// Extract all overlapping patches as rows of an `N x D` matrix.
///
/// Each patch is flattened row-major; patches are ordered by their top-left
/// corner, rows before columns.
pub fn extract_patches<F: GmmFloat>(
    image: ArrayView2<F>,
    patch_shape: (usize, usize),
    shift: usize,
) -> Result<Array2<F>> {
    validate_geometry(image.dim(), patch_shape, shift)?;
    let (pr, pc) = patch_shape;
    let rows = grid_positions(image.nrows(), pr, shift);
    let cols = grid_positions(image.ncols(), pc, shift);

    let mut patches = Array2::zeros((rows.len() * cols.len(), pr * pc));
    let mut n = 0;
    for &r in &rows {
        for &c in &cols {
            let window = image.slice(ndarray::s![r..r + pr, c..c + pc]);
            for (j, &v) in window.iter().enumerate() {
                patches[[n, j]] = v;
            }
            n += 1;
        }
    }
    Ok(patches)
}

/// Reassemble an image from (typically denoised) overlapping patches.
///
/// `patches` must have the exact row count and width that
/// [`extract_patches`] produces for this geometry. Overlapping
/// contributions to a pixel are combined per `strategy`.
pub fn merge_patches<F: GmmFloat>(
    patches: ArrayView2<F>,
    image_shape: (usize, usize),
    patch_shape: (usize, usize),
    shift: usize,
    strategy: MergeStrategy,
) -> Result<Array2<F>> {
    validate_geometry(image_shape, patch_shape, shift)?;
    let (pr, pc) = patch_shape;
    let rows = grid_positions(image_shape.0, pr, shift);
    let cols = grid_positions(image_shape.1, pc, shift);

    let expected = rows.len() * cols.len();
    if patches.nrows() != expected {
        return Err(GmmError::DimensionMismatch {
            expected,
            actual: patches.nrows(),
        });
    }
    if patches.ncols() != pr * pc {
        return Err(GmmError::DimensionMismatch {
            expected: pr * pc,
            actual: patches.ncols(),
        });
    }

    match strategy {
        MergeStrategy::Mean => {
            let mut sum = Array2::<F>::zeros(image_shape);
            let mut count = Array2::<F>::zeros(image_shape);
            let mut n = 0;
            for &r in &rows {
                for &c in &cols {
                    let patch = patches.row(n);
                    for i in 0..pr {
                        for j in 0..pc {
                            sum[[r + i, c + j]] += patch[i * pc + j];
                            count[[r + i, c + j]] += F::one();
                        }
                    }
                    n += 1;
                }
            }
            Ok(ndarray::Zip::from(&sum)
                .and(&count)
                .map_collect(|&s, &k| s / k))
        }
        MergeStrategy::Median => {
            let mut stacks: Vec<Vec<F>> =
                vec![Vec::new(); image_shape.0 * image_shape.1];
            let mut n = 0;
            for &r in &rows {
                for &c in &cols {
                    let patch = patches.row(n);
                    for i in 0..pr {
                        for j in 0..pc {
                            stacks[(r + i) * image_shape.1 + (c + j)]
                                .push(patch[i * pc + j]);
                        }
                    }
                    n += 1;
                }
            }
            let mut out = Array2::zeros(image_shape);
            for (idx, stack) in stacks.iter_mut().enumerate() {
                out[[idx / image_shape.1, idx % image_shape.1]] =
                    median_of_slice(stack);
            }
            Ok(out)
        }
    }
}

/// Robust estimate of the observation noise standard deviation.
///
/// Uses the MAD of horizontal adjacent-pixel differences; the difference of
/// two independent noise samples carries twice the noise variance, hence the
/// sqrt(2) correction. Smooth image content contributes little to the
/// median, so structure does not inflate the estimate the way a variance
/// would.
pub fn estimate_noise_sigma<F: GmmFloat>(image: ArrayView2<F>) -> F {
    let (rows, cols) = image.dim();
    if cols < 2 {
        return F::zero();
    }
    let mut diffs: Vec<F> = Vec::with_capacity(rows * (cols - 1));
    for r in 0..rows {
        for c in 0..cols - 1 {
            diffs.push(image[[r, c + 1]] - image[[r, c]]);
        }
    }
    let center = median_of_slice(&mut diffs);
    let mut deviations: Vec<F> = diffs.iter().map(|&d| (d - center).abs()).collect();
    let mad = median_of_slice(&mut deviations);
    mad * F::from_f64_c(MAD_TO_SIGMA) / F::from_f64_c(2.0).sqrt()
}

/// O(n) median via select_nth_unstable; averages the two central elements
/// for even lengths.
fn median_of_slice<F: GmmFloat>(data: &mut [F]) -> F {
    let len = data.len();
    if len == 0 {
        return F::zero();
    }
    let mid = len / 2;
    let (_, &mut median, _) = data.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    if len % 2 == 1 {
        median
    } else {
        // The partition leaves everything before mid <= the median.
        let below = data[..mid]
            .iter()
            .fold(F::neg_infinity(), |a, &b| a.max(b));
        (below + median) / F::from_f64_c(2.0)
    }
}
