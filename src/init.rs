//! Mixture initialization: seeds priors, means, and covariance parameters
//! before EM begins.
//!
//! Means default to assumption-free K-MC^2 sampling (Markov-chain
//! approximate farthest-point seeding), variances to the data's empirical
//! variance, factor loadings to scaled uniform noise, and priors to flat.
//! Every parameter group can instead be supplied as a precomputed array
//! through the corresponding `*Init::Given` variant.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::config::{
    CovarianceKind, LoadingInit, MeanInit, ModelConfig, PriorInit, VarianceInit,
};
use crate::covariance::Covariance;
use crate::error::{GmmError, Result};
use crate::float_trait::GmmFloat;
use crate::model::MixtureModel;

/// Fixed Markov-chain length per AFK-MC^2 seed draw.
const AFKMC2_CHAIN_LENGTH: usize = 200;

/// Build a starting model for the given data and configuration.
///
/// All randomness (seed sampling, loading draws) flows through `rng`; the
/// same generator state yields the identical starting point.
pub fn initialize<F: GmmFloat, R: Rng>(
    data: ArrayView2<F>,
    config: &ModelConfig<F>,
    rng: &mut R,
) -> Result<MixtureModel<F>> {
    let (n, d) = data.dim();
    if n == 0 {
        return Err(GmmError::EmptyInput);
    }
    config.validate(d)?;
    let c = config.components;

    let means = match &config.mean_init {
        MeanInit::Given(m) => m.clone(),
        MeanInit::Afkmc2 => afkmc2_means(data, c, rng),
    };

    let variance = match &config.variance_init {
        VarianceInit::Given(v) => v.clone(),
        VarianceInit::DataVariance => empirical_variance(data).mapv(|v| v + config.reg_covar),
    };

    let priors = match &config.prior_init {
        PriorInit::Given(p) => p.clone(),
        PriorInit::Flat => Array1::from_elem(c, F::one() / F::usize_as(c)),
        PriorInit::SeedCounts => priors_from_hard_assignment(data, &means),
    };

    let slots = if config.shared { 1 } else { c };
    let mut covariances = Vec::with_capacity(slots);
    for slot in 0..slots {
        let cov = match config.covariance {
            CovarianceKind::Isotropic => {
                Covariance::isotropic(d, variance.sum() / F::usize_as(d))?
            }
            CovarianceKind::Diagonal => Covariance::diagonal(variance.clone())?,
            CovarianceKind::Factor => {
                let loading = match &config.loading_init {
                    LoadingInit::Given(a) => {
                        a.index_axis(Axis(0), slot.min(a.dim().0 - 1)).to_owned()
                    }
                    LoadingInit::ScaledUniform => {
                        scaled_uniform_loading(d, config.factor_dim, &variance, rng)
                    }
                };
                Covariance::factor(loading, variance.clone())?
            }
            CovarianceKind::Full => {
                let mut sigma = Array2::zeros((d, d));
                for i in 0..d {
                    sigma[[i, i]] = variance[i];
                }
                Covariance::full(sigma)?
            }
        };
        covariances.push(cov);
    }

    let mut model = MixtureModel::new(priors, means, covariances, config.shared)?;
    model.set_regularization(config.reg_covar);
    Ok(model)
}

/// Per-dimension empirical variance of the dataset.
fn empirical_variance<F: GmmFloat>(data: ArrayView2<F>) -> Array1<F> {
    let (n, d) = data.dim();
    let inv_n = F::one() / F::usize_as(n);
    let mean = data.sum_axis(Axis(0)).mapv(|s| s * inv_n);
    let mut var = Array1::zeros(d);
    for row in data.rows() {
        for j in 0..d {
            let r = row[j] - mean[j];
            var[j] += r * r;
        }
    }
    var.mapv_inplace(|v| v * inv_n);
    var
}

/// Uniform loadings in [-1, 1], scaled so the implied factor variance
/// matches the data's mean empirical variance.
fn scaled_uniform_loading<F: GmmFloat, R: Rng>(
    d: usize,
    h: usize,
    variance: &Array1<F>,
    rng: &mut R,
) -> Array2<F> {
    let mean_var = variance.sum().to_f64_c() / d as f64;
    let scale = (mean_var / h as f64).sqrt();
    Array2::from_shape_fn((d, h), |_| {
        F::from_f64_c((rng.gen::<f64>() * 2.0 - 1.0) * scale)
    })
}

/// Priors from a hard nearest-seed clustering, add-one smoothed so no
/// component starts at zero mass.
fn priors_from_hard_assignment<F: GmmFloat>(
    data: ArrayView2<F>,
    means: &Array2<F>,
) -> Array1<F> {
    let n = data.nrows();
    let c = means.nrows();
    let mut counts = vec![0usize; c];
    for row in data.rows() {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for k in 0..c {
            let dist = sq_distance(row, means.row(k));
            if dist < best_dist {
                best_dist = dist;
                best = k;
            }
        }
        counts[best] += 1;
    }
    let denom = (n + c) as f64;
    Array1::from_shape_fn(c, |k| F::from_f64_c((counts[k] + 1) as f64 / denom))
}

fn sq_distance<F: GmmFloat>(a: ArrayView1<F>, b: ArrayView1<F>) -> f64 {
    let mut sum = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let r = (x - y).to_f64_c();
        sum += r * r;
    }
    sum
}

/// Assumption-free K-MC^2 mean seeding.
///
/// The first seed is uniform; each further seed is drawn by a fixed-length
/// Metropolis-Hastings chain over the proposal
/// q(x) = 0.5 * d^2(x, c_1) / sum_d^2 + 0.5 / N, accepting candidate y over
/// state x with probability min(1, d^2(y, S) q(x) / (d^2(x, S) q(y))) where
/// S is the set of seeds chosen so far. Cost per seed is O(chain * |S| * D)
/// rather than the O(N * |S| * D) of exact k-means++.
fn afkmc2_means<F: GmmFloat, R: Rng>(
    data: ArrayView2<F>,
    c: usize,
    rng: &mut R,
) -> Array2<F> {
    let (n, d) = data.dim();
    let first = rng.gen_range(0..n);

    // Proposal distribution from the first seed.
    let mut d0: Vec<f64> = Vec::with_capacity(n);
    for row in data.rows() {
        d0.push(sq_distance(row, data.row(first)));
    }
    let total: f64 = d0.iter().sum();
    let uniform = 0.5 / n as f64;
    let q: Vec<f64> = if total > 0.0 {
        d0.iter().map(|&v| 0.5 * v / total + uniform).collect()
    } else {
        vec![1.0 / n as f64; n]
    };
    let mut cdf = Vec::with_capacity(n);
    let mut acc = 0.0;
    for &qi in &q {
        acc += qi;
        cdf.push(acc);
    }
    let cdf_total = acc;

    let mut chosen = Vec::with_capacity(c);
    chosen.push(first);

    let min_dist = |idx: usize, seeds: &[usize]| -> f64 {
        seeds
            .iter()
            .map(|&s| sq_distance(data.row(idx), data.row(s)))
            .fold(f64::INFINITY, f64::min)
    };

    while chosen.len() < c {
        let mut x = sample_cdf(&cdf, cdf_total, rng);
        let mut dx = min_dist(x, &chosen);
        for _ in 1..AFKMC2_CHAIN_LENGTH {
            let y = sample_cdf(&cdf, cdf_total, rng);
            let dy = min_dist(y, &chosen);
            let accept = if dx <= 0.0 {
                true
            } else {
                (dy * q[x]) / (dx * q[y]) > rng.gen::<f64>()
            };
            if accept {
                x = y;
                dx = dy;
            }
        }
        chosen.push(x);
    }

    let mut means = Array2::zeros((c, d));
    for (k, &idx) in chosen.iter().enumerate() {
        means.row_mut(k).assign(&data.row(idx));
    }
    means
}

fn sample_cdf<R: Rng>(cdf: &[f64], total: f64, rng: &mut R) -> usize {
    let u = rng.gen::<f64>() * total;
    cdf.partition_point(|&v| v < u).min(cdf.len() - 1)
}
