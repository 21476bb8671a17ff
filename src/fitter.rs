//! Truncated variational EM fitter.
//!
//! Iterates expectation/maximization over per-patch candidate sets of at
//! most C' components. Candidate sets are refreshed every G-th outer
//! iteration at O(N*C) cost; all other passes run at O(N*C'). The model is
//! mutated only at M-step boundaries; readers see a consistent state between
//! iterations.
//!
//! Parallel passes chunk the patch axis at a fixed length and merge partial
//! accumulators in chunk order, so results do not depend on the thread
//! count.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::{
    CovarianceKind, FitConfig, MeanInit, ModelConfig, PriorInit, SimMeasure,
};
use crate::covariance::CovStats;
use crate::error::{GmmError, Result};
use crate::float_trait::GmmFloat;
use crate::init;
use crate::model::MixtureModel;

// =============================================================================
// Constants
// =============================================================================

/// Patch-chunk length for the parallel E/M passes. Fixed rather than derived
/// from the thread count, so partial sums always merge in the same order.
pub(crate) const PATCH_CHUNK_LEN: usize = 512;

/// A component whose responsibility mass falls below this fraction of the
/// total mass is deactivated instead of receiving a singular update.
const MIN_RELATIVE_MASS: f64 = 1e-10;

/// Patch subsampling stride of the pretrainer pass.
const PRETRAIN_STRIDE: usize = 10;

/// Outer-iteration budget of the pretrainer pass.
const PRETRAIN_LIMIT: usize = 10;

/// Floor applied to pretrainer priors before they seed the main fit, so a
/// component starved during pretraining can still recover.
const PRETRAIN_PRIOR_FLOOR: f64 = 1e-6;

// =============================================================================
// Types
// =============================================================================

/// One entry of a patch's truncated responsibility set.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<F: GmmFloat> {
    /// Index into the model's component table.
    pub component: usize,
    /// Posterior responsibility of that component for this patch.
    pub responsibility: F,
}

/// Truncated responsibility set of one patch: at most C' candidates,
/// ordered by decreasing score at the last refresh.
pub type CandidateSet<F> = Vec<Candidate<F>>;

/// Terminal state of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    /// Relative free-energy change fell below eps.
    Converged,
    /// The iteration limit elapsed before eps-convergence. The partial fit
    /// is still returned and usable.
    IterationLimit,
    /// The caller requested cancellation; the best state so far is returned.
    Stopped,
}

/// Outcome of one fit: status plus the free-energy history.
#[derive(Debug, Clone)]
pub struct FitReport<F: GmmFloat> {
    pub status: FitStatus,
    /// Number of completed outer iterations.
    pub iterations: usize,
    /// Final free-energy (truncated log-likelihood lower bound).
    pub free_energy: F,
    /// Free energy after each outer iteration.
    pub free_energy_trace: Vec<F>,
}

impl<F: GmmFloat> FitReport<F> {
    /// Whether the fit reached eps-convergence.
    pub fn converged(&self) -> bool {
        self.status == FitStatus::Converged
    }
}

// =============================================================================
// Public entry points
// =============================================================================

/// Initialize and fit a mixture model on the given patches.
///
/// Builds the seeded generator, optionally runs the pretrainer pass, then
/// initializes and fits the model per the two configurations.
pub fn fit_model<F: GmmFloat>(
    data: ArrayView2<F>,
    model_config: &ModelConfig<F>,
    fit_config: &FitConfig<F>,
) -> Result<(MixtureModel<F>, FitReport<F>)> {
    fit_model_with_cancel(data, model_config, fit_config, None)
}

/// [`fit_model`] with an external cancellation flag, polled at outer
/// iteration boundaries.
pub fn fit_model_with_cancel<F: GmmFloat>(
    data: ArrayView2<F>,
    model_config: &ModelConfig<F>,
    fit_config: &FitConfig<F>,
    cancel: Option<&AtomicBool>,
) -> Result<(MixtureModel<F>, FitReport<F>)> {
    let (n, d) = data.dim();
    if n == 0 {
        return Err(GmmError::EmptyInput);
    }
    model_config.validate(d)?;
    fit_config.validate(model_config.components)?;

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(fit_config.seed);
    let mut effective = model_config.clone();

    if fit_config.use_pretrainer {
        // A smaller instance of the same state machine: isotropic backend on
        // a subsampled patch set, feeding means and priors to the main
        // initializer.
        let sub = data.slice(s![..;PRETRAIN_STRIDE, ..]);
        let pre_model_config = ModelConfig {
            covariance: CovarianceKind::Isotropic,
            ..model_config.clone()
        };
        let pre_fit_config = FitConfig {
            limit: Some(PRETRAIN_LIMIT),
            use_pretrainer: false,
            verbose: false,
            ..fit_config.clone()
        };
        let mut pre_model = init::initialize(sub, &pre_model_config, &mut rng)?;
        fit_with_cancel(&mut pre_model, sub, &pre_fit_config, cancel)?;

        let floor = F::from_f64_c(PRETRAIN_PRIOR_FLOOR);
        effective.mean_init = MeanInit::Given(pre_model.means().clone());
        effective.prior_init = PriorInit::Given(pre_model.priors().mapv(|p| p.max(floor)));
    }

    let mut model = init::initialize(data, &effective, &mut rng)?;
    let report = fit_with_cancel(&mut model, data, fit_config, cancel)?;
    Ok((model, report))
}

/// Fit an already-initialized model in place.
pub fn fit<F: GmmFloat>(
    model: &mut MixtureModel<F>,
    data: ArrayView2<F>,
    config: &FitConfig<F>,
) -> Result<FitReport<F>> {
    fit_with_cancel(model, data, config, None)
}

/// [`fit`] with an external cancellation flag.
pub fn fit_with_cancel<F: GmmFloat>(
    model: &mut MixtureModel<F>,
    data: ArrayView2<F>,
    config: &FitConfig<F>,
    cancel: Option<&AtomicBool>,
) -> Result<FitReport<F>> {
    let (n, d) = data.dim();
    if n == 0 {
        return Err(GmmError::EmptyInput);
    }
    if d != model.dim() {
        return Err(GmmError::DimensionMismatch {
            expected: model.dim(),
            actual: d,
        });
    }
    config.validate(model.num_components())?;

    let mut qs: Vec<CandidateSet<F>> = vec![Vec::new(); n];
    let mut best: Vec<usize> = vec![0; n];
    let mut trace: Vec<F> = Vec::new();
    let mut prev_fe: Option<F> = None;
    let mut iterations = 0;

    let mut t = 0;
    let status = loop {
        if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
            break FitStatus::Stopped;
        }
        if model.active_components().is_empty() {
            return Err(GmmError::NumericalInstability {
                component: None,
                message: "all components were deactivated".into(),
            });
        }
        if t % config.refresh_period == 0 {
            refresh_candidates(
                model,
                data,
                &mut qs,
                &best,
                config.truncation,
                config.sim_measure,
                t == 0,
            );
        }

        let mut fe = F::zero();
        for _ in 0..config.inner_epochs {
            fe = e_step(model, data, &mut qs, &mut best, config.hard);
            m_step(model, data, &qs)?;
        }
        if !fe.is_finite() {
            return Err(GmmError::NumericalInstability {
                component: None,
                message: "free energy is not finite".into(),
            });
        }
        trace.push(fe);
        iterations = t + 1;
        if config.verbose {
            eprintln!("iteration {:4}  free energy {:.6}", t, fe);
        }

        if let Some(prev) = prev_fe {
            let scale = prev.abs().max(F::from_f64_c(1e-12));
            if ((fe - prev) / scale).abs() < config.eps {
                break FitStatus::Converged;
            }
        }
        prev_fe = Some(fe);

        t += 1;
        if let Some(limit) = config.limit {
            if t >= limit {
                break FitStatus::IterationLimit;
            }
        }
    };

    Ok(FitReport {
        status,
        iterations,
        free_energy: trace.last().copied().unwrap_or_else(F::neg_infinity),
        free_energy_trace: trace,
    })
}

// =============================================================================
// Candidate refresh
// =============================================================================

/// Similarity score of component `k` for a patch, higher is better.
fn similarity<F: GmmFloat>(
    model: &MixtureModel<F>,
    k: usize,
    x: ArrayView1<F>,
    sim: SimMeasure,
) -> F {
    match sim {
        // KL from the patch's Dirac measure to the component predictive
        // reduces to the component log-density up to patch-constant terms.
        SimMeasure::Kl => model.log_density(k, x),
        SimMeasure::Posterior => model.log_joint(k, x),
    }
}

/// Select the top-`limit` active components for one patch, ordered by
/// decreasing similarity.
fn top_components<F: GmmFloat>(
    model: &MixtureModel<F>,
    x: ArrayView1<F>,
    active: &[usize],
    limit: usize,
    sim: SimMeasure,
) -> Vec<usize> {
    let mut scored: Vec<(F, usize)> = active
        .iter()
        .map(|&k| (similarity(model, k, x, sim), k))
        .collect();
    let keep = limit.min(scored.len());
    if keep < scored.len() {
        scored.select_nth_unstable_by(keep - 1, |a, b| {
            b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(keep);
    }
    scored.sort_unstable_by(|a, b| {
        b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.into_iter().map(|(_, k)| k).collect()
}

/// Rebuild every patch's candidate set from the current parameters.
///
/// Keeps the patch's previous winning component in the set (except on the
/// very first refresh), so the variational bound cannot drop when the set
/// changes.
fn refresh_candidates<F: GmmFloat>(
    model: &MixtureModel<F>,
    data: ArrayView2<F>,
    qs: &mut [CandidateSet<F>],
    best: &[usize],
    c_prime: usize,
    sim: SimMeasure,
    first: bool,
) {
    let active = model.active_components();
    let limit = c_prime.min(active.len());

    qs.par_chunks_mut(PATCH_CHUNK_LEN)
        .enumerate()
        .for_each(|(ci, chunk)| {
            for (i, set) in chunk.iter_mut().enumerate() {
                let nidx = ci * PATCH_CHUNK_LEN + i;
                let x = data.row(nidx);
                let mut top = top_components(model, x, &active, limit, sim);
                if !first {
                    let keep = best[nidx];
                    if model.is_active(keep) && !top.contains(&keep) {
                        let last = top.len() - 1;
                        top[last] = keep;
                    }
                }
                set.clear();
                set.extend(top.into_iter().map(|component| Candidate {
                    component,
                    responsibility: F::zero(),
                }));
            }
        });
}

// =============================================================================
// E-step
// =============================================================================

/// Soft (or hard) responsibilities over one patch's candidate set.
///
/// Returns the patch's log-sum-exp contribution to the free energy and
/// updates the winning component. Deactivated candidates are dropped.
fn normalize_set<F: GmmFloat>(
    model: &MixtureModel<F>,
    x: ArrayView1<F>,
    set: &mut CandidateSet<F>,
    hard: bool,
) -> (F, Option<usize>) {
    set.retain(|cand| model.is_active(cand.component));
    if set.is_empty() {
        return (F::zero(), None);
    }

    let scores: Vec<F> = set
        .iter()
        .map(|cand| model.log_joint(cand.component, x))
        .collect();
    let max = scores
        .iter()
        .copied()
        .fold(F::neg_infinity(), |a, b| a.max(b));
    if !max.is_finite() {
        for cand in set.iter_mut() {
            cand.responsibility = F::zero();
        }
        return (F::zero(), None);
    }

    let mut sum = F::zero();
    for &s in &scores {
        sum += (s - max).exp();
    }
    let lse = max + sum.ln();

    let mut winner = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[winner] {
            winner = i;
        }
        set[i].responsibility = (s - lse).exp();
    }
    if hard {
        for (i, cand) in set.iter_mut().enumerate() {
            cand.responsibility = if i == winner { F::one() } else { F::zero() };
        }
    }
    (lse, Some(set[winner].component))
}

/// One expectation pass over all patches; returns the free energy.
fn e_step<F: GmmFloat>(
    model: &MixtureModel<F>,
    data: ArrayView2<F>,
    qs: &mut [CandidateSet<F>],
    best: &mut [usize],
    hard: bool,
) -> F {
    let partials: Vec<F> = qs
        .par_chunks_mut(PATCH_CHUNK_LEN)
        .zip(best.par_chunks_mut(PATCH_CHUNK_LEN))
        .enumerate()
        .map(|(ci, (qchunk, bchunk))| {
            let mut local = F::zero();
            for (i, set) in qchunk.iter_mut().enumerate() {
                let nidx = ci * PATCH_CHUNK_LEN + i;
                let (lse, winner) = normalize_set(model, data.row(nidx), set, hard);
                local += lse;
                if let Some(w) = winner {
                    bchunk[i] = w;
                }
            }
            local
        })
        .collect();
    // Sequential fold in chunk order keeps the sum reproducible.
    partials.into_iter().fold(F::zero(), |a, b| a + b)
}

// =============================================================================
// M-step
// =============================================================================

/// Raw (uncentered) weighted sufficient statistics of one component.
struct RawStats<F: GmmFloat> {
    weight: F,
    sum: Array1<F>,
    moment: RawMoment<F>,
}

enum RawMoment<F: GmmFloat> {
    /// Per-dimension weighted second moments (isotropic/diagonal).
    PerDim(Array1<F>),
    /// Weighted outer products (factor/full).
    Scatter(Array2<F>),
}

impl<F: GmmFloat> RawStats<F> {
    fn new(d: usize, scatter: bool) -> Self {
        Self {
            weight: F::zero(),
            sum: Array1::zeros(d),
            moment: if scatter {
                RawMoment::Scatter(Array2::zeros((d, d)))
            } else {
                RawMoment::PerDim(Array1::zeros(d))
            },
        }
    }

    fn add(&mut self, x: ArrayView1<F>, w: F) {
        self.weight += w;
        self.sum.scaled_add(w, &x);
        match &mut self.moment {
            RawMoment::PerDim(sq) => {
                for (s, &xi) in sq.iter_mut().zip(x.iter()) {
                    *s += w * xi * xi;
                }
            }
            RawMoment::Scatter(outer) => {
                for (i, mut row) in outer.rows_mut().into_iter().enumerate() {
                    row.scaled_add(w * x[i], &x);
                }
            }
        }
    }

    fn merge(&mut self, other: &RawStats<F>) {
        self.weight += other.weight;
        self.sum += &other.sum;
        match (&mut self.moment, &other.moment) {
            (RawMoment::PerDim(a), RawMoment::PerDim(b)) => *a += b,
            (RawMoment::Scatter(a), RawMoment::Scatter(b)) => *a += b,
            _ => unreachable!("mismatched moment shapes"),
        }
    }

    /// Center the second moments at the weighted mean.
    fn centered(&self, mean: &Array1<F>) -> CovStats<F> {
        let w = self.weight;
        match &self.moment {
            RawMoment::PerDim(sq) => {
                let centered_sq = ndarray::Zip::from(sq)
                    .and(mean)
                    // Floor at zero absorbs the rounding of E[x^2] - mu^2.
                    .map_collect(|&s, &m| (s - w * m * m).max(F::zero()));
                CovStats::Moments {
                    weight: w,
                    centered_sq,
                }
            }
            RawMoment::Scatter(outer) => {
                let mut centered = outer.clone();
                for (i, mut row) in centered.rows_mut().into_iter().enumerate() {
                    row.scaled_add(-(w * mean[i]), mean);
                }
                CovStats::Scatter {
                    weight: w,
                    centered,
                }
            }
        }
    }
}

/// One maximization pass: accumulate per-component statistics in parallel,
/// then update priors, means, and covariances.
///
/// A component whose mass underflows, or whose covariance update turns
/// singular, is deactivated. Instability of the shared covariance aborts the
/// whole fit since no per-component fallback exists.
fn m_step<F: GmmFloat>(
    model: &mut MixtureModel<F>,
    data: ArrayView2<F>,
    qs: &[CandidateSet<F>],
) -> Result<()> {
    let c = model.num_components();
    let d = model.dim();
    let scatter = model.covariance(0).kind().needs_scatter();
    let reg = model.regularization();

    // Per-chunk partial statistics, merged in chunk order.
    let partials: Vec<FxHashMap<usize, RawStats<F>>> = qs
        .par_chunks(PATCH_CHUNK_LEN)
        .enumerate()
        .map(|(ci, chunk)| {
            let mut local: FxHashMap<usize, RawStats<F>> = FxHashMap::default();
            for (i, set) in chunk.iter().enumerate() {
                let nidx = ci * PATCH_CHUNK_LEN + i;
                let x = data.row(nidx);
                for cand in set {
                    if cand.responsibility > F::zero() {
                        local
                            .entry(cand.component)
                            .or_insert_with(|| RawStats::new(d, scatter))
                            .add(x, cand.responsibility);
                    }
                }
            }
            local
        })
        .collect();

    let mut stats: Vec<Option<RawStats<F>>> = (0..c).map(|_| None).collect();
    for local in &partials {
        for k in 0..c {
            if let Some(part) = local.get(&k) {
                match &mut stats[k] {
                    Some(acc) => acc.merge(part),
                    slot @ None => {
                        let mut acc = RawStats::new(d, scatter);
                        acc.merge(part);
                        *slot = Some(acc);
                    }
                }
            }
        }
    }

    let total_mass: F = stats
        .iter()
        .flatten()
        .map(|s| s.weight)
        .fold(F::zero(), |a, b| a + b);
    if !(total_mass > F::zero()) {
        return Err(GmmError::NumericalInstability {
            component: None,
            message: "total responsibility mass vanished".into(),
        });
    }
    let mass_floor = F::from_f64_c(MIN_RELATIVE_MASS) * total_mass;

    // Decide survivors and their new means before touching the model.
    let mut updates: Vec<(usize, F, Array1<F>, CovStats<F>)> = Vec::new();
    let mut starved: Vec<usize> = Vec::new();
    for k in 0..c {
        if !model.is_active(k) {
            continue;
        }
        let raw = match &stats[k] {
            Some(raw) if raw.weight > mass_floor => raw,
            _ => {
                starved.push(k);
                continue;
            }
        };
        let inv_w = F::one() / raw.weight;
        let mean = raw.sum.mapv(|v| v * inv_w);
        let cov_stats = raw.centered(&mean);
        updates.push((k, raw.weight, mean, cov_stats));
    }
    for &k in &starved {
        model.deactivate(k);
    }
    if updates.is_empty() {
        return Err(GmmError::NumericalInstability {
            component: None,
            message: "all components were deactivated".into(),
        });
    }

    if model.is_shared() {
        // Pool all components' centered statistics into the single slot;
        // updates is non-empty here.
        let mut pooled = updates[0].3.clone();
        for (_, _, _, cov_stats) in &updates[1..] {
            pooled.merge(cov_stats);
        }
        model
            .covariance_slot_mut(0)
            .update_from_stats(&pooled, reg)
            .map_err(shared_abort)?;
        for (k, _, mean, _) in &updates {
            model.set_mean(*k, mean.view());
        }
        apply_priors(model, &updates);
    } else {
        let mut surviving: Vec<(usize, F, Array1<F>, CovStats<F>)> = Vec::new();
        for (k, mass, mean, cov_stats) in updates {
            match model
                .covariance_slot_mut(model.cov_slot(k))
                .update_from_stats(&cov_stats, reg)
            {
                Ok(()) => {
                    model.set_mean(k, mean.view());
                    surviving.push((k, mass, mean, cov_stats));
                }
                Err(_) => {
                    // Early-detected instability: drop this component, keep
                    // the fit going.
                    model.deactivate(k);
                }
            }
        }
        if surviving.is_empty() {
            return Err(GmmError::NumericalInstability {
                component: None,
                message: "all components were deactivated".into(),
            });
        }
        apply_priors(model, &surviving);
    }

    Ok(())
}

fn apply_priors<F: GmmFloat>(
    model: &mut MixtureModel<F>,
    updates: &[(usize, F, Array1<F>, CovStats<F>)],
) {
    let total: F = updates
        .iter()
        .map(|(_, mass, _, _)| *mass)
        .fold(F::zero(), |a, b| a + b);
    for (k, mass, _, _) in updates {
        model.set_prior(*k, *mass / total);
    }
}

fn shared_abort(e: GmmError) -> GmmError {
    match e {
        GmmError::NumericalInstability { message, .. } => GmmError::NumericalInstability {
            component: None,
            message: format!("shared covariance update failed: {}", message),
        },
        other => other,
    }
}

// =============================================================================
// Estimator support
// =============================================================================

/// One non-iterative E-step for a single patch: candidate selection plus
/// soft responsibilities under the final parameters.
pub(crate) fn posterior_candidates<F: GmmFloat>(
    model: &MixtureModel<F>,
    x: ArrayView1<F>,
    c_prime: usize,
    sim: SimMeasure,
) -> CandidateSet<F> {
    let active = model.active_components();
    let limit = c_prime.min(active.len());
    let top = top_components(model, x, &active, limit, sim);
    let mut set: CandidateSet<F> = top
        .into_iter()
        .map(|component| Candidate {
            component,
            responsibility: F::zero(),
        })
        .collect();
    normalize_set(model, x, &mut set, false);
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::config::VarianceInit;

    /// Rows alternate between two well-separated unit-spread clusters.
    fn two_cluster_data(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |(i, _)| {
            let center = if i % 2 == 0 { 0.0 } else { 8.0 };
            center + rng.gen::<f64>() - 0.5
        })
    }

    fn isotropic_config(c: usize) -> ModelConfig<f64> {
        ModelConfig {
            components: c,
            covariance: CovarianceKind::Isotropic,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_responsibilities_sum_to_one() {
        let data = two_cluster_data(64, 4, 1);
        let config = isotropic_config(4);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let model = init::initialize(data.view(), &config, &mut rng).unwrap();

        for row in data.rows() {
            let set = posterior_candidates(&model, row, 3, SimMeasure::Kl);
            assert!(!set.is_empty() && set.len() <= 3);
            let total: f64 = set.iter().map(|c| c.responsibility).sum();
            assert!((total - 1.0).abs() < 1e-9, "sum was {}", total);
        }
    }

    #[test]
    fn test_hard_assignment_is_one_hot() {
        let data = two_cluster_data(32, 3, 2);
        let config = isotropic_config(4);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let model = init::initialize(data.view(), &config, &mut rng).unwrap();

        let mut set = posterior_candidates(&model, data.row(0), 4, SimMeasure::Kl);
        normalize_set(&model, data.row(0), &mut set, true);
        let ones = set
            .iter()
            .filter(|c| c.responsibility == 1.0)
            .count();
        let zeros = set
            .iter()
            .filter(|c| c.responsibility == 0.0)
            .count();
        assert_eq!(ones, 1);
        assert_eq!(zeros, set.len() - 1);
    }

    #[test]
    fn test_free_energy_is_monotone() {
        let data = two_cluster_data(200, 4, 7);
        let config = ModelConfig {
            components: 6,
            covariance: CovarianceKind::Diagonal,
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            eps: 1e-12,
            limit: Some(25),
            truncation: 3,
            refresh_period: 4,
            sim_measure: SimMeasure::Posterior,
            ..FitConfig::default()
        };
        let (_, report) = fit_model(data.view(), &config, &fit_config).unwrap();

        let trace = &report.free_energy_trace;
        assert!(trace.len() > 2);
        for w in trace.windows(2) {
            let slack = 1e-7 * w[0].abs().max(1.0);
            assert!(
                w[1] >= w[0] - slack,
                "free energy dropped: {} -> {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_same_seed_reproduces_fit_exactly() {
        let data = two_cluster_data(150, 5, 11);
        let config = ModelConfig {
            components: 5,
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            limit: Some(12),
            seed: 7,
            ..FitConfig::default()
        };
        let (a, ra) = fit_model(data.view(), &config, &fit_config).unwrap();
        let (b, rb) = fit_model(data.view(), &config, &fit_config).unwrap();

        assert_eq!(a.means(), b.means());
        assert_eq!(a.priors(), b.priors());
        assert_eq!(ra.free_energy_trace, rb.free_energy_trace);
    }

    /// With the truncation width equal to C and a refresh every iteration,
    /// the fitter must reproduce plain full-support EM.
    #[test]
    fn test_full_truncation_matches_plain_em() {
        let n = 80;
        let d = 3;
        let c = 3;
        let v0 = 2.0;
        let reg = 1e-3;
        let iters = 3;
        let data = two_cluster_data(n, d, 13);
        let means0 = Array2::from_shape_fn((c, d), |(k, j)| data[[k * 10, j]]);

        let config = ModelConfig {
            components: c,
            covariance: CovarianceKind::Isotropic,
            reg_covar: reg,
            mean_init: MeanInit::Given(means0.clone()),
            prior_init: PriorInit::Flat,
            variance_init: VarianceInit::Given(Array1::from_elem(d, v0)),
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            eps: 1e-300,
            limit: Some(iters),
            truncation: c,
            refresh_period: 1,
            ..FitConfig::default()
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut model = init::initialize(data.view(), &config, &mut rng).unwrap();
        fit(&mut model, data.view(), &fit_config).unwrap();

        // Hand-rolled full-support soft EM with the same updates.
        let mut priors = vec![1.0 / c as f64; c];
        let mut means = means0;
        let mut vars = vec![v0; c];
        for _ in 0..iters {
            let mut resp = Array2::zeros((n, c));
            for i in 0..n {
                let mut logs = vec![0.0; c];
                for k in 0..c {
                    let mut sq = 0.0;
                    for j in 0..d {
                        let r = data[[i, j]] - means[[k, j]];
                        sq += r * r;
                    }
                    logs[k] = priors[k].ln()
                        - 0.5
                            * (d as f64 * (2.0 * std::f64::consts::PI).ln()
                                + d as f64 * vars[k].ln()
                                + sq / vars[k]);
                }
                let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let lse = max + logs.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
                for k in 0..c {
                    resp[[i, k]] = (logs[k] - lse).exp();
                }
            }
            let mut total = 0.0;
            let mut masses = vec![0.0; c];
            for k in 0..c {
                let mass: f64 = (0..n).map(|i| resp[[i, k]]).sum();
                masses[k] = mass;
                total += mass;
                for j in 0..d {
                    let s: f64 = (0..n).map(|i| resp[[i, k]] * data[[i, j]]).sum();
                    means[[k, j]] = s / mass;
                }
                let mut sq = 0.0;
                for i in 0..n {
                    for j in 0..d {
                        let r = data[[i, j]] - means[[k, j]];
                        sq += resp[[i, k]] * r * r;
                    }
                }
                vars[k] = sq / (mass * d as f64) + reg;
            }
            for k in 0..c {
                priors[k] = masses[k] / total;
            }
        }

        for k in 0..c {
            assert!((model.priors()[k] - priors[k]).abs() < 1e-8);
            assert!(
                (model.covariance(k).isotropic_variance().unwrap() - vars[k]).abs() < 1e-8
            );
            for j in 0..d {
                assert!((model.means()[[k, j]] - means[[k, j]]).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_full_truncation_matches_plain_em_diagonal() {
        let n = 60;
        let d = 2;
        let c = 2;
        let v0 = 1.5;
        let reg = 1e-3;
        let iters = 4;
        let data = two_cluster_data(n, d, 41);
        let means0 = Array2::from_shape_fn((c, d), |(k, j)| data[[k + 1, j]]);

        let config = ModelConfig {
            components: c,
            covariance: CovarianceKind::Diagonal,
            reg_covar: reg,
            mean_init: MeanInit::Given(means0.clone()),
            prior_init: PriorInit::Flat,
            variance_init: VarianceInit::Given(Array1::from_elem(d, v0)),
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            eps: 1e-300,
            limit: Some(iters),
            truncation: c,
            refresh_period: 1,
            ..FitConfig::default()
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut model = init::initialize(data.view(), &config, &mut rng).unwrap();
        fit(&mut model, data.view(), &fit_config).unwrap();

        let mut priors = vec![1.0 / c as f64; c];
        let mut means = means0;
        let mut vars = Array2::from_elem((c, d), v0);
        for _ in 0..iters {
            let mut resp = Array2::zeros((n, c));
            for i in 0..n {
                let mut logs = vec![0.0; c];
                for k in 0..c {
                    let mut maha = 0.0;
                    let mut log_det = 0.0;
                    for j in 0..d {
                        let r = data[[i, j]] - means[[k, j]];
                        maha += r * r / vars[[k, j]];
                        log_det += vars[[k, j]].ln();
                    }
                    logs[k] = priors[k].ln()
                        - 0.5
                            * (d as f64 * (2.0 * std::f64::consts::PI).ln() + log_det + maha);
                }
                let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let lse = max + logs.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
                for k in 0..c {
                    resp[[i, k]] = (logs[k] - lse).exp();
                }
            }
            let mut total = 0.0;
            let mut masses = vec![0.0; c];
            for k in 0..c {
                let mass: f64 = (0..n).map(|i| resp[[i, k]]).sum();
                masses[k] = mass;
                total += mass;
                for j in 0..d {
                    let s: f64 = (0..n).map(|i| resp[[i, k]] * data[[i, j]]).sum();
                    means[[k, j]] = s / mass;
                }
                for j in 0..d {
                    let sq: f64 = (0..n)
                        .map(|i| {
                            let r = data[[i, j]] - means[[k, j]];
                            resp[[i, k]] * r * r
                        })
                        .sum();
                    vars[[k, j]] = sq / mass + reg;
                }
            }
            for k in 0..c {
                priors[k] = masses[k] / total;
            }
        }

        for k in 0..c {
            assert!((model.priors()[k] - priors[k]).abs() < 1e-8);
            let dense = model.covariance(k).dense(d);
            for j in 0..d {
                assert!((model.means()[[k, j]] - means[[k, j]]).abs() < 1e-8);
                assert!((dense[[j, j]] - vars[[k, j]]).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_full_truncation_matches_plain_em_full_covariance() {
        let n = 60;
        let d = 2;
        let c = 2;
        let v0 = 1.5;
        let reg = 1e-3;
        let iters = 3;
        let data = two_cluster_data(n, d, 47);
        let means0 = Array2::from_shape_fn((c, d), |(k, j)| data[[k + 2, j]]);

        let config = ModelConfig {
            components: c,
            covariance: CovarianceKind::Full,
            reg_covar: reg,
            mean_init: MeanInit::Given(means0.clone()),
            prior_init: PriorInit::Flat,
            variance_init: VarianceInit::Given(Array1::from_elem(d, v0)),
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            eps: 1e-300,
            limit: Some(iters),
            truncation: c,
            refresh_period: 1,
            ..FitConfig::default()
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut model = init::initialize(data.view(), &config, &mut rng).unwrap();
        fit(&mut model, data.view(), &fit_config).unwrap();

        // Reference full-support EM with explicit 2x2 covariance algebra.
        let mut priors = vec![1.0 / c as f64; c];
        let mut means = means0;
        let mut sigmas = vec![[[v0, 0.0], [0.0, v0]]; c];
        for _ in 0..iters {
            let mut resp = Array2::zeros((n, c));
            for i in 0..n {
                let mut logs = vec![0.0; c];
                for k in 0..c {
                    let [[a, b], [_, cc]] = sigmas[k];
                    let det = a * cc - b * b;
                    let r0 = data[[i, 0]] - means[[k, 0]];
                    let r1 = data[[i, 1]] - means[[k, 1]];
                    let maha = (r0 * r0 * cc - 2.0 * r0 * r1 * b + r1 * r1 * a) / det;
                    logs[k] = priors[k].ln()
                        - 0.5
                            * (d as f64 * (2.0 * std::f64::consts::PI).ln()
                                + det.ln()
                                + maha);
                }
                let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let lse = max + logs.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
                for k in 0..c {
                    resp[[i, k]] = (logs[k] - lse).exp();
                }
            }
            let mut total = 0.0;
            let mut masses = vec![0.0; c];
            for k in 0..c {
                let mass: f64 = (0..n).map(|i| resp[[i, k]]).sum();
                masses[k] = mass;
                total += mass;
                for j in 0..d {
                    let s: f64 = (0..n).map(|i| resp[[i, k]] * data[[i, j]]).sum();
                    means[[k, j]] = s / mass;
                }
                let mut scatter = [[0.0; 2]; 2];
                for i in 0..n {
                    let r0 = data[[i, 0]] - means[[k, 0]];
                    let r1 = data[[i, 1]] - means[[k, 1]];
                    scatter[0][0] += resp[[i, k]] * r0 * r0;
                    scatter[0][1] += resp[[i, k]] * r0 * r1;
                    scatter[1][1] += resp[[i, k]] * r1 * r1;
                }
                sigmas[k] = [
                    [scatter[0][0] / mass + reg, scatter[0][1] / mass],
                    [scatter[0][1] / mass, scatter[1][1] / mass + reg],
                ];
            }
            for k in 0..c {
                priors[k] = masses[k] / total;
            }
        }

        for k in 0..c {
            assert!((model.priors()[k] - priors[k]).abs() < 1e-8);
            let dense = model.covariance(k).dense(d);
            for i in 0..d {
                assert!((model.means()[[k, i]] - means[[k, i]]).abs() < 1e-8);
                for j in 0..d {
                    assert!(
                        (dense[[i, j]] - sigmas[k][i][j]).abs() < 1e-8,
                        "sigma[{}][{},{}]: {} vs {}",
                        k,
                        i,
                        j,
                        dense[[i, j]],
                        sigmas[k][i][j]
                    );
                }
            }
        }
    }

    /// With the truncation width equal to C every candidate set holds every
    /// active component, so full-support responsibilities are computed each
    /// iteration regardless of the refresh period.
    #[test]
    fn test_full_truncation_ignores_refresh_period_factor() {
        let data = two_cluster_data(150, 3, 53);
        let config = ModelConfig {
            components: 2,
            covariance: CovarianceKind::Factor,
            factor_dim: 1,
            ..ModelConfig::default()
        };
        let base = FitConfig {
            eps: 1e-300,
            limit: Some(6),
            truncation: 2,
            seed: 9,
            ..FitConfig::default()
        };
        let every = FitConfig {
            refresh_period: 1,
            ..base.clone()
        };
        let rare = FitConfig {
            refresh_period: 5,
            ..base
        };
        let (a, ra) = fit_model(data.view(), &config, &every).unwrap();
        let (b, rb) = fit_model(data.view(), &config, &rare).unwrap();

        for (x, y) in a.means().iter().zip(b.means().iter()) {
            assert!((x - y).abs() < 1e-8, "{} vs {}", x, y);
        }
        for (x, y) in a.priors().iter().zip(b.priors().iter()) {
            assert!((x - y).abs() < 1e-8);
        }
        assert_eq!(ra.free_energy_trace.len(), rb.free_energy_trace.len());
        for (x, y) in ra
            .free_energy_trace
            .iter()
            .zip(rb.free_energy_trace.iter())
        {
            assert!((x - y).abs() < 1e-6 * x.abs().max(1.0));
        }
    }

    #[test]
    fn test_starved_components_are_deactivated() {
        let data = two_cluster_data(60, 2, 17);
        // Two means on the clusters, two far outside any data support.
        let means0 = ndarray::arr2(&[[0.0, 0.0], [8.0, 8.0], [1e3, 1e3], [-1e3, -1e3]]);
        let config = ModelConfig {
            components: 4,
            covariance: CovarianceKind::Isotropic,
            mean_init: MeanInit::Given(means0),
            variance_init: VarianceInit::Given(arr1(&[1.0, 1.0])),
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            limit: Some(4),
            truncation: 4,
            refresh_period: 1,
            ..FitConfig::default()
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut model = init::initialize(data.view(), &config, &mut rng).unwrap();
        fit(&mut model, data.view(), &fit_config).unwrap();

        assert!(model.is_active(0));
        assert!(model.is_active(1));
        assert!(!model.is_active(2));
        assert!(!model.is_active(3));
        assert!((model.priors().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cancellation_before_first_iteration() {
        let data = two_cluster_data(40, 3, 19);
        let config = isotropic_config(3);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut model = init::initialize(data.view(), &config, &mut rng).unwrap();

        let cancel = AtomicBool::new(true);
        let report =
            fit_with_cancel(&mut model, data.view(), &FitConfig::default(), Some(&cancel))
                .unwrap();
        assert_eq!(report.status, FitStatus::Stopped);
        assert_eq!(report.iterations, 0);
        assert!(report.free_energy_trace.is_empty());
    }

    #[test]
    fn test_iteration_limit_status() {
        let data = two_cluster_data(50, 3, 23);
        let fit_config = FitConfig {
            eps: 1e-300,
            limit: Some(2),
            ..FitConfig::default()
        };
        let (_, report) = fit_model(data.view(), &isotropic_config(3), &fit_config).unwrap();
        assert_eq!(report.status, FitStatus::IterationLimit);
        assert_eq!(report.iterations, 2);
    }

    #[test]
    fn test_converges_on_separated_clusters() {
        let data = two_cluster_data(200, 4, 29);
        let fit_config = FitConfig {
            eps: 1e-6,
            limit: Some(200),
            truncation: 2,
            ..FitConfig::default()
        };
        let (model, report) =
            fit_model(data.view(), &isotropic_config(2), &fit_config).unwrap();
        assert!(report.converged());
        assert!(report.free_energy.is_finite());

        // The two means must land near the cluster centers, in either order.
        let m0 = model.means().row(0).sum() / 4.0;
        let m1 = model.means().row(1).sum() / 4.0;
        let (lo, hi) = if m0 < m1 { (m0, m1) } else { (m1, m0) };
        assert!((lo - 0.0).abs() < 0.5, "low mean at {}", lo);
        assert!((hi - 8.0).abs() < 0.5, "high mean at {}", hi);
    }

    #[test]
    fn test_pretrainer_smoke() {
        let data = two_cluster_data(300, 4, 31);
        let config = ModelConfig {
            components: 4,
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            limit: Some(20),
            use_pretrainer: true,
            ..FitConfig::default()
        };
        let (model, report) = fit_model(data.view(), &config, &fit_config).unwrap();
        assert!(report.free_energy.is_finite());
        assert!(!model.active_components().is_empty());
    }

    #[test]
    fn test_empty_input_rejected() {
        let data = Array2::<f64>::zeros((0, 4));
        let err = fit_model(data.view(), &isotropic_config(2), &FitConfig::default())
            .unwrap_err();
        assert!(matches!(err, GmmError::EmptyInput));
    }

    #[test]
    fn test_shared_covariance_fit() {
        let data = two_cluster_data(120, 3, 37);
        let config = ModelConfig {
            components: 3,
            covariance: CovarianceKind::Diagonal,
            shared: true,
            ..ModelConfig::default()
        };
        let fit_config = FitConfig {
            limit: Some(15),
            ..FitConfig::default()
        };
        let (model, report) = fit_model(data.view(), &config, &fit_config).unwrap();
        assert_eq!(model.num_cov_slots(), 1);
        assert!(report.free_energy.is_finite());
    }
}
