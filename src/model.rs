//! Mixture model parameter container.
//!
//! Owns priors, means, and the covariance objects for one fit. In shared
//! mode there is exactly one covariance slot and every component maps to it
//! through [`MixtureModel::cov_slot`]; this is an aliasing relationship by
//! index, never a per-component copy that could drift.

use ndarray::{Array1, Array2, ArrayView1};

use crate::covariance::Covariance;
use crate::error::{GmmError, Result};
use crate::float_trait::GmmFloat;

/// A fitted or in-progress Gaussian mixture over patch vectors.
#[derive(Debug, Clone)]
pub struct MixtureModel<F: GmmFloat> {
    dim: usize,
    priors: Array1<F>,
    means: Array2<F>,
    covariances: Vec<Covariance<F>>,
    shared: bool,
    active: Vec<bool>,
    reg: F,
}

impl<F: GmmFloat> MixtureModel<F> {
    /// Assemble a model from its parameter groups.
    ///
    /// `covariances` must hold one object per component, or exactly one when
    /// `shared` is true.
    pub fn new(
        priors: Array1<F>,
        means: Array2<F>,
        covariances: Vec<Covariance<F>>,
        shared: bool,
    ) -> Result<Self> {
        let (c, dim) = means.dim();
        if priors.len() != c {
            return Err(GmmError::DimensionMismatch {
                expected: c,
                actual: priors.len(),
            });
        }
        let expected_slots = if shared { 1 } else { c };
        if covariances.len() != expected_slots {
            return Err(GmmError::DimensionMismatch {
                expected: expected_slots,
                actual: covariances.len(),
            });
        }
        let total = priors.sum();
        if !(total > F::zero()) {
            return Err(GmmError::NumericalInstability {
                component: None,
                message: "priors must have positive mass".into(),
            });
        }
        let priors = priors.mapv(|p| p / total);
        Ok(Self {
            dim,
            priors,
            means,
            covariances,
            shared,
            active: vec![true; c],
            reg: F::zero(),
        })
    }

    /// Diagonal regularization added to every covariance update during
    /// fitting. Zero for externally assembled models unless set.
    pub fn regularization(&self) -> F {
        self.reg
    }

    /// Set the covariance regularization carried through fitting.
    pub fn set_regularization(&mut self, reg: F) {
        self.reg = reg;
    }

    /// Number of mixture components C.
    pub fn num_components(&self) -> usize {
        self.means.nrows()
    }

    /// Patch dimensionality D.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Whether all components alias one covariance object.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Component priors.
    pub fn priors(&self) -> &Array1<F> {
        &self.priors
    }

    /// Component means, one row per component.
    pub fn means(&self) -> &Array2<F> {
        &self.means
    }

    /// Index of the covariance slot backing component `k`.
    pub fn cov_slot(&self, k: usize) -> usize {
        if self.shared {
            0
        } else {
            k
        }
    }

    /// Number of distinct covariance slots (1 in shared mode, C otherwise).
    pub fn num_cov_slots(&self) -> usize {
        self.covariances.len()
    }

    /// Covariance object backing component `k`.
    pub fn covariance(&self, k: usize) -> &Covariance<F> {
        &self.covariances[self.cov_slot(k)]
    }

    /// Whether component `k` still participates in the fit.
    pub fn is_active(&self, k: usize) -> bool {
        self.active[k]
    }

    /// Indices of all active components.
    pub fn active_components(&self) -> Vec<usize> {
        (0..self.num_components())
            .filter(|&k| self.active[k])
            .collect()
    }

    /// Unnormalized log-posterior of component `k` at `x`:
    /// log(pi_k) + log N(x | mu_k, Sigma_k). Deactivated components score
    /// negative infinity.
    pub fn log_joint(&self, k: usize, x: ArrayView1<F>) -> F {
        if !self.active[k] {
            return F::neg_infinity();
        }
        self.priors[k].ln() + self.covariance(k).log_density(x, self.means.row(k))
    }

    /// Component log-density without the prior term.
    pub fn log_density(&self, k: usize, x: ArrayView1<F>) -> F {
        if !self.active[k] {
            return F::neg_infinity();
        }
        self.covariance(k).log_density(x, self.means.row(k))
    }

    /// Remove component `k` from the fit: zero its prior and renormalize
    /// the remaining mass.
    pub(crate) fn deactivate(&mut self, k: usize) {
        self.active[k] = false;
        self.priors[k] = F::zero();
        let total = self.priors.sum();
        if total > F::zero() {
            self.priors.mapv_inplace(|p| p / total);
        }
    }

    pub(crate) fn set_prior(&mut self, k: usize, value: F) {
        self.priors[k] = value;
    }

    pub(crate) fn set_mean(&mut self, k: usize, value: ArrayView1<F>) {
        self.means.row_mut(k).assign(&value);
    }

    pub(crate) fn covariance_slot_mut(&mut self, slot: usize) -> &mut Covariance<F> {
        &mut self.covariances[slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn toy_model(shared: bool) -> MixtureModel<f64> {
        let c = 3;
        let d = 2;
        let priors = Array1::from_elem(c, 1.0 / c as f64);
        let means = Array2::from_shape_fn((c, d), |(k, j)| (k * d + j) as f64);
        let slots = if shared { 1 } else { c };
        let covariances = (0..slots)
            .map(|_| Covariance::isotropic(d, 1.0).unwrap())
            .collect();
        MixtureModel::new(priors, means, covariances, shared).unwrap()
    }

    #[test]
    fn test_shared_mode_single_slot_aliasing() {
        let model = toy_model(true);
        assert_eq!(model.num_cov_slots(), 1);
        for k in 0..model.num_components() {
            assert_eq!(model.cov_slot(k), 0);
        }
    }

    #[test]
    fn test_per_component_mode_distinct_slots() {
        let model = toy_model(false);
        assert_eq!(model.num_cov_slots(), 3);
        let slots: Vec<usize> = (0..3).map(|k| model.cov_slot(k)).collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn test_slot_count_mismatch_rejected() {
        let priors = arr1(&[0.5, 0.5]);
        let means = Array2::zeros((2, 2));
        let covariances = vec![Covariance::isotropic(2, 1.0).unwrap()];
        assert!(MixtureModel::new(priors, means, covariances, false).is_err());
    }

    #[test]
    fn test_priors_normalized_on_construction() {
        let priors = arr1(&[2.0f64, 2.0]);
        let means = Array2::zeros((2, 2));
        let covariances = vec![
            Covariance::isotropic(2, 1.0).unwrap(),
            Covariance::isotropic(2, 1.0).unwrap(),
        ];
        let model = MixtureModel::new(priors, means, covariances, false).unwrap();
        assert!((model.priors()[0] - 0.5).abs() < 1e-12);
        assert!((model.priors().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_deactivation_renormalizes_and_scores_neg_inf() {
        let mut model = toy_model(false);
        model.deactivate(1);
        assert!(!model.is_active(1));
        assert_eq!(model.active_components(), vec![0, 2]);
        assert!((model.priors().sum() - 1.0).abs() < 1e-12);
        assert_eq!(model.priors()[1], 0.0);

        let x = arr1(&[0.0, 0.0]);
        assert!(model.log_joint(1, x.view()).is_infinite());
        assert!(model.log_joint(0, x.view()).is_finite());
    }
}
