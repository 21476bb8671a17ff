//! Dense symmetric linear algebra primitives on ndarray storage.
//!
//! The covariance backends only ever need structure-specific solves:
//! Cholesky factorization/solve for dense SPD matrices (Full backend and the
//! Woodbury core of the Factor backend) and a Jacobi eigensolver for
//! positive-definiteness checks. Everything operates on `Array2`/`Array1`
//! directly; no LAPACK binding is involved.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::float_trait::GmmFloat;

/// Default number of Jacobi sweeps; cyclic Jacobi on well-conditioned
/// covariance-sized matrices converges far earlier.
const JACOBI_MAX_SWEEPS: usize = 50;

/// Compute the lower Cholesky factor L with A = L * L^T.
///
/// Returns None when a pivot is not strictly positive, i.e. the matrix is
/// not positive definite within floating-point accuracy. The input is read
/// as its lower triangle; strict symmetry of the upper triangle is not
/// required.
pub fn cholesky_lower<F: GmmFloat>(a: ArrayView2<F>) -> Option<Array2<F>> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    let mut l = Array2::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= F::zero() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Log-determinant of A from its lower Cholesky factor: 2 * sum(ln L_ii).
pub fn cholesky_log_det<F: GmmFloat>(l: &Array2<F>) -> F {
    let two = F::from_f64_c(2.0);
    (0..l.nrows()).map(|i| l[[i, i]].ln()).sum::<F>() * two
}

/// Solve L * y = b by forward substitution.
pub fn forward_substitute<F: GmmFloat>(l: &Array2<F>, b: ArrayView1<F>) -> Array1<F> {
    let n = l.nrows();
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }
    y
}

/// Solve L^T * x = y by backward substitution.
pub fn backward_substitute<F: GmmFloat>(l: &Array2<F>, y: ArrayView1<F>) -> Array1<F> {
    let n = l.nrows();
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solve A * x = b given the lower Cholesky factor of A.
pub fn cholesky_solve<F: GmmFloat>(l: &Array2<F>, b: ArrayView1<F>) -> Array1<F> {
    let y = forward_substitute(l, b);
    backward_substitute(l, y.view())
}

/// Eigenvalues of a symmetric matrix by cyclic Jacobi rotations,
/// returned in ascending order.
///
/// Used for positive-definiteness verification of materialized or implied
/// covariances; accuracy well below covariance regularization scales.
pub fn symmetric_eigenvalues<F: GmmFloat>(a: ArrayView2<F>) -> Array1<F> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    let mut m = a.to_owned();
    let tiny = F::from_f64_c(1e-300);

    for _ in 0..JACOBI_MAX_SWEEPS {
        // Off-diagonal Frobenius mass decides convergence.
        let mut off = F::zero();
        for p in 0..n {
            for q in (p + 1)..n {
                off += m[[p, q]] * m[[p, q]];
            }
        }
        let scale = (0..n).map(|i| m[[i, i]].abs()).sum::<F>().max(F::one());
        if off.sqrt() <= F::epsilon() * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if apq.abs() <= tiny {
                    continue;
                }
                let app = m[[p, p]];
                let aqq = m[[q, q]];
                let tau = (aqq - app) / (F::from_f64_c(2.0) * apq);
                let t = if tau >= F::zero() {
                    F::one() / (tau + (F::one() + tau * tau).sqrt())
                } else {
                    -F::one() / (-tau + (F::one() + tau * tau).sqrt())
                };
                let c = F::one() / (F::one() + t * t).sqrt();
                let s = t * c;

                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
            }
        }
    }

    let mut eigs: Vec<F> = (0..n).map(|i| m[[i, i]]).collect();
    eigs.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    Array1::from(eigs)
}
