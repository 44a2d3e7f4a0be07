use faer::{
    linalg::{matmul::matmul, triangular_solve::solve_upper_triangular_in_place},
    Accum, ColMut, ColRef, Mat, MatRef, Par, Side,
};
use itertools::izip;
use multiversion::multiversion;
use rand_distr::StandardNormal;

use crate::{
    cpu_state::InnerState,
    mass_matrix_adapt::{
        MassMatrixAdaptOptions, MassMatrixEstimator, RunningCovariance, RunningVariance,
    },
    math::{multiply, vector_dot},
};

const LOWER_LIMIT: f64 = 1e-10f64;
const UPPER_LIMIT: f64 = 1e10f64;

/// The adapted inverse mass matrix (the posterior covariance estimate).
#[derive(Debug, Clone, PartialEq)]
pub enum InverseMassMatrix {
    /// Diagonal entries.
    Diag(Box<[f64]>),
    /// Row-major `dim x dim` matrix.
    Dense { dim: usize, values: Box<[f64]> },
}

impl InverseMassMatrix {
    pub fn dim(&self) -> usize {
        match self {
            InverseMassMatrix::Diag(diag) => diag.len(),
            InverseMassMatrix::Dense { dim, .. } => *dim,
        }
    }

    /// The diagonal, for either representation.
    pub fn diagonal(&self) -> Box<[f64]> {
        match self {
            InverseMassMatrix::Diag(diag) => diag.clone(),
            InverseMassMatrix::Dense { dim, values } => {
                (0..*dim).map(|i| values[i * dim + i]).collect()
            }
        }
    }
}

/// The kinetic energy of a euclidean hamiltonian.
///
/// `variance` style quantities are the inverse mass matrix, so that the
/// velocity is `v = M⁻¹ p` and momenta are drawn from `N(0, M)`.
pub(crate) trait MassMatrix: Send {
    type Estimator: MassMatrixEstimator;

    fn update_velocity(&self, state: &mut InnerState);
    fn update_kinetic_energy(&self, state: &mut InnerState);
    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R);

    fn new_estimator(&self, dim: usize) -> Self::Estimator;

    /// Replace the metric by the regularized estimate.
    ///
    /// Returns false and keeps the current metric if the estimator does
    /// not have enough draws or the estimate is unusable.
    fn update_from_estimator(
        &mut self,
        estimator: &Self::Estimator,
        options: &MassMatrixAdaptOptions,
    ) -> bool;

    fn inverse_mass_matrix(&self) -> InverseMassMatrix;

    /// Go back to the identity metric.
    fn reset(&mut self);
}

#[derive(Debug)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    /// The identity mass matrix.
    pub(crate) fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub(crate) fn update_diag(&mut self, new_variance: &[f64]) {
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn update_diag(variance_out: &mut [f64], inv_std_out: &mut [f64], new_variance: &[f64]) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, &x)| {
        let x = x.clamp(LOWER_LIMIT, UPPER_LIMIT);
        *var = x;
        *inv_std = x.sqrt().recip();
    });
}

impl MassMatrix for DiagMassMatrix {
    type Estimator = RunningVariance;

    fn update_velocity(&self, state: &mut InnerState) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    fn new_estimator(&self, dim: usize) -> RunningVariance {
        RunningVariance::new(dim)
    }

    fn update_from_estimator(
        &mut self,
        estimator: &RunningVariance,
        options: &MassMatrixAdaptOptions,
    ) -> bool {
        let Some(variance) = estimator.current(options) else {
            return false;
        };
        if !variance.iter().all(|x| x.is_finite()) {
            log::warn!("Ignoring non-finite mass matrix estimate");
            return false;
        }
        self.update_diag(&variance);
        true
    }

    fn inverse_mass_matrix(&self) -> InverseMassMatrix {
        InverseMassMatrix::Diag(self.variance.clone())
    }

    fn reset(&mut self) {
        self.variance.fill(1.);
        self.inv_stds.fill(1.);
    }
}

/// A dense metric `M⁻¹ = Σ` with `Σ = L Lᵀ`.
///
/// Each leapfrog step costs a matrix vector product, so this should only
/// be used for posteriors of modest dimension.
#[derive(Debug)]
pub(crate) struct DenseMassMatrix {
    dim: usize,
    /// Inverse mass matrix
    covariance: Mat<f64>,
    /// Lower cholesky factor of `covariance`
    chol: Mat<f64>,
}

impl DenseMassMatrix {
    /// The identity mass matrix.
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            dim,
            covariance: Mat::identity(dim, dim),
            chol: Mat::identity(dim, dim),
        }
    }

    /// Set the covariance and recompute its cholesky factor.
    ///
    /// Leaves the metric unchanged and returns false if the matrix is not
    /// positive definite.
    pub(crate) fn update_covariance(&mut self, covariance: &Mat<f64>) -> bool {
        assert!(covariance.nrows() == self.dim);
        assert!(covariance.ncols() == self.dim);

        if !mat_all_finite(&covariance.as_ref()) {
            log::warn!("Ignoring non-finite mass matrix estimate");
            return false;
        }
        let llt = match covariance.llt(Side::Lower) {
            Ok(llt) => llt,
            Err(_) => {
                log::warn!("Mass matrix estimate is not positive definite, keeping previous metric");
                return false;
            }
        };
        let chol = llt.L().to_owned();
        if !mat_all_finite(&chol.as_ref()) {
            log::warn!("Ignoring non-finite cholesky factor of the mass matrix");
            return false;
        }
        self.covariance = covariance.clone();
        self.chol = chol;
        true
    }
}

fn mat_all_finite(mat: &MatRef<f64>) -> bool {
    let mut ok = true;
    faer::zip!(mat).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

impl MassMatrix for DenseMassMatrix {
    type Estimator = RunningCovariance;

    fn update_velocity(&self, state: &mut InnerState) {
        matmul(
            ColMut::from_slice_mut(&mut state.v[..]).as_mat_mut(),
            Accum::Replace,
            self.covariance.as_ref(),
            ColRef::from_slice(&state.p[..]).as_mat(),
            1f64,
            Par::Seq,
        );
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        // p = L⁻ᵀ z has covariance (L Lᵀ)⁻¹ = M
        state.p.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
        solve_upper_triangular_in_place(
            self.chol.transpose(),
            ColMut::from_slice_mut(&mut state.p[..]).as_mat_mut(),
            Par::Seq,
        );
    }

    fn new_estimator(&self, dim: usize) -> RunningCovariance {
        RunningCovariance::new(dim)
    }

    fn update_from_estimator(
        &mut self,
        estimator: &RunningCovariance,
        options: &MassMatrixAdaptOptions,
    ) -> bool {
        match estimator.current(options) {
            Some(covariance) => self.update_covariance(&covariance),
            None => false,
        }
    }

    fn inverse_mass_matrix(&self) -> InverseMassMatrix {
        let n = self.dim;
        InverseMassMatrix::Dense {
            dim: n,
            values: (0..n * n)
                .map(|idx| self.covariance[(idx / n, idx % n)])
                .collect(),
        }
    }

    fn reset(&mut self) {
        *self = DenseMassMatrix::new(self.dim);
    }
}
