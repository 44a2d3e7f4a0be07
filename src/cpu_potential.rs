use std::sync::Arc;

use crate::cpu_state::{State, StatePool};
use crate::mass_matrix::MassMatrix;
use crate::math::all_finite;
use crate::nuts::{Collector, Direction, DivergenceInfo, Hamiltonian, LogpError, NutsError};

/// The log density of the posterior in unconstrained space.
pub trait CpuLogpFunc {
    type LogpError: LogpError + 'static;

    /// Compute the log density at `position` and write its gradient into `grad`.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;
    fn dim(&self) -> usize;
}

pub(crate) struct EuclideanPotential<F: CpuLogpFunc, M: MassMatrix> {
    logp: F,
    pub(crate) mass_matrix: M,
    max_energy_error: f64,
    pub(crate) step_size: f64,
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanPotential<F, M> {
    pub(crate) fn new(logp: F, mass_matrix: M, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanPotential {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }
}

/// Why the density could not be evaluated at a point.
enum EvalError<E> {
    Logp(E),
    NotFinite,
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanPotential<F, M> {
    fn update_potential_gradient(
        &mut self,
        state: &mut State,
    ) -> Result<(), EvalError<F::LogpError>> {
        let inner = state
            .try_mut_inner()
            .expect("Leapfrog output should have only one reference");
        let logp = self
            .logp
            .logp(&inner.q, &mut inner.grad)
            .map_err(EvalError::Logp)?;
        inner.potential_energy = -logp;
        if !logp.is_finite() || !all_finite(&inner.grad) {
            return Err(EvalError::NotFinite);
        }
        Ok(())
    }

    fn update_velocity(&self, state: &mut State) {
        self.mass_matrix
            .update_velocity(state.try_mut_inner().expect("State already in use"))
    }

    fn update_kinetic_energy(&self, state: &mut State) {
        self.mass_matrix
            .update_kinetic_energy(state.try_mut_inner().expect("State already in use"))
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> Hamiltonian for EuclideanPotential<F, M> {
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<Result<State, DivergenceInfo>, NutsError> {
        let mut out = pool.new_state();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.update_velocity(&mut out);

        start.position_step(&mut out, epsilon);
        if let Err(error) = self.update_potential_gradient(&mut out) {
            let logp_function_error = match error {
                EvalError::Logp(logp_error) => {
                    if !logp_error.is_recoverable() {
                        return Err(NutsError::LogpFailure(Box::new(logp_error)));
                    }
                    let err: Arc<dyn std::error::Error + Send + Sync> = Arc::new(logp_error);
                    Some(err)
                }
                EvalError::NotFinite => None,
            };
            let info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                energy_error: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: None,
                logp_function_error,
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        out.second_momentum_halfstep(epsilon);

        self.update_velocity(&mut out);
        self.update_kinetic_energy(&mut out);

        out.try_mut_inner()
            .expect("Leapfrog output should have only one reference")
            .idx_in_trajectory = start.index_in_trajectory() + sign;

        start.set_psum(&mut out, dir);

        let energy_error = out.energy() - initial_energy;
        if (energy_error.abs() > self.max_energy_error) | !energy_error.is_finite() {
            let info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                energy_error: Some(energy_error),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                logp_function_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        collector.register_leapfrog(start, &out, None);

        Ok(Ok(out))
    }

    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State, NutsError> {
        if init.len() != self.dim() {
            return Err(NutsError::InvalidInitPoint(format!(
                "expected {} values, got {}",
                self.dim(),
                init.len()
            )));
        }
        let mut state = pool.new_state();
        {
            let inner = state
                .try_mut_inner()
                .expect("New state should have only one reference");
            inner.q.copy_from_slice(init);
            inner.p.fill(0.);
            inner.p_sum.fill(0.);
            inner.idx_in_trajectory = 0;
        }
        match self.update_potential_gradient(&mut state) {
            Ok(()) => {}
            Err(EvalError::Logp(err)) if err.is_recoverable() => {
                return Err(NutsError::InvalidInitPoint(err.to_string()));
            }
            Err(EvalError::Logp(err)) => return Err(NutsError::LogpFailure(Box::new(err))),
            Err(EvalError::NotFinite) => {
                return Err(NutsError::InvalidInitPoint(
                    "logp or its gradient is not finite".to_string(),
                ));
            }
        }
        self.update_velocity(&mut state);
        self.update_kinetic_energy(&mut state);
        Ok(state)
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let inner = state
            .try_mut_inner()
            .expect("State should have only one reference");
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
    }

    fn dim(&self) -> usize {
        self.logp.dim()
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }
}
