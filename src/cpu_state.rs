use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};
use crate::nuts::Direction;

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerState>>>,
}

impl StateStorage {
    fn with_capacity(capacity: usize) -> StateStorage {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }
}

impl ReuseState for StateStorage {
    fn reuse_state(&self, state: Rc<InnerState>) {
        self.free_states.borrow_mut().push(state)
    }
}

/// Hands out phase space states of a fixed dimension.
///
/// States that are no longer referenced go back into the pool, so that
/// building a trajectory does not allocate once the pool is warm.
pub(crate) struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub(crate) fn new(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage::with_capacity(capacity)),
            dim,
        }
    }

    pub(crate) fn new_state(&mut self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => {
                if self.dim != inner.q.len() {
                    panic!("dim mismatch");
                }
                inner
            }
            None => {
                let owner: Rc<dyn ReuseState> = self.storage.clone();
                Rc::new(InnerState::new(self.dim, &owner))
            }
        };
        State {
            inner: std::mem::ManuallyDrop::new(inner),
        }
    }

    #[cfg(test)]
    fn num_free(&self) -> usize {
        self.storage.free_states.borrow().len()
    }
}

trait ReuseState {
    fn reuse_state(&self, state: Rc<InnerState>);
}

pub(crate) struct InnerState {
    pub(crate) p: Box<[f64]>,
    pub(crate) q: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
    reuser: Weak<dyn ReuseState>,
}

impl std::fmt::Debug for InnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerState")
            .field("q", &self.q)
            .field("p", &self.p)
            .field("idx_in_trajectory", &self.idx_in_trajectory)
            .field("kinetic_energy", &self.kinetic_energy)
            .field("potential_energy", &self.potential_energy)
            .finish()
    }
}

impl InnerState {
    fn new(size: usize, owner: &Rc<dyn ReuseState>) -> InnerState {
        InnerState {
            p: vec![0.; size].into(),
            q: vec![0.; size].into(),
            v: vec![0.; size].into(),
            p_sum: vec![0.; size].into(),
            grad: vec![0.; size].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
            reuser: Rc::downgrade(owner),
        }
    }
}

/// A point in phase space together with its place in the current trajectory.
///
/// Cloning a state is cheap and shares the underlying buffers. States are
/// only ever written through `try_mut_inner`, which fails while the buffers
/// are shared, so a state that is part of a trajectory can not change.
#[derive(Debug)]
pub(crate) struct State {
    inner: std::mem::ManuallyDrop<Rc<InnerState>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

#[derive(Debug)]
pub(crate) struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(val),
            None => Err(StateInUse {}),
        }
    }

    /// Copy all values into a fresh state that does not share buffers.
    pub(crate) fn deep_clone(&self, pool: &mut StatePool) -> State {
        let mut out = pool.new_state();
        let inner = out
            .try_mut_inner()
            .expect("New state should have only one reference");
        inner.p.copy_from_slice(&self.p);
        inner.q.copy_from_slice(&self.q);
        inner.v.copy_from_slice(&self.v);
        inner.p_sum.copy_from_slice(&self.p_sum);
        inner.grad.copy_from_slice(&self.grad);
        inner.idx_in_trajectory = self.idx_in_trajectory;
        inner.kinetic_energy = self.kinetic_energy;
        inner.potential_energy = self.potential_energy;
        out
    }

    pub(crate) fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub(crate) fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    pub(crate) fn write_position(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.q);
    }

    pub(crate) fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }

    /// Make this state the first point of a new trajectory.
    ///
    /// Must be called after the momentum was resampled.
    pub(crate) fn make_init_point(&mut self) -> Result<()> {
        let inner = self.try_mut_inner()?;
        inner.idx_in_trajectory = 0;
        inner.p_sum.copy_from_slice(&inner.p);
        Ok(())
    }

    /// The generalized no-U-turn criterion between two points of the same
    /// trajectory.
    ///
    /// `rho` is the sum of all momenta between (and including) the two
    /// points, and the trajectory is turning if it points backwards
    /// relative to the velocity at either end.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (&**self, &**other)
        } else {
            (&**other, &**self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut State, epsilon: f64) {
        let out = out
            .try_mut_inner()
            .expect("Leapfrog output should have only one reference");
        axpy_out(&self.grad, &self.p, epsilon / 2., &mut out.p);
    }

    pub(crate) fn position_step(&self, out: &mut State, epsilon: f64) {
        let out = out
            .try_mut_inner()
            .expect("Leapfrog output should have only one reference");
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        let inner = self
            .try_mut_inner()
            .expect("Leapfrog output should have only one reference");
        axpy(&inner.grad, &mut inner.p, epsilon / 2.);
    }

    /// Update the momentum sum of `out`, the successor of `self` in
    /// direction `dir`.
    pub(crate) fn set_psum(&self, out: &mut State, dir: Direction) {
        let out = out
            .try_mut_inner()
            .expect("Leapfrog output should have only one reference");
        assert!(out.idx_in_trajectory != 0);
        match dir {
            Direction::Backward if out.idx_in_trajectory == -1 => {
                out.p_sum.copy_from_slice(&out.p);
            }
            _ => {
                axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
            }
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // SAFETY: `inner` is not used again after it was taken here.
        let mut rc = unsafe { std::mem::ManuallyDrop::take(&mut self.inner) };
        if let Some(state_ref) = Rc::get_mut(&mut rc) {
            if let Some(reuser) = &mut state_ref.reuser.upgrade() {
                reuser.reuse_state(rc);
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}
