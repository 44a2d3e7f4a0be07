use std::{collections::HashMap, sync::Arc};

use rand_distr::{Distribution, StandardUniform};
use thiserror::Error;

use crate::cpu_state::{State, StatePool};
use crate::math::logaddexp;
use crate::sampler::ConfigError;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid initial position: {0}")]
    InvalidInitPoint(String),

    #[error("No valid initial position found after {attempts} attempts: {last_error}")]
    InitializationFailed { attempts: usize, last_error: String },

    #[error("Invalid sampler settings")]
    Config(#[from] ConfigError),

    #[error("The chain has no position, call set_position first")]
    Uninitialized,
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value, or the logp or its gradient are not finite.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    /// The position in parameter space where the diverging leapfrog started
    pub start_location: Option<Box<[f64]>>,
    /// The position in parameter space where the diverging leapfrog ended
    pub end_location: Option<Box<[f64]>>,
    /// The difference between the energy at the end of the diverging
    /// leapfrog step and the initial energy of the trajectory.
    ///
    /// This is not available if the divergence was caused by a logp function error
    pub energy_error: Option<f64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub end_idx_in_trajectory: Option<i64>,
    /// The recoverable logp function error that caused the divergence, if any
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Callbacks for various events during a Nuts sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate.
pub(crate) trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State, _options: &NutsOptions) {}
}

/// The hamiltonian defined by the potential energy and the kinetic energy
pub(crate) trait Hamiltonian {
    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<State, DivergenceInfo>>;

    /// Initialize a state at a new location.
    ///
    /// The momentum is left at zero, it will later be set using
    /// `Self::randomize_momentum`.
    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State>;

    /// Draw a new momentum and update velocity and kinetic energy.
    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R);

    /// The dimension of the hamiltonian (position only).
    fn dim(&self) -> usize;

    fn step_size(&self) -> f64;
    fn step_size_mut(&mut self) -> &mut f64;
}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,

    /// The total energy at the start of the trajectory
    pub initial_energy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleStatValue {
    Array(Box<[f64]>),
    OptionArray(Option<Box<[f64]>>),
    U64(u64),
    I64(i64),
    F64(f64),
    OptionF64(Option<f64>),
    Bool(bool),
    OptionString(Option<String>),
}

impl From<Box<[f64]>> for SampleStatValue {
    fn from(val: Box<[f64]>) -> Self {
        SampleStatValue::Array(val)
    }
}

impl From<Option<Box<[f64]>>> for SampleStatValue {
    fn from(val: Option<Box<[f64]>>) -> Self {
        SampleStatValue::OptionArray(val)
    }
}

impl From<u64> for SampleStatValue {
    fn from(val: u64) -> Self {
        SampleStatValue::U64(val)
    }
}

impl From<i64> for SampleStatValue {
    fn from(val: i64) -> Self {
        SampleStatValue::I64(val)
    }
}

impl From<f64> for SampleStatValue {
    fn from(val: f64) -> Self {
        SampleStatValue::F64(val)
    }
}

impl From<Option<f64>> for SampleStatValue {
    fn from(val: Option<f64>) -> Self {
        SampleStatValue::OptionF64(val)
    }
}

impl From<bool> for SampleStatValue {
    fn from(val: bool) -> Self {
        SampleStatValue::Bool(val)
    }
}

impl From<Option<String>> for SampleStatValue {
    fn from(val: Option<String>) -> Self {
        SampleStatValue::OptionString(val)
    }
}

/// Export sampler statistics as named values, so that they can be stored
/// without knowing the concrete stats type.
pub trait AsSampleStatMap {
    fn as_map(&self) -> HashMap<&'static str, SampleStatValue>;
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(NutsError),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    /// Double the tree by building a subtree of the same depth in `direction`.
    fn extend<P, R, C>(
        mut self,
        pool: &mut StatePool,
        rng: &mut R,
        potential: &mut P,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult
    where
        P: Hamiltonian,
        R: rand::Rng + ?Sized,
        C: Collector,
    {
        let mut other = match self.single_step(pool, potential, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(pool, rng, potential, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        // Biased progressive sampling on the main tree, uniform within subtrees
        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || rng.random_bool((other.log_size - self_log_size).exp())
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    fn single_step<P: Hamiltonian, C: Collector>(
        &self,
        pool: &mut StatePool,
        potential: &mut P,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match potential.leapfrog(pool, start, direction, self.initial_energy, collector)? {
            Ok(end) => end,
            Err(info) => return Ok(Err(info)),
        };

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
            initial_energy: self.initial_energy,
        }
    }
}

/// Settings for a single NUTS transition.
#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    /// The tree is doubled at most this many times, so a trajectory has
    /// at most `2^maxdepth` leapfrog steps.
    pub maxdepth: u64,
}

impl Default for NutsOptions {
    fn default() -> Self {
        Self { maxdepth: 10 }
    }
}

/// Run one NUTS transition starting at `init`.
///
/// The random stream is consumed in a fixed order: momentum, then for each
/// doubling the direction followed by the multinomial draws of the merges.
pub(crate) fn draw<P, R, C>(
    pool: &mut StatePool,
    init: &mut State,
    rng: &mut R,
    potential: &mut P,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    P: Hamiltonian,
    R: rand::Rng + ?Sized,
    C: Collector,
{
    if init.try_mut_inner().is_err() {
        *init = init.deep_clone(pool);
    }
    potential.randomize_momentum(init, rng);
    init.make_init_point()
        .expect("Initial state should have only one reference");
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(pool, rng, potential, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

#[cfg(test)]
pub(crate) mod test_logps {
    use thiserror::Error;

    use crate::cpu_potential::CpuLogpFunc;
    use crate::nuts::LogpError;

    /// Independent normal distributions with a shared mean and standard deviation.
    #[derive(Clone, Debug)]
    pub(crate) struct NormalLogp {
        pub(crate) dim: usize,
        pub(crate) mu: f64,
        pub(crate) sigma: f64,
    }

    impl NormalLogp {
        pub(crate) fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu, sigma: 1. }
        }
    }

    #[derive(Error, Debug)]
    pub(crate) enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    impl CpuLogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let var = self.sigma * self.sigma;
            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2. / var;
                *g = -val / var;
            }
            Ok(logp)
        }
    }

    #[derive(Error, Debug)]
    #[error("position outside of the support")]
    pub(crate) struct OutOfSupport;

    impl LogpError for OutOfSupport {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    /// A standard normal that is only defined on `|x_i| < bound`.
    #[derive(Clone, Debug)]
    pub(crate) struct BoundedNormalLogp {
        pub(crate) dim: usize,
        pub(crate) bound: f64,
    }

    impl CpuLogpFunc for BoundedNormalLogp {
        type LogpError = OutOfSupport;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, OutOfSupport> {
            if position.iter().any(|x| x.abs() >= self.bound) {
                return Err(OutOfSupport);
            }
            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                logp -= p * p / 2.;
                *g = -p;
            }
            Ok(logp)
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::test_logps::{BoundedNormalLogp, NormalLogp};
    use super::*;
    use crate::cpu_potential::EuclideanPotential;
    use crate::mass_matrix::DiagMassMatrix;
    use crate::stepsize::AcceptanceRateCollector;

    fn potential(dim: usize, step_size: f64) -> EuclideanPotential<NormalLogp, DiagMassMatrix> {
        EuclideanPotential::new(
            NormalLogp::new(dim, 0.),
            DiagMassMatrix::new(dim),
            1000f64,
            step_size,
        )
    }

    #[test]
    fn maxdepth_zero_returns_initial_state() {
        let mut potential = potential(3, 0.1);
        let mut pool = StatePool::new(3, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut state = potential.init_state(&mut pool, &[0.5, -0.3, 1.2]).unwrap();
        let options = NutsOptions { maxdepth: 0 };

        for _ in 0..10 {
            let mut collector = AcceptanceRateCollector::new();
            let (next, info) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut potential,
                &options,
                &mut collector,
            )
            .unwrap();
            assert_eq!(&*next.q, &[0.5, -0.3, 1.2]);
            assert_eq!(next.index_in_trajectory(), 0);
            assert_eq!(info.depth, 0);
            assert!(info.reached_maxdepth);
            assert!(info.divergence_info.is_none());
            assert_eq!(collector.mean.count(), 0);
            state = next;
        }
    }

    #[test]
    fn trajectory_turns_before_maxdepth() {
        let mut potential = potential(1, 0.1);
        let mut pool = StatePool::new(1, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut state = potential.init_state(&mut pool, &[1.]).unwrap();
        let options = NutsOptions { maxdepth: 10 };

        for _ in 0..100 {
            let mut collector = AcceptanceRateCollector::new();
            let (next, info) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut potential,
                &options,
                &mut collector,
            )
            .unwrap();
            // Half an orbit of the harmonic oscillator takes ~31 steps of size 0.1
            assert!(!info.reached_maxdepth);
            assert!(info.depth <= 7);
            assert!(info.divergence_info.is_none());
            assert!(collector.mean.current() > 0.9);
            state = next;
        }
    }

    #[test]
    fn divergence_on_first_step_keeps_initial_state() {
        let logp = BoundedNormalLogp { dim: 1, bound: 1. };
        let mut potential =
            EuclideanPotential::new(logp, DiagMassMatrix::new(1), 1000f64, 100f64);
        let mut pool = StatePool::new(1, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut state = potential.init_state(&mut pool, &[0.5]).unwrap();
        let options = NutsOptions::default();

        let mut collector = AcceptanceRateCollector::new();
        let (next, info) = draw(
            &mut pool,
            &mut state,
            &mut rng,
            &mut potential,
            &options,
            &mut collector,
        )
        .unwrap();
        assert_eq!(&*next.q, &[0.5]);
        assert_eq!(info.depth, 0);
        assert!(!info.reached_maxdepth);
        let div = info.divergence_info.expect("Step should diverge");
        assert!(div.logp_function_error.is_some());
        assert_eq!(collector.mean.count(), 1);
        assert_eq!(collector.mean.current(), 0.);
    }

    #[test]
    fn deterministic_given_seed() {
        let run = || {
            let mut potential = potential(4, 0.3);
            let mut pool = StatePool::new(4, 8);
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            let mut state = potential
                .init_state(&mut pool, &[0.1, 0.2, 0.3, 0.4])
                .unwrap();
            let mut out = Vec::new();
            for _ in 0..20 {
                let mut collector = AcceptanceRateCollector::new();
                let (next, _) = draw(
                    &mut pool,
                    &mut state,
                    &mut rng,
                    &mut potential,
                    &NutsOptions::default(),
                    &mut collector,
                )
                .unwrap();
                out.push(next.q.to_vec());
                state = next;
            }
            out
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn shared_initial_state_is_not_modified() {
        let mut potential = potential(2, 0.2);
        let mut pool = StatePool::new(2, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let state = potential.init_state(&mut pool, &[0.4, 0.4]).unwrap();
        let mut start = state.clone();
        let momentum_before = state.p.to_vec();

        let mut collector = AcceptanceRateCollector::new();
        draw(
            &mut pool,
            &mut start,
            &mut rng,
            &mut potential,
            &NutsOptions::default(),
            &mut collector,
        )
        .unwrap();
        assert_eq!(state.p.to_vec(), momentum_before);
    }
}
