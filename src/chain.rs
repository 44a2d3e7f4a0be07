use std::collections::HashMap;

use crate::{
    adapt_strategy::WindowedAdaptation,
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    cpu_state::{State, StatePool},
    mass_matrix::{InverseMassMatrix, MassMatrix},
    nuts::{
        draw, AsSampleStatMap, DivergenceInfo, Hamiltonian, NutsError, NutsOptions, Result,
        SampleStatValue,
    },
    sampler::{ConfigError, InitPointFunc},
    stepsize::AcceptanceRateCollector,
};

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
pub trait Chain {
    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error or is not finite
    /// at `position`. Calling it again restarts the chain: the draw counter,
    /// the mass matrix and the step size adaptation start from scratch.
    fn set_position(&mut self, position: &[f64]) -> Result<()>;

    /// Initialize the sampler at a point generated by `init_func`.
    ///
    /// Points where the logp function is not defined are rejected and a new
    /// point is tried, up to `max_attempts` times.
    fn set_random_position(
        &mut self,
        init_func: &mut dyn InitPointFunc,
        max_attempts: usize,
    ) -> Result<()>;

    /// Draw a new sample and return the position and some diagnostic information.
    fn draw(&mut self) -> Result<Draw>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;

    /// The current step size and inverse mass matrix.
    fn adapted_parameters(&self) -> AdaptedParameters;
}

/// One draw of a chain together with its sampler statistics.
#[derive(Debug, Clone)]
pub struct Draw {
    pub position: Box<[f64]>,
    pub stats: SampleStats,
}

/// Diagnostic information about a single draw.
#[derive(Debug, Clone)]
pub struct SampleStats {
    pub chain: u64,
    pub draw: u64,
    /// Whether the draw is part of the warmup
    pub tuning: bool,
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub diverging: bool,
    pub divergence_info: Option<DivergenceInfo>,
    /// Mean acceptance probability over all leapfrog steps of the trajectory.
    ///
    /// `NAN` if the trajectory did not contain any leapfrog steps.
    pub mean_tree_accept: f64,
    pub n_steps: u64,
    /// The step size used for this draw
    pub step_size: f64,
    pub energy: f64,
    /// Energy of the draw relative to the start of its trajectory
    pub energy_error: f64,
    pub logp: f64,
    pub index_in_trajectory: i64,
}

impl AsSampleStatMap for SampleStats {
    fn as_map(&self) -> HashMap<&'static str, SampleStatValue> {
        let mut map: HashMap<_, SampleStatValue> = HashMap::with_capacity(20);
        map.insert("chain", self.chain.into());
        map.insert("draw", self.draw.into());
        map.insert("tuning", self.tuning.into());
        map.insert("depth", self.depth.into());
        map.insert("maxdepth_reached", self.maxdepth_reached.into());
        map.insert("diverging", self.diverging.into());
        map.insert("mean_tree_accept", self.mean_tree_accept.into());
        map.insert("n_steps", self.n_steps.into());
        map.insert("step_size", self.step_size.into());
        map.insert("energy", self.energy.into());
        map.insert("energy_error", self.energy_error.into());
        map.insert("logp", self.logp.into());
        map.insert("index_in_trajectory", self.index_in_trajectory.into());

        let div_info = self.divergence_info.as_ref();
        map.insert(
            "divergence_start",
            div_info.and_then(|info| info.start_location.clone()).into(),
        );
        map.insert(
            "divergence_end",
            div_info.and_then(|info| info.end_location.clone()).into(),
        );
        map.insert(
            "divergence_energy_error",
            div_info.and_then(|info| info.energy_error).into(),
        );
        map.insert(
            "divergence_message",
            div_info
                .and_then(|info| info.logp_function_error.as_ref())
                .map(|err| err.to_string())
                .into(),
        );
        map
    }
}

/// The parameters found during warmup.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedParameters {
    pub step_size: f64,
    pub mass_matrix: InverseMassMatrix,
}

pub(crate) struct NutsChain<F, M, R>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    R: rand::Rng,
{
    pool: StatePool,
    potential: EuclideanPotential<F, M>,
    collector: AcceptanceRateCollector,
    options: NutsOptions,
    rng: R,
    state: Option<State>,
    chain: u64,
    draw_count: u64,
    strategy: WindowedAdaptation<M>,
}

impl<F, M, R> NutsChain<F, M, R>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    R: rand::Rng,
{
    pub(crate) fn new(
        potential: EuclideanPotential<F, M>,
        strategy: WindowedAdaptation<M>,
        options: NutsOptions,
        rng: R,
        chain: u64,
    ) -> Self {
        let pool_size: usize = options.maxdepth.clamp(4, 16).try_into().unwrap_or(16);
        let pool = StatePool::new(potential.dim(), 2 * pool_size);
        log::debug!(
            "Chain {} uses {} adaptation windows",
            chain,
            strategy.windows().len()
        );
        NutsChain {
            pool,
            potential,
            collector: AcceptanceRateCollector::new(),
            options,
            rng,
            state: None,
            chain,
            draw_count: 0,
            strategy,
        }
    }
}

impl<F, M, R> Chain for NutsChain<F, M, R>
where
    F: CpuLogpFunc,
    M: MassMatrix,
    R: rand::Rng,
{
    fn set_position(&mut self, position: &[f64]) -> Result<()> {
        if position.len() != self.dim() {
            return Err(ConfigError::InitPointDimension {
                expected: self.dim(),
                found: position.len(),
            }
            .into());
        }
        self.state = None;
        self.draw_count = 0;
        self.potential.mass_matrix.reset();
        let state = self.potential.init_state(&mut self.pool, position)?;
        self.strategy
            .init(&mut self.pool, &mut self.potential, &state, &mut self.rng)?;
        self.state = Some(state);
        Ok(())
    }

    fn set_random_position(
        &mut self,
        init_func: &mut dyn InitPointFunc,
        max_attempts: usize,
    ) -> Result<()> {
        let mut position = vec![0f64; self.dim()];
        let mut last_error = String::new();
        for attempt in 0..max_attempts {
            init_func.new_init_point(&mut self.rng, self.chain, &mut position);
            match self.set_position(&position) {
                Ok(()) => return Ok(()),
                Err(NutsError::InvalidInitPoint(msg)) => {
                    log::debug!(
                        "Chain {} rejected initial point {}: {}",
                        self.chain,
                        attempt,
                        msg
                    );
                    last_error = msg;
                }
                Err(err) => return Err(err),
            }
        }
        Err(NutsError::InitializationFailed {
            attempts: max_attempts,
            last_error,
        })
    }

    fn draw(&mut self) -> Result<Draw> {
        let init = self.state.as_mut().ok_or(NutsError::Uninitialized)?;
        let step_size = self.potential.step_size();
        let (state, info) = draw(
            &mut self.pool,
            init,
            &mut self.rng,
            &mut self.potential,
            &self.options,
            &mut self.collector,
        )?;

        let tuning = self.strategy.is_tuning(self.draw_count);
        self.strategy.adapt(
            &mut self.pool,
            &mut self.potential,
            self.draw_count,
            &state,
            &self.collector,
            &mut self.rng,
        )?;

        let n_steps = self.collector.mean.count();
        let mean_tree_accept = if n_steps > 0 {
            self.collector.mean.current()
        } else {
            f64::NAN
        };

        let stats = SampleStats {
            chain: self.chain,
            draw: self.draw_count,
            tuning,
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            diverging: info.divergence_info.is_some(),
            divergence_info: info.divergence_info,
            mean_tree_accept,
            n_steps,
            step_size,
            energy: state.energy(),
            energy_error: state.energy() - info.initial_energy,
            logp: state.logp(),
            index_in_trajectory: state.index_in_trajectory(),
        };

        let mut position: Box<[f64]> = vec![0f64; self.dim()].into();
        state.write_position(&mut position);

        self.draw_count += 1;
        self.state = Some(state);
        Ok(Draw { position, stats })
    }

    fn dim(&self) -> usize {
        self.potential.dim()
    }

    fn adapted_parameters(&self) -> AdaptedParameters {
        AdaptedParameters {
            step_size: self.potential.step_size(),
            mass_matrix: self.potential.mass_matrix.inverse_mass_matrix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::{
        adapt_strategy::EuclideanAdaptOptions,
        mass_matrix::{DenseMassMatrix, DiagMassMatrix},
        nuts::test_logps::{BoundedNormalLogp, NormalLogp},
        sampler::JitterInitFunc,
    };

    fn diag_chain(dim: usize, num_tune: u64) -> NutsChain<NormalLogp, DiagMassMatrix, ChaCha8Rng> {
        let mass_matrix = DiagMassMatrix::new(dim);
        let strategy = WindowedAdaptation::new(
            EuclideanAdaptOptions::default(),
            num_tune,
            mass_matrix.new_estimator(dim),
        );
        let potential = EuclideanPotential::new(NormalLogp::new(dim, 2.), mass_matrix, 1000., 0.1);
        NutsChain::new(
            potential,
            strategy,
            NutsOptions::default(),
            ChaCha8Rng::seed_from_u64(5),
            3,
        )
    }

    #[test]
    fn draw_requires_position() {
        let mut chain = diag_chain(2, 10);
        assert!(matches!(chain.draw(), Err(NutsError::Uninitialized)));
        assert!(matches!(
            chain.set_position(&[1.]),
            Err(NutsError::Config(ConfigError::InitPointDimension {
                expected: 2,
                found: 1
            }))
        ));
        chain.set_position(&[1., 1.]).unwrap();
        assert!(chain.draw().is_ok());
    }

    #[test]
    fn stats_follow_warmup() {
        let num_tune = 50;
        let mut chain = diag_chain(4, num_tune);
        chain.set_position(&[0., 1., 2., 3.]).unwrap();

        for i in 0..(num_tune + 20) {
            let Draw { position, stats } = chain.draw().unwrap();
            assert_eq!(position.len(), 4);
            assert_eq!(stats.chain, 3);
            assert_eq!(stats.draw, i);
            assert_eq!(stats.tuning, i < num_tune);
            assert!(stats.n_steps >= 1);
            assert!(stats.n_steps < (1 << 10));
            assert!(stats.mean_tree_accept >= 0. && stats.mean_tree_accept <= 1.);
            assert!(stats.logp.is_finite());
            if i >= num_tune {
                assert_eq!(stats.step_size, chain.adapted_parameters().step_size);
            }
        }
    }

    #[test]
    fn stat_map_is_complete() {
        let mut chain = diag_chain(2, 5);
        chain.set_position(&[0., 0.]).unwrap();
        let draw = chain.draw().unwrap();
        let map = draw.stats.as_map();
        for key in [
            "chain",
            "draw",
            "tuning",
            "depth",
            "maxdepth_reached",
            "diverging",
            "mean_tree_accept",
            "n_steps",
            "step_size",
            "energy",
            "energy_error",
            "logp",
            "index_in_trajectory",
            "divergence_start",
            "divergence_end",
            "divergence_energy_error",
            "divergence_message",
        ] {
            assert!(map.contains_key(key), "missing {}", key);
        }
        assert_eq!(map["chain"], SampleStatValue::U64(3));
        assert_eq!(map["divergence_start"], SampleStatValue::OptionArray(None));
    }

    #[test]
    fn dense_chain_exports_matrix() {
        let dim = 2;
        let mass_matrix = DenseMassMatrix::new(dim);
        let strategy = WindowedAdaptation::new(
            EuclideanAdaptOptions::default(),
            200,
            mass_matrix.new_estimator(dim),
        );
        let potential = EuclideanPotential::new(NormalLogp::new(dim, 0.), mass_matrix, 1000., 0.1);
        let mut chain = NutsChain::new(
            potential,
            strategy,
            NutsOptions::default(),
            ChaCha8Rng::seed_from_u64(1),
            0,
        );
        chain.set_position(&[0.5, -0.5]).unwrap();
        for _ in 0..200 {
            chain.draw().unwrap();
        }
        let params = chain.adapted_parameters();
        let InverseMassMatrix::Dense { dim, values } = params.mass_matrix else {
            panic!("Expected a dense mass matrix");
        };
        assert_eq!(dim, 2);
        assert!(values[0] != 1. || values[3] != 1.);
        assert_eq!(values[1], values[2]);
    }

    #[test]
    fn random_position_retries() {
        let dim = 2;
        let mass_matrix = DiagMassMatrix::new(dim);
        let strategy = WindowedAdaptation::new(
            EuclideanAdaptOptions::default(),
            10,
            mass_matrix.new_estimator(dim),
        );
        // Only a small part of the jitter range is inside the support
        let logp = BoundedNormalLogp { dim, bound: 0.7 };
        let potential = EuclideanPotential::new(logp, mass_matrix, 1000., 0.1);
        let mut chain = NutsChain::new(
            potential,
            strategy,
            NutsOptions::default(),
            ChaCha8Rng::seed_from_u64(2),
            0,
        );
        let mut init = JitterInitFunc::new();
        chain.set_random_position(&mut init, 1000).unwrap();
        let draw = chain.draw().unwrap();
        assert!(draw.position.iter().all(|x| x.abs() < 0.7));
    }

    #[test]
    fn random_position_gives_up() {
        let dim = 2;
        let mass_matrix = DiagMassMatrix::new(dim);
        let strategy = WindowedAdaptation::new(
            EuclideanAdaptOptions::default(),
            10,
            mass_matrix.new_estimator(dim),
        );
        let logp = BoundedNormalLogp { dim, bound: 0. };
        let potential = EuclideanPotential::new(logp, mass_matrix, 1000., 0.1);
        let mut chain = NutsChain::new(
            potential,
            strategy,
            NutsOptions::default(),
            ChaCha8Rng::seed_from_u64(2),
            0,
        );
        let mut init = JitterInitFunc::new();
        match chain.set_random_position(&mut init, 7) {
            Err(NutsError::InitializationFailed { attempts, last_error }) => {
                assert_eq!(attempts, 7);
                assert!(!last_error.is_empty());
            }
            other => panic!("Unexpected result {:?}", other),
        }
        assert!(matches!(chain.draw(), Err(NutsError::Uninitialized)));
    }

    #[test]
    fn set_position_restarts_warmup() {
        let num_tune = 150;
        let mut chain = diag_chain(2, num_tune);
        chain.set_position(&[1., 1.]).unwrap();
        for _ in 0..(num_tune + 5) {
            chain.draw().unwrap();
        }
        let identity = InverseMassMatrix::Diag(vec![1.; 2].into());
        assert!(chain.adapted_parameters().mass_matrix != identity);

        chain.set_position(&[0.5, -0.5]).unwrap();
        assert_eq!(chain.adapted_parameters().mass_matrix, identity);
        let draw = chain.draw().unwrap();
        assert_eq!(draw.stats.draw, 0);
        assert!(draw.stats.tuning);
    }
}
