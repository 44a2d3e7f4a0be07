use crate::{
    cpu_state::{State, StatePool},
    nuts::{Collector, Direction, DivergenceInfo, Hamiltonian, NutsOptions, Result},
};

const MIN_STEP_SIZE: f64 = 1e-10;
const MAX_STEP_SIZE: f64 = 1e5;
const MAX_SEARCH_ITERATIONS: usize = 100;

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    pub target_accept: f64,
    /// Starting point for the initial step size search
    pub initial_step: f64,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            initial_step: 0.1,
            params: DualAverageOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Forget the history and start again around `initial_step`.
    pub(crate) fn restart(&mut self, initial_step: f64) {
        *self = DualAverage::new(self.settings, initial_step);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Average the acceptance probability of all points in a trajectory
/// relative to its initial point. Divergent steps count as zero.
#[derive(Debug, Clone)]
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }

    fn start(&mut self, initial_energy: f64) {
        self.initial_energy = initial_energy;
        self.mean.reset();
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => self
                .mean
                .add(end.log_acceptance_probability(self.initial_energy).exp()),
        }
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.start(state.energy());
    }
}

/// Acceptance probability of one forward leapfrog step from `state`.
fn single_step_accept<P: Hamiltonian>(
    pool: &mut StatePool,
    potential: &mut P,
    state: &State,
) -> Result<f64> {
    let mut collector = AcceptanceRateCollector::new();
    collector.start(state.energy());
    // Divergences are recorded by the collector
    let _ = potential.leapfrog(pool, state, Direction::Forward, state.energy(), &mut collector)?;
    Ok(collector.mean.current())
}

/// Search for a step size where a single leapfrog step from `state` has an
/// acceptance probability of about one half.
///
/// Starting at `initial_step`, the step size is doubled while the acceptance
/// probability stays above 0.5, or halved while it stays below. The step size
/// of the potential is set to the result, which is also returned.
pub(crate) fn find_reasonable_step_size<P, R>(
    pool: &mut StatePool,
    potential: &mut P,
    state: &State,
    initial_step: f64,
    rng: &mut R,
) -> Result<f64>
where
    P: Hamiltonian,
    R: rand::Rng + ?Sized,
{
    let mut state = state.deep_clone(pool);
    potential.randomize_momentum(&mut state, rng);
    state
        .make_init_point()
        .expect("New state should have only one reference");

    *potential.step_size_mut() = initial_step;
    let accept = single_step_accept(pool, potential, &state)?;
    let increase = accept > 0.5;

    for _ in 0..MAX_SEARCH_ITERATIONS {
        let step_size = potential.step_size();
        let next = if increase {
            step_size * 2.
        } else {
            step_size / 2.
        };
        if !(MIN_STEP_SIZE..=MAX_STEP_SIZE).contains(&next) {
            break;
        }
        *potential.step_size_mut() = next;
        let accept = single_step_accept(pool, potential, &state)?;
        if increase != (accept > 0.5) {
            break;
        }
    }

    log::debug!("Initial step size search ended at {}", potential.step_size());
    Ok(potential.step_size())
}
