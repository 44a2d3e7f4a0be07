use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Sender},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use itertools::Itertools;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use thiserror::Error;

use crate::{
    adapt_strategy::{EuclideanAdaptOptions, WindowedAdaptation},
    chain::{AdaptedParameters, Chain, Draw, NutsChain, SampleStats},
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix},
    nuts::{NutsError, NutsOptions},
};

/// Trees deeper than this would overflow the leapfrog counters.
const MAX_MAXDEPTH: u64 = 62;

/// Invalid sampler settings, reported before any chain starts.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("target_accept must be in (0, 1), got {0}")]
    TargetAccept(f64),

    #[error("maxdepth must be between 1 and {max}, got {found}")]
    Maxdepth { found: u64, max: u64 },

    #[error("max_energy_error must be positive, got {0}")]
    MaxEnergyError(f64),

    #[error("initial step size must be positive and finite, got {0}")]
    InitialStep(f64),

    #[error("invalid step size adaptation: {0}")]
    StepSizeAdaptation(String),

    #[error("invalid mass matrix regularization: {0}")]
    MassMatrixRegularization(String),

    #[error("invalid adaptation windows: {0}")]
    Windows(String),

    #[error("expected an initial point with {expected} values, got {found}")]
    InitPointDimension { expected: usize, found: usize },

    #[error("the density of chain {chain} has dimension {found}, expected {expected}")]
    ModelDimension {
        chain: u64,
        expected: usize,
        found: usize,
    },

    #[error("invalid jitter range [{low}, {high})")]
    JitterRange { low: f64, high: f64 },

    #[error("max_init_attempts must be at least one")]
    InitAttempts,

    #[error("num_chains must be at least one")]
    NumChains,
}

/// How the mass matrix is represented and adapted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MassMatrixKind {
    /// Adapt only the posterior variances
    #[default]
    Diag,
    /// Adapt the full posterior covariance
    Dense,
}

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    /// Settings for step size and mass matrix adaptation.
    pub adapt_options: EuclideanAdaptOptions,
    pub mass_matrix: MassMatrixKind,
    /// How many random initial points are tried before a chain gives up
    pub max_init_attempts: usize,

    pub num_chains: usize,
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 1000,
            maxdepth: 10,
            max_energy_error: 1000f64,
            adapt_options: EuclideanAdaptOptions::default(),
            mass_matrix: MassMatrixKind::Diag,
            max_init_attempts: 100,
            num_chains: 4,
            seed: 0,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let step = &self.adapt_options.dual_average_options;
        if !(step.target_accept > 0. && step.target_accept < 1.) {
            return Err(ConfigError::TargetAccept(step.target_accept));
        }
        if !(step.initial_step > 0. && step.initial_step.is_finite()) {
            return Err(ConfigError::InitialStep(step.initial_step));
        }
        let params = &step.params;
        if !(params.gamma > 0. && params.gamma.is_finite()) {
            return Err(ConfigError::StepSizeAdaptation(format!(
                "gamma must be positive, got {}",
                params.gamma
            )));
        }
        if !(params.t0 >= 0. && params.t0.is_finite()) {
            return Err(ConfigError::StepSizeAdaptation(format!(
                "t0 must not be negative, got {}",
                params.t0
            )));
        }
        if !(params.k > 0. && params.k <= 1.) {
            return Err(ConfigError::StepSizeAdaptation(format!(
                "k must be in (0, 1], got {}",
                params.k
            )));
        }

        if (self.maxdepth == 0) | (self.maxdepth > MAX_MAXDEPTH) {
            return Err(ConfigError::Maxdepth {
                found: self.maxdepth,
                max: MAX_MAXDEPTH,
            });
        }
        if !(self.max_energy_error > 0.) {
            return Err(ConfigError::MaxEnergyError(self.max_energy_error));
        }

        let mass = &self.adapt_options.mass_matrix_options;
        if !(mass.prior_count >= 0. && mass.prior_count.is_finite()) {
            return Err(ConfigError::MassMatrixRegularization(format!(
                "prior count must not be negative, got {}",
                mass.prior_count
            )));
        }
        if !(mass.target > 0. && mass.target.is_finite()) {
            return Err(ConfigError::MassMatrixRegularization(format!(
                "target must be positive, got {}",
                mass.target
            )));
        }

        let windows = &self.adapt_options.window_options;
        if windows.base_window == 0 {
            return Err(ConfigError::Windows(
                "base_window must be at least one draw".to_string(),
            ));
        }
        if windows
            .init_buffer
            .checked_add(windows.base_window)
            .and_then(|total| total.checked_add(windows.term_buffer))
            .is_none()
        {
            return Err(ConfigError::Windows(
                "init_buffer + base_window + term_buffer overflows".to_string(),
            ));
        }
        if self.num_tune.checked_add(self.num_draws).is_none() {
            return Err(ConfigError::Windows(
                "num_tune + num_draws overflows".to_string(),
            ));
        }

        if self.max_init_attempts == 0 {
            return Err(ConfigError::InitAttempts);
        }
        if self.num_chains == 0 {
            return Err(ConfigError::NumChains);
        }
        Ok(())
    }

    /// Create a new chain with its own random stream.
    ///
    /// Chains with the same seed and chain id produce identical draws.
    pub fn new_chain<'a, F: CpuLogpFunc + 'a>(&self, chain: u64, logp: F) -> Box<dyn Chain + 'a> {
        let rng = chain_rng(self.seed, chain);
        let dim = logp.dim();
        match self.mass_matrix {
            MassMatrixKind::Diag => Box::new(self.build_chain(chain, logp, DiagMassMatrix::new(dim), rng)),
            MassMatrixKind::Dense => {
                Box::new(self.build_chain(chain, logp, DenseMassMatrix::new(dim), rng))
            }
        }
    }

    fn build_chain<F: CpuLogpFunc, M: MassMatrix, R: rand::Rng>(
        &self,
        chain: u64,
        logp: F,
        mass_matrix: M,
        rng: R,
    ) -> NutsChain<F, M, R> {
        let strategy = WindowedAdaptation::new(
            self.adapt_options,
            self.num_tune,
            mass_matrix.new_estimator(logp.dim()),
        );
        let potential = EuclideanPotential::new(
            logp,
            mass_matrix,
            self.max_energy_error,
            self.adapt_options.dual_average_options.initial_step,
        );
        let options = NutsOptions {
            maxdepth: self.maxdepth,
        };
        NutsChain::new(potential, strategy, options, rng, chain)
    }
}

fn chain_rng(seed: u64, chain: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    rng
}

/// Generate initial positions for chains.
pub trait InitPointFunc {
    fn new_init_point(&mut self, rng: &mut dyn RngCore, chain: u64, out: &mut [f64]);
}

/// Draw each coordinate of the initial position uniformly from `[low, high)`.
#[derive(Debug, Clone, Copy)]
pub struct JitterInitFunc {
    low: f64,
    high: f64,
}

impl JitterInitFunc {
    pub fn new() -> JitterInitFunc {
        JitterInitFunc {
            low: -2.,
            high: 2.,
        }
    }

    pub fn with_range(low: f64, high: f64) -> std::result::Result<JitterInitFunc, ConfigError> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(ConfigError::JitterRange { low, high });
        }
        Ok(JitterInitFunc { low, high })
    }
}

impl Default for JitterInitFunc {
    fn default() -> Self {
        Self::new()
    }
}

impl InitPointFunc for JitterInitFunc {
    fn new_init_point(&mut self, rng: &mut dyn RngCore, _chain: u64, out: &mut [f64]) {
        out.iter_mut()
            .for_each(|val| *val = rng.random_range(self.low..self.high));
    }
}

/// Sample a single chain from a fixed starting point.
///
/// The iterator yields the warmup draws followed by the posterior draws.
pub fn sample_sequentially<'a, F: CpuLogpFunc + 'a>(
    logp: F,
    settings: &Settings,
    start: &[f64],
    chain: u64,
) -> std::result::Result<impl Iterator<Item = std::result::Result<Draw, NutsError>> + 'a, NutsError>
{
    settings.validate()?;
    let mut sampler = settings.new_chain(chain, logp);
    sampler.set_position(start)?;
    let draws = settings.num_tune + settings.num_draws;
    Ok((0..draws).map(move |_| sampler.draw()))
}

/// Create a log density function for each chain.
pub trait CpuLogpFuncMaker<Func>: Send + Sync
where
    Func: CpuLogpFunc,
{
    fn make_logp_func(&self, chain: usize) -> Result<Func>;
    fn dim(&self) -> usize;
}

/// Cancel a running sampler.
///
/// Chains check the handle between draws, so a trajectory that is being
/// built is always finished.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_draws: usize,
    pub total_draws: usize,
    pub divergences: usize,
    pub tuning: bool,
    pub started: bool,
    pub latest_num_steps: usize,
    pub total_num_steps: usize,
    pub step_size: f64,
    pub runtime: Duration,
    pub divergent_draws: Vec<usize>,
    pub maxdepth_hits: usize,
}

impl ChainProgress {
    fn new(total: usize) -> Self {
        Self {
            finished_draws: 0,
            total_draws: total,
            divergences: 0,
            tuning: true,
            started: false,
            latest_num_steps: 0,
            step_size: 0f64,
            total_num_steps: 0,
            runtime: Duration::ZERO,
            divergent_draws: Vec::new(),
            maxdepth_hits: 0,
        }
    }

    fn update(&mut self, stats: &SampleStats, draw_duration: Duration) {
        if stats.diverging & !stats.tuning {
            self.divergences += 1;
            self.divergent_draws.push(self.finished_draws);
        }
        if stats.maxdepth_reached & !stats.tuning {
            self.maxdepth_hits += 1;
        }
        self.finished_draws += 1;
        self.tuning = stats.tuning;

        self.latest_num_steps = stats.n_steps as usize;
        self.total_num_steps += stats.n_steps as usize;
        self.step_size = stats.step_size;
        self.runtime += draw_duration;
    }
}

/// The result of one chain of a parallel run.
#[derive(Debug)]
pub struct ChainOutput {
    pub chain_id: u64,
    /// Draws after the warmup
    pub draws: Vec<Draw>,
    pub num_warmup: u64,
    /// `None` if the chain failed before the end of the warmup
    pub adapted_parameters: Option<AdaptedParameters>,
    pub progress: ChainProgress,
    pub aborted: bool,
    /// The error that stopped the chain, if any
    pub error: Option<anyhow::Error>,
}

impl ChainOutput {
    fn new(chain_id: u64, settings: &Settings) -> Self {
        Self {
            chain_id,
            draws: Vec::with_capacity(settings.num_draws as usize),
            num_warmup: 0,
            adapted_parameters: None,
            progress: ChainProgress::new((settings.num_tune + settings.num_draws) as usize),
            aborted: false,
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
}

impl<I: Iterator<Item = ChainOutput>> From<I> for Trace {
    fn from(value: I) -> Self {
        let mut chains = value.into_iter().collect_vec();
        chains.sort_unstable_by_key(|x| x.chain_id);
        Trace { chains }
    }
}

impl Trace {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            num_chains: self.chains.len(),
            failed_chains: self
                .chains
                .iter()
                .filter(|chain| chain.error.is_some())
                .map(|chain| chain.chain_id)
                .collect(),
            aborted: self.chains.iter().any(|chain| chain.aborted),
            num_draws: self.chains.iter().map(|chain| chain.draws.len()).sum(),
            divergences: self
                .chains
                .iter()
                .map(|chain| chain.progress.divergences)
                .sum(),
            maxdepth_hits: self
                .chains
                .iter()
                .map(|chain| chain.progress.maxdepth_hits)
                .sum(),
        }
    }
}

/// Problems of a finished run, counted over the draws after warmup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub num_chains: usize,
    pub failed_chains: Vec<u64>,
    pub aborted: bool,
    pub num_draws: usize,
    pub divergences: usize,
    pub maxdepth_hits: usize,
}

impl RunSummary {
    pub fn log_warnings(&self) {
        if self.divergences > 0 {
            log::warn!(
                "There were {} divergences after tuning. Increase `target_accept` or reparameterize.",
                self.divergences
            );
        }
        if self.maxdepth_hits > 0 {
            log::warn!(
                "{} of {} draws reached the maximum tree depth. Increase `maxdepth`, increase `target_accept` or reparameterize.",
                self.maxdepth_hits,
                self.num_draws
            );
        }
        if !self.failed_chains.is_empty() {
            log::warn!(
                "{} of {} chains failed: {:?}",
                self.failed_chains.len(),
                self.num_chains,
                self.failed_chains
            );
        }
        if self.aborted {
            log::warn!("Sampling was aborted, the trace is incomplete.");
        }
    }
}

/// Sample all chains in a rayon thread pool.
///
/// Each chain is initialized with `init_point_func`, retrying up to
/// `settings.max_init_attempts` times. Chains that fail report their
/// error in the trace without affecting the other chains. If `draws` is
/// given, every draw (warmup included) is also sent there as soon as it is
/// available.
pub fn sample_parallel<M, F, I>(
    logp_func_maker: &M,
    init_point_func: &I,
    settings: &Settings,
    num_threads: Option<usize>,
    abort: &AbortHandle,
    draws: Option<Sender<Draw>>,
) -> Result<Trace>
where
    M: CpuLogpFuncMaker<F>,
    F: CpuLogpFunc,
    I: InitPointFunc + Clone + Send + Sync,
{
    settings.validate().context("Invalid sampler settings")?;
    let settings = *settings;

    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .thread_name(|i| format!("nuts-chain-{}", i))
        .build()
        .context("Could not create thread pool")?;

    let (results_tx, results_rx) = channel();
    pool.scope_fifo(|scope| {
        for chain in 0..settings.num_chains as u64 {
            let results = results_tx.clone();
            let draws = draws.clone();
            let init_point_func = init_point_func.clone();
            let abort = abort.clone();
            scope.spawn_fifo(move |_| {
                let output = run_chain(
                    logp_func_maker,
                    init_point_func,
                    &settings,
                    chain,
                    &abort,
                    draws.as_ref(),
                );
                // The receiver lives until the scope has ended
                let _ = results.send(output);
            });
        }
    });
    drop(results_tx);

    let trace: Trace = results_rx.into_iter().into();
    trace.summary().log_warnings();
    Ok(trace)
}

fn run_chain<M, F, I>(
    logp_func_maker: &M,
    init_point_func: I,
    settings: &Settings,
    chain: u64,
    abort: &AbortHandle,
    draws: Option<&Sender<Draw>>,
) -> ChainOutput
where
    M: CpuLogpFuncMaker<F>,
    F: CpuLogpFunc,
    I: InitPointFunc,
{
    let mut output = ChainOutput::new(chain, settings);
    if let Err(error) = sample_chain(
        logp_func_maker,
        init_point_func,
        settings,
        chain,
        abort,
        draws,
        &mut output,
    ) {
        log::debug!("Chain {} failed: {:#}", chain, error);
        output.error = Some(error);
    }
    output
}

fn sample_chain<M, F, I>(
    logp_func_maker: &M,
    mut init_point_func: I,
    settings: &Settings,
    chain: u64,
    abort: &AbortHandle,
    draws: Option<&Sender<Draw>>,
    output: &mut ChainOutput,
) -> Result<()>
where
    M: CpuLogpFuncMaker<F>,
    F: CpuLogpFunc,
    I: InitPointFunc,
{
    let logp = logp_func_maker
        .make_logp_func(chain as usize)
        .context("Failed to create model density")?;
    if logp.dim() != logp_func_maker.dim() {
        return Err(ConfigError::ModelDimension {
            chain,
            expected: logp_func_maker.dim(),
            found: logp.dim(),
        }
        .into());
    }
    let mut sampler = settings.new_chain(chain, logp);
    sampler
        .set_random_position(&mut init_point_func, settings.max_init_attempts)
        .with_context(|| format!("Failed to initialize chain {}", chain))?;
    output.progress.started = true;

    let total = settings.num_tune + settings.num_draws;
    for _ in 0..total {
        if abort.is_aborted() {
            output.aborted = true;
            break;
        }
        let now = Instant::now();
        let draw = sampler.draw()?;
        output.progress.update(&draw.stats, now.elapsed());
        if let Some(sender) = draws {
            sender
                .send(draw.clone())
                .context("Could not send draw to the receiver")?;
        }
        if draw.stats.tuning {
            output.num_warmup += 1;
        } else {
            if output.adapted_parameters.is_none() {
                output.adapted_parameters = Some(sampler.adapted_parameters());
            }
            output.draws.push(draw);
        }
    }
    if output.adapted_parameters.is_none() && output.num_warmup == settings.num_tune {
        output.adapted_parameters = Some(sampler.adapted_parameters());
    }

    log::info!(
        "Chain {} finished {} draws with {} divergences",
        chain,
        output.progress.finished_draws,
        output.progress.divergences
    );
    Ok(())
}
