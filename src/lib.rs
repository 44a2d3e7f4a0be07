//! Sample from posterior distributions using the No U-turn Sampler (NUTS).
//! For details see the original [NUTS paper](https://arxiv.org/abs/1111.4246)
//! and the more recent [introduction](https://arxiv.org/abs/1701.02434).
//!
//! This crate implements a NUTS sampler with windowed step size and mass
//! matrix adaptation in the style of Stan. The mass matrix can be diagonal
//! or dense.
//!
//! ## Usage
//!
//! ```
//! use nuts_engine::{CpuLogpFunc, LogpError, Settings, Chain};
//! use thiserror::Error;
//!
//! // Define a function that computes the unnormalized posterior density
//! // and its gradient.
//! struct PosteriorDensity {}
//!
//! // The density might fail in a recoverable or non-recoverable manner...
//! #[derive(Debug, Error)]
//! enum PosteriorLogpError {}
//! impl LogpError for PosteriorLogpError {
//!     fn is_recoverable(&self) -> bool { false }
//! }
//!
//! impl CpuLogpFunc for PosteriorDensity {
//!     type LogpError = PosteriorLogpError;
//!
//!     // We define a 10 dimensional normal distribution
//!     fn dim(&self) -> usize { 10 }
//!
//!     // The normal likelihood with mean 3 and its gradient.
//!     fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
//!         let mu = 3f64;
//!         let logp = position
//!             .iter()
//!             .copied()
//!             .zip(grad.iter_mut())
//!             .map(|(x, grad)| {
//!                 let diff = x - mu;
//!                 *grad = -diff;
//!                 -diff * diff / 2f64
//!             })
//!             .sum();
//!         return Ok(logp)
//!     }
//! }
//!
//! // We get the default sampler arguments
//! let mut settings = Settings::default();
//!
//! // and modify as we like
//! settings.num_tune = 1000;
//! settings.maxdepth = 3;  // small value just for testing...
//!
//! // We instanciate our posterior density function
//! let logp_func = PosteriorDensity {};
//!
//! let chain = 0;
//! let mut sampler = settings.new_chain(chain, logp_func);
//!
//! // Set to some initial position and start drawing samples.
//! sampler.set_position(&vec![0f64; 10]).expect("Unrecoverable error during init");
//! let mut trace = vec![];  // Collection of all draws
//! for _ in 0..2000 {
//!     let draw = sampler.draw().expect("Unrecoverable error during sampling");
//!     trace.push(draw);
//! }
//! ```
//!
//! Several chains can be sampled in parallel with [`sample_parallel`].

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod cpu_potential;
pub(crate) mod cpu_state;
pub(crate) mod mass_matrix;
pub(crate) mod mass_matrix_adapt;
pub(crate) mod math;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod stepsize;

pub use adapt_strategy::{
    adaptation_windows, AdaptationWindow, EuclideanAdaptOptions, WindowKind, WindowOptions,
};
pub use chain::{AdaptedParameters, Chain, Draw, SampleStats};
pub use cpu_potential::CpuLogpFunc;
pub use mass_matrix::InverseMassMatrix;
pub use mass_matrix_adapt::MassMatrixAdaptOptions;
pub use nuts::{
    AsSampleStatMap, Direction, DivergenceInfo, LogpError, NutsError, NutsOptions, SampleInfo,
    SampleStatValue,
};
pub use sampler::{
    sample_parallel, sample_sequentially, AbortHandle, ChainOutput, ChainProgress, ConfigError,
    CpuLogpFuncMaker, InitPointFunc, JitterInitFunc, MassMatrixKind, RunSummary, Settings, Trace,
};
pub use stepsize::{DualAverageOptions, DualAverageSettings};
