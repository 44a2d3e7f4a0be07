use std::sync::mpsc::channel;

use anyhow::{anyhow, Result};
use nuts_engine::{
    sample_parallel, AbortHandle, CpuLogpFunc, CpuLogpFuncMaker, Draw, JitterInitFunc,
    LogpError, Settings,
};
use thiserror::Error;

/// A normal distribution with mean 3 in `dim` dimensions.
struct PosteriorDensity {
    dim: usize,
}

#[derive(Debug, Error)]
enum PosteriorLogpError {}

impl LogpError for PosteriorLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl CpuLogpFunc for PosteriorDensity {
    type LogpError = PosteriorLogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        let mu = 3f64;
        let logp = position
            .iter()
            .zip(grad.iter_mut())
            .map(|(x, grad)| {
                let diff = x - mu;
                *grad = -diff;
                -diff * diff / 2f64
            })
            .sum();
        Ok(logp)
    }
}

struct Maker {
    dim: usize,
}

impl CpuLogpFuncMaker<PosteriorDensity> for Maker {
    fn make_logp_func(&self, _chain: usize) -> Result<PosteriorDensity> {
        Ok(PosteriorDensity { dim: self.dim })
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

fn main() -> Result<()> {
    let settings = Settings {
        num_chains: 4,
        seed: 42,
        ..Default::default()
    };
    let maker = Maker { dim: 10 };

    let (tx, rx) = channel::<Draw>();
    let printer = std::thread::spawn(move || {
        for draw in rx {
            if draw.stats.draw % 500 == 0 {
                println!(
                    "chain {} draw {}: logp {:.3} step size {:.3}",
                    draw.stats.chain, draw.stats.draw, draw.stats.logp, draw.stats.step_size
                );
            }
        }
    });

    let trace = sample_parallel(
        &maker,
        &JitterInitFunc::new(),
        &settings,
        None,
        &AbortHandle::new(),
        Some(tx),
    )?;
    printer
        .join()
        .map_err(|_| anyhow!("Printer thread panicked"))?;

    for chain in trace.chains.iter() {
        let n = chain.draws.len() as f64;
        let mean = chain.draws.iter().map(|draw| draw.position[0]).sum::<f64>() / n;
        println!(
            "chain {}: mean of first coordinate {:.3}, {} divergences, {:?} runtime",
            chain.chain_id, mean, chain.progress.divergences, chain.progress.runtime
        );
    }
    println!("{:?}", trace.summary());
    Ok(())
}
