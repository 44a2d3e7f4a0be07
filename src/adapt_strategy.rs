use crate::{
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    cpu_state::{State, StatePool},
    mass_matrix::MassMatrix,
    mass_matrix_adapt::{MassMatrixAdaptOptions, MassMatrixEstimator},
    nuts::{Hamiltonian, Result},
    stepsize::{
        find_reasonable_step_size, AcceptanceRateCollector, DualAverage, DualAverageSettings,
    },
};

/// Sizes of the warmup windows, in draws.
///
/// If the warmup is too short for these, 15% of it is used as initial
/// buffer, 10% as terminal buffer and the rest for one slow window.
#[derive(Debug, Clone, Copy)]
pub struct WindowOptions {
    /// Fast adaptation (step size only) at the start of the warmup
    pub init_buffer: u64,
    /// Fast adaptation with the final mass matrix at the end of the warmup
    pub term_buffer: u64,
    /// Size of the first slow window. Each following window is twice as large.
    pub base_window: u64,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

/// Below this many warmup draws only the step size is adapted.
const MIN_WINDOWED_WARMUP: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Only the step size is adapted
    Fast,
    /// Draws are collected for the mass matrix, which is updated at the end
    /// of the window
    Slow,
}

/// The draws `start..end` of the warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptationWindow {
    pub start: u64,
    pub end: u64,
    pub kind: WindowKind,
}

impl AdaptationWindow {
    fn new(start: u64, end: u64, kind: WindowKind) -> Self {
        Self { start, end, kind }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, draw: u64) -> bool {
        (self.start..self.end).contains(&draw)
    }
}

/// Split `num_tune` warmup draws into adaptation windows.
///
/// The windows are contiguous and cover `0..num_tune`.
pub fn adaptation_windows(num_tune: u64, options: &WindowOptions) -> Vec<AdaptationWindow> {
    if num_tune == 0 {
        return vec![];
    }
    if num_tune < MIN_WINDOWED_WARMUP {
        return vec![AdaptationWindow::new(0, num_tune, WindowKind::Fast)];
    }

    let (init_buffer, term_buffer, base_window) =
        if options
            .init_buffer
            .checked_add(options.base_window)
            .and_then(|total| total.checked_add(options.term_buffer))
            .map_or(true, |total| total > num_tune)
        {
            let init_buffer = (0.15 * num_tune as f64) as u64;
            let term_buffer = (0.1 * num_tune as f64) as u64;
            (init_buffer, term_buffer, num_tune - init_buffer - term_buffer)
        } else {
            (options.init_buffer, options.term_buffer, options.base_window)
        };

    let slow_end = num_tune - term_buffer;
    let mut windows = Vec::new();
    if init_buffer > 0 {
        windows.push(AdaptationWindow::new(0, init_buffer, WindowKind::Fast));
    }

    let mut start = init_buffer;
    let mut size = base_window.max(1);
    while start < slow_end {
        let mut end = start + size;
        // The next window would not fit, so this one takes the rest
        if end + 2 * size > slow_end {
            end = slow_end;
        }
        windows.push(AdaptationWindow::new(start, end, WindowKind::Slow));
        start = end;
        size *= 2;
    }

    if term_buffer > 0 {
        windows.push(AdaptationWindow::new(slow_end, num_tune, WindowKind::Fast));
    }
    windows
}

/// Settings for the windowed adaptation of step size and mass matrix
#[derive(Debug, Clone, Copy)]
pub struct EuclideanAdaptOptions {
    pub dual_average_options: DualAverageSettings,
    pub mass_matrix_options: MassMatrixAdaptOptions,
    pub window_options: WindowOptions,
    /// Search for a new initial step size after each mass matrix update
    pub rerun_step_size_search: bool,
}

impl Default for EuclideanAdaptOptions {
    fn default() -> Self {
        Self {
            dual_average_options: DualAverageSettings::default(),
            mass_matrix_options: MassMatrixAdaptOptions::default(),
            window_options: WindowOptions::default(),
            rerun_step_size_search: true,
        }
    }
}

/// Drives step size and mass matrix adaptation through the warmup windows.
pub(crate) struct WindowedAdaptation<M: MassMatrix> {
    windows: Vec<AdaptationWindow>,
    num_tune: u64,
    options: EuclideanAdaptOptions,
    step_size_adapt: DualAverage,
    estimator: M::Estimator,
    current_window: usize,
    finalized: bool,
}

impl<M: MassMatrix> WindowedAdaptation<M> {
    pub(crate) fn new(
        options: EuclideanAdaptOptions,
        num_tune: u64,
        estimator: M::Estimator,
    ) -> Self {
        Self {
            windows: adaptation_windows(num_tune, &options.window_options),
            num_tune,
            step_size_adapt: DualAverage::new(
                options.dual_average_options.params,
                options.dual_average_options.initial_step,
            ),
            options,
            estimator,
            current_window: 0,
            finalized: false,
        }
    }

    pub(crate) fn windows(&self) -> &[AdaptationWindow] {
        &self.windows
    }

    pub(crate) fn is_tuning(&self, draw: u64) -> bool {
        draw < self.num_tune
    }

    /// Find an initial step size at the starting point of the chain and
    /// forget everything learned in a previous warmup.
    pub(crate) fn init<F, R>(
        &mut self,
        pool: &mut StatePool,
        potential: &mut EuclideanPotential<F, M>,
        state: &State,
        rng: &mut R,
    ) -> Result<()>
    where
        F: CpuLogpFunc,
        R: rand::Rng + ?Sized,
    {
        let step_size = find_reasonable_step_size(
            pool,
            potential,
            state,
            self.options.dual_average_options.initial_step,
            rng,
        )?;
        self.step_size_adapt.restart(step_size);
        self.estimator.reset();
        self.current_window = 0;
        self.finalized = false;
        Ok(())
    }

    /// Update the adaptation state after warmup draw `draw`.
    ///
    /// Does nothing after the warmup.
    pub(crate) fn adapt<F, R>(
        &mut self,
        pool: &mut StatePool,
        potential: &mut EuclideanPotential<F, M>,
        draw: u64,
        state: &State,
        collector: &AcceptanceRateCollector,
        rng: &mut R,
    ) -> Result<()>
    where
        F: CpuLogpFunc,
        R: rand::Rng + ?Sized,
    {
        if self.finalized || !self.is_tuning(draw) {
            return Ok(());
        }

        // A trajectory without leapfrog steps tells us nothing about the step size
        if collector.mean.count() > 0 {
            self.step_size_adapt.advance(
                collector.mean.current(),
                self.options.dual_average_options.target_accept,
            );
        }
        *potential.step_size_mut() = self.step_size_adapt.current_step_size();

        while self
            .windows
            .get(self.current_window)
            .is_some_and(|window| window.end <= draw)
        {
            self.current_window += 1;
        }
        let window = self.windows.get(self.current_window).copied();

        if let Some(window) = window.filter(|window| window.kind == WindowKind::Slow) {
            self.estimator.observe(&state.q);
            if draw + 1 == window.end {
                self.end_slow_window(pool, potential, state, rng)?;
            }
        }

        if draw + 1 == self.num_tune {
            *potential.step_size_mut() = self.step_size_adapt.current_step_size_adapted();
            self.finalized = true;
            log::debug!("Warmup finished with step size {}", potential.step_size());
        }
        Ok(())
    }

    fn end_slow_window<F, R>(
        &mut self,
        pool: &mut StatePool,
        potential: &mut EuclideanPotential<F, M>,
        state: &State,
        rng: &mut R,
    ) -> Result<()>
    where
        F: CpuLogpFunc,
        R: rand::Rng + ?Sized,
    {
        let count = self.estimator.count();
        let updated = potential
            .mass_matrix
            .update_from_estimator(&self.estimator, &self.options.mass_matrix_options);
        self.estimator.reset();

        let step_size = if updated && self.options.rerun_step_size_search {
            let current = potential.step_size();
            find_reasonable_step_size(pool, potential, state, current, rng)?
        } else {
            potential.step_size()
        };
        self.step_size_adapt.restart(step_size);
        *potential.step_size_mut() = step_size;

        log::debug!(
            "Slow adaptation window ended after {} draws, mass matrix updated: {}, step size {}",
            count,
            updated,
            step_size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::{
        mass_matrix::{DiagMassMatrix, InverseMassMatrix},
        nuts::{draw, test_logps::NormalLogp, NutsOptions},
    };

    fn assert_contiguous(windows: &[AdaptationWindow], num_tune: u64) {
        assert_eq!(windows.first().unwrap().start, 0);
        assert_eq!(windows.last().unwrap().end, num_tune);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!(windows.iter().all(|window| !window.is_empty()));
    }

    #[test]
    fn stan_default_windows() {
        let windows = adaptation_windows(1000, &WindowOptions::default());
        let bounds: Vec<(u64, u64)> = windows.iter().map(|w| (w.start, w.end)).collect();
        assert_eq!(
            bounds,
            vec![
                (0, 75),
                (75, 100),
                (100, 150),
                (150, 250),
                (250, 450),
                (450, 950),
                (950, 1000)
            ]
        );
        assert_eq!(windows[0].kind, WindowKind::Fast);
        assert!(windows[1..6].iter().all(|w| w.kind == WindowKind::Slow));
        assert_eq!(windows[6].kind, WindowKind::Fast);
    }

    #[test]
    fn short_warmup_uses_fractions() {
        let windows = adaptation_windows(100, &WindowOptions::default());
        assert_eq!(
            windows,
            vec![
                AdaptationWindow::new(0, 15, WindowKind::Fast),
                AdaptationWindow::new(15, 90, WindowKind::Slow),
                AdaptationWindow::new(90, 100, WindowKind::Fast),
            ]
        );
    }

    #[test]
    fn tiny_warmup_is_one_fast_window() {
        let windows = adaptation_windows(19, &WindowOptions::default());
        assert_eq!(windows, vec![AdaptationWindow::new(0, 19, WindowKind::Fast)]);
        assert!(adaptation_windows(0, &WindowOptions::default()).is_empty());
    }

    proptest! {
        #[test]
        fn windows_are_contiguous(
            num_tune in 1u64..5000,
            init_buffer in 0u64..200,
            term_buffer in 0u64..200,
            base_window in 1u64..100,
        ) {
            let options = WindowOptions { init_buffer, term_buffer, base_window };
            let windows = adaptation_windows(num_tune, &options);
            assert_contiguous(&windows, num_tune);

            let slow: Vec<_> = windows.iter().filter(|w| w.kind == WindowKind::Slow).collect();
            // Slow windows double, the last one also takes the rest
            for (i, pair) in slow.windows(2).enumerate() {
                prop_assert!(pair[1].len() >= 2 * pair[0].len());
                if i + 2 < slow.len() {
                    prop_assert_eq!(pair[1].len(), 2 * pair[0].len());
                }
            }
        }
    }

    #[test]
    fn adaptation_updates_mass_matrix_and_freezes() {
        let dim = 3;
        let logp = NormalLogp {
            dim,
            mu: 1.,
            sigma: 3.,
        };
        let mut potential =
            EuclideanPotential::new(logp, DiagMassMatrix::new(dim), 1000., 0.1);
        let mut pool = StatePool::new(dim, 16);
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let num_tune = 300;
        let mut adapt: WindowedAdaptation<DiagMassMatrix> = WindowedAdaptation::new(
            EuclideanAdaptOptions::default(),
            num_tune,
            potential.mass_matrix.new_estimator(dim),
        );

        let mut state = potential.init_state(&mut pool, &[0., 0., 0.]).unwrap();
        adapt.init(&mut pool, &mut potential, &state, &mut rng).unwrap();

        let options = NutsOptions::default();
        for i in 0..num_tune {
            let mut collector = AcceptanceRateCollector::new();
            let (next, _) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut potential,
                &options,
                &mut collector,
            )
            .unwrap();
            state = next;
            adapt
                .adapt(&mut pool, &mut potential, i, &state, &collector, &mut rng)
                .unwrap();
        }

        let InverseMassMatrix::Diag(variance) = potential.mass_matrix.inverse_mass_matrix() else {
            panic!("Expected a diagonal mass matrix");
        };
        // The posterior variance is 9
        for var in variance.iter() {
            assert!(*var > 3. && *var < 20., "variance estimate {}", var);
        }

        let step_size = potential.step_size();
        assert!(step_size > 0.3);
        let collector = AcceptanceRateCollector::new();
        adapt
            .adapt(&mut pool, &mut potential, num_tune, &state, &collector, &mut rng)
            .unwrap();
        assert_eq!(potential.step_size(), step_size);
        assert!(!adapt.is_tuning(num_tune));
    }
}
