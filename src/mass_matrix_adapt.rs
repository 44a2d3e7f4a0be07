use faer::Mat;
use itertools::izip;

/// Settings for mass matrix adaptation
///
/// The estimate from `n` draws is shrunk towards `target` as if
/// `prior_count` extra draws with that variance had been observed.
#[derive(Clone, Copy, Debug)]
pub struct MassMatrixAdaptOptions {
    pub prior_count: f64,
    pub target: f64,
}

impl Default for MassMatrixAdaptOptions {
    fn default() -> Self {
        Self {
            prior_count: 5.,
            target: 5e-3,
        }
    }
}

impl MassMatrixAdaptOptions {
    fn weights(&self, count: u64) -> (f64, f64) {
        let n = count as f64;
        let scale = n / (n + self.prior_count);
        let shift = self.target * (self.prior_count / (n + self.prior_count));
        (scale, shift)
    }
}

/// An online estimator for the posterior covariance.
pub(crate) trait MassMatrixEstimator: Send {
    fn observe(&mut self, position: &[f64]);
    fn count(&self) -> u64;
    fn reset(&mut self);
}

/// Welford's algorithm for the elementwise variance.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// The unbiased sample variance, `None` with fewer than two draws.
    pub(crate) fn sample_variance(&self) -> Option<Box<[f64]>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count - 1) as f64;
        Some(self.m2.iter().map(|m2| m2 / denom).collect())
    }

    /// The regularized variance estimate.
    pub(crate) fn current(&self, options: &MassMatrixAdaptOptions) -> Option<Box<[f64]>> {
        let (scale, shift) = options.weights(self.count);
        let mut variance = self.sample_variance()?;
        variance
            .iter_mut()
            .for_each(|var| *var = scale * *var + shift);
        Some(variance)
    }
}

impl MassMatrixEstimator for RunningVariance {
    fn observe(&mut self, position: &[f64]) {
        assert!(position.len() == self.mean.len());
        self.count += 1;
        let n = self.count as f64;
        izip!(self.mean.iter_mut(), self.m2.iter_mut(), position).for_each(|(mean, m2, &x)| {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        });
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

/// Welford's algorithm for the full covariance matrix.
#[derive(Debug, Clone)]
pub(crate) struct RunningCovariance {
    dim: usize,
    mean: Box<[f64]>,
    /// Row-major sum of outer products of deviations
    m2: Box<[f64]>,
    delta: Box<[f64]>,
    count: u64,
}

impl RunningCovariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            dim,
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim * dim].into(),
            delta: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// The unbiased sample covariance, `None` with fewer than two draws.
    pub(crate) fn sample_covariance(&self) -> Option<Mat<f64>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count - 1) as f64;
        let n = self.dim;
        Some(Mat::from_fn(n, n, |i, j| {
            (self.m2[i * n + j] + self.m2[j * n + i]) / (2. * denom)
        }))
    }

    /// The regularized covariance estimate.
    ///
    /// Off-diagonal entries are only shrunk, the diagonal is also pulled
    /// towards the target.
    pub(crate) fn current(&self, options: &MassMatrixAdaptOptions) -> Option<Mat<f64>> {
        let (scale, shift) = options.weights(self.count);
        let cov = self.sample_covariance()?;
        let n = self.dim;
        Some(Mat::from_fn(n, n, |i, j| {
            let val = scale * cov[(i, j)];
            if i == j {
                val + shift
            } else {
                val
            }
        }))
    }
}

impl MassMatrixEstimator for RunningCovariance {
    fn observe(&mut self, position: &[f64]) {
        assert!(position.len() == self.dim);
        self.count += 1;
        let n = self.count as f64;
        izip!(self.delta.iter_mut(), self.mean.iter_mut(), position).for_each(
            |(delta, mean, &x)| {
                *delta = x - *mean;
                *mean += *delta / n;
            },
        );
        for (row, delta) in self.m2.chunks_exact_mut(self.dim).zip(self.delta.iter()) {
            izip!(row, position, self.mean.iter())
                .for_each(|(m2, &x, mean)| *m2 += delta * (x - mean));
        }
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}
