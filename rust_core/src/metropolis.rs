//! Adaptive random-walk Metropolis, one step method per stochastic block.
//!
//! Each block proposes all of its components at once from a normal centred
//! on the current (unconstrained) value. Scalar blocks draw from
//! `proposal_sd`. Blocks with several parameters start the same way, and
//! once the first tuning interval of burn-in has passed they switch to a
//! proposal covariance estimated from their own history and scaled by
//! `2.38² / d`, so correlated components move together. A block-wide
//! `adaptive_scale_factor` is retuned from the acceptance rate on top of
//! either proposal. Adaptation stops at the end of burn-in, so the kept
//! draws come from a fixed kernel.

use crate::autodiff::{eval_logp, trace_values};
use crate::graph::{Block, Graph};
use crate::hmc::{is_recorded, ChainResult};
use crate::progress::ChainProgress;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::ops::Range;

/// Draws per block dimension needed before a covariance is estimated.
const MIN_HISTORY_PER_DIM: usize = 20;

/// Relative ridge added to the diagonal of an estimated covariance.
const COV_RIDGE: f64 = 1e-6;

/// Configuration for the Metropolis sampler.
#[derive(Debug, Clone)]
pub struct MetropolisConfig {
    /// Total iterations, burn-in included.
    pub iterations: usize,
    pub burn: usize,
    pub thin: usize,
    /// Iterations between two proposal tunings during burn-in. The first
    /// interval is also the delay before block history is recorded.
    pub tune_interval: usize,
}

impl Default for MetropolisConfig {
    fn default() -> Self {
        Self {
            iterations: 20000,
            burn: 5000,
            thin: 2,
            tune_interval: 1000,
        }
    }
}

/// Running mean and covariance of a block's values (Welford).
#[derive(Debug, Clone)]
struct RunningCovariance {
    count: usize,
    mean: Vec<f64>,
    /// Row-major sums of co-deviations.
    m2: Vec<f64>,
}

impl RunningCovariance {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim * dim],
        }
    }

    fn push(&mut self, x: &[f64]) {
        let d = self.mean.len();
        self.count += 1;
        let n = self.count as f64;
        let before: Vec<f64> = x.iter().zip(&self.mean).map(|(v, m)| v - m).collect();
        for (m, delta) in self.mean.iter_mut().zip(&before) {
            *m += delta / n;
        }
        for i in 0..d {
            for j in 0..d {
                self.m2[i * d + j] += before[i] * (x[j] - self.mean[j]);
            }
        }
    }

    fn covariance(&self) -> Option<Vec<f64>> {
        (self.count >= 2).then(|| {
            let denom = (self.count - 1) as f64;
            self.m2.iter().map(|v| v / denom).collect()
        })
    }
}

/// Lower Cholesky factor of a row-major `dim × dim` matrix, `None` unless
/// the matrix is positive definite.
fn cholesky_lower(matrix: &[f64], dim: usize) -> Option<Vec<f64>> {
    let mut lower = vec![0.0; dim * dim];
    for row in 0..dim {
        for col in 0..=row {
            let mut sum = matrix[row * dim + col];
            for k in 0..col {
                sum -= lower[row * dim + k] * lower[col * dim + k];
            }
            if row == col {
                if !(sum > 0.0) {
                    return None;
                }
                lower[row * dim + col] = sum.sqrt();
            } else {
                lower[row * dim + col] = sum / lower[col * dim + col];
            }
        }
    }
    Some(lower)
}

/// Metropolis step method owning one block of parameters.
#[derive(Debug, Clone)]
pub struct StepMethod {
    pub name: String,
    pub params: Range<usize>,
    pub proposal_sd: Vec<f64>,
    pub adaptive_scale_factor: f64,
    /// Row-major lower Cholesky factor of the adapted proposal covariance.
    pub proposal_chol: Option<Vec<f64>>,
    history: RunningCovariance,
    accepted: u64,
    rejected: u64,
    total_accepted: u64,
    total_rejected: u64,
}

impl StepMethod {
    /// Proposal widths start at the magnitude of the initial value, or 1
    /// where the initial value is zero.
    pub fn new(block: &Block, init: &[f64]) -> Self {
        let proposal_sd = init[block.params.clone()]
            .iter()
            .map(|v| if *v == 0.0 { 1.0 } else { v.abs() })
            .collect();
        Self {
            name: block.name.clone(),
            params: block.params.clone(),
            proposal_sd,
            adaptive_scale_factor: 1.0,
            proposal_chol: None,
            history: RunningCovariance::new(block.params.len()),
            accepted: 0,
            rejected: 0,
            total_accepted: 0,
            total_rejected: 0,
        }
    }

    fn dim(&self) -> usize {
        self.params.len()
    }

    /// Propose a new value for this block and accept or reject it.
    /// `logp` is the current joint log density and is updated on acceptance.
    pub fn step(
        &mut self,
        graph: &Graph,
        q: &mut Vec<f64>,
        logp: &mut f64,
        rng: &mut ChaCha8Rng,
    ) -> bool {
        let d = self.dim();
        let z: Vec<f64> = (0..d).map(|_| StandardNormal.sample(rng)).collect();

        let mut proposal = q.clone();
        for (row, i) in self.params.clone().enumerate() {
            let delta = match &self.proposal_chol {
                Some(lower) => (0..=row).map(|k| lower[row * d + k] * z[k]).sum::<f64>(),
                None => self.proposal_sd[row] * z[row],
            };
            proposal[i] += delta * self.adaptive_scale_factor;
        }

        let logp_prop = eval_logp(graph, &proposal);
        let log_ratio = logp_prop - *logp;
        let accept = log_ratio.is_finite() && rng.gen::<f64>().ln() < log_ratio;

        if accept {
            *q = proposal;
            *logp = logp_prop;
            self.accepted += 1;
            self.total_accepted += 1;
        } else {
            self.rejected += 1;
            self.total_rejected += 1;
        }
        accept
    }

    /// Record the block's current value for covariance estimation.
    /// Scalar blocks keep no history.
    pub fn observe(&mut self, q: &[f64]) {
        if self.dim() > 1 {
            self.history.push(&q[self.params.clone()]);
        }
    }

    /// Acceptance rate since the last tuning.
    pub fn recent_accept_rate(&self) -> Option<f64> {
        let n = self.accepted + self.rejected;
        (n > 0).then(|| self.accepted as f64 / n as f64)
    }

    pub fn accept_rate(&self) -> f64 {
        let n = self.total_accepted + self.total_rejected;
        if n == 0 {
            0.0
        } else {
            self.total_accepted as f64 / n as f64
        }
    }

    /// Re-estimate the proposal covariance from the recorded history.
    /// Returns whether a new factor was installed.
    fn adapt_covariance(&mut self) -> bool {
        let d = self.dim();
        if d < 2 || self.history.count < MIN_HISTORY_PER_DIM * d {
            return false;
        }
        let Some(mut cov) = self.history.covariance() else {
            return false;
        };
        let scale = 2.38 * 2.38 / d as f64;
        for v in cov.iter_mut() {
            *v *= scale;
        }
        for i in 0..d {
            cov[i * d + i] += COV_RIDGE * cov[i * d + i].abs() + f64::MIN_POSITIVE;
        }
        match cholesky_lower(&cov, d) {
            Some(lower) => {
                self.proposal_chol = Some(lower);
                true
            }
            None => false,
        }
    }

    /// Rescale the proposal from the acceptance rate since the last call,
    /// and refresh the proposal covariance of multi-parameter blocks.
    /// Returns whether the proposal changed. Counters are reset either way.
    pub fn tune(&mut self) -> bool {
        let Some(rate) = self.recent_accept_rate() else {
            return false;
        };
        self.accepted = 0;
        self.rejected = 0;

        let first_covariance = self.proposal_chol.is_none();
        let adapted = self.adapt_covariance();
        if adapted && first_covariance {
            // the old scale was fitted to the diagonal proposal
            self.adaptive_scale_factor = 1.0;
            tracing::debug!(block = %self.name, accept_rate = rate, "switched to adapted covariance");
            return true;
        }

        let factor = scale_adjustment(rate);
        if factor != 1.0 {
            self.adaptive_scale_factor *= factor;
        }
        if adapted || factor != 1.0 {
            tracing::debug!(
                block = %self.name,
                accept_rate = rate,
                scale = self.adaptive_scale_factor,
                "tuned proposal"
            );
        }
        adapted || factor != 1.0
    }
}

/// Multiplier applied to the proposal scale for a given acceptance rate.
pub fn scale_adjustment(accept_rate: f64) -> f64 {
    if accept_rate < 0.001 {
        0.1
    } else if accept_rate < 0.05 {
        0.5
    } else if accept_rate < 0.2 {
        0.9
    } else if accept_rate > 0.95 {
        10.0
    } else if accept_rate > 0.75 {
        2.0
    } else if accept_rate > 0.5 {
        1.1
    } else {
        1.0
    }
}

/// Run a single Metropolis chain, sweeping every block once per iteration.
pub fn run_chain(
    graph: &Graph,
    config: &MetropolisConfig,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
    progress: Option<ChainProgress<'_>>,
) -> ChainResult {
    let mut q = init.unwrap_or_else(|| graph.initial_values());
    let mut logp = eval_logp(graph, &q);
    let mut steps: Vec<StepMethod> = graph.blocks.iter().map(|b| StepMethod::new(b, &q)).collect();

    let kept = config.iterations.saturating_sub(config.burn).div_ceil(config.thin);
    let mut samples = Vec::with_capacity(kept);

    for iter in 0..config.iterations {
        let mut moved = 0;
        for step in steps.iter_mut() {
            if step.step(graph, &mut q, &mut logp, rng) {
                moved += 1;
            }
        }

        if iter < config.burn {
            if iter >= config.tune_interval {
                for step in steps.iter_mut() {
                    step.observe(&q);
                }
            }
            if (iter + 1) % config.tune_interval == 0 {
                for step in steps.iter_mut() {
                    step.tune();
                }
            }
        }

        if is_recorded(iter, config.burn, config.thin) {
            samples.push(trace_values(graph, &q));
        }

        if let Some(progress) = progress {
            progress.iteration(moved, steps.len() as u64);
        }
    }

    let (accepted, total) = steps.iter().fold((0u64, 0u64), |(a, t), s| {
        (
            a + s.total_accepted,
            t + s.total_accepted + s.total_rejected,
        )
    });

    ChainResult {
        samples,
        accept_rate: if total > 0 {
            accepted as f64 / total as f64
        } else {
            0.0
        },
        divergences: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use rand::SeedableRng;

    #[test]
    fn test_scale_adjustment_rules() {
        assert_eq!(scale_adjustment(0.0), 0.1);
        assert_eq!(scale_adjustment(0.01), 0.5);
        assert_eq!(scale_adjustment(0.1), 0.9);
        assert_eq!(scale_adjustment(0.3), 1.0);
        assert_eq!(scale_adjustment(0.6), 1.1);
        assert_eq!(scale_adjustment(0.8), 2.0);
        assert_eq!(scale_adjustment(0.99), 10.0);
    }

    #[test]
    fn test_initial_proposal_sd() {
        let block = Block {
            name: "z".to_string(),
            params: 1..3,
        };
        let step = StepMethod::new(&block, &[5.0, 0.0, -2.5]);
        assert_eq!(step.proposal_sd, vec![1.0, 2.5]);
        assert_eq!(step.adaptive_scale_factor, 1.0);
    }

    #[test]
    fn test_tune_resets_counters() {
        let block = Block {
            name: "x".to_string(),
            params: 0..1,
        };
        let mut step = StepMethod::new(&block, &[0.0]);
        assert!(!step.tune());

        step.accepted = 99;
        step.rejected = 1;
        assert!(step.tune());
        assert_eq!(step.adaptive_scale_factor, 10.0);
        assert_eq!(step.recent_accept_rate(), None);
    }

    #[test]
    fn test_thinning_and_burn_in() {
        let mut g = Graph::new();
        Normal::prior(&mut g, "x", 0.0, 1.0).unwrap();
        let config = MetropolisConfig {
            iterations: 100,
            burn: 20,
            thin: 3,
            tune_interval: 10,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = run_chain(&g, &config, &mut rng, None, None);
        assert_eq!(result.samples.len(), 27);
    }

    #[test]
    fn test_recovers_normal_posterior() {
        let mut g = Graph::new();
        Normal::prior(&mut g, "x", 3.0, 2.0).unwrap();
        let config = MetropolisConfig {
            iterations: 20000,
            burn: 5000,
            thin: 2,
            tune_interval: 1000,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let result = run_chain(&g, &config, &mut rng, None, None);

        assert_eq!(result.samples.len(), 7500);
        let n = result.samples.len() as f64;
        let mean = result.samples.iter().map(|d| d[0]).sum::<f64>() / n;
        let var = result
            .samples
            .iter()
            .map(|d| (d[0] - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        assert!((mean - 3.0).abs() < 0.25, "mean = {}", mean);
        assert!((var.sqrt() - 2.0).abs() < 0.3, "sd = {}", var.sqrt());
        assert!(result.accept_rate > 0.1 && result.accept_rate < 0.9);
    }

    #[test]
    fn test_running_covariance() {
        let mut acc = RunningCovariance::new(2);
        for x in [[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0]] {
            acc.push(&x);
        }
        assert_eq!(acc.count, 4);
        let cov = acc.covariance().unwrap();
        let var = 5.0 / 3.0;
        let expected = [var, 2.0 * var, 2.0 * var, 4.0 * var];
        for (got, want) in cov.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{:?}", cov);
        }
    }

    #[test]
    fn test_cholesky_lower() {
        let lower = cholesky_lower(&[4.0, 2.0, 2.0, 3.0], 2).unwrap();
        assert_eq!(lower, vec![2.0, 0.0, 1.0, 2.0f64.sqrt()]);
        assert!(cholesky_lower(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
    }

    #[test]
    fn test_tune_installs_block_covariance() {
        let block = Block {
            name: "theta".to_string(),
            params: 0..2,
        };
        let mut step = StepMethod::new(&block, &[0.0, 0.0]);
        step.adaptive_scale_factor = 0.05;

        // too little history: only the scale moves
        step.observe(&[0.0, 0.0]);
        step.accepted = 1;
        step.rejected = 99;
        assert!(step.tune());
        assert!(step.proposal_chol.is_none());
        assert!((step.adaptive_scale_factor - 0.025).abs() < 1e-12);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..200 {
            let a: f64 = StandardNormal.sample(&mut rng);
            let b: f64 = StandardNormal.sample(&mut rng);
            step.observe(&[a, -a + 0.1 * b]);
        }
        step.accepted = 1;
        step.rejected = 99;
        assert!(step.tune());
        assert_eq!(step.adaptive_scale_factor, 1.0);

        // the factor follows the history's strong negative correlation
        let l = step.proposal_chol.clone().unwrap();
        let cov_01 = l[2] * l[0];
        let var_0 = l[0] * l[0];
        let var_1 = l[2] * l[2] + l[3] * l[3];
        let corr = cov_01 / (var_0 * var_1).sqrt();
        assert!(corr < -0.95, "corr = {}", corr);
        assert!((var_0 / (2.38 * 2.38 / 2.0) - 1.0).abs() < 0.3, "var = {}", var_0);

        // later tunings keep the covariance and rescale from acceptance
        step.accepted = 99;
        step.rejected = 1;
        assert!(step.tune());
        assert_eq!(step.adaptive_scale_factor, 10.0);
    }

    #[test]
    fn test_scalar_block_keeps_no_history() {
        let block = Block {
            name: "x".to_string(),
            params: 1..2,
        };
        let mut step = StepMethod::new(&block, &[0.0, 1.0]);
        step.observe(&[0.0, 1.0]);
        assert_eq!(step.history.count, 0);
    }

    /// y | x ~ N(0.9 x, 0.3²) with x ~ N(0, 1): correlation about 0.95.
    fn correlated_pair() -> Graph {
        let mut g = Graph::new();
        g.begin_block("xy");
        let x = g.add_param("x");
        let y = g.add_param("y");
        g.end_block();
        let zero = g.add_constant(0.0);
        let one = g.add_constant(1.0);
        g.normal_logp(x, zero, one);
        let slope = g.add_constant(0.9);
        let mean_y = g.mul(slope, x);
        let sd_y = g.add_constant(0.3);
        g.normal_logp(y, mean_y, sd_y);
        g
    }

    #[test]
    fn test_mixes_along_correlated_ridge() {
        let g = correlated_pair();
        assert_eq!(g.blocks.len(), 1);
        let config = MetropolisConfig::default();

        for seed in [42, 103, 109] {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let result = run_chain(&g, &config, &mut rng, None, None);
            let n = result.samples.len() as f64;
            let mean = |k: usize| result.samples.iter().map(|d| d[k]).sum::<f64>() / n;
            let (mx, my) = (mean(0), mean(1));
            let var = |k: usize, m: f64| {
                result.samples.iter().map(|d| (d[k] - m).powi(2)).sum::<f64>() / (n - 1.0)
            };
            let (sx, sy) = (var(0, mx).sqrt(), var(1, my).sqrt());
            let cov = result
                .samples
                .iter()
                .map(|d| (d[0] - mx) * (d[1] - my))
                .sum::<f64>()
                / (n - 1.0);

            assert!(mx.abs() < 0.2, "seed {}: mean x = {}", seed, mx);
            assert!((sx - 1.0).abs() < 0.15, "seed {}: sd x = {}", seed, sx);
            assert!((sy - 0.9487).abs() < 0.15, "seed {}: sd y = {}", seed, sy);
            assert!(cov / (sx * sy) > 0.9, "seed {}: corr = {}", seed, cov / (sx * sy));
            assert!(result.accept_rate > 0.1 && result.accept_rate < 0.75);
        }
    }
}
