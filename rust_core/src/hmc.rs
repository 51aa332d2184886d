use crate::autodiff::{grad_logp, trace_values};
use crate::graph::Graph;
use crate::progress::ChainProgress;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Energy error above which a transition is counted as divergent.
const MAX_DELTA_H: f64 = 1000.0;

/// Draws a metric window needs before its variances are used.
const MIN_WINDOW: usize = 10;

/// Configuration for the HMC sampler.
#[derive(Debug, Clone)]
pub struct HmcConfig {
    /// Initial step size; 0 picks one with the doubling heuristic.
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    pub iterations: usize,
    pub burn: usize,
    pub thin: usize,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            num_leapfrog_steps: 15,
            iterations: 1500,
            burn: 500,
            thin: 1,
        }
    }
}

/// Result of a single chain run, shared by all samplers.
#[derive(Debug, Clone)]
pub struct ChainResult {
    /// samples[draw][traced node], natural scale.
    pub samples: Vec<Vec<f64>>,
    pub accept_rate: f64,
    pub divergences: usize,
}

/// Whether iteration `iter` is kept given burn-in and thinning.
pub(crate) fn is_recorded(iter: usize, burn: usize, thin: usize) -> bool {
    iter >= burn && (iter - burn) % thin == 0
}

struct Trajectory {
    q: Vec<f64>,
    p: Vec<f64>,
    logp: f64,
}

/// Leapfrog integration under a diagonal metric. `inv_metric[i]` is the
/// variance estimate for parameter `i`, so position moves by
/// `step_size * inv_metric[i] * p[i]`.
fn leapfrog(
    graph: &Graph,
    q: &[f64],
    p: &[f64],
    grad: &[f64],
    inv_metric: &[f64],
    step_size: f64,
    num_steps: usize,
) -> Trajectory {
    let dim = q.len();
    let mut q_prop = q.to_vec();
    let mut p_prop = p.to_vec();
    let mut grad = grad.to_vec();
    let mut logp = f64::NEG_INFINITY;

    // Half step for momentum
    for i in 0..dim {
        p_prop[i] += 0.5 * step_size * grad[i];
    }

    for step in 0..num_steps {
        for i in 0..dim {
            q_prop[i] += step_size * inv_metric[i] * p_prop[i];
        }

        let (new_logp, new_grad) = grad_logp(graph, &q_prop);
        logp = new_logp;
        grad = new_grad;
        if !logp.is_finite() {
            break;
        }

        // Full step for momentum (except at end)
        if step < num_steps - 1 {
            for i in 0..dim {
                p_prop[i] += step_size * grad[i];
            }
        }
    }

    for i in 0..dim {
        p_prop[i] += 0.5 * step_size * grad[i];
    }

    Trajectory {
        q: q_prop,
        p: p_prop,
        logp,
    }
}

fn kinetic(p: &[f64], inv_metric: &[f64]) -> f64 {
    p.iter()
        .zip(inv_metric)
        .map(|(pi, v)| 0.5 * v * pi * pi)
        .sum()
}

/// Momentum drawn from N(0, M) with M = diag(1 / inv_metric).
fn sample_momentum(inv_metric: &[f64], rng: &mut ChaCha8Rng) -> Vec<f64> {
    inv_metric
        .iter()
        .map(|v| {
            let z: f64 = StandardNormal.sample(rng);
            z / v.sqrt()
        })
        .collect()
}

/// Double or halve a unit step until a single leapfrog step crosses an
/// acceptance probability of one half.
fn find_initial_step_size(
    graph: &Graph,
    q: &[f64],
    inv_metric: &[f64],
    rng: &mut ChaCha8Rng,
) -> f64 {
    let (logp0, grad0) = grad_logp(graph, q);
    let p0 = sample_momentum(inv_metric, rng);
    let h0 = -logp0 + kinetic(&p0, inv_metric);
    let threshold = 0.5f64.ln();

    let mut eps = 1.0;
    let first = leapfrog(graph, q, &p0, &grad0, inv_metric, eps, 1);
    let direction = if h0 - (-first.logp + kinetic(&first.p, inv_metric)) > threshold {
        1.0
    } else {
        -1.0
    };

    for _ in 0..50 {
        let t = leapfrog(graph, q, &p0, &grad0, inv_metric, eps, 1);
        let lr = h0 - (-t.logp + kinetic(&t.p, inv_metric));
        if !lr.is_finite() {
            eps *= 0.5;
            if direction > 0.0 {
                break;
            }
            continue;
        }
        if direction > 0.0 && lr < threshold {
            break;
        }
        if direction < 0.0 && lr > threshold {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}

/// Nesterov dual averaging of log step size toward a target acceptance.
struct DualAveraging {
    mu: f64,
    log_eps_bar: f64,
    h_bar: f64,
    count: u64,
}

impl DualAveraging {
    const TARGET_ACCEPT: f64 = 0.65;
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(step_size: f64) -> Self {
        Self {
            mu: (10.0 * step_size).ln(),
            log_eps_bar: step_size.ln(),
            h_bar: 0.0,
            count: 0,
        }
    }

    /// Feed one acceptance probability; returns the next step size.
    fn update(&mut self, accept_prob: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (Self::TARGET_ACCEPT - accept_prob);
        let log_eps = self.mu - (m.sqrt() / Self::GAMMA) * self.h_bar;
        let m_pow = m.powf(-Self::KAPPA);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        log_eps.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Per-parameter running variance over one metric window (Welford).
struct VarianceWindow {
    count: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl VarianceWindow {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn push(&mut self, q: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for (i, &x) in q.iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    /// Sample variances shrunk toward 1e-3, as Stan regularizes its metric.
    fn regularized_variance(&self) -> Option<Vec<f64>> {
        if self.count < MIN_WINDOW {
            return None;
        }
        let n = self.count as f64;
        Some(
            self.m2
                .iter()
                .map(|m2| {
                    let var = m2 / (n - 1.0);
                    (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
                })
                .collect(),
        )
    }
}

/// Leapfrog step count for one iteration, uniform on `[L/2, 3L/2]`.
fn jittered_steps(num_steps: usize, rng: &mut ChaCha8Rng) -> usize {
    let low = num_steps.div_ceil(2).max(1);
    let high = (num_steps + num_steps / 2).max(low);
    rng.gen_range(low..=high)
}

/// Run a single HMC chain.
///
/// The graph is taken by shared reference and is read-only during sampling.
/// Each chain gets its own RNG for reproducibility. Burn-in is split the way
/// Stan's windowed adaptation does it:
///   0-15%: step size only, unit metric
///   15-40% and 40-90%: draws collected, diagonal metric set from their
///     variances at the end of each window
///   90-100%: step size only, under the final metric
/// Both the metric and the step size are frozen afterwards.
pub fn run_chain(
    graph: &Graph,
    config: &HmcConfig,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
    progress: Option<ChainProgress<'_>>,
) -> ChainResult {
    let dim = graph.param_count;
    let mut q = init.unwrap_or_else(|| graph.initial_values());
    let kept = config.iterations.saturating_sub(config.burn).div_ceil(config.thin);

    let mut samples = Vec::with_capacity(kept);
    let mut accepted = 0u64;
    let mut total = 0u64;
    let mut divergences = 0usize;

    let mut inv_metric = vec![1.0f64; dim];
    let window_start = config.burn * 15 / 100;
    let window_ends = [config.burn * 40 / 100, config.burn * 90 / 100];
    let mut window = VarianceWindow::new(dim);

    let mut step_size = if config.step_size > 0.0 {
        config.step_size
    } else {
        find_initial_step_size(graph, &q, &inv_metric, rng)
    };
    let mut adaptation = DualAveraging::new(step_size);

    let (mut logp_current, mut grad_current) = grad_logp(graph, &q);

    for iter in 0..config.iterations {
        let is_warmup = iter < config.burn;

        let p = sample_momentum(&inv_metric, rng);
        let num_steps = jittered_steps(config.num_leapfrog_steps, rng);
        let prop = leapfrog(
            graph,
            &q,
            &p,
            &grad_current,
            &inv_metric,
            step_size,
            num_steps,
        );

        let h_current = -logp_current + kinetic(&p, &inv_metric);
        let h_prop = -prop.logp + kinetic(&prop.p, &inv_metric);
        let log_accept_ratio = h_current - h_prop;
        let accept_prob = if log_accept_ratio.is_finite() {
            log_accept_ratio.min(0.0).exp()
        } else {
            0.0
        };

        if !log_accept_ratio.is_finite() || -log_accept_ratio > MAX_DELTA_H {
            divergences += 1;
            if let Some(progress) = progress {
                progress.divergence();
            }
        }

        total += 1;
        let accept = log_accept_ratio.is_finite() && rng.gen::<f64>().ln() < log_accept_ratio;
        if accept {
            q = prop.q;
            let (logp, grad) = grad_logp(graph, &q);
            logp_current = logp;
            grad_current = grad;
            accepted += 1;
        }

        if is_warmup {
            step_size = adaptation.update(accept_prob);

            if iter >= window_start && iter < window_ends[1] {
                window.push(&q);
            }
            if window_ends.contains(&(iter + 1)) {
                if let Some(var) = window.regularized_variance() {
                    inv_metric = var;
                    step_size = find_initial_step_size(graph, &q, &inv_metric, rng);
                    adaptation = DualAveraging::new(step_size);
                    tracing::debug!(iter, step_size, "hmc metric adapted");
                }
                window = VarianceWindow::new(dim);
            }

            if iter + 1 == config.burn {
                step_size = adaptation.final_step_size();
                tracing::debug!(step_size, "hmc step size adapted");
            }
        }

        if is_recorded(iter, config.burn, config.thin) {
            samples.push(trace_values(graph, &q));
        }

        if let Some(progress) = progress {
            progress.iteration(accept as u64, 1);
        }
    }

    ChainResult {
        samples,
        accept_rate: if total > 0 {
            accepted as f64 / total as f64
        } else {
            0.0
        },
        divergences,
    }
}
