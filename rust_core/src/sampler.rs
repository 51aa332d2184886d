use crate::autodiff::eval_logp;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::hmc::{self, ChainResult, HmcConfig};
use crate::metropolis::{self, MetropolisConfig};
use crate::progress::{spawn_progress_thread, ProgressState};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which transition kernel drives the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    #[default]
    Metropolis,
    Hmc,
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerKind::Metropolis => f.write_str("metropolis"),
            SamplerKind::Hmc => f.write_str("hmc"),
        }
    }
}

/// Configuration for the multi-chain sampler.
///
/// The defaults reproduce `sample(iter=20000, burn=5000, thin=2)` on a
/// single chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    pub kind: SamplerKind,
    pub num_chains: usize,
    /// Total iterations per chain, burn-in included.
    pub iterations: usize,
    pub burn: usize,
    pub thin: usize,
    /// Metropolis only: iterations between proposal tunings during burn-in.
    pub tune_interval: usize,
    /// HMC only: initial step size, 0 to search for one.
    pub step_size: f64,
    /// HMC only.
    pub num_leapfrog_steps: usize,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
    /// Render a progress bar on stderr while sampling.
    pub progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: SamplerKind::Metropolis,
            num_chains: 1,
            iterations: 20000,
            burn: 5000,
            thin: 2,
            tune_interval: 1000,
            step_size: 0.0,
            num_leapfrog_steps: 15,
            seed: 42,
            num_threads: 0,
            progress: false,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            return Err(Error::InvalidConfig("num_chains must be at least 1".into()));
        }
        if self.thin == 0 {
            return Err(Error::InvalidConfig("thin must be at least 1".into()));
        }
        if self.iterations <= self.burn {
            return Err(Error::InvalidConfig(format!(
                "iterations ({}) must exceed burn ({})",
                self.iterations, self.burn
            )));
        }
        if self.tune_interval == 0 {
            return Err(Error::InvalidConfig("tune_interval must be at least 1".into()));
        }
        if self.num_leapfrog_steps == 0 {
            return Err(Error::InvalidConfig(
                "num_leapfrog_steps must be at least 1".into(),
            ));
        }
        if !(self.step_size >= 0.0 && self.step_size.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "step_size must be a non-negative number, got {}",
                self.step_size
            )));
        }
        Ok(())
    }

    /// Draws kept per chain after burn-in and thinning.
    pub fn draws_per_chain(&self) -> usize {
        self.iterations.saturating_sub(self.burn).div_ceil(self.thin.max(1))
    }
}

/// Result of sampling across all chains.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// samples[chain][draw][node], natural scale, in `trace_names` order.
    pub samples: Vec<Vec<Vec<f64>>>,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
    pub trace_names: Vec<String>,
}

impl SampleResult {
    /// Get posterior mean for each traced node.
    pub fn mean(&self) -> Vec<f64> {
        let n_nodes = self.trace_names.len();
        let mut sums = vec![0.0; n_nodes];
        let mut count = 0usize;

        for chain in &self.samples {
            for draw in chain {
                for (i, v) in draw.iter().enumerate() {
                    sums[i] += v;
                }
                count += 1;
            }
        }

        sums.iter().map(|s| s / count as f64).collect()
    }

    /// Get posterior standard deviation for each traced node.
    pub fn std(&self) -> Vec<f64> {
        let means = self.mean();
        let n_nodes = self.trace_names.len();
        let mut sum_sq = vec![0.0; n_nodes];
        let mut count = 0usize;

        for chain in &self.samples {
            for draw in chain {
                for (i, v) in draw.iter().enumerate() {
                    let diff = v - means[i];
                    sum_sq[i] += diff * diff;
                }
                count += 1;
            }
        }

        sum_sq.iter().map(|s| (s / count as f64).sqrt()).collect()
    }

    /// All draws of one node, chains concatenated.
    pub fn trace(&self, name: &str) -> Result<Vec<f64>> {
        let idx = self
            .trace_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        Ok(self
            .samples
            .iter()
            .flat_map(|chain| chain.iter().map(move |draw| draw[idx]))
            .collect())
    }
}

/// Seed of chain `chain`: the base seed offset by the chain index, wrapping
/// past `u64::MAX`.
pub fn chain_seed(seed: u64, chain: usize) -> u64 {
    seed.wrapping_add(chain as u64)
}

/// Run parallel chains on the given graph.
///
/// The graph is shared read-only across all chains. Each chain gets a
/// deterministic RNG seeded from [`chain_seed`], so results are reproducible
/// regardless of thread scheduling.
pub fn sample(graph: &Graph, config: &SamplerConfig) -> Result<SampleResult> {
    config.validate()?;

    let init = graph.initial_values();
    let logp0 = eval_logp(graph, &init);
    if !logp0.is_finite() {
        return Err(Error::NonFiniteInitialLogp(logp0));
    }

    if config.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build_global()
            .ok();
    }

    tracing::info!(
        sampler = %config.kind,
        chains = config.num_chains,
        iterations = config.iterations,
        burn = config.burn,
        thin = config.thin,
        params = graph.param_count,
        "sampling"
    );

    let progress = config.progress.then(|| {
        let label = match config.kind {
            SamplerKind::Metropolis => "Metropolis",
            SamplerKind::Hmc => "HMC",
        };
        Arc::new(ProgressState::new(
            label,
            config.num_chains,
            config.iterations,
            config.burn,
        ))
    });
    let handle = progress.clone().map(spawn_progress_thread);

    let chain_indices: Vec<usize> = (0..config.num_chains).collect();
    let results: Vec<ChainResult> = chain_indices
        .par_iter()
        .map(|&chain_idx| {
            let mut rng = ChaCha8Rng::seed_from_u64(chain_seed(config.seed, chain_idx));
            let state = progress.as_deref().map(|p| p.chain(chain_idx));
            let result = match config.kind {
                SamplerKind::Metropolis => {
                    let mh_config = MetropolisConfig {
                        iterations: config.iterations,
                        burn: config.burn,
                        thin: config.thin,
                        tune_interval: config.tune_interval,
                    };
                    metropolis::run_chain(graph, &mh_config, &mut rng, Some(init.clone()), state)
                }
                SamplerKind::Hmc => {
                    let hmc_config = HmcConfig {
                        step_size: config.step_size,
                        num_leapfrog_steps: config.num_leapfrog_steps,
                        iterations: config.iterations,
                        burn: config.burn,
                        thin: config.thin,
                    };
                    hmc::run_chain(graph, &hmc_config, &mut rng, Some(init.clone()), state)
                }
            };
            tracing::debug!(
                chain = chain_idx,
                accept_rate = result.accept_rate,
                draws = result.samples.len(),
                "chain finished"
            );
            result
        })
        .collect();

    if let (Some(state), Some(handle)) = (progress, handle) {
        state.finish();
        let _ = handle.join();
    }

    let divergences = results.iter().map(|r| r.divergences).sum();
    let accept_rates = results.iter().map(|r| r.accept_rate).collect();
    let samples = results.into_iter().map(|r| r.samples).collect();

    Ok(SampleResult {
        samples,
        accept_rates,
        divergences,
        trace_names: graph.trace_names(),
    })
}
