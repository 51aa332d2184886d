//! Posterior summary statistics and MCMC diagnostics: mean, sd, MC error,
//! HPD interval, quantiles, R-hat and ESS.
//!
//! R-hat and ESS follow the definitions in:
//!   Vehtari et al. (2021) "Rank-normalization, folding, and localization:
//!   An improved R-hat for assessing convergence of MCMC"

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

/// Probabilities reported in the quantile columns.
pub const QUANTILES: [f64; 5] = [0.025, 0.25, 0.5, 0.75, 0.975];

/// Number of batches used for the batch-means MC error.
const MC_ERROR_BATCHES: usize = 100;

const RHAT_WARN: f64 = 1.05;
const ESS_WARN: f64 = 400.0;

/// Per-node summary.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub mc_error: f64,
    /// 95% highest posterior density interval.
    pub hpd_lower: f64,
    pub hpd_upper: f64,
    /// Values at `QUANTILES`.
    pub quantiles: [f64; 5],
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
}

impl NodeSummary {
    pub fn median(&self) -> f64 {
        self.quantiles[2]
    }

    fn converged(&self) -> bool {
        self.r_hat.is_finite() && self.r_hat <= RHAT_WARN
    }
}

/// Summary of a whole sampling run.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub nodes: Vec<NodeSummary>,
    pub num_chains: usize,
    /// Kept draws per chain.
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

fn cell(v: f64, width: usize, precision: usize) -> String {
    if v.is_finite() {
        format!("{:>width$.precision$}", v)
    } else {
        format!("{:>width$}", "-")
    }
}

impl DiagnosticsReport {
    pub fn node(&self, name: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Total kept draws across chains.
    pub fn sample_size(&self) -> usize {
        self.num_chains * self.num_draws
    }

    pub fn mean_accept_rate(&self) -> f64 {
        if self.accept_rates.is_empty() {
            return f64::NAN;
        }
        self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64
    }

    /// Render a BUGS-style node statistics table followed by the interval
    /// and convergence columns.
    pub fn to_table(&self) -> String {
        let mut out = Vec::new();
        let width = self
            .nodes
            .iter()
            .map(|n| n.name.len())
            .max()
            .unwrap_or(4)
            .max(4);

        out.push(format!(
            "{:<width$} {:>10} {:>9} {:>9} {:>10} {:>10} {:>10} {:>7}",
            "node", "mean", "sd", "MC error", "2.5%", "median", "97.5%", "sample"
        ));
        for n in &self.nodes {
            out.push(format!(
                "{:<width$} {} {} {} {} {} {} {:>7}",
                n.name,
                cell(n.mean, 10, 4),
                cell(n.sd, 9, 4),
                cell(n.mc_error, 9, 5),
                cell(n.quantiles[0], 10, 4),
                cell(n.median(), 10, 4),
                cell(n.quantiles[4], 10, 4),
                self.sample_size(),
            ));
        }

        out.push(String::new());
        out.push(format!(
            "{:<width$} {:>10} {:>10} {:>9} {:>9} {:>7}",
            "node", "95% HPD", "", "ESS bulk", "ESS tail", "R-hat"
        ));
        for n in &self.nodes {
            out.push(format!(
                "{:<width$} {} {} {} {} {}{}",
                n.name,
                cell(n.hpd_lower, 10, 4),
                cell(n.hpd_upper, 10, 4),
                cell(n.ess_bulk, 9, 0),
                cell(n.ess_tail, 9, 0),
                cell(n.r_hat, 7, 3),
                if n.converged() { "" } else { " *" },
            ));
        }

        out.push(String::new());
        out.push(format!(
            "{} chain{} x {} draws, acceptance {}, {} divergent transition{}",
            self.num_chains,
            if self.num_chains == 1 { "" } else { "s" },
            self.num_draws,
            cell(self.mean_accept_rate(), 0, 2),
            self.divergences,
            if self.divergences == 1 { "" } else { "s" },
        ));

        if self.nodes.iter().any(|n| !n.converged()) {
            out.push(format!("* R-hat above {RHAT_WARN}: run longer or check the initial values"));
        }
        if self
            .nodes
            .iter()
            .any(|n| n.ess_bulk < ESS_WARN || n.ess_tail < ESS_WARN)
        {
            out.push(format!("ESS below {ESS_WARN} for some nodes; MC errors may be optimistic"));
        }

        out.join("\n")
    }
}

/// Summarize `samples[chain][draw][node]`, one entry per name in `names`.
pub fn compute_diagnostics(
    samples: &[Vec<Vec<f64>>],
    names: &[String],
    accept_rates: &[f64],
    divergences: usize,
) -> DiagnosticsReport {
    let nodes = names
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let chains: Vec<Vec<f64>> = samples
                .iter()
                .map(|chain| chain.iter().map(|draw| draw[idx]).collect())
                .collect();
            summarize(name, &chains)
        })
        .collect();

    DiagnosticsReport {
        nodes,
        num_chains: samples.len(),
        num_draws: samples.first().map_or(0, Vec::len),
        accept_rates: accept_rates.to_vec(),
        divergences,
    }
}

fn summarize(name: &str, chains: &[Vec<f64>]) -> NodeSummary {
    let pooled: Vec<f64> = chains.concat();
    let (mean, sd) = mean_sd(&pooled);

    let mut sorted = pooled.clone();
    sorted.sort_unstable_by(f64::total_cmp);
    let quantiles = QUANTILES.map(|q| quantile_sorted(&sorted, q));
    let (hpd_lower, hpd_upper) = hpd_sorted(&sorted, 0.05);

    let ess_bulk = SplitChains::new(&rank_normalize(chains)).map_or(f64::NAN, |s| s.ess());
    let ess_tail = tail_ess(chains, &sorted);

    let mc_error = batch_sd(chains, MC_ERROR_BATCHES).unwrap_or(if ess_bulk > 0.0 {
        sd / ess_bulk.sqrt()
    } else {
        f64::NAN
    });

    NodeSummary {
        name: name.to_string(),
        mean,
        sd,
        mc_error,
        hpd_lower,
        hpd_upper,
        quantiles,
        ess_bulk,
        ess_tail,
        r_hat: rank_r_hat(chains),
    }
}

fn mean_sd(draws: &[f64]) -> (f64, f64) {
    let n = draws.len() as f64;
    if draws.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = draws.iter().sum::<f64>() / n;
    if draws.len() < 2 {
        return (mean, f64::NAN);
    }
    let ss: f64 = draws.iter().map(|x| (x - mean) * (x - mean)).sum();
    (mean, (ss / (n - 1.0)).sqrt())
}

/// Linear interpolation between order statistics.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return f64::NAN;
    };
    let pos = q.clamp(0.0, 1.0) * last as f64;
    let below = pos.floor() as usize;
    let above = (below + 1).min(last);
    let w = pos - below as f64;
    sorted[below] + w * (sorted[above] - sorted[below])
}

/// Shortest interval holding a `1 - alpha` share of the sorted draws.
fn hpd_sorted(sorted: &[f64], alpha: f64) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let width_idx = ((1.0 - alpha) * n as f64).floor() as usize;
    if width_idx == 0 || width_idx >= n {
        return (sorted[0], sorted[n - 1]);
    }

    let (start, _) = (0..n - width_idx)
        .map(|i| (i, sorted[i + width_idx] - sorted[i]))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, 0.0));
    (sorted[start], sorted[start + width_idx])
}

/// Means of consecutive batches, `batches` in total shared evenly between
/// chains. A batch never spans two chains. `None` when a chain has fewer
/// than two draws per batch.
fn batch_means(chains: &[Vec<f64>], batches: usize) -> Option<Vec<f64>> {
    if chains.is_empty() {
        return None;
    }
    let per_chain = (batches / chains.len()).max(1);
    let mut means = Vec::with_capacity(per_chain * chains.len());
    for chain in chains {
        let batch_len = chain.len() / per_chain;
        if batch_len < 2 {
            return None;
        }
        means.extend(
            chain
                .chunks_exact(batch_len)
                .take(per_chain)
                .map(|b| b.iter().sum::<f64>() / b.len() as f64),
        );
    }
    Some(means)
}

/// Standard deviation of the batch means divided by sqrt(number of batches).
fn batch_sd(chains: &[Vec<f64>], batches: usize) -> Option<f64> {
    let means = batch_means(chains, batches)?;
    if means.len() < 2 {
        return None;
    }
    let k = means.len() as f64;
    let m = means.iter().sum::<f64>() / k;
    let var = means.iter().map(|b| (b - m).powi(2)).sum::<f64>() / k;
    Some(var.sqrt() / k.sqrt())
}

/// Every chain cut into two equal halves, with per-half means and the
/// pooled within-half variance.
struct SplitChains {
    halves: Vec<Vec<f64>>,
    means: Vec<f64>,
    within: f64,
}

impl SplitChains {
    /// `None` when the halves are too short or the draws are constant.
    fn new(chains: &[Vec<f64>]) -> Option<Self> {
        let halves: Vec<Vec<f64>> = chains
            .iter()
            .flat_map(|chain| {
                let half = chain.len() / 2;
                // odd-length chains drop the middle draw
                [
                    chain[..half].to_vec(),
                    chain[chain.len() - half..].to_vec(),
                ]
            })
            .collect();
        if halves.len() < 2 || halves[0].len() < 4 {
            return None;
        }

        let (means, variances): (Vec<f64>, Vec<f64>) = halves
            .iter()
            .map(|h| {
                let (m, sd) = mean_sd(h);
                (m, sd * sd)
            })
            .unzip();
        let within = variances.iter().sum::<f64>() / variances.len() as f64;
        if !(within > 1e-30) {
            return None;
        }
        Some(Self {
            halves,
            means,
            within,
        })
    }

    fn len(&self) -> f64 {
        self.halves[0].len() as f64
    }

    fn count(&self) -> f64 {
        self.halves.len() as f64
    }

    /// Between-half variance of the means, scaled by the half length.
    fn between(&self) -> f64 {
        let grand = self.means.iter().sum::<f64>() / self.count();
        let spread: f64 = self.means.iter().map(|m| (m - grand).powi(2)).sum();
        self.len() * spread / (self.count() - 1.0)
    }

    fn var_plus(&self) -> f64 {
        let n = self.len();
        (n - 1.0) / n * self.within + self.between() / n
    }

    fn r_hat(&self) -> f64 {
        (self.var_plus() / self.within).sqrt()
    }

    /// Combined autocorrelation at `lag`, computed on demand.
    fn rho(&self, lag: usize) -> f64 {
        let n = self.halves[0].len();
        let autocov: f64 = self
            .halves
            .iter()
            .zip(&self.means)
            .map(|(h, m)| {
                (0..n - lag)
                    .map(|t| (h[t] - m) * (h[t + lag] - m))
                    .sum::<f64>()
                    / n as f64
            })
            .sum::<f64>()
            / self.count();
        1.0 - (self.within - autocov) / self.var_plus()
    }

    /// Geyer's initial positive sequence over pairs of autocorrelations.
    fn ess(&self) -> f64 {
        let n = self.halves[0].len();
        let total = self.count() * self.len();

        let mut tau = -1.0;
        let mut lag = 0;
        while lag + 1 < n {
            let pair = self.rho(lag) + self.rho(lag + 1);
            if pair < 0.0 {
                break;
            }
            tau += 2.0 * pair;
            lag += 2;
        }
        total / tau.max(1.0 / total.log10().max(1.0))
    }
}

/// Rank-normalized split R-hat, the larger of the bulk and folded versions.
fn rank_r_hat(chains: &[Vec<f64>]) -> f64 {
    let bulk = SplitChains::new(&rank_normalize(chains)).map(|s| s.r_hat());

    let mut pooled = chains.concat();
    pooled.sort_unstable_by(f64::total_cmp);
    let median = quantile_sorted(&pooled, 0.5);
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|c| c.iter().map(|x| (x - median).abs()).collect())
        .collect();
    let folded = SplitChains::new(&rank_normalize(&folded)).map(|s| s.r_hat());

    match (bulk, folded) {
        (Some(b), Some(f)) => b.max(f),
        (Some(b), None) => b,
        (None, Some(f)) => f,
        (None, None) => f64::NAN,
    }
}

/// Smaller of the ESS of the 5% and 95% quantile indicators.
fn tail_ess(chains: &[Vec<f64>], sorted: &[f64]) -> f64 {
    let lower = quantile_sorted(sorted, 0.05);
    let upper = quantile_sorted(sorted, 0.95);
    let indicator = |hit: &dyn Fn(f64) -> bool| -> f64 {
        let ind: Vec<Vec<f64>> = chains
            .iter()
            .map(|c| c.iter().map(|&x| f64::from(u8::from(hit(x)))).collect())
            .collect();
        SplitChains::new(&ind).map_or(f64::NAN, |s| s.ess())
    };
    indicator(&|x| x <= lower).min(indicator(&|x| x >= upper))
}

/// Replace every draw by the normal score of its pooled rank, with ties
/// sharing their average rank.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut order: Vec<(usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| (0..chain.len()).map(move |d| (c, d)))
        .collect();
    order.sort_unstable_by(|a, b| chains[a.0][a.1].total_cmp(&chains[b.0][b.1]));

    let mut scores: Vec<Vec<f64>> = chains.iter().map(|c| vec![f64::NAN; c.len()]).collect();
    let Ok(std_normal) = Normal::new(0.0, 1.0) else {
        return scores;
    };
    let total = order.len() as f64;

    let mut seen = 0;
    for tie in order.chunk_by(|a, b| chains[a.0][a.1] == chains[b.0][b.1]) {
        // 1-based average rank of the tied run
        let rank = seen as f64 + (tie.len() as f64 + 1.0) / 2.0;
        let z = std_normal.inverse_cdf((rank - 0.375) / (total + 0.25));
        for &(c, d) in tie {
            scores[c][d] = z;
        }
        seen += tie.len();
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn white_noise(chains: usize, draws: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..chains)
            .map(|_| (0..draws).map(|_| StandardNormal.sample(&mut rng)).collect())
            .collect()
    }

    /// AR(1) chain with autocorrelation `phi` and unit marginal variance.
    fn ar1(draws: usize, phi: f64, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let scale = (1.0 - phi * phi).sqrt();
        let mut x = 0.0;
        (0..draws)
            .map(|_| {
                let e: f64 = StandardNormal.sample(&mut rng);
                x = phi * x + scale * e;
                x
            })
            .collect()
    }

    #[test]
    fn test_r_hat_near_one_for_mixed_chains() {
        let r = rank_r_hat(&white_noise(4, 1000, 1));
        assert!(r < 1.02, "r_hat = {}", r);
    }

    #[test]
    fn test_r_hat_flags_separated_chains() {
        let mut chains = white_noise(2, 500, 2);
        for x in chains[1].iter_mut() {
            *x += 5.0;
        }
        assert!(rank_r_hat(&chains) > 1.5);
    }

    #[test]
    fn test_single_chain_r_hat_flags_drift() {
        let drifting: Vec<f64> = ar1(2000, 0.5, 3)
            .into_iter()
            .enumerate()
            .map(|(i, x)| x + i as f64 * 0.01)
            .collect();
        assert!(rank_r_hat(&[drifting]) > 1.1);
    }

    #[test]
    fn test_ess_reflects_autocorrelation() {
        let independent = SplitChains::new(&white_noise(1, 4000, 4)).unwrap().ess();
        assert!(independent > 3000.0 && independent < 5000.0, "{}", independent);

        // ESS of AR(1) is about n (1 - phi) / (1 + phi)
        let sticky = SplitChains::new(&[ar1(4000, 0.9, 5)]).unwrap().ess();
        assert!(sticky > 100.0 && sticky < 500.0, "{}", sticky);
    }

    #[test]
    fn test_constant_trace_has_no_split_statistics() {
        assert!(SplitChains::new(&[vec![2.0; 100]]).is_none());
        assert!(rank_r_hat(&[vec![2.0; 100]]).is_nan());
    }

    #[test]
    fn test_rank_normalize_ties_and_symmetry() {
        let tied = rank_normalize(&[vec![3.0, 1.0, 2.0, 2.0, 5.0]]).remove(0);
        assert_eq!(tied[2], tied[3]);
        assert!(tied[1] < tied[2] && tied[2] < tied[0] && tied[0] < tied[4]);

        let scores = rank_normalize(&[vec![1.0, 2.0], vec![3.0, 4.0, 5.0]]);
        // the middle rank maps to zero
        assert!(scores[1][0].abs() < 1e-9);
        assert!((scores[0][0] + scores[1][2]).abs() < 1e-9);
        assert!((scores[0][1] + scores[1][1]).abs() < 1e-9);
    }

    #[test]
    fn test_hpd_picks_shortest_interval() {
        let mut draws: Vec<f64> = (0..90).map(|i| i as f64 * 0.01).collect();
        draws.extend((0..10).map(|i| 10.0 + i as f64));
        assert_eq!(hpd_sorted(&draws, 0.1), (0.0, 10.0));
        assert!(quantile_sorted(&draws, 0.95) > 10.0);
    }

    #[test]
    fn test_batch_sd() {
        assert_eq!(batch_sd(&[vec![1.5; 1000]], 100), Some(0.0));
        assert_eq!(batch_sd(&[vec![1.5; 150]], 100), None);
        assert_eq!(batch_sd(&[], 100), None);

        // Independent draws: batch-means error is close to sd / sqrt(n)
        let draws = white_noise(1, 20_000, 6);
        let err = batch_sd(&draws, 100).unwrap();
        let naive = 1.0 / (20_000f64).sqrt();
        assert!(err > 0.7 * naive && err < 1.3 * naive, "{} vs {}", err, naive);

        let draws = white_noise(4, 5_000, 8);
        let err = batch_sd(&draws, 100).unwrap();
        assert!(err > 0.7 * naive && err < 1.3 * naive, "{} vs {}", err, naive);
    }

    #[test]
    fn test_batches_stay_within_chains() {
        // 1010 draws per chain do not split evenly into 50 batches, so pooled
        // batching would put a batch across the two chains
        let chains = vec![vec![0.0; 1010], vec![1.0; 1010]];
        let means = batch_means(&chains, 100).unwrap();
        assert_eq!(means.len(), 100);
        assert!(means.iter().all(|&m| m == 0.0 || m == 1.0));
        assert_eq!(means.iter().filter(|&&m| m == 1.0).count(), 50);

        let err = batch_sd(&chains, 100).unwrap();
        assert!((err - 0.05).abs() < 1e-12, "{}", err);
    }

    #[test]
    fn test_quantiles_and_report() {
        let chain: Vec<Vec<f64>> = (0..=1000).map(|i| vec![i as f64 / 1000.0]).collect();
        let report = compute_diagnostics(&[chain], &["u".to_string()], &[0.4], 0);
        let u = report.node("u").unwrap();
        assert!((u.mean - 0.5).abs() < 1e-12);
        assert!((u.median() - 0.5).abs() < 1e-12);
        assert!((u.quantiles[0] - 0.025).abs() < 1e-12);
        assert!((u.quantiles[4] - 0.975).abs() < 1e-12);
        assert_eq!(report.sample_size(), 1001);

        let table = report.to_table();
        assert!(table.starts_with("node"));
        assert!(table.contains("MC error"));
        assert!(table.contains("95% HPD"));
        assert_eq!(table.lines().filter(|l| l.starts_with("u ")).count(), 2);
        assert!(table.contains("1 chain x 1001 draws, acceptance 0.40, 0 divergent transitions"));
    }
}
