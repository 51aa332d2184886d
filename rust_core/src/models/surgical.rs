//! Surgical: institutional ranking (simple version).
//!
//! Mortality in 12 hospitals performing cardiac surgery in babies. Each
//! hospital's death rate gets an independent uniform prior, and since the
//! rates stay independent a posteriori each one is its own block:
//!
//! ```text
//! p[i] ~ dbeta(1.0, 1.0)
//! r[i] ~ dbin(p[i], n[i])
//! ```

use super::{Model, ReferenceValue};
use crate::distributions::{BetaDist, Binomial};
use crate::error::{Error, Result};
use crate::graph::Graph;

#[derive(Debug, Clone, PartialEq)]
pub struct SurgicalData {
    /// Operations per hospital.
    pub n: Vec<u64>,
    /// Deaths per hospital.
    pub r: Vec<u64>,
    pub prior_alpha: f64,
    pub prior_beta: f64,
}

impl Default for SurgicalData {
    fn default() -> Self {
        Self {
            n: vec![47, 148, 119, 810, 211, 196, 148, 215, 207, 97, 256, 360],
            r: vec![0, 18, 8, 46, 8, 13, 9, 31, 14, 8, 29, 24],
            prior_alpha: 1.0,
            prior_beta: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurgicalInits {
    pub p: Vec<f64>,
}

impl Default for SurgicalInits {
    fn default() -> Self {
        Self { p: vec![0.1; 12] }
    }
}

/// The Beta prior is conjugate, so `p[i] | r ~ Beta(alpha + r, beta + n - r)`
/// and the reference summaries are exact.
pub fn reference(data: &SurgicalData) -> Vec<ReferenceValue> {
    data.n
        .iter()
        .zip(data.r.iter())
        .enumerate()
        .map(|(i, (&n, &r))| {
            let a = data.prior_alpha + r as f64;
            let b = data.prior_beta + (n - r) as f64;
            let mean = a / (a + b);
            let sd = (a * b / ((a + b).powi(2) * (a + b + 1.0))).sqrt();
            ReferenceValue::new(format!("p[{}]", i + 1), mean, sd)
        })
        .collect()
}

pub fn build(data: &SurgicalData, inits: &SurgicalInits) -> Result<Model> {
    if inits.p.len() != data.n.len() {
        return Err(Error::ShapeMismatch {
            what: "surgical initial values".to_string(),
            expected: data.n.len(),
            got: inits.p.len(),
        });
    }

    let mut graph = Graph::new();
    let p = inits
        .p
        .iter()
        .enumerate()
        .map(|(i, &init)| {
            let name = format!("p[{}]", i + 1);
            BetaDist::prior(&mut graph, &name, data.prior_alpha, data.prior_beta, init)
        })
        .collect::<Result<Vec<_>>>()?;
    let p_vec = graph.stack(p);
    Binomial::observed(&mut graph, p_vec, &data.n, &data.r)?;

    Ok(Model {
        name: "surgical",
        graph,
        reference: reference(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::compute_diagnostics;
    use crate::models::check_reference;
    use crate::sampler::{sample, SamplerConfig, SamplerKind};

    #[test]
    fn test_literal_data() {
        let data = SurgicalData::default();
        assert_eq!(data.n.len(), 12);
        assert_eq!(data.r.len(), 12);
        assert_eq!(data.n.iter().sum::<u64>(), 2814);
        assert_eq!(data.r.iter().sum::<u64>(), 208);
        assert_eq!(SurgicalInits::default().p, vec![0.1; 12]);
    }

    #[test]
    fn test_exact_reference() {
        let reference = reference(&SurgicalData::default());
        // Hospital 1: 0 deaths in 47 operations, Beta(1, 48)
        assert_eq!(reference[0].node, "p[1]");
        assert!((reference[0].mean - 1.0 / 49.0).abs() < 1e-12);
        // Hospital 4: 46 deaths in 810 operations, Beta(47, 765)
        assert!((reference[3].mean - 47.0 / 812.0).abs() < 1e-12);
    }

    #[test]
    fn test_one_block_per_hospital() {
        let model = build(&SurgicalData::default(), &SurgicalInits::default()).unwrap();
        assert_eq!(model.graph.blocks.len(), 12);
        assert_eq!(model.graph.blocks[3].name, "p[4]");
        assert_eq!(model.graph.blocks[3].params, 3..4);
        assert_eq!(model.graph.trace_names()[11], "p[12]");
    }

    #[test]
    fn test_rejects_short_inits() {
        let inits = SurgicalInits { p: vec![0.1; 11] };
        assert!(matches!(
            build(&SurgicalData::default(), &inits),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_impossible_counts() {
        let mut data = SurgicalData::default();
        data.r[0] = 48;
        assert!(matches!(
            build(&data, &SurgicalInits::default()),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_posterior_matches_conjugate_result() {
        let model = build(&SurgicalData::default(), &SurgicalInits::default()).unwrap();
        let result = sample(&model.graph, &SamplerConfig::default()).unwrap();
        let report = compute_diagnostics(
            &result.samples,
            &result.trace_names,
            &result.accept_rates,
            result.divergences,
        );

        for c in check_reference(&report, &model.reference, 0.5).unwrap() {
            assert!(
                c.passed,
                "{}: posterior mean {} vs exact {} ({} sd)",
                c.node, c.posterior_mean, c.reference_mean, c.deviation
            );
        }
        for node in &report.nodes {
            assert!(node.hpd_lower >= 0.0 && node.hpd_upper <= 1.0);
        }
    }

    #[test]
    fn test_hmc_matches_conjugate_result() {
        let model = build(&SurgicalData::default(), &SurgicalInits::default()).unwrap();
        let config = SamplerConfig {
            kind: SamplerKind::Hmc,
            iterations: 1500,
            burn: 500,
            thin: 1,
            ..SamplerConfig::default()
        };
        let result = sample(&model.graph, &config).unwrap();
        let means = result.mean();
        for (i, r) in model.reference.iter().enumerate() {
            assert!(
                (means[i] - r.mean).abs() < 0.5 * r.sd,
                "{}: {} vs {}",
                r.node,
                means[i],
                r.mean
            );
        }
    }

    #[test]
    fn test_same_seed_same_summary() {
        let model = build(&SurgicalData::default(), &SurgicalInits::default()).unwrap();
        let config = SamplerConfig {
            iterations: 2000,
            burn: 500,
            ..SamplerConfig::default()
        };
        let a = sample(&model.graph, &config).unwrap().mean();
        let b = sample(&model.graph, &config).unwrap().mean();
        assert_eq!(a, b);
    }
}
