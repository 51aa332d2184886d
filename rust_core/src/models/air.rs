//! Air: Berkson measurement error.
//!
//! Reported respiratory illness versus exposure to nitrogen dioxide in 103
//! children, grouped into three exposure bands. The true exposure `z[j]` of
//! each band is latent and scattered around a calibration line in the
//! observed NO2 concentration `x[j]`:
//!
//! ```text
//! y[j] ~ dbin(p[j], n[j])
//! logit(p[j]) <- theta[1] + theta[2] * z[j]
//! z[j] ~ dnorm(alpha + beta * x[j], 0.01232)
//! theta[k] ~ dnorm(0, 0.0001)
//! ```

use super::{Model, ReferenceValue};
use crate::distributions::{Binomial, Normal};
use crate::error::{Error, Result};
use crate::graph::Graph;

/// Observed data and fixed calibration constants.
#[derive(Debug, Clone, PartialEq)]
pub struct AirData {
    /// Children reporting respiratory illness per exposure band.
    pub y: Vec<u64>,
    /// Children per exposure band.
    pub n: Vec<u64>,
    /// Observed NO2 concentration (ppb).
    pub x: Vec<f64>,
    pub alpha: f64,
    pub beta: f64,
    /// Precision of the calibration error on `z`.
    pub z_tau: f64,
    /// Precision of the vague priors on `theta`.
    pub theta_tau: f64,
}

impl Default for AirData {
    fn default() -> Self {
        Self {
            y: vec![21, 20, 15],
            n: vec![48, 34, 21],
            x: vec![10.0, 30.0, 50.0],
            alpha: 4.48,
            beta: 0.76,
            z_tau: 0.01232,
            theta_tau: 0.0001,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AirInits {
    pub theta: [f64; 2],
    pub z: Vec<f64>,
}

impl Default for AirInits {
    fn default() -> Self {
        Self {
            theta: [0.0, 0.0],
            z: vec![0.0, 0.0, 0.0],
        }
    }
}

/// BUGS results: 20000 samples after a 12000 iteration burn-in.
pub fn reference() -> Vec<ReferenceValue> {
    vec![
        ReferenceValue::new("theta[1]", -0.8096, 0.8559),
        ReferenceValue::new("theta[2]", 0.04207, 0.03144),
        ReferenceValue::new("z[1]", 12.8, 8.299),
        ReferenceValue::new("z[2]", 27.43, 7.474),
        ReferenceValue::new("z[3]", 41.43, 8.56),
    ]
}

pub fn build(data: &AirData, inits: &AirInits) -> Result<Model> {
    if data.x.len() != data.n.len() {
        return Err(Error::ShapeMismatch {
            what: "air exposure levels".to_string(),
            expected: data.n.len(),
            got: data.x.len(),
        });
    }

    let mut graph = Graph::new();

    // intercept and slope are strongly anti-correlated, so they move jointly
    graph.begin_block("theta");
    let theta1 = Normal::prior_precision(&mut graph, "theta[1]", 0.0, data.theta_tau, inits.theta[0])?;
    let theta2 = Normal::prior_precision(&mut graph, "theta[2]", 0.0, data.theta_tau, inits.theta[1])?;
    graph.end_block();

    let mu: Vec<f64> = data.x.iter().map(|x| data.alpha + data.beta * x).collect();
    let z = Normal::vector_precision(&mut graph, "z", &mu, data.z_tau, &inits.z)?;

    let mut logits = Vec::with_capacity(z.len());
    for (j, &zj) in z.iter().enumerate() {
        let slope = graph.mul(theta2, zj);
        let logit = graph.add(theta1, slope);
        let p = graph.sigmoid(logit);
        graph.add_deterministic(&format!("p[{}]", j + 1), p);
        logits.push(logit);
    }
    let logit_vec = graph.stack(logits);
    Binomial::observed_logit(&mut graph, logit_vec, &data.n, &data.y)?;

    Ok(Model {
        name: "air",
        graph,
        reference: reference(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{eval_logp, trace_values};
    use crate::diagnostics::{compute_diagnostics, DiagnosticsReport};
    use crate::models::check_reference;
    use crate::sampler::{sample, SamplerConfig, SamplerKind};

    #[test]
    fn test_literal_data() {
        let data = AirData::default();
        assert_eq!(data.y, vec![21, 20, 15]);
        assert_eq!(data.n, vec![48, 34, 21]);
        assert_eq!(data.x, vec![10.0, 30.0, 50.0]);
        assert_eq!(data.alpha, 4.48);
        assert_eq!(data.beta, 0.76);
    }

    #[test]
    fn test_graph_layout() {
        let model = build(&AirData::default(), &AirInits::default()).unwrap();
        let g = &model.graph;
        assert_eq!(
            g.trace_names(),
            vec!["theta[1]", "theta[2]", "z[1]", "z[2]", "z[3]", "p[1]", "p[2]", "p[3]"]
        );
        let blocks: Vec<&str> = g.blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(blocks, vec!["theta", "z"]);
    }

    #[test]
    fn test_initial_state() {
        let model = build(&AirData::default(), &AirInits::default()).unwrap();
        let init = model.graph.initial_values();
        assert_eq!(init, vec![0.0; 5]);
        assert!(eval_logp(&model.graph, &init).is_finite());

        // theta = 0 puts every p at one half
        let trace = trace_values(&model.graph, &init);
        assert_eq!(&trace[5..], &[0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_latent_exposure_enters_likelihood() {
        let model = build(&AirData::default(), &AirInits::default()).unwrap();
        let g = &model.graph;
        let base = eval_logp(g, &[0.0, 0.05, 10.0, 30.0, 50.0]);
        let shifted = eval_logp(g, &[0.0, 0.05, 10.0, 30.0, 60.0]);
        // Moving z[3] changes both its prior and p[3]
        assert!((base - shifted).abs() > 1e-6);
    }

    #[test]
    fn test_mismatched_exposures() {
        let data = AirData {
            x: vec![10.0, 30.0],
            ..AirData::default()
        };
        assert!(matches!(
            build(&data, &AirInits::default()),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    fn assert_matches_reference(model: &Model, config: &SamplerConfig) -> DiagnosticsReport {
        let result = sample(&model.graph, config).unwrap();
        let report = compute_diagnostics(
            &result.samples,
            &result.trace_names,
            &result.accept_rates,
            result.divergences,
        );
        let checks = check_reference(&report, &model.reference, 0.5).unwrap();
        for c in &checks {
            assert!(
                c.passed,
                "{} (seed {}): posterior mean {} vs reference {} ({} sd)",
                c.node, config.seed, c.posterior_mean, c.reference_mean, c.deviation
            );
        }
        report
    }

    #[test]
    fn test_posterior_matches_bugs_reference() {
        let model = build(&AirData::default(), &AirInits::default()).unwrap();
        let config = SamplerConfig {
            num_chains: 4,
            ..SamplerConfig::default()
        };
        let report = assert_matches_reference(&model, &config);

        for node in ["theta[1]", "theta[2]"] {
            let s = report.node(node).unwrap();
            assert!(s.r_hat < 1.05, "{}: r_hat {}", node, s.r_hat);
            assert!(s.ess_bulk > 400.0, "{}: ess {}", node, s.ess_bulk);
            let reference = model.reference.iter().find(|r| r.node == node).unwrap();
            assert!(
                (s.sd / reference.sd - 1.0).abs() < 0.2,
                "{}: sd {} vs {}",
                node,
                s.sd,
                reference.sd
            );
        }

        let p1 = report.node("p[1]").unwrap();
        assert!(p1.mean > 0.2 && p1.mean < 0.6);
    }

    #[test]
    fn test_reference_holds_across_seeds() {
        let model = build(&AirData::default(), &AirInits::default()).unwrap();
        for seed in [103, 109] {
            let config = SamplerConfig {
                seed,
                ..SamplerConfig::default()
            };
            assert_matches_reference(&model, &config);
        }
    }

    #[test]
    fn test_hmc_matches_bugs_reference() {
        let model = build(&AirData::default(), &AirInits::default()).unwrap();
        let config = SamplerConfig {
            kind: SamplerKind::Hmc,
            num_chains: 2,
            iterations: 3000,
            burn: 1000,
            thin: 1,
            ..SamplerConfig::default()
        };
        let report = assert_matches_reference(&model, &config);

        for reference in &model.reference {
            let s = report.node(&reference.node).unwrap();
            assert!(
                (s.sd / reference.sd - 1.0).abs() < 0.2,
                "{}: sd {} vs {}",
                reference.node,
                s.sd,
                reference.sd
            );
        }
    }
}
