use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, ParamTransform};

fn element_name(name: &str, i: usize) -> String {
    format!("{}[{}]", name, i + 1)
}

fn check_positive(name: &str, what: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: name.to_string(),
            reason: format!("{} must be positive and finite, got {}", what, value),
        })
    }
}

fn check_len(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            what: what.to_string(),
            expected,
            got,
        })
    }
}

// ── Normal (unconstrained) ──────────────────────────────────────────

pub struct Normal;

impl Normal {
    pub fn prior(graph: &mut Graph, name: &str, mu: f64, sigma: f64) -> Result<NodeId> {
        check_positive(name, "sigma", sigma)?;
        Ok(Self::add(graph, name, mu, sigma, 0.0))
    }

    /// BUGS-style `dnorm(mu, tau)` where `tau` is the precision, 1/sigma².
    pub fn prior_precision(
        graph: &mut Graph,
        name: &str,
        mu: f64,
        tau: f64,
        init: f64,
    ) -> Result<NodeId> {
        check_positive(name, "tau", tau)?;
        Ok(Self::add(graph, name, mu, tau.sqrt().recip(), init))
    }

    /// Independent normals sharing a precision, sampled as one block
    /// named `name` with elements `name[1]`, `name[2]`, ...
    pub fn vector_precision(
        graph: &mut Graph,
        name: &str,
        mus: &[f64],
        tau: f64,
        inits: &[f64],
    ) -> Result<Vec<NodeId>> {
        check_positive(name, "tau", tau)?;
        check_len(&format!("{} inits", name), mus.len(), inits.len())?;
        let sigma = tau.sqrt().recip();

        graph.begin_block(name);
        let nodes: Vec<NodeId> = mus
            .iter()
            .zip(inits.iter())
            .enumerate()
            .map(|(i, (&mu, &init))| Self::add(graph, &element_name(name, i), mu, sigma, init))
            .collect();
        graph.end_block();
        Ok(nodes)
    }

    fn add(graph: &mut Graph, name: &str, mu: f64, sigma: f64, init: f64) -> NodeId {
        let param = graph.add_param_with_transform(name, ParamTransform::Identity, init);
        let mu_node = graph.add_constant(mu);
        let sigma_node = graph.add_constant(sigma);
        graph.normal_logp(param, mu_node, sigma_node);
        param
    }
}

// ── Beta (0 < x < 1, logit-transform) ──────────────────────────────

pub struct BetaDist;

impl BetaDist {
    /// Samples raw on (-∞, +∞), transforms via x = sigmoid(raw).
    /// Jacobian: log|dx/draw| = log(sigmoid(raw)) + log(1-sigmoid(raw))
    pub fn prior(
        graph: &mut Graph,
        name: &str,
        alpha: f64,
        beta: f64,
        init: f64,
    ) -> Result<NodeId> {
        check_positive(name, "alpha", alpha)?;
        check_positive(name, "beta", beta)?;
        if !(init > 0.0 && init < 1.0) {
            return Err(Error::InvalidParameter {
                name: name.to_string(),
                reason: format!("initial value must lie in (0, 1), got {}", init),
            });
        }

        let raw = graph.add_param_with_transform(name, ParamTransform::Sigmoid, init);
        let x = graph.sigmoid(raw);
        let alpha_node = graph.add_constant(alpha);
        let beta_node = graph.add_constant(beta);
        graph.beta_logp(x, alpha_node, beta_node);

        // Jacobian: log(x) + log(1-x)
        let log_x = graph.log(x);
        let one = graph.add_constant(1.0);
        let one_minus_x = graph.sub(one, x);
        let log_one_minus_x = graph.log(one_minus_x);
        let jac = graph.add(log_x, log_one_minus_x);
        graph.add_logp_term(jac);
        Ok(x)
    }
}

// ── Binomial (observed counts) ──────────────────────────────────────

pub struct Binomial;

impl Binomial {
    /// `r[i] ~ Binomial(n[i], p[i])` with `p_vec` a stacked vector of probabilities.
    pub fn observed(graph: &mut Graph, p_vec: NodeId, n: &[u64], r: &[u64]) -> Result<NodeId> {
        let (trials, obs) = Self::store(graph, p_vec, n, r)?;
        Ok(graph.binomial_obs_logp(p_vec, trials, obs))
    }

    /// `r[i] ~ Binomial(n[i], sigmoid(logit[i]))`.
    pub fn observed_logit(
        graph: &mut Graph,
        logit_vec: NodeId,
        n: &[u64],
        r: &[u64],
    ) -> Result<NodeId> {
        let (trials, obs) = Self::store(graph, logit_vec, n, r)?;
        Ok(graph.binomial_logit_obs_logp(logit_vec, trials, obs))
    }

    fn store(graph: &mut Graph, vec: NodeId, n: &[u64], r: &[u64]) -> Result<(usize, usize)> {
        let len = graph
            .vector_len(vec)
            .ok_or_else(|| Error::InvalidData("binomial probabilities must be a vector node".into()))?;
        check_len("binomial trials", len, n.len())?;
        check_len("binomial observations", len, r.len())?;
        if let Some((i, (ni, ri))) = n.iter().zip(r.iter()).enumerate().find(|(_, (ni, ri))| ri > ni) {
            return Err(Error::InvalidData(format!(
                "observation {} has {} successes out of {} trials",
                i + 1,
                ri,
                ni
            )));
        }

        let trials = graph.add_data(n.iter().map(|&v| v as f64).collect());
        let obs = graph.add_obs_data(r.iter().map(|&v| v as f64).collect());
        Ok((trials, obs))
    }
}
