use crate::graph::{sigmoid, Graph, Op};
use statrs::function::beta::ln_beta;
use statrs::function::gamma::{digamma, ln_gamma};

/// Result of evaluating one node: a scalar, or the stacked per-unit values
/// that feed a vector likelihood.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    pub fn as_scalar(&self) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Vector(_) => panic!("expected scalar, got vector"),
        }
    }

    pub fn as_vector(&self) -> &[f64] {
        match self {
            Value::Vector(v) => v,
            Value::Scalar(_) => panic!("expected vector, got scalar"),
        }
    }
}

/// Evaluate the nodes in insertion order, which is topological.
pub fn forward(graph: &Graph, params: &[f64]) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::with_capacity(graph.nodes.len());

    for node in &graph.nodes {
        let val = match &node.op {
            Op::Param(idx) => Value::Scalar(params[*idx]),
            Op::Constant(c) => Value::Scalar(*c),
            Op::Add(a, b) => Value::Scalar(values[a.0].as_scalar() + values[b.0].as_scalar()),
            Op::Sub(a, b) => Value::Scalar(values[a.0].as_scalar() - values[b.0].as_scalar()),
            Op::Mul(a, b) => Value::Scalar(values[a.0].as_scalar() * values[b.0].as_scalar()),
            Op::Log(a) => Value::Scalar(values[a.0].as_scalar().ln()),
            Op::Sigmoid(a) => Value::Scalar(sigmoid(values[a.0].as_scalar())),
            Op::Stack(elems) => {
                Value::Vector(elems.iter().map(|e| values[e.0].as_scalar()).collect())
            }
            Op::NormalLogP { x, mu, sigma } => {
                let xv = values[x.0].as_scalar();
                let mv = values[mu.0].as_scalar();
                let sv = values[sigma.0].as_scalar();
                Value::Scalar(normal_logp_scalar(xv, mv, sv))
            }
            Op::BetaLogP { x, alpha, beta } => {
                let xv = values[x.0].as_scalar();
                let av = values[alpha.0].as_scalar();
                let bv = values[beta.0].as_scalar();
                Value::Scalar(beta_logp_scalar(xv, av, bv))
            }
            Op::BinomialObsLogP {
                p_vec,
                trials_idx,
                obs_idx,
            } => {
                let p = values[p_vec.0].as_vector();
                let n = &graph.data_vectors[*trials_idx];
                let k = &graph.obs_vectors[*obs_idx];
                Value::Scalar(binomial_logp_sum(p, n, k))
            }
            Op::BinomialLogitObsLogP {
                logit_vec,
                trials_idx,
                obs_idx,
            } => {
                let l = values[logit_vec.0].as_vector();
                let n = &graph.data_vectors[*trials_idx];
                let k = &graph.obs_vectors[*obs_idx];
                Value::Scalar(binomial_logit_logp_sum(l, n, k))
            }
        };
        values.push(val);
    }

    values
}

/// Joint log density of the model at unconstrained `params`.
///
/// Returns `-inf` whenever a term is outside its support; NaN is mapped to
/// `-inf` as well so samplers can simply reject.
pub fn eval_logp(graph: &Graph, params: &[f64]) -> f64 {
    let values = forward(graph, params);
    total(graph, &values)
}

fn total(graph: &Graph, values: &[Value]) -> f64 {
    let sum: f64 = graph
        .logp_terms
        .iter()
        .map(|id| values[id.0].as_scalar())
        .sum();
    if sum.is_nan() {
        f64::NEG_INFINITY
    } else {
        sum
    }
}

/// Natural-scale values of every traced quantity, in `Graph::trace_names` order.
pub fn trace_values(graph: &Graph, params: &[f64]) -> Vec<f64> {
    let constrained = params
        .iter()
        .zip(graph.param_transforms.iter())
        .map(|(&raw, t)| t.constrain(raw));

    if graph.deterministics.is_empty() {
        return constrained.collect();
    }

    let values = forward(graph, params);
    constrained
        .chain(
            graph
                .deterministics
                .iter()
                .map(|(_, id)| values[id.0].as_scalar()),
        )
        .collect()
}

/// Joint log density and its gradient with respect to the unconstrained
/// parameters, by one reverse sweep over the nodes.
pub fn grad_logp(graph: &Graph, params: &[f64]) -> (f64, Vec<f64>) {
    let values = forward(graph, params);
    let n = graph.nodes.len();
    let total_logp = total(graph, &values);

    // Adjoint for each node. Vector nodes get vector adjoints via a separate table.
    let mut adj_scalar = vec![0.0f64; n];
    let mut adj_vector: Vec<Option<Vec<f64>>> = vec![None; n];

    // Seed: d(total_logp)/d(logp_term) = 1.0
    for &id in &graph.logp_terms {
        adj_scalar[id.0] += 1.0;
    }

    for node in graph.nodes.iter().rev() {
        let idx = node.id.0;
        let a_s = adj_scalar[idx];

        match &node.op {
            Op::Param(_) | Op::Constant(_) => {}

            Op::Add(a, b) => {
                adj_scalar[a.0] += a_s;
                adj_scalar[b.0] += a_s;
            }
            Op::Sub(a, b) => {
                adj_scalar[a.0] += a_s;
                adj_scalar[b.0] -= a_s;
            }
            Op::Mul(a, b) => {
                let va = values[a.0].as_scalar();
                let vb = values[b.0].as_scalar();
                adj_scalar[a.0] += a_s * vb;
                adj_scalar[b.0] += a_s * va;
            }
            Op::Log(a) => {
                let va = values[a.0].as_scalar();
                adj_scalar[a.0] += a_s / va;
            }
            Op::Sigmoid(a) => {
                let s = values[idx].as_scalar();
                adj_scalar[a.0] += a_s * s * (1.0 - s);
            }
            Op::Stack(elems) => {
                if let Some(uv) = adj_vector[idx].take() {
                    for (e, u) in elems.iter().zip(uv.iter()) {
                        adj_scalar[e.0] += u;
                    }
                }
            }
            Op::NormalLogP { x, mu, sigma } => {
                let xv = values[x.0].as_scalar();
                let mv = values[mu.0].as_scalar();
                let sv = values[sigma.0].as_scalar();
                let diff = xv - mv;
                let s2 = sv * sv;
                // d logp / d x = -(x - mu) / sigma^2
                adj_scalar[x.0] += a_s * (-diff / s2);
                // d logp / d mu = (x - mu) / sigma^2
                adj_scalar[mu.0] += a_s * (diff / s2);
                // d logp / d sigma = (x - mu)^2 / sigma^3 - 1/sigma
                adj_scalar[sigma.0] += a_s * (diff * diff / (s2 * sv) - 1.0 / sv);
            }
            Op::BetaLogP { x, alpha, beta } => {
                let xv = values[x.0].as_scalar();
                if xv <= 0.0 || xv >= 1.0 {
                    continue;
                }
                let av = values[alpha.0].as_scalar();
                let bv = values[beta.0].as_scalar();
                // d logp / d x = (a-1)/x - (b-1)/(1-x)
                adj_scalar[x.0] += a_s * ((av - 1.0) / xv - (bv - 1.0) / (1.0 - xv));
                let psi_ab = digamma(av + bv);
                adj_scalar[alpha.0] += a_s * (xv.ln() - digamma(av) + psi_ab);
                adj_scalar[beta.0] += a_s * ((1.0 - xv).ln() - digamma(bv) + psi_ab);
            }
            Op::BinomialObsLogP {
                p_vec,
                trials_idx,
                obs_idx,
            } => {
                let p = values[p_vec.0].as_vector();
                let trials = &graph.data_vectors[*trials_idx];
                let obs = &graph.obs_vectors[*obs_idx];

                // d logp / d p_i = k/p - (n-k)/(1-p)
                let dp: Vec<f64> = p
                    .iter()
                    .zip(trials.iter().zip(obs.iter()))
                    .map(|(&pi, (&ni, &ki))| a_s * (ratio(ki, pi) - ratio(ni - ki, 1.0 - pi)))
                    .collect();
                merge_vec_adj(&mut adj_vector[p_vec.0], &dp);
            }
            Op::BinomialLogitObsLogP {
                logit_vec,
                trials_idx,
                obs_idx,
            } => {
                let l = values[logit_vec.0].as_vector();
                let trials = &graph.data_vectors[*trials_idx];
                let obs = &graph.obs_vectors[*obs_idx];

                // d logp / d l_i = k - n * sigmoid(l)
                let dl: Vec<f64> = l
                    .iter()
                    .zip(trials.iter().zip(obs.iter()))
                    .map(|(&li, (&ni, &ki))| a_s * (ki - ni * sigmoid(li)))
                    .collect();
                merge_vec_adj(&mut adj_vector[logit_vec.0], &dl);
            }
        }
    }

    let mut grad = vec![0.0; graph.param_count];
    for node in &graph.nodes {
        if let Op::Param(pidx) = node.op {
            grad[pidx] = adj_scalar[node.id.0];
        }
    }

    (total_logp, grad)
}

fn merge_vec_adj(slot: &mut Option<Vec<f64>>, incoming: &[f64]) {
    match slot {
        Some(ref mut existing) => {
            for (e, i) in existing.iter_mut().zip(incoming.iter()) {
                *e += i;
            }
        }
        None => {
            *slot = Some(incoming.to_vec());
        }
    }
}

/// `a * ln(b)` with the convention `0 * ln(0) = 0`.
fn xlogy(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        0.0
    } else {
        a * b.ln()
    }
}

/// `a / b` with the convention `0 / 0 = 0`.
fn ratio(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        0.0
    } else {
        a / b
    }
}

fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn ln_choose(n: f64, k: f64) -> f64 {
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}

fn normal_logp_scalar(x: f64, mu: f64, sigma: f64) -> f64 {
    let diff = x - mu;
    -0.5 * (diff * diff) / (sigma * sigma) - sigma.ln() - 0.5 * std::f64::consts::TAU.ln()
}

fn beta_logp_scalar(x: f64, alpha: f64, beta: f64) -> f64 {
    if x <= 0.0 || x >= 1.0 {
        return f64::NEG_INFINITY;
    }
    xlogy(alpha - 1.0, x) + xlogy(beta - 1.0, 1.0 - x) - ln_beta(alpha, beta)
}

fn binomial_logp_sum(p: &[f64], trials: &[f64], obs: &[f64]) -> f64 {
    p.iter()
        .zip(trials.iter().zip(obs.iter()))
        .map(|(&pi, (&ni, &ki))| {
            if !(0.0..=1.0).contains(&pi) {
                return f64::NEG_INFINITY;
            }
            ln_choose(ni, ki) + xlogy(ki, pi) + xlogy(ni - ki, 1.0 - pi)
        })
        .sum()
}

fn binomial_logit_logp_sum(logit: &[f64], trials: &[f64], obs: &[f64]) -> f64 {
    logit
        .iter()
        .zip(trials.iter().zip(obs.iter()))
        .map(|(&li, (&ni, &ki))| ln_choose(ni, ki) + ki * li - ni * softplus(li))
        .sum()
}
