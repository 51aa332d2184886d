use std::collections::HashMap;
use std::ops::Range;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Operations supported in the computation graph.
#[derive(Debug, Clone)]
pub enum Op {
    /// A free parameter to be sampled (index into the parameter vector).
    /// Its value is always the raw, unconstrained one.
    Param(usize),
    /// A constant scalar value baked into the graph.
    Constant(f64),
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Log(NodeId),
    /// Inverse logit: 1 / (1 + exp(-x)).
    Sigmoid(NodeId),
    /// Gather scalar nodes into a vector, in order.
    Stack(Vec<NodeId>),
    /// Log-density of a Normal distribution: logp(x | mu, sigma).
    NormalLogP {
        x: NodeId,
        mu: NodeId,
        sigma: NodeId,
    },
    /// Log-density of a Beta distribution: logp(x | alpha, beta).
    BetaLogP {
        x: NodeId,
        alpha: NodeId,
        beta: NodeId,
    },
    /// Sum of Binomial log-masses of observed counts given a probability vector.
    BinomialObsLogP {
        p_vec: NodeId,
        trials_idx: usize,
        obs_idx: usize,
    },
    /// Same as `BinomialObsLogP` but parameterised on the logit scale,
    /// which keeps the likelihood finite for extreme linear predictors.
    BinomialLogitObsLogP {
        logit_vec: NodeId,
        trials_idx: usize,
        obs_idx: usize,
    },
}

/// A single node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub name: Option<String>,
}

/// Mapping between the sampler's unconstrained space and a parameter's support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamTransform {
    /// Real line, sampled as is.
    Identity,
    /// Unit interval, x = sigmoid(raw).
    Sigmoid,
}

impl ParamTransform {
    pub fn constrain(&self, raw: f64) -> f64 {
        match self {
            ParamTransform::Identity => raw,
            ParamTransform::Sigmoid => sigmoid(raw),
        }
    }

    pub fn unconstrain(&self, x: f64) -> f64 {
        match self {
            ParamTransform::Identity => x,
            ParamTransform::Sigmoid => (x / (1.0 - x)).ln(),
        }
    }
}

/// A named stochastic variable owning a contiguous range of parameters.
///
/// Scalar variables own one parameter, vector variables (`z[1..3]`) own one
/// per element. The Metropolis sampler proposes a whole block at once.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub params: Range<usize>,
}

/// The computational graph representing a probabilistic model.
///
/// Stores nodes in topological order (each node only references earlier nodes).
/// Data vectors and observed values are stored separately from the graph
/// structure so the graph itself stays lightweight and shareable across threads.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub param_count: usize,
    pub data_vectors: Vec<Vec<f64>>,
    pub obs_vectors: Vec<Vec<f64>>,
    pub param_names: Vec<String>,
    pub param_transforms: Vec<ParamTransform>,
    /// Initial values on the raw scale.
    pub param_inits: Vec<f64>,
    pub logp_terms: Vec<NodeId>,
    /// Traced nodes that are functions of the parameters, not sampled themselves.
    pub deterministics: Vec<(String, NodeId)>,
    pub blocks: Vec<Block>,
    open_block: Option<(String, usize)>,
    name_to_node: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            param_count: 0,
            data_vectors: Vec::new(),
            obs_vectors: Vec::new(),
            param_names: Vec::new(),
            param_transforms: Vec::new(),
            param_inits: Vec::new(),
            logp_terms: Vec::new(),
            deterministics: Vec::new(),
            blocks: Vec::new(),
            open_block: None,
            name_to_node: HashMap::new(),
        }
    }

    fn add_node(&mut self, op: Op, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(ref n) = name {
            self.name_to_node.insert(n.clone(), id);
        }
        self.nodes.push(Node { id, op, name });
        id
    }

    pub fn add_param(&mut self, name: &str) -> NodeId {
        self.add_param_with_transform(name, ParamTransform::Identity, 0.0)
    }

    /// Add a free parameter. `init` is given on the natural scale.
    ///
    /// Outside of `begin_block`/`end_block` the parameter forms a block of its own.
    pub fn add_param_with_transform(
        &mut self,
        name: &str,
        transform: ParamTransform,
        init: f64,
    ) -> NodeId {
        let idx = self.param_count;
        self.param_count += 1;
        self.param_names.push(name.to_string());
        self.param_transforms.push(transform);
        self.param_inits.push(transform.unconstrain(init));
        if self.open_block.is_none() {
            self.blocks.push(Block {
                name: name.to_string(),
                params: idx..idx + 1,
            });
        }
        self.add_node(Op::Param(idx), Some(name.to_string()))
    }

    /// Group every parameter added until `end_block` into one stochastic block.
    pub fn begin_block(&mut self, name: &str) {
        self.end_block();
        self.open_block = Some((name.to_string(), self.param_count));
    }

    pub fn end_block(&mut self) {
        if let Some((name, start)) = self.open_block.take() {
            if start < self.param_count {
                self.blocks.push(Block {
                    name,
                    params: start..self.param_count,
                });
            }
        }
    }

    pub fn add_constant(&mut self, value: f64) -> NodeId {
        self.add_node(Op::Constant(value), None)
    }

    /// Store a fixed data vector (e.g. binomial trial counts).
    pub fn add_data(&mut self, values: Vec<f64>) -> usize {
        let idx = self.data_vectors.len();
        self.data_vectors.push(values);
        idx
    }

    pub fn add_obs_data(&mut self, values: Vec<f64>) -> usize {
        let idx = self.obs_vectors.len();
        self.obs_vectors.push(values);
        idx
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Add(a, b), None)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Sub(a, b), None)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Mul(a, b), None)
    }

    pub fn log(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Log(a), None)
    }

    pub fn sigmoid(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Sigmoid(a), None)
    }

    pub fn stack(&mut self, elems: Vec<NodeId>) -> NodeId {
        self.add_node(Op::Stack(elems), None)
    }

    pub fn normal_logp(&mut self, x: NodeId, mu: NodeId, sigma: NodeId) -> NodeId {
        let node = self.add_node(Op::NormalLogP { x, mu, sigma }, None);
        self.logp_terms.push(node);
        node
    }

    pub fn beta_logp(&mut self, x: NodeId, alpha: NodeId, beta: NodeId) -> NodeId {
        let node = self.add_node(Op::BetaLogP { x, alpha, beta }, None);
        self.logp_terms.push(node);
        node
    }

    pub fn binomial_obs_logp(&mut self, p_vec: NodeId, trials_idx: usize, obs_idx: usize) -> NodeId {
        let node = self.add_node(
            Op::BinomialObsLogP {
                p_vec,
                trials_idx,
                obs_idx,
            },
            None,
        );
        self.logp_terms.push(node);
        node
    }

    pub fn binomial_logit_obs_logp(
        &mut self,
        logit_vec: NodeId,
        trials_idx: usize,
        obs_idx: usize,
    ) -> NodeId {
        let node = self.add_node(
            Op::BinomialLogitObsLogP {
                logit_vec,
                trials_idx,
                obs_idx,
            },
            None,
        );
        self.logp_terms.push(node);
        node
    }

    /// Register an arbitrary scalar node as an additional log-probability term
    /// (used for change-of-variable Jacobians).
    pub fn add_logp_term(&mut self, node: NodeId) {
        self.logp_terms.push(node);
    }

    /// Trace a scalar node under `name` alongside the sampled parameters.
    pub fn add_deterministic(&mut self, name: &str, node: NodeId) {
        self.name_to_node.insert(name.to_string(), node);
        self.deterministics.push((name.to_string(), node));
    }

    /// Length of a vector-valued node, `None` for scalars.
    pub fn vector_len(&self, id: NodeId) -> Option<usize> {
        match &self.nodes[id.0].op {
            Op::Stack(elems) => Some(elems.len()),
            _ => None,
        }
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    pub fn initial_values(&self) -> Vec<f64> {
        self.param_inits.clone()
    }

    /// Names of every traced quantity: parameters first, then deterministics.
    pub fn trace_names(&self) -> Vec<String> {
        self.param_names
            .iter()
            .cloned()
            .chain(self.deterministics.iter().map(|(name, _)| name.clone()))
            .collect()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
