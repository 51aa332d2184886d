use thiserror::Error;

/// Errors raised while building a model or running a sampler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch for {what}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),

    #[error("initial log-probability is not finite ({0}); check the initial values")]
    NonFiniteInitialLogp(f64),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),
}

pub type Result<T> = std::result::Result<T, Error>;
