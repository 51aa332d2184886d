//! Log-density graphs, adaptive MCMC samplers and posterior summaries for
//! small Bayesian hierarchical models, with the OpenBUGS Air and Surgical
//! examples built in.

pub mod autodiff;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod hmc;
pub mod metropolis;
pub mod models;
pub mod progress;
pub mod sampler;

pub use error::{Error, Result};
