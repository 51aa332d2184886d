//! Example models from the OpenBUGS collection.
//!
//! Each model module exposes its literal data and initial values as
//! `Default` implementations and a `build` function that turns them into a
//! [`Graph`], together with the published (or exact) posterior summaries the
//! sampler output can be checked against.

pub mod air;
pub mod surgical;

use crate::diagnostics::DiagnosticsReport;
use crate::error::{Error, Result};
use crate::graph::Graph;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A model ready to be sampled.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: &'static str,
    pub graph: Graph,
    pub reference: Vec<ReferenceValue>,
}

/// Expected posterior mean and standard deviation of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceValue {
    pub node: String,
    pub mean: f64,
    pub sd: f64,
}

impl ReferenceValue {
    pub fn new(node: impl Into<String>, mean: f64, sd: f64) -> Self {
        Self {
            node: node.into(),
            mean,
            sd,
        }
    }
}

/// Outcome of comparing one posterior summary against its reference.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceCheck {
    pub node: String,
    pub reference_mean: f64,
    pub reference_sd: f64,
    pub posterior_mean: f64,
    /// |posterior mean - reference mean| in units of the reference sd.
    pub deviation: f64,
    pub passed: bool,
}

/// Compare posterior means with reference values. A node passes when its
/// mean lies within `tolerance` reference standard deviations.
pub fn check_reference(
    report: &DiagnosticsReport,
    reference: &[ReferenceValue],
    tolerance: f64,
) -> Result<Vec<ReferenceCheck>> {
    reference
        .iter()
        .map(|r| {
            let node = report
                .node(&r.node)
                .ok_or_else(|| Error::UnknownNode(r.node.clone()))?;
            let deviation = (node.mean - r.mean).abs() / r.sd;
            Ok(ReferenceCheck {
                node: r.node.clone(),
                reference_mean: r.mean,
                reference_sd: r.sd,
                posterior_mean: node.mean,
                deviation,
                passed: deviation <= tolerance,
            })
        })
        .collect()
}

/// The bundled models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Air,
    Surgical,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Air, ModelKind::Surgical];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Air => "air",
            ModelKind::Surgical => "surgical",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelKind::Air => {
                "Air: Berkson measurement error, respiratory illness vs NO2 exposure in 103 children"
            }
            ModelKind::Surgical => {
                "Surgical: institutional ranking, mortality in 12 hospitals performing cardiac surgery in babies"
            }
        }
    }

    /// Build the model over its published data and initial values.
    pub fn build(&self) -> Result<Model> {
        match self {
            ModelKind::Air => air::build(&air::AirData::default(), &air::AirInits::default()),
            ModelKind::Surgical => surgical::build(
                &surgical::SurgicalData::default(),
                &surgical::SurgicalInits::default(),
            ),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownModel(s.to_string()))
    }
}
