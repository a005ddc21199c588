//! Interactive exploration session over one active schema.
//!
//! A session owns the schema snapshot plus the three things a frontend
//! mutates between runs: the variable binding, the sample resolution, and
//! the visible-output set. `run` is a full recompute and holds no state
//! between calls, so it is safe to call on every slider tick.

use std::collections::HashSet;

use anyhow::Result;
use locus_core::intersection::{find_intersections, Intersection};
use locus_core::schema::{OutputVariable, SimulationSchema, VariableBinding};
use locus_core::simulation::{sample_domain, SimulationData, DEFAULT_RESOLUTION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ingest::{ingest_schema, ModelProvider};

pub const MAX_RESOLUTION: usize = 500;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("no variable with symbol `{0}` in the active schema")]
    UnknownVariable(String),
    #[error("no output with symbol `{0}` in the active schema")]
    UnknownOutput(String),
}

/// The result of one full recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub data: SimulationData,
    pub intersections: Vec<Intersection>,
}

#[derive(Debug, Clone)]
pub struct Session {
    schema: SimulationSchema,
    binding: VariableBinding,
    resolution: usize,
    hidden: HashSet<String>,
}

impl Session {
    /// Starts a session: binding from variable defaults, default resolution,
    /// visibility from each output's hint.
    pub fn new(schema: SimulationSchema) -> Self {
        let binding = schema.default_binding();
        let hidden = schema
            .outputs
            .iter()
            .filter(|output| !output.visible)
            .map(|output| output.symbol.clone())
            .collect();
        Session {
            schema,
            binding,
            resolution: DEFAULT_RESOLUTION,
            hidden,
        }
    }

    /// Asks a provider to model the problem text and starts a session on the
    /// ingested schema.
    pub fn from_problem(provider: &dyn ModelProvider, problem: &str) -> Result<Session> {
        let payload = provider.schema_for(problem)?;
        let (schema, repairs) = ingest_schema(payload);
        if !repairs.is_empty() {
            info!(
                repairs = repairs.len(),
                title = %schema.title,
                "provider schema repaired during ingestion"
            );
        }
        Ok(Session::new(schema))
    }

    pub fn schema(&self) -> &SimulationSchema {
        &self.schema
    }

    pub fn binding(&self) -> &VariableBinding {
        &self.binding
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// Updates one variable, clamped into its declared domain. Non-finite
    /// values fall back to the variable's default. Returns the value stored.
    pub fn set_value(&mut self, symbol: &str, value: f64) -> Result<f64, SessionError> {
        let var = self
            .schema
            .variable(symbol)
            .ok_or_else(|| SessionError::UnknownVariable(symbol.to_string()))?;
        let (min, max) = var.resolved_domain();
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let stored = if value.is_finite() {
            value.clamp(lo, hi)
        } else {
            var.default
        };
        self.binding.insert(symbol.to_string(), stored);
        Ok(stored)
    }

    /// Clamps the requested resolution into `1..=MAX_RESOLUTION` and returns
    /// the value in effect.
    pub fn set_resolution(&mut self, resolution: usize) -> usize {
        self.resolution = resolution.clamp(1, MAX_RESOLUTION);
        self.resolution
    }

    pub fn set_output_visible(&mut self, symbol: &str, visible: bool) -> Result<(), SessionError> {
        if self.schema.output(symbol).is_none() {
            return Err(SessionError::UnknownOutput(symbol.to_string()));
        }
        if visible {
            self.hidden.remove(symbol);
        } else {
            self.hidden.insert(symbol.to_string());
        }
        Ok(())
    }

    /// Declared outputs minus the hidden set, in declaration order.
    pub fn visible_outputs(&self) -> Vec<OutputVariable> {
        self.schema
            .outputs
            .iter()
            .filter(|output| !self.hidden.contains(&output.symbol))
            .cloned()
            .collect()
    }

    /// Full recompute: resample the domain, then scan the visible outputs
    /// for intersections. Pure in the session state.
    pub fn run(&self) -> SimulationRun {
        let data = sample_domain(&self.schema, &self.binding, self.resolution);
        let intersections = find_intersections(&data, &self.visible_outputs());
        SimulationRun {
            data,
            intersections,
        }
    }

    /// Replaces the schema wholesale (a new problem); binding, resolution,
    /// and visibility all reset.
    pub fn replace_schema(&mut self, schema: SimulationSchema) {
        *self = Session::new(schema);
    }
}
