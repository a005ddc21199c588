//! Domain sampling.
//!
//! One engine run sweeps the primary variable across its resolved domain,
//! evaluates the compiled formula once per sample point, and assembles the
//! ordered dataset. A run is a pure function of (schema, binding, resolution):
//! no hidden state, safe to recompute on every parameter change.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::formula_engine::compile_formula;
use crate::schema::{OutputVariable, SimulationSchema, VariableBinding, VariableDef};

/// Sample count substituted when the requested resolution is not positive.
pub const DEFAULT_RESOLUTION: usize = 100;

/// Column key for a scalar formula result when no outputs are declared.
pub const FALLBACK_OUTPUT_SYMBOL: &str = "y";

/// One sampled point: column key to value, in insertion order (primary
/// symbol, then declared variables, then outputs in formula order).
pub type DataPoint = IndexMap<String, f64>;

/// The result of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationData {
    /// Ordered by the primary sweep (ascending for a forward domain).
    /// May hold fewer than `N + 1` points when samples were skipped.
    pub points: Vec<DataPoint>,
    /// The sweep variable with its domain resolved, or `None` for a schema
    /// without variables.
    pub primary: Option<VariableDef>,
    /// Declared outputs, unchanged; empty when the schema declares none.
    pub outputs: Vec<OutputVariable>,
}

impl SimulationData {
    fn empty(primary: Option<VariableDef>, outputs: Vec<OutputVariable>) -> Self {
        Self {
            points: Vec::new(),
            primary,
            outputs,
        }
    }
}

/// Rounds to `digits` decimal places, half away from zero. Non-finite values
/// pass through unchanged.
pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

pub(crate) fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

pub(crate) fn round4(value: f64) -> f64 {
    round_to(value, 4)
}

/// Samples the schema's formula across the primary variable's domain.
///
/// Emits `N + 1` points for resolution `N` (default 100 when `N == 0`),
/// skipping any sample whose evaluation fails. Never fails itself: a schema
/// without variables, or a formula the engine rejects, produces an empty
/// dataset.
pub fn sample_domain(
    schema: &SimulationSchema,
    binding: &VariableBinding,
    resolution: usize,
) -> SimulationData {
    let Some(primary) = schema.primary_variable() else {
        return SimulationData::empty(None, schema.outputs.clone());
    };

    let (min, max) = primary.resolved_domain();
    let mut resolved_primary = primary.clone();
    resolved_primary.min = min;
    resolved_primary.max = max;

    let steps = if resolution == 0 {
        DEFAULT_RESOLUTION
    } else {
        resolution
    };
    let step_size = (max - min) / steps as f64;

    let variables: Vec<String> = schema.variables.iter().map(|v| v.symbol.clone()).collect();
    let scalar_symbol = schema
        .outputs
        .first()
        .map(|o| o.symbol.as_str())
        .unwrap_or(FALLBACK_OUTPUT_SYMBOL);

    let program = match compile_formula(&schema.formula, &variables, scalar_symbol) {
        Ok(program) => program,
        Err(err) => {
            warn!(error = %err, "formula rejected; run produces an empty dataset");
            return SimulationData::empty(Some(resolved_primary), schema.outputs.clone());
        }
    };
    if program.is_fallback() {
        warn!("formula body is blank; sampling the constant-zero fallback");
    }

    let mut eval_binding = binding.clone();
    let mut points = Vec::with_capacity(steps + 1);
    for i in 0..=steps {
        let x = round2(min + step_size * i as f64);
        eval_binding.insert(primary.symbol.clone(), x);

        let results = match program.eval(&eval_binding) {
            Ok(results) => results,
            Err(err) => {
                debug!(sample = i, error = %err, "sample skipped");
                continue;
            }
        };

        let mut point = DataPoint::with_capacity(schema.variables.len() + results.len());
        point.insert(primary.symbol.clone(), x);
        for v in &schema.variables {
            if let Some(&value) = eval_binding.get(&v.symbol) {
                point.entry(v.symbol.clone()).or_insert(value);
            }
        }
        for (symbol, value) in results {
            point.insert(symbol, round4(value));
        }
        points.push(point);
    }

    SimulationData {
        points,
        primary: Some(resolved_primary),
        outputs: schema.outputs.clone(),
    }
}
