//! Ingestion of untrusted Model-Provider schema payloads.
//!
//! A provider returns JSON describing a model: variables, outputs, a formula
//! body, and narrative text. Nothing about that payload can be trusted, so
//! deserialization treats every field as optional and `ingest_schema`
//! normalizes the result into a schema the engine accepts, repairing what it
//! must. Ingestion never rejects a payload that deserializes; malformed JSON
//! is the only hard error.

use std::collections::HashSet;

use anyhow::Result;
use locus_core::schema::{
    OutputVariable, SimulationSchema, VariableDef, DEFAULT_DOMAIN_MAX, DEFAULT_DOMAIN_MIN,
    DEFAULT_STEP,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed schema payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source of schema payloads, typically an external language model.
///
/// The engine side of the boundary: free-form problem text in, raw payload
/// out. Implementations own their transport and prompt handling.
pub trait ModelProvider {
    fn schema_for(&self, problem: &str) -> Result<SchemaPayload>;
}

/// Raw provider schema, before normalization. Field aliases accept the
/// camelCase spellings providers commonly emit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputVariables")]
    pub variables: Vec<VariablePayload>,
    #[serde(default, alias = "outputVariables")]
    pub outputs: Vec<OutputPayload>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default, alias = "displayFormula")]
    pub display_formula: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariablePayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub default: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub visible: Option<bool>,
}

/// Parses and normalizes a provider payload from JSON.
pub fn ingest_json(json: &str) -> Result<(SimulationSchema, Vec<String>), IngestError> {
    let payload: SchemaPayload = serde_json::from_str(json)?;
    Ok(ingest_schema(payload))
}

/// Normalizes a raw payload into a valid schema.
///
/// Absent fields take their documented defaults silently; supplied but
/// invalid values are repaired and recorded. The returned notes describe
/// every repair applied, for logging or display.
pub fn ingest_schema(payload: SchemaPayload) -> (SimulationSchema, Vec<String>) {
    let mut repairs = Vec::new();

    let mut used = HashSet::new();
    let mut variables: Vec<VariableDef> = payload
        .variables
        .into_iter()
        .enumerate()
        .map(|(index, raw)| normalize_variable(raw, index, &mut used, &mut repairs))
        .collect();
    if variables.is_empty() {
        note(
            &mut repairs,
            "no input variables declared; added the default sweep variable `x`".to_string(),
        );
        variables.push(VariableDef::default_sweep());
    }

    let mut used = HashSet::new();
    let outputs: Vec<OutputVariable> = payload
        .outputs
        .into_iter()
        .enumerate()
        .map(|(index, raw)| normalize_output(raw, index, &mut used, &mut repairs))
        .collect();

    let formula = payload.formula.unwrap_or_default();
    if formula.trim().is_empty() {
        note(
            &mut repairs,
            "formula body is blank; the constant-zero fallback will be used".to_string(),
        );
    }

    let schema = SimulationSchema {
        title: payload.title.unwrap_or_default(),
        description: payload.description.unwrap_or_default(),
        variables,
        outputs,
        formula,
        explanation: payload.explanation.unwrap_or_default(),
        display_formula: payload.display_formula.unwrap_or_default(),
    };

    if !repairs.is_empty() {
        warn!(
            repairs = repairs.len(),
            title = %schema.title,
            "provider schema needed repairs"
        );
    }
    (schema, repairs)
}

fn note(repairs: &mut Vec<String>, message: String) {
    debug!(repair = %message, "schema payload repaired");
    repairs.push(message);
}

/// A symbol must be referenceable from a formula body and survive delimited
/// export: a letter followed by alphanumerics or underscores, the same shape
/// the formula tokenizer reads.
fn is_identifier(symbol: &str) -> bool {
    let mut chars = symbol.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

fn resolve_symbol(
    raw: Option<String>,
    generated: String,
    used: &mut HashSet<String>,
    repairs: &mut Vec<String>,
) -> String {
    let trimmed = raw.unwrap_or_default().trim().to_string();
    let base = if trimmed.is_empty() {
        note(repairs, format!("blank symbol; generated `{generated}`"));
        generated
    } else if !is_identifier(&trimmed) {
        note(
            repairs,
            format!("symbol `{trimmed}` is not a valid identifier; generated `{generated}`"),
        );
        generated
    } else {
        trimmed
    };

    let mut symbol = base.clone();
    let mut suffix = 2;
    while used.contains(&symbol) {
        symbol = format!("{base}{suffix}");
        suffix += 1;
    }
    if symbol != base {
        note(
            repairs,
            format!("duplicate symbol `{base}`; renamed to `{symbol}`"),
        );
    }
    used.insert(symbol.clone());
    symbol
}

fn normalize_variable(
    raw: VariablePayload,
    index: usize,
    used: &mut HashSet<String>,
    repairs: &mut Vec<String>,
) -> VariableDef {
    let symbol = resolve_symbol(raw.symbol, format!("x{}", index + 1), used, repairs);

    let mut min = match raw.min {
        Some(v) if v.is_finite() => v,
        Some(v) => {
            note(repairs, format!("variable `{symbol}`: min {v} is not finite"));
            DEFAULT_DOMAIN_MIN
        }
        None => DEFAULT_DOMAIN_MIN,
    };
    let mut max = match raw.max {
        Some(v) if v.is_finite() => v,
        Some(v) => {
            note(repairs, format!("variable `{symbol}`: max {v} is not finite"));
            DEFAULT_DOMAIN_MAX
        }
        None => DEFAULT_DOMAIN_MAX,
    };
    if min > max {
        note(
            repairs,
            format!("variable `{symbol}`: bounds [{min}, {max}] are reversed"),
        );
        std::mem::swap(&mut min, &mut max);
    }

    let step = match raw.step {
        Some(v) if v.is_finite() && v > 0.0 => v,
        Some(v) => {
            note(repairs, format!("variable `{symbol}`: step {v} is not usable"));
            DEFAULT_STEP
        }
        None => DEFAULT_STEP,
    };

    let default = match raw.default {
        Some(v) if v.is_finite() => {
            let clamped = v.clamp(min, max);
            if clamped != v {
                note(
                    repairs,
                    format!("variable `{symbol}`: default {v} lies outside [{min}, {max}]"),
                );
            }
            clamped
        }
        Some(v) => {
            note(repairs, format!("variable `{symbol}`: default {v} is not finite"));
            0f64.clamp(min, max)
        }
        None => 0f64.clamp(min, max),
    };

    let name = raw
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| symbol.clone());

    VariableDef {
        name,
        symbol,
        min,
        max,
        default,
        step,
        description: raw.description.unwrap_or_default(),
    }
}

fn normalize_output(
    raw: OutputPayload,
    index: usize,
    used: &mut HashSet<String>,
    repairs: &mut Vec<String>,
) -> OutputVariable {
    let symbol = resolve_symbol(raw.symbol, format!("y{}", index + 1), used, repairs);
    let name = raw
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| symbol.clone());

    OutputVariable {
        name,
        symbol,
        unit: raw.unit,
        color: raw.color,
        visible: raw.visible.unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingest_value(value: serde_json::Value) -> (SimulationSchema, Vec<String>) {
        ingest_json(&value.to_string()).expect("payload should deserialize")
    }

    #[test]
    fn well_formed_payload_passes_through_without_repairs() {
        let (schema, repairs) = ingest_value(json!({
            "title": "Projectile height",
            "description": "Height of a thrown ball over time.",
            "inputVariables": [
                {"name": "Time", "symbol": "t", "min": 0.0, "max": 5.0,
                 "default": 0.0, "step": 0.1, "description": "seconds"}
            ],
            "outputVariables": [
                {"name": "Height", "symbol": "h", "unit": "m", "color": "#3366cc"}
            ],
            "formula": "h = 20*t - 4.9*t^2",
            "explanation": "Quadratic under gravity.",
            "displayFormula": "h(t) = 20t - 4.9t^2"
        }));

        assert!(repairs.is_empty(), "unexpected repairs: {repairs:?}");
        assert_eq!(schema.title, "Projectile height");
        assert_eq!(schema.variables.len(), 1);
        assert_eq!(schema.variables[0].symbol, "t");
        assert_eq!(schema.variables[0].max, 5.0);
        assert_eq!(schema.outputs[0].unit.as_deref(), Some("m"));
        assert!(schema.outputs[0].visible);
        assert_eq!(schema.display_formula, "h(t) = 20t - 4.9t^2");
    }

    #[test]
    fn empty_payload_gets_the_default_sweep_variable() {
        let (schema, repairs) = ingest_value(json!({}));

        assert_eq!(schema.variables.len(), 1);
        let var = &schema.variables[0];
        assert_eq!(var.symbol, "x");
        assert_eq!((var.min, var.max), (DEFAULT_DOMAIN_MIN, DEFAULT_DOMAIN_MAX));
        assert_eq!(var.default, 0.0);
        assert_eq!(var.step, DEFAULT_STEP);
        assert!(schema.formula.is_empty());
        assert!(!repairs.is_empty());
    }

    #[test]
    fn snake_case_field_names_deserialize_too() {
        let (schema, _) = ingest_value(json!({
            "variables": [{"symbol": "t"}],
            "outputs": [{"symbol": "h"}],
            "display_formula": "h(t)"
        }));

        assert_eq!(schema.variables[0].symbol, "t");
        assert_eq!(schema.outputs[0].symbol, "h");
        assert_eq!(schema.display_formula, "h(t)");
    }

    #[test]
    fn non_finite_bounds_are_replaced_and_noted() {
        let payload = SchemaPayload {
            variables: vec![VariablePayload {
                symbol: Some("t".to_string()),
                min: Some(f64::NAN),
                max: Some(f64::INFINITY),
                ..Default::default()
            }],
            formula: Some("t".to_string()),
            ..Default::default()
        };

        let (schema, repairs) = ingest_schema(payload);
        let var = &schema.variables[0];
        assert_eq!((var.min, var.max), (DEFAULT_DOMAIN_MIN, DEFAULT_DOMAIN_MAX));
        assert_eq!(repairs.len(), 2, "repairs: {repairs:?}");
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let (schema, repairs) = ingest_value(json!({
            "variables": [{"symbol": "t", "min": 10.0, "max": 0.0}],
            "formula": "t"
        }));

        let var = &schema.variables[0];
        assert_eq!((var.min, var.max), (0.0, 10.0));
        assert!(repairs.iter().any(|r| r.contains("reversed")));
    }

    #[test]
    fn blank_symbols_are_generated_positionally() {
        let (schema, _) = ingest_value(json!({
            "variables": [{"symbol": ""}, {}],
            "outputs": [{}],
            "formula": "0"
        }));

        assert_eq!(schema.variables[0].symbol, "x1");
        assert_eq!(schema.variables[1].symbol, "x2");
        assert_eq!(schema.outputs[0].symbol, "y1");
    }

    #[test]
    fn duplicate_symbols_keep_the_first_and_rename_the_rest() {
        let (schema, repairs) = ingest_value(json!({
            "variables": [{"symbol": "t"}, {"symbol": "t"}, {"symbol": "t"}],
            "formula": "t"
        }));

        let symbols: Vec<&str> = schema.variables.iter().map(|v| v.symbol.as_str()).collect();
        assert_eq!(symbols, ["t", "t2", "t3"]);
        assert!(repairs.iter().any(|r| r.contains("duplicate symbol")));
    }

    #[test]
    fn non_identifier_symbols_are_regenerated() {
        // `a-b` can never be referenced from a formula, and `profit,margin`
        // would corrupt a delimited export. Both get positional symbols.
        let (schema, repairs) = ingest_value(json!({
            "variables": [{"symbol": "a-b"}, {"symbol": "k_2"}, {"symbol": "2x"}],
            "outputs": [{"symbol": "profit,margin"}],
            "formula": "k_2"
        }));

        let symbols: Vec<&str> = schema.variables.iter().map(|v| v.symbol.as_str()).collect();
        assert_eq!(symbols, ["x1", "k_2", "x3"]);
        assert_eq!(schema.outputs[0].symbol, "y1");
        assert!(
            repairs.iter().any(|r| r.contains("not a valid identifier")),
            "repairs: {repairs:?}"
        );
    }

    #[test]
    fn out_of_range_default_is_clamped() {
        let (schema, repairs) = ingest_value(json!({
            "variables": [{"symbol": "t", "min": 0.0, "max": 10.0, "default": 99.0}],
            "formula": "t"
        }));

        assert_eq!(schema.variables[0].default, 10.0);
        assert!(repairs.iter().any(|r| r.contains("outside")));
    }

    #[test]
    fn missing_default_clamps_zero_into_the_domain() {
        let (schema, _) = ingest_value(json!({
            "variables": [{"symbol": "t", "min": 5.0, "max": 10.0}],
            "formula": "t"
        }));

        assert_eq!(schema.variables[0].default, 5.0);
    }

    #[test]
    fn non_positive_step_is_replaced() {
        let (schema, repairs) = ingest_value(json!({
            "variables": [{"symbol": "t", "step": -1.0}],
            "formula": "t"
        }));

        assert_eq!(schema.variables[0].step, DEFAULT_STEP);
        assert!(repairs.iter().any(|r| r.contains("step")));
    }

    #[test]
    fn blank_formula_is_noted_but_kept() {
        let (schema, repairs) = ingest_value(json!({
            "variables": [{"symbol": "t"}],
            "formula": "   "
        }));

        assert_eq!(schema.formula, "   ");
        assert!(repairs.iter().any(|r| r.contains("fallback")));
    }

    #[test]
    fn variable_name_falls_back_to_the_symbol() {
        let (schema, _) = ingest_value(json!({
            "variables": [{"symbol": "t"}],
            "formula": "t"
        }));

        assert_eq!(schema.variables[0].name, "t");
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let (schema, _) = ingest_value(json!({
            "variables": [{"symbol": "t", "confidence": 0.93}],
            "formula": "t",
            "modelVersion": "v2"
        }));

        assert_eq!(schema.variables[0].symbol, "t");
    }

    #[test]
    fn malformed_json_is_the_only_hard_error() {
        let result = ingest_json("this is not json");
        assert!(matches!(result, Err(IngestError::Json(_))));
    }

    #[test]
    fn hidden_visibility_hint_survives_ingestion() {
        let (schema, _) = ingest_value(json!({
            "variables": [{"symbol": "t"}],
            "outputs": [{"symbol": "a"}, {"symbol": "b", "visible": false}],
            "formula": "a = t; b = -t"
        }));

        assert!(schema.outputs[0].visible);
        assert!(!schema.outputs[1].visible);
    }
}
