use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Domain bounds substituted when a schema does not carry usable ones.
pub const DEFAULT_DOMAIN_MIN: f64 = -10.0;
pub const DEFAULT_DOMAIN_MAX: f64 = 10.0;

/// Slider increment substituted when a schema does not carry a usable one.
pub const DEFAULT_STEP: f64 = 0.1;

/// Concrete assignment of values to declared variable symbols.
///
/// Must hold an entry for every declared [`VariableDef`] symbol. The engine
/// overrides the primary symbol per sample and never mutates the caller's map.
pub type VariableBinding = HashMap<String, f64>;

/// One independent (input) variable of a schema.
///
/// The first entry of [`SimulationSchema::variables`] is the primary sweep
/// variable: the one axis the engine iterates over. The remaining entries
/// hold their bound value for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    /// Display label.
    pub name: String,
    /// Unique binding key; evaluator argument name and dataset column key.
    pub symbol: String,
    pub min: f64,
    pub max: f64,
    /// Initial bound value; expected inside `[min, max]`.
    pub default: f64,
    /// Slider increment hint for the presentation layer.
    pub step: f64,
    pub description: String,
}

impl VariableDef {
    /// The sweep variable substituted when a schema declares no variables.
    pub fn default_sweep() -> Self {
        Self {
            name: "x".to_string(),
            symbol: "x".to_string(),
            min: DEFAULT_DOMAIN_MIN,
            max: DEFAULT_DOMAIN_MAX,
            default: 0.0,
            step: DEFAULT_STEP,
            description: "Default sweep variable".to_string(),
        }
    }

    /// Sampling domain with non-finite bounds replaced by the defaults.
    pub fn resolved_domain(&self) -> (f64, f64) {
        let min = if self.min.is_finite() {
            self.min
        } else {
            DEFAULT_DOMAIN_MIN
        };
        let max = if self.max.is_finite() {
            self.max
        } else {
            DEFAULT_DOMAIN_MAX
        };
        (min, max)
    }
}

/// One named result series of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVariable {
    /// Display label.
    pub name: String,
    /// Unique key the formula populates; dataset column key.
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Initial visibility hint. Live visibility state belongs to the
    /// presentation layer; the engine only ever receives the currently
    /// visible subset as an explicit argument.
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl OutputVariable {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            unit: None,
            color: None,
            visible: true,
        }
    }
}

/// The full declarative model of one analysis request.
///
/// Produced once by the model provider, immutable for the lifetime of a
/// simulation session, replaced wholesale when the user starts a new problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSchema {
    pub title: String,
    pub description: String,
    /// Ordered; the first entry is the primary sweep variable.
    pub variables: Vec<VariableDef>,
    /// Ordered; symbols are unique within a schema.
    pub outputs: Vec<OutputVariable>,
    /// Executable formula body, parsed by the formula engine.
    pub formula: String,
    /// Explanatory narrative for the user.
    pub explanation: String,
    /// Documentation-only rendering of the model (e.g. a pretty-printed
    /// equation). Never executed.
    pub display_formula: String,
}

impl SimulationSchema {
    /// The primary sweep variable, if the schema declares any variable.
    pub fn primary_variable(&self) -> Option<&VariableDef> {
        self.variables.first()
    }

    /// Binding that assigns every declared variable its default value.
    pub fn default_binding(&self) -> VariableBinding {
        self.variables
            .iter()
            .map(|v| (v.symbol.clone(), v.default))
            .collect()
    }

    pub fn variable(&self, symbol: &str) -> Option<&VariableDef> {
        self.variables.iter().find(|v| v.symbol == symbol)
    }

    pub fn output(&self, symbol: &str) -> Option<&OutputVariable> {
        self.outputs.iter().find(|o| o.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_variable_schema() -> SimulationSchema {
        SimulationSchema {
            title: "Rectangle area".to_string(),
            description: String::new(),
            variables: vec![
                VariableDef {
                    name: "Width".to_string(),
                    symbol: "w".to_string(),
                    min: 0.0,
                    max: 10.0,
                    default: 2.0,
                    step: 0.5,
                    description: String::new(),
                },
                VariableDef {
                    name: "Height".to_string(),
                    symbol: "h".to_string(),
                    min: 0.0,
                    max: 5.0,
                    default: 3.0,
                    step: 0.5,
                    description: String::new(),
                },
            ],
            outputs: vec![OutputVariable::new("Area", "area")],
            formula: "area = w * h".to_string(),
            explanation: String::new(),
            display_formula: "A = w × h".to_string(),
        }
    }

    #[test]
    fn primary_variable_is_first_declared() {
        let schema = two_variable_schema();
        let primary = schema.primary_variable().expect("schema has variables");
        assert_eq!(primary.symbol, "w");
    }

    #[test]
    fn default_binding_covers_every_declared_symbol() {
        let schema = two_variable_schema();
        let binding = schema.default_binding();
        assert_eq!(binding.len(), 2);
        assert_eq!(binding["w"], 2.0);
        assert_eq!(binding["h"], 3.0);
    }

    #[test]
    fn resolved_domain_replaces_non_finite_bounds() {
        let mut var = VariableDef::default_sweep();
        var.min = f64::NAN;
        var.max = f64::INFINITY;
        assert_eq!(var.resolved_domain(), (DEFAULT_DOMAIN_MIN, DEFAULT_DOMAIN_MAX));

        var.min = 2.0;
        var.max = 8.0;
        assert_eq!(var.resolved_domain(), (2.0, 8.0));
    }

    #[test]
    fn output_visibility_hint_defaults_to_true_when_deserialized() {
        let json = r#"{ "name": "Area", "symbol": "area" }"#;
        let output: OutputVariable = serde_json::from_str(json).expect("output should parse");
        assert!(output.visible);
        assert_eq!(output.unit, None);
    }
}
