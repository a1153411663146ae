use crate::equation_engine::is_valid_name;
use crate::functions;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Finite-difference scheme used for gradients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceFormula {
    /// Symmetric two-point difference, second order.
    #[default]
    Euler,
    /// One-sided backward difference, first order.
    UpwindEuler,
    /// Symmetric four-point difference, fourth order.
    FourthOrder,
}

pub const DEFAULT_STEP: f64 = 1e-8;

fn default_step() -> f64 {
    DEFAULT_STEP
}

/// Everything needed to build a [`crate::function_parser::FunctionParser`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParserConfig {
    /// Comma separated variable names, e.g. `"x,y,t"`.
    pub variables: String,
    /// One expression per component.
    pub expressions: Vec<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    /// When set, the last variable is time and is filled from the parser's
    /// current time instead of the evaluation point.
    #[serde(default)]
    pub time_dependent: bool,
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default)]
    pub difference_formula: DifferenceFormula,
}

/// Splits a comma separated variable list, trimming whitespace.
pub fn split_variables(variables: &str) -> Vec<String> {
    split_list(variables, ',')
}

/// Splits a semicolon separated list of component expressions.
pub fn split_expressions(expressions: &str) -> Vec<String> {
    split_list(expressions, ';')
}

fn split_list(list: &str, separator: char) -> Vec<String> {
    if list.trim().is_empty() {
        return Vec::new();
    }
    list.split(separator)
        .map(|item| item.trim().to_string())
        .collect()
}

impl FunctionParserConfig {
    /// Builds a config from a variable list and a `;`-separated expression
    /// string, one expression per component.
    pub fn new(variables: &str, expressions: &str) -> Self {
        Self {
            variables: variables.to_string(),
            expressions: split_expressions(expressions),
            constants: BTreeMap::new(),
            time_dependent: false,
            step: DEFAULT_STEP,
            difference_formula: DifferenceFormula::default(),
        }
    }

    pub fn with_constant(mut self, name: &str, value: f64) -> Self {
        self.constants.insert(name.to_string(), value);
        self
    }

    pub fn time_dependent(mut self, time_dependent: bool) -> Self {
        self.time_dependent = time_dependent;
        self
    }

    pub fn with_step(mut self, step: f64, formula: DifferenceFormula) -> Self {
        self.step = step;
        self.difference_formula = formula;
        self
    }

    pub fn variable_names(&self) -> Vec<String> {
        split_variables(&self.variables)
    }

    /// Number of spatial coordinates, i.e. variables minus the time variable.
    pub fn dimension(&self) -> usize {
        let n_vars = self.variable_names().len();
        if self.time_dependent {
            n_vars.saturating_sub(1)
        } else {
            n_vars
        }
    }

    pub fn constant_list(&self) -> Vec<(String, f64)> {
        self.constants
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.expressions.is_empty() {
            bail!("At least one expression is required.");
        }
        if let Some(index) = self.expressions.iter().position(|e| e.trim().is_empty()) {
            bail!("Expression for component {index} is empty.");
        }

        let names = self.variable_names();
        if names.is_empty() {
            bail!("At least one variable is required.");
        }

        let mut seen = HashSet::new();
        for name in names.iter().chain(self.constants.keys()) {
            if !is_valid_name(name) {
                bail!("Invalid variable or constant name: {name:?}");
            }
            if functions::is_function_name(name) {
                bail!("Name {name:?} is already used by a function.");
            }
            if !seen.insert(name.as_str()) {
                bail!("Name {name:?} is declared more than once.");
            }
        }

        if !self.step.is_finite() || self.step <= 0.0 {
            bail!("Finite-difference step must be finite and positive.");
        }
        Ok(())
    }
}
