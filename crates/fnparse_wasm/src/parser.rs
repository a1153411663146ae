//! WASM wrapper around `FunctionParser`.

use fnparse_core::config::{DifferenceFormula, FunctionParserConfig};
use fnparse_core::function_parser::FunctionParser;
use fnparse_core::traits::Function;
use js_sys::Float64Array;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmFunctionParser {
    pub(crate) parser: FunctionParser,
}

pub(crate) fn build_parser(config: FunctionParserConfig) -> anyhow::Result<FunctionParser> {
    FunctionParser::new(config)
}

fn to_js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<(), JsValue> {
    if got != expected {
        return Err(JsValue::from_str(&format!(
            "{what} dimension mismatch: expected {expected}, got {got}."
        )));
    }
    Ok(())
}

#[wasm_bindgen]
impl WasmFunctionParser {
    #[wasm_bindgen(constructor)]
    pub fn new(
        variables: &str,
        expressions: Vec<String>,
        time_dependent: bool,
    ) -> Result<WasmFunctionParser, JsValue> {
        console_error_panic_hook::set_once();

        let mut config = FunctionParserConfig::new(variables, "").time_dependent(time_dependent);
        config.expressions = expressions;
        let parser = build_parser(config).map_err(to_js_error)?;
        Ok(WasmFunctionParser { parser })
    }

    /// Builds a parser from a serialized `FunctionParserConfig`.
    pub fn from_config(config: JsValue) -> Result<WasmFunctionParser, JsValue> {
        console_error_panic_hook::set_once();

        let config: FunctionParserConfig = serde_wasm_bindgen::from_value(config)
            .map_err(|e| JsValue::from_str(&format!("Invalid config: {e}")))?;
        let parser = build_parser(config).map_err(to_js_error)?;
        Ok(WasmFunctionParser { parser })
    }

    pub fn dimension(&self) -> usize {
        self.parser.dimension()
    }

    pub fn n_components(&self) -> usize {
        self.parser.n_components()
    }

    pub fn set_time(&mut self, t: f64) {
        self.parser.set_time(t);
    }

    pub fn time(&self) -> f64 {
        self.parser.time()
    }

    pub fn value(&self, point: &[f64], component: usize) -> Result<f64, JsValue> {
        check_len("Point", point.len(), self.parser.dimension())?;
        if component >= self.parser.n_components() {
            return Err(JsValue::from_str("Component index out of range."));
        }
        Ok(self.parser.value(point, component))
    }

    pub fn vector_value(&self, point: &[f64]) -> Result<Float64Array, JsValue> {
        check_len("Point", point.len(), self.parser.dimension())?;
        let mut out = vec![0.0; self.parser.n_components()];
        self.parser.vector_value(point, &mut out);
        Ok(Float64Array::from(out.as_slice()))
    }

    pub fn gradient(&self, point: &[f64], component: usize) -> Result<Float64Array, JsValue> {
        check_len("Point", point.len(), self.parser.dimension())?;
        if component >= self.parser.n_components() {
            return Err(JsValue::from_str("Component index out of range."));
        }
        let mut out = vec![0.0; self.parser.dimension()];
        self.parser.gradient(point, component, &mut out);
        Ok(Float64Array::from(out.as_slice()))
    }

    /// Name of the configured finite-difference formula.
    pub fn difference_formula(&self) -> String {
        match self.parser.config().difference_formula {
            DifferenceFormula::Euler => "euler",
            DifferenceFormula::UpwindEuler => "upwind_euler",
            DifferenceFormula::FourthOrder => "fourth_order",
        }
        .to_string()
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use super::*;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[wasm_bindgen_test]
    fn wasm_parser_rejects_invalid_point() {
        let parser = WasmFunctionParser::new("x,y", vec!["x * y".to_string()], false)
            .expect("parser");
        let message = parser
            .value(&[1.0], 0)
            .err()
            .and_then(|err| err.as_string())
            .unwrap_or_default();
        assert!(message.contains("dimension mismatch"));
    }

    #[wasm_bindgen_test]
    fn wasm_parser_vector_value_and_gradient() {
        let expressions = vec!["x * y".to_string(), "x".to_string()];
        let parser = WasmFunctionParser::new("x,y", expressions, false).expect("parser");
        let values = parser.vector_value(&[2.0, 3.0]).expect("values").to_vec();
        assert_eq!(values, vec![6.0, 2.0]);
        let gradient = parser.gradient(&[2.0, 3.0], 0).expect("gradient").to_vec();
        assert!((gradient[0] - 3.0).abs() < 1e-6);
        assert!((gradient[1] - 2.0).abs() < 1e-6);
    }

    #[wasm_bindgen_test]
    fn random_expressions_seed_from_entropy() {
        let expressions = vec!["rand() + 0 * x".to_string()];
        let parser = WasmFunctionParser::new("x", expressions, false).expect("parser");
        let value = parser.value(&[0.0], 0).expect("value");
        assert!((0.0..=1.0).contains(&value), "draw out of range: {value}");
    }

    #[wasm_bindgen_test]
    fn from_config_reads_serialized_config() {
        let config = FunctionParserConfig::new("x", "k * x").with_constant("k", 3.0);
        let value = serde_wasm_bindgen::to_value(&config).expect("config");
        let parser = WasmFunctionParser::from_config(value).expect("parser");
        assert_eq!(parser.value(&[2.0], 0).expect("value"), 6.0);
    }
}
