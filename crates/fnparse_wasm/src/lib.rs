mod parser;

pub use parser::WasmFunctionParser;

use js_sys::Array;
use wasm_bindgen::prelude::*;

/// Names of the custom functions available in expressions, in catalog order.
#[wasm_bindgen]
pub fn function_names() -> Array {
    fnparse_core::function_names()
        .iter()
        .map(|name| JsValue::from_str(name))
        .collect()
}
