pub mod config;
pub mod equation_engine;
pub mod function_parser;
pub mod functions;
pub mod parser_data;
pub mod random;
/// The `fnparse_core` crate evaluates user-supplied formula strings as numeric
/// functions, repeatedly and from many threads at once.
///
/// Key components:
/// - **Traits**: `Evaluator` (opaque compiled expression) and `Function`
///   (vector-valued function of a point).
/// - **Equation Engine**: A parser and bytecode VM behind the `Evaluator` handle.
/// - **Functions**: The built-in vocabulary plus the custom catalog (`if`,
///   `and`, `erf`, `rand_seed`, ...).
/// - **Parser Data**: Per-thread variable buffers and evaluator handles.
/// - **Function Parser**: The host-facing function object, compiled lazily once per thread.
pub mod traits;

pub use config::{DifferenceFormula, FunctionParserConfig};
pub use equation_engine::{compile, compile_with_constants, ParseError};
pub use function_parser::FunctionParser;
pub use functions::function_names;
pub use traits::{Evaluator, Function};
