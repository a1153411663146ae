use crate::config::{DifferenceFormula, FunctionParserConfig};
use crate::equation_engine::compile_with_constants;
use crate::parser_data::{ParserData, ThreadStates};
use crate::traits::Function;
use anyhow::{Context, Result};
use tracing::debug;

/// A vector-valued function defined by formula strings.
///
/// The expressions are compiled once per thread, the first time that thread
/// evaluates the function; after that a call only rewrites the thread's
/// variable buffer and runs the compiled bytecode. A `FunctionParser` can be
/// shared by reference between any number of threads.
#[derive(Debug)]
pub struct FunctionParser {
    config: FunctionParserConfig,
    var_names: Vec<String>,
    constants: Vec<(String, f64)>,
    dimension: usize,
    time: f64,
    states: ThreadStates,
}

impl FunctionParser {
    /// Validates `config` and compiles every component.
    ///
    /// A malformed expression aborts construction; the error can be
    /// downcast to [`crate::equation_engine::ParseError`].
    pub fn new(config: FunctionParserConfig) -> Result<Self> {
        config.validate()?;
        let var_names = config.variable_names();
        let constants = config.constant_list();

        let mut evaluators = Vec::with_capacity(config.expressions.len());
        for (index, text) in config.expressions.iter().enumerate() {
            let evaluator = compile_with_constants(text, &var_names, &constants)
                .with_context(|| format!("Failed to compile component {index} ({text:?})"))?;
            evaluators.push(evaluator);
        }

        // The constructing thread keeps what was just compiled.
        let states = ThreadStates::new();
        states.insert_current(ParserData {
            vars: vec![0.0; var_names.len()],
            evaluators,
        });

        debug!(
            components = config.expressions.len(),
            variables = %config.variables,
            time_dependent = config.time_dependent,
            "initialized function parser"
        );

        Ok(Self {
            dimension: config.dimension(),
            config,
            var_names,
            constants,
            time: 0.0,
            states,
        })
    }

    /// Shorthand for a time-independent function from a variable list and a
    /// `;`-separated expression string.
    pub fn from_expressions(variables: &str, expressions: &str) -> Result<Self> {
        Self::new(FunctionParserConfig::new(variables, expressions))
    }

    pub fn config(&self) -> &FunctionParserConfig {
        &self.config
    }

    pub fn expressions(&self) -> &[String] {
        &self.config.expressions
    }

    pub fn variable_names(&self) -> &[String] {
        &self.var_names
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn advance_time(&mut self, dt: f64) {
        self.time += dt;
    }

    /// Frees the calling thread's compiled state. The next evaluation on
    /// this thread compiles it again.
    pub fn release_thread_state(&self) {
        self.states.release_current();
    }

    /// Number of threads currently holding compiled state.
    pub fn thread_state_count(&self) -> usize {
        self.states.len()
    }

    /// Gradient of `component` with respect to the spatial coordinates,
    /// approximated by finite differences.
    /// out: buffer of length `dimension()`
    pub fn gradient(&self, point: &[f64], component: usize, out: &mut [f64]) {
        self.check_point(point);
        self.check_component(component);
        assert_eq!(
            out.len(),
            self.dimension,
            "Gradient buffer has length {} but the function has dimension {}.",
            out.len(),
            self.dimension
        );

        let h = self.config.step;
        let formula = self.config.difference_formula;
        self.with_thread_data(point, |data| {
            for (i, slot) in out.iter_mut().enumerate() {
                let x = point[i];
                let mut at = |offset: f64| {
                    data.vars[i] = x + offset;
                    data.evaluate(component)
                };
                *slot = match formula {
                    DifferenceFormula::Euler => (at(h) - at(-h)) / (2.0 * h),
                    DifferenceFormula::UpwindEuler => (at(0.0) - at(-h)) / h,
                    DifferenceFormula::FourthOrder => {
                        (at(-2.0 * h) - 8.0 * at(-h) + 8.0 * at(h) - at(2.0 * h)) / (12.0 * h)
                    }
                };
                data.vars[i] = x;
            }
        });
    }

    fn check_point(&self, point: &[f64]) {
        assert_eq!(
            point.len(),
            self.dimension,
            "Point has {} coordinates but the function has dimension {}.",
            point.len(),
            self.dimension
        );
    }

    fn check_component(&self, component: usize) {
        assert!(
            component < self.config.expressions.len(),
            "Component {component} out of range for a function with {} components.",
            self.config.expressions.len()
        );
    }

    fn compile_thread_data(&self) -> std::result::Result<ParserData, crate::ParseError> {
        ParserData::compile(&self.config.expressions, &self.var_names, &self.constants)
    }

    /// Loads `point` (and the current time) into the calling thread's
    /// variable buffer, then runs `f` on that thread's state.
    fn with_thread_data<R>(&self, point: &[f64], f: impl FnOnce(&mut ParserData) -> R) -> R {
        let mut data = match self.states.get_or_try_init(|| self.compile_thread_data()) {
            Ok(data) => data,
            Err(err) => unreachable!("expressions were compiled when the parser was built: {err}"),
        };
        data.vars[..self.dimension].copy_from_slice(point);
        if self.config.time_dependent {
            data.vars[self.dimension] = self.time;
        }
        f(&mut *data)
    }
}

impl Function for FunctionParser {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn n_components(&self) -> usize {
        self.config.expressions.len()
    }

    fn value(&self, point: &[f64], component: usize) -> f64 {
        self.check_point(point);
        self.check_component(component);
        self.with_thread_data(point, |data| data.evaluate(component))
    }

    fn vector_value(&self, point: &[f64], out: &mut [f64]) {
        self.check_point(point);
        assert_eq!(
            out.len(),
            self.n_components(),
            "Output buffer has length {} but the function has {} components.",
            out.len(),
            self.n_components()
        );
        self.with_thread_data(point, |data| data.evaluate_all(out));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::ParseError;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn evaluates_scalar_function() {
        let parser = FunctionParser::from_expressions("x,y", "x + y").expect("parser");
        assert_eq!(parser.dimension(), 2);
        assert_eq!(parser.n_components(), 1);
        assert_eq!(parser.value(&[3.0, 4.0], 0), 7.0);
    }

    #[test]
    fn evaluates_vector_function() {
        // `pi` is not predefined; only `_pi` is.
        assert_err_contains(
            FunctionParser::from_expressions("x,y", "x*y; if(x < y, x, y); pi * x"),
            "unknown variable: pi",
        );

        let config = FunctionParserConfig::new("x,y", "x*y; if(x < y, x, y); pi * x")
            .with_constant("pi", std::f64::consts::PI);
        let parser = FunctionParser::new(config).expect("parser");
        let mut out = [0.0; 3];
        parser.vector_value(&[2.0, 5.0], &mut out);
        assert_eq!(out[0], 10.0);
        assert_eq!(out[1], 2.0);
        assert!((out[2] - 2.0 * std::f64::consts::PI).abs() < 1e-15);
    }

    #[test]
    fn parse_errors_abort_construction() {
        let result = FunctionParser::from_expressions("x", "x; x + unknown_var");
        let err = result.expect_err("should fail");
        assert_eq!(
            err.downcast_ref::<ParseError>(),
            Some(&ParseError::UnknownVariable("unknown_var".to_string()))
        );
        assert!(format!("{err}").contains("component 1"));
    }

    #[test]
    fn time_variable_comes_from_parser_time() {
        let config = FunctionParserConfig::new("x,t", "x * t").time_dependent(true);
        let mut parser = FunctionParser::new(config).expect("parser");
        assert_eq!(parser.dimension(), 1);
        assert_eq!(parser.value(&[2.0], 0), 0.0);
        parser.set_time(1.5);
        assert_eq!(parser.value(&[2.0], 0), 3.0);
        parser.advance_time(0.5);
        assert_eq!(parser.time(), 2.0);
        assert_eq!(parser.value(&[2.0], 0), 4.0);
    }

    #[test]
    fn gradient_matches_analytic_derivative() {
        let point = [0.7, -1.3];
        let expected = [2.0 * 0.7 * -1.3 + (0.7f64).cos(), 0.7 * 0.7];

        for formula in [
            DifferenceFormula::Euler,
            DifferenceFormula::UpwindEuler,
            DifferenceFormula::FourthOrder,
        ] {
            let (step, tolerance) = match formula {
                DifferenceFormula::UpwindEuler => (1e-7, 1e-5),
                _ => (1e-4, 1e-6),
            };
            let config = FunctionParserConfig::new("x,y", "x^2 * y + sin(x)")
                .with_step(step, formula);
            let parser = FunctionParser::new(config).expect("parser");
            let mut grad = [0.0; 2];
            parser.gradient(&point, 0, &mut grad);
            for (got, want) in grad.iter().zip(expected) {
                assert!(
                    (got - want).abs() < tolerance,
                    "{formula:?}: expected {want}, got {got}"
                );
            }
            let value = parser.value(&point, 0);
            assert!((value - (0.7 * 0.7 * -1.3 + (0.7f64).sin())).abs() < 1e-15);
        }
    }

    #[test]
    #[should_panic(expected = "coordinates")]
    fn wrong_point_length_panics() {
        let parser = FunctionParser::from_expressions("x,y", "x").expect("parser");
        parser.value(&[1.0], 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn component_out_of_range_panics() {
        let parser = FunctionParser::from_expressions("x", "x").expect("parser");
        parser.value(&[1.0], 1);
    }

    #[test]
    fn released_state_is_rebuilt_on_demand() {
        let parser = FunctionParser::from_expressions("x", "2 * x").expect("parser");
        assert_eq!(parser.thread_state_count(), 1);
        parser.release_thread_state();
        assert_eq!(parser.thread_state_count(), 0);
        assert_eq!(parser.value(&[4.0], 0), 8.0);
        assert_eq!(parser.thread_state_count(), 1);
    }

    #[test]
    fn concurrent_evaluation_matches_single_threaded_reference() {
        init_tracing();
        const THREADS: usize = 8;
        const POINTS: usize = 500;

        let parser = Arc::new(
            FunctionParser::from_expressions(
                "x,y",
                "sin(x) * y + x^2; if(x < y, x, y); erf(x - y) + floor(y * 3)",
            )
            .expect("parser"),
        );
        let point = |thread: usize, i: usize| {
            let x = thread as f64 + i as f64 * 0.013;
            let y = (thread * POINTS + i) as f64 * -0.007;
            [x, y]
        };

        let reference: Vec<Vec<[f64; 3]>> = (0..THREADS)
            .map(|thread| {
                (0..POINTS)
                    .map(|i| {
                        let mut out = [0.0; 3];
                        parser.vector_value(&point(thread, i), &mut out);
                        out
                    })
                    .collect()
            })
            .collect();

        let results: Vec<Vec<[f64; 3]>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|thread| {
                    let parser = Arc::clone(&parser);
                    scope.spawn(move || {
                        (0..POINTS)
                            .map(|i| {
                                let p = point(thread, i);
                                let mut out = [0.0; 3];
                                parser.vector_value(&p, &mut out);
                                for (component, value) in out.iter().enumerate() {
                                    assert_eq!(parser.value(&p, component), *value);
                                }
                                out
                            })
                            .collect::<Vec<[f64; 3]>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker should finish"))
                .collect()
        });

        assert_eq!(results, reference);
        // Workers that finished early may have handed their slot on.
        let states = parser.thread_state_count();
        assert!((2..=THREADS + 1).contains(&states), "unexpected state count {states}");
    }

    #[test]
    fn evaluation_in_progress_does_not_block_other_threads() {
        let parser = &FunctionParser::from_expressions("x", "3 * x").expect("parser");
        let inner = parser.with_thread_data(&[1.0], |data| {
            let (tx, rx) = mpsc::channel();
            thread::scope(|scope| {
                scope.spawn(move || tx.send(parser.value(&[2.0], 0)).expect("send"));
                let other = rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("another thread's evaluation should not wait");
                (other, data.evaluate(0))
            })
        });
        assert_eq!(inner, (6.0, 3.0));
    }

    #[test]
    fn seeded_random_expressions_agree_across_threads() {
        let parser = Arc::new(
            FunctionParser::from_expressions("x", "rand_seed(42) + 0 * x; rand()")
                .expect("parser"),
        );
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let parser = Arc::clone(&parser);
                thread::spawn(move || {
                    let mut out = [0.0; 2];
                    parser.vector_value(&[0.0], &mut out);
                    let mut values = out.to_vec();
                    values.extend((0..4).map(|_| parser.value(&[0.0], 1)));
                    values
                })
            })
            .collect();
        let draws: Vec<Vec<f64>> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect();
        assert_eq!(draws[0], draws[1]);
    }
}
