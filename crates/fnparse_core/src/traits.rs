/// A compiled scalar expression that is ready to evaluate.
///
/// Handles are produced by [`crate::compile`] and are owned by exactly one
/// thread's evaluation state. They are intentionally not `Clone`: each one
/// carries its own scratch stack.
pub trait Evaluator: Send + Sync {
    /// Evaluates the expression.
    /// vars: current variable values, in the order given at compile time.
    fn evaluate(&mut self, vars: &[f64]) -> f64;

    /// Number of variables the expression was compiled against.
    fn n_vars(&self) -> usize;
}

/// A vector-valued function of a point in space (and possibly time).
pub trait Function {
    /// Returns the number of spatial coordinates a point must have.
    fn dimension(&self) -> usize;

    /// Returns the number of output components.
    fn n_components(&self) -> usize;

    /// Evaluates one component at `point`.
    fn value(&self, point: &[f64], component: usize) -> f64;

    /// Evaluates every component at `point`.
    /// out: buffer to write the result, one entry per component
    fn vector_value(&self, point: &[f64], out: &mut [f64]);
}
