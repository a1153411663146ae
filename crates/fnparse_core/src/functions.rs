//! Function catalogs available inside expressions.
//!
//! Two tables exist:
//! - the built-in vocabulary (`sin`, `sqrt`, `min`, ...) that any expression
//!   engine is expected to provide;
//! - the custom catalog that extends it with conditional, logical, rounding,
//!   reciprocal trigonometric, error and random functions.
//!
//! Both are `static` data built at compile time and never mutated, so they
//! can be read from any number of threads. Only [`function_names`] reports
//! the custom catalog; the built-ins are considered part of the engine.
//!
//! None of these functions fail. Inputs outside a function's domain produce
//! IEEE-754 infinities or NaN, which propagate through the rest of the
//! expression.

use crate::random::{draw_thread_stream, reseed_thread_stream};
use std::f64::consts::{E, PI};

/// Implementation of a catalog entry, by arity.
#[derive(Debug, Clone, Copy)]
pub enum FunctionImpl {
    Nullary(fn() -> f64),
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
    Ternary(fn(f64, f64, f64) -> f64),
}

impl FunctionImpl {
    pub fn arity(&self) -> usize {
        match self {
            FunctionImpl::Nullary(_) => 0,
            FunctionImpl::Unary(_) => 1,
            FunctionImpl::Binary(_) => 2,
            FunctionImpl::Ternary(_) => 3,
        }
    }
}

/// A named function in one of the catalogs.
#[derive(Debug, Clone, Copy)]
pub struct FunctionEntry {
    pub name: &'static str,
    pub imp: FunctionImpl,
}

macro_rules! function_table {
    ( $table:ident, $names:ident; $( $name:literal => $imp:expr ),+ $(,)? ) => {
        pub static $table: &[FunctionEntry] = &[
            $( FunctionEntry { name: $name, imp: $imp } ),+
        ];

        const $names: &[&str] = &[ $( $name ),+ ];
    };
}

function_table!(
    CUSTOM_FUNCTIONS, CUSTOM_NAMES;
    "round"     => FunctionImpl::Unary(round),
    "if"        => FunctionImpl::Ternary(select),
    "or"        => FunctionImpl::Binary(or),
    "and"       => FunctionImpl::Binary(and),
    "int"       => FunctionImpl::Unary(int),
    "ceil"      => FunctionImpl::Unary(ceil),
    "floor"     => FunctionImpl::Unary(floor),
    "cot"       => FunctionImpl::Unary(cot),
    "csc"       => FunctionImpl::Unary(csc),
    "sec"       => FunctionImpl::Unary(sec),
    "log"       => FunctionImpl::Unary(log),
    "pow"       => FunctionImpl::Binary(pow),
    "erf"       => FunctionImpl::Unary(erf),
    "erfc"      => FunctionImpl::Unary(erfc),
    "rand_seed" => FunctionImpl::Unary(rand_seed),
    "rand"      => FunctionImpl::Nullary(rand),
);

function_table!(
    BUILTIN_FUNCTIONS, BUILTIN_NAMES;
    "sin"   => FunctionImpl::Unary(f64::sin),
    "cos"   => FunctionImpl::Unary(f64::cos),
    "tan"   => FunctionImpl::Unary(f64::tan),
    "asin"  => FunctionImpl::Unary(f64::asin),
    "acos"  => FunctionImpl::Unary(f64::acos),
    "atan"  => FunctionImpl::Unary(f64::atan),
    "sinh"  => FunctionImpl::Unary(f64::sinh),
    "cosh"  => FunctionImpl::Unary(f64::cosh),
    "tanh"  => FunctionImpl::Unary(f64::tanh),
    "asinh" => FunctionImpl::Unary(f64::asinh),
    "acosh" => FunctionImpl::Unary(f64::acosh),
    "atanh" => FunctionImpl::Unary(f64::atanh),
    "exp"   => FunctionImpl::Unary(f64::exp),
    "sqrt"  => FunctionImpl::Unary(f64::sqrt),
    "abs"   => FunctionImpl::Unary(f64::abs),
    "sign"  => FunctionImpl::Unary(sign),
    "rint"  => FunctionImpl::Unary(f64::round_ties_even),
    "ln"    => FunctionImpl::Unary(f64::ln),
    "log2"  => FunctionImpl::Unary(f64::log2),
    "log10" => FunctionImpl::Unary(f64::log10),
    "atan2" => FunctionImpl::Binary(f64::atan2),
    "min"   => FunctionImpl::Binary(f64::min),
    "max"   => FunctionImpl::Binary(f64::max),
);

/// Constants every expression can reference without declaring them.
pub const BUILTIN_CONSTANTS: &[(&str, f64)] = &[("_pi", PI), ("_e", E)];

/// Returns the names of the custom functions, in catalog order.
///
/// Built-in functions are not included. The order is fixed at compile time,
/// so repeated calls always agree.
pub fn function_names() -> &'static [&'static str] {
    CUSTOM_NAMES
}

/// Returns the names of the built-in functions, in catalog order.
pub fn builtin_function_names() -> &'static [&'static str] {
    BUILTIN_NAMES
}

/// Looks a function up by name in both catalogs.
pub fn lookup(name: &str) -> Option<&'static FunctionEntry> {
    CUSTOM_FUNCTIONS
        .iter()
        .chain(BUILTIN_FUNCTIONS.iter())
        .find(|entry| entry.name == name)
}

pub fn is_function_name(name: &str) -> bool {
    lookup(name).is_some()
}

pub fn builtin_constant(name: &str) -> Option<f64> {
    BUILTIN_CONSTANTS
        .iter()
        .find(|(constant, _)| *constant == name)
        .map(|(_, value)| *value)
}

fn truthy(value: f64) -> bool {
    value != 0.0
}

fn from_bool(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Nearest integer, halfway cases rounded away from zero.
pub fn round(x: f64) -> f64 {
    x.round()
}

/// `if(condition, then, otherwise)`.
pub fn select(condition: f64, then_value: f64, else_value: f64) -> f64 {
    if truthy(condition) {
        then_value
    } else {
        else_value
    }
}

pub fn or(left: f64, right: f64) -> f64 {
    from_bool(truthy(left) || truthy(right))
}

pub fn and(left: f64, right: f64) -> f64 {
    from_bool(truthy(left) && truthy(right))
}

/// Truncation toward zero.
pub fn int(x: f64) -> f64 {
    x.trunc()
}

pub fn ceil(x: f64) -> f64 {
    x.ceil()
}

pub fn floor(x: f64) -> f64 {
    x.floor()
}

pub fn cot(x: f64) -> f64 {
    1.0 / x.tan()
}

pub fn csc(x: f64) -> f64 {
    1.0 / x.sin()
}

pub fn sec(x: f64) -> f64 {
    1.0 / x.cos()
}

/// Natural logarithm.
pub fn log(x: f64) -> f64 {
    x.ln()
}

pub fn pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

pub fn erf(x: f64) -> f64 {
    libm::erf(x)
}

pub fn erfc(x: f64) -> f64 {
    libm::erfc(x)
}

/// Reseeds the calling thread's random stream and returns its first draw.
pub fn rand_seed(seed: f64) -> f64 {
    reseed_thread_stream(seed)
}

/// Draws from the calling thread's random stream.
pub fn rand() -> f64 {
    draw_thread_stream()
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        x
    }
}
