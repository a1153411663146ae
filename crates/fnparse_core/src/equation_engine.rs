use crate::functions::{self, FunctionImpl};
use crate::traits::Evaluator;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while turning expression text into bytecode.
///
/// All of them are reported at compile time; evaluation itself never fails.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expression is empty")]
    EmptyExpression,
    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedCharacter { ch: char, position: usize },
    #[error("invalid number '{text}' at position {position}")]
    InvalidNumber { text: String, position: usize },
    #[error("unexpected {found} at position {position}")]
    UnexpectedToken { found: String, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("function {name} expects {expected} argument(s), got {found}")]
    WrongArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("name declared more than once: {0}")]
    DuplicateName(String),
    #[error("expression is nested more than {0} levels deep")]
    NestingTooDeep(usize),
}

/// OpCodes for the Stack-based Virtual Machine.
#[derive(Debug, Clone, Copy)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a variable (by index) onto the stack.
    /// Indices correspond to the order variables were declared (e.g., 0=x, 1=y).
    LoadVar(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes 1 if a == 0, else 0.
    Not,
    /// Comparisons pop (b, a) and push 1 or 0.
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    /// Logical connectives pop (b, a) and push 1 or 0.
    And,
    Or,
    /// Pops (else, then, cond), pushes `then` when cond != 0, else `else`.
    Select,
    /// Pops as many values as the function's arity, pushes the result.
    Call(FunctionImpl),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Stack-based Virtual Machine for evaluating expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Current variable values (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

// Compiled bytecode is always balanced; NaN only shows up for hand-built code.
fn pop(stack: &mut Vec<f64>) -> f64 {
    stack.pop().unwrap_or(f64::NAN)
}

impl VM {
    pub fn execute(bytecode: &Bytecode, vars: &[f64], stack: &mut Vec<f64>) -> f64 {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadVar(idx) => stack.push(vars[idx]),
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Not => {
                    let a = pop(stack);
                    stack.push(flag(a == 0.0));
                }
                OpCode::Select => {
                    let otherwise = pop(stack);
                    let then = pop(stack);
                    let cond = pop(stack);
                    stack.push(functions::select(cond, then, otherwise));
                }
                OpCode::Call(imp) => {
                    let result = match imp {
                        FunctionImpl::Nullary(f) => f(),
                        FunctionImpl::Unary(f) => {
                            let a = pop(stack);
                            f(a)
                        }
                        FunctionImpl::Binary(f) => {
                            let b = pop(stack);
                            let a = pop(stack);
                            f(a, b)
                        }
                        FunctionImpl::Ternary(f) => {
                            let c = pop(stack);
                            let b = pop(stack);
                            let a = pop(stack);
                            f(a, b, c)
                        }
                    };
                    stack.push(result);
                }
                binary => {
                    let b = pop(stack);
                    let a = pop(stack);
                    let result = match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        OpCode::Pow => a.powf(b),
                        OpCode::Lt => flag(a < b),
                        OpCode::Gt => flag(a > b),
                        OpCode::Le => flag(a <= b),
                        OpCode::Ge => flag(a >= b),
                        OpCode::Eq => flag(a == b),
                        OpCode::Ne => flag(a != b),
                        OpCode::And => functions::and(a, b),
                        OpCode::Or => functions::or(a, b),
                        _ => unreachable!("non-binary opcode {binary:?}"),
                    };
                    stack.push(result);
                }
            }
        }

        // The result is the last item on the stack.
        pop(stack)
    }
}

// --- AST & Compiler ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Call(String, Vec<Expr>),
    /// `cond ? then : otherwise`
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// Returns true when `name` can be used as a variable or constant name.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn check_name(name: &str) -> Result<(), ParseError> {
    if !is_valid_name(name) || functions::is_function_name(name) {
        return Err(ParseError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves variable names to indices and constants to literal loads.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub const_map: HashMap<String, f64>,
}

impl Compiler {
    pub fn new<S: AsRef<str>>(var_names: &[S]) -> Result<Self, ParseError> {
        let mut var_map = HashMap::new();
        for (i, name) in var_names.iter().enumerate() {
            let name = name.as_ref();
            check_name(name)?;
            if var_map.insert(name.to_string(), i).is_some() {
                return Err(ParseError::DuplicateName(name.to_string()));
            }
        }

        Ok(Self {
            var_map,
            const_map: HashMap::new(),
        })
    }

    /// Registers named constants, which are substituted at compile time.
    pub fn with_constants<S: AsRef<str>>(
        mut self,
        constants: &[(S, f64)],
    ) -> Result<Self, ParseError> {
        for (name, value) in constants {
            let name = name.as_ref();
            check_name(name)?;
            if self.var_map.contains_key(name)
                || self.const_map.insert(name.to_string(), *value).is_some()
            {
                return Err(ParseError::DuplicateName(name.to_string()));
            }
        }
        Ok(self)
    }

    pub fn n_vars(&self) -> usize {
        self.var_map.len()
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ParseError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ParseError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&value) = self.const_map.get(name) {
                    ops.push(OpCode::LoadConst(value));
                } else if let Some(value) = functions::builtin_constant(name) {
                    ops.push(OpCode::LoadConst(value));
                } else {
                    return Err(ParseError::UnknownVariable(name.clone()));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                    BinaryOp::Lt => OpCode::Lt,
                    BinaryOp::Gt => OpCode::Gt,
                    BinaryOp::Le => OpCode::Le,
                    BinaryOp::Ge => OpCode::Ge,
                    BinaryOp::Eq => OpCode::Eq,
                    BinaryOp::Ne => OpCode::Ne,
                    BinaryOp::And => OpCode::And,
                    BinaryOp::Or => OpCode::Or,
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(match op {
                    UnaryOp::Neg => OpCode::Neg,
                    UnaryOp::Not => OpCode::Not,
                });
            }
            Expr::Call(name, args) => {
                let entry = functions::lookup(name)
                    .ok_or_else(|| ParseError::UnknownFunction(name.clone()))?;
                if entry.imp.arity() != args.len() {
                    return Err(ParseError::WrongArgumentCount {
                        name: name.clone(),
                        expected: entry.imp.arity(),
                        found: args.len(),
                    });
                }
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(OpCode::Call(entry.imp));
            }
            Expr::Conditional(cond, then, otherwise) => {
                self.compile_recursive(cond, ops)?;
                self.compile_recursive(then, ops)?;
                self.compile_recursive(otherwise, ops)?;
                ops.push(OpCode::Select);
            }
        }
        Ok(())
    }
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Token::Number(n) => return write!(f, "number {n}"),
            Token::Identifier(name) => return write!(f, "identifier '{name}'"),
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Caret => "^",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Comma => ",",
            Token::Less => "<",
            Token::Greater => ">",
            Token::LessEq => "<=",
            Token::GreaterEq => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Bang => "!",
            Token::Question => "?",
            Token::Colon => ":",
        };
        write!(f, "'{symbol}'")
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let byte_at = |i: usize| chars.get(i).map_or(input.len(), |&(pos, _)| pos);
    let char_at = |i: usize| chars.get(i).map(|&(_, c)| c);

    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(c) = char_at(i) {
        let position = byte_at(i);
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while matches!(char_at(i), Some(d) if d.is_ascii_digit() || d == '.') {
                i += 1;
            }
            if matches!(char_at(i), Some('e' | 'E')) {
                let digits_at = if matches!(char_at(i + 1), Some('+' | '-')) {
                    i + 2
                } else {
                    i + 1
                };
                if matches!(char_at(digits_at), Some(d) if d.is_ascii_digit()) {
                    i = digits_at;
                    while matches!(char_at(i), Some(d) if d.is_ascii_digit()) {
                        i += 1;
                    }
                }
            }
            let text = &input[byte_at(start)..byte_at(i)];
            let value = text.parse().map_err(|_| ParseError::InvalidNumber {
                text: text.to_string(),
                position,
            })?;
            tokens.push(Spanned {
                token: Token::Number(value),
                position,
            });
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while matches!(char_at(i), Some(d) if d.is_alphanumeric() || d == '_') {
                i += 1;
            }
            let ident = input[byte_at(start)..byte_at(i)].to_string();
            tokens.push(Spanned {
                token: Token::Identifier(ident),
                position,
            });
        } else {
            let next = char_at(i + 1);
            let (token, width) = match (c, next) {
                ('<', Some('=')) => (Token::LessEq, 2),
                ('>', Some('=')) => (Token::GreaterEq, 2),
                ('=', Some('=')) => (Token::EqEq, 2),
                ('!', Some('=')) => (Token::NotEq, 2),
                ('&', Some('&')) => (Token::AndAnd, 2),
                ('|', Some('|')) => (Token::OrOr, 2),
                ('+', _) => (Token::Plus, 1),
                ('-', _) => (Token::Minus, 1),
                ('*', _) => (Token::Star, 1),
                ('/', _) => (Token::Slash, 1),
                ('^', _) => (Token::Caret, 1),
                ('(', _) => (Token::LParen, 1),
                (')', _) => (Token::RParen, 1),
                (',', _) => (Token::Comma, 1),
                ('<', _) => (Token::Less, 1),
                ('>', _) => (Token::Greater, 1),
                ('!', _) => (Token::Bang, 1),
                ('?', _) => (Token::Question, 1),
                (':', _) => (Token::Colon, 1),
                _ => return Err(ParseError::UnexpectedCharacter { ch: c, position }),
            };
            tokens.push(Spanned { token, position });
            i += width;
        }
    }
    Ok(tokens)
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::EmptyExpression);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expression()?;
    match parser.consume() {
        None => Ok(expr),
        Some(extra) => Err(ParseError::UnexpectedToken {
            found: extra.token.to_string(),
            position: extra.position,
        }),
    }
}

/// Maximum recursion depth of the parser (parentheses, call arguments,
/// prefix operators and exponents all count).
pub const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|spanned| &spanned.token)
    }

    fn consume(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned()?;
        self.pos += 1;
        Some(spanned)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        match self.consume() {
            Some(spanned) if spanned.token == expected => Ok(()),
            Some(spanned) => Err(ParseError::UnexpectedToken {
                found: spanned.token.to_string(),
                position: spanned.position,
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::NestingTooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_ternary)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if let Some(Token::Question) = self.peek() {
            self.consume();
            let then = self.parse_expression()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_expression()?;
            return Ok(Expr::Conditional(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek() {
            self.consume();
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        while let Some(Token::AndAnd) = self.peek() {
            self.consume();
            let right = self.parse_comparison()?;
            left = Expr::Binary(Box::new(left), BinaryOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Less => BinaryOp::Lt,
                Token::Greater => BinaryOp::Gt,
                Token::LessEq => BinaryOp::Le,
                Token::GreaterEq => BinaryOp::Ge,
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::Ne,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_prefixed)
    }

    fn parse_prefixed(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(expr)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            Some(Token::Bang) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(expr)))
            }
            _ => self.parse_power(),
        }
    }

    // Right associative: 2^3^2 == 2^(3^2).
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(
                Box::new(base),
                BinaryOp::Pow,
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let spanned = self.consume().ok_or(ParseError::UnexpectedEnd)?;
        match spanned.token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Identifier(name) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let args = self.parse_arguments()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Token::LParen => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            other => Err(ParseError::UnexpectedToken {
                found: other.to_string(),
                position: spanned.position,
            }),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            match self.consume() {
                Some(Spanned {
                    token: Token::Comma,
                    ..
                }) => continue,
                Some(Spanned {
                    token: Token::RParen,
                    ..
                }) => return Ok(args),
                Some(spanned) => {
                    return Err(ParseError::UnexpectedToken {
                        found: spanned.token.to_string(),
                        position: spanned.position,
                    })
                }
                None => return Err(ParseError::UnexpectedEnd),
            }
        }
    }
}

// --- Evaluator handles ---

/// An [`Evaluator`] backed by the bytecode VM.
///
/// Each handle owns its scratch stack, so it must not be shared between
/// threads while evaluating; the per-thread containers guarantee that.
#[derive(Debug)]
pub struct BytecodeEvaluator {
    bytecode: Bytecode,
    n_vars: usize,
    stack: Vec<f64>,
}

impl BytecodeEvaluator {
    pub fn new(bytecode: Bytecode, n_vars: usize) -> Self {
        Self {
            bytecode,
            n_vars,
            stack: Vec::with_capacity(16),
        }
    }
}

impl Evaluator for BytecodeEvaluator {
    fn evaluate(&mut self, vars: &[f64]) -> f64 {
        debug_assert_eq!(
            vars.len(),
            self.n_vars,
            "expected {} variable values, got {}",
            self.n_vars,
            vars.len()
        );
        VM::execute(&self.bytecode, vars, &mut self.stack)
    }

    fn n_vars(&self) -> usize {
        self.n_vars
    }
}

/// Compiles `text` against the declared variables into an evaluator handle.
pub fn compile<S: AsRef<str>>(
    text: &str,
    var_names: &[S],
) -> Result<Box<dyn Evaluator>, ParseError> {
    compile_with_constants::<S, &str>(text, var_names, &[])
}

/// Like [`compile`], additionally binding named constants.
pub fn compile_with_constants<S: AsRef<str>, C: AsRef<str>>(
    text: &str,
    var_names: &[S],
    constants: &[(C, f64)],
) -> Result<Box<dyn Evaluator>, ParseError> {
    let compiler = Compiler::new(var_names)?.with_constants(constants)?;
    let expr = parse(text)?;
    let bytecode = compiler.compile(&expr)?;
    Ok(Box::new(BytecodeEvaluator::new(bytecode, compiler.n_vars())))
}
