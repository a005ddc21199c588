//! Constrained formula engine.
//!
//! Formula bodies arrive as text from an untrusted model provider. Instead of
//! executing them as live code, they are compiled through a fixed pipeline:
//! tokenizer -> recursive-descent parser -> AST -> bytecode -> stack VM. The
//! grammar covers arithmetic, named-variable lookup, and a small allow-listed
//! function set; nothing else is expressible, which is the whole point.

use anyhow::{anyhow, Result};
use num_traits::{Float, FromPrimitive};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;

use crate::schema::VariableBinding;

/// Numeric types the stack VM can operate on.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a variable slot onto the stack. Slots are assigned
    /// in declaration order, followed by one slot per assignment target.
    LoadVar(usize),
    /// Pops `b`, then `a`; pushes `a + b`.
    Add,
    /// Pops `b`, then `a`; pushes `a - b`.
    Sub,
    /// Pops `b`, then `a`; pushes `a * b`.
    Mul,
    /// Pops `b`, then `a`; pushes `a / b`. Division never fails; a zero
    /// divisor produces a non-finite value the sampling layer knows about.
    Div,
    /// Pops `b`, then `a`; pushes `a ^ b`.
    Pow,
    /// Pops the top value and pushes its negation.
    Neg,
    Sin,
    Cos,
    Tan,
    Exp,
    /// Natural logarithm.
    Ln,
    /// Base-10 logarithm.
    Log,
    Sqrt,
    Abs,
}

/// A compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based virtual machine for evaluating compiled formulas.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run (produced by [`Compiler`], so stack
///   arity is guaranteed to balance),
/// - `vars`: variable slot values (read-only),
/// - `stack`: a reusable buffer for intermediate computations.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap());
                }
                OpCode::LoadVar(slot) => {
                    stack.push(vars[*slot]);
                }
                OpCode::Add => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a.powf(b));
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap();
                    stack.push(-a);
                }
                OpCode::Sin => {
                    let a = stack.pop().unwrap();
                    stack.push(a.sin());
                }
                OpCode::Cos => {
                    let a = stack.pop().unwrap();
                    stack.push(a.cos());
                }
                OpCode::Tan => {
                    let a = stack.pop().unwrap();
                    stack.push(a.tan());
                }
                OpCode::Exp => {
                    let a = stack.pop().unwrap();
                    stack.push(a.exp());
                }
                OpCode::Ln => {
                    let a = stack.pop().unwrap();
                    stack.push(a.ln());
                }
                OpCode::Log => {
                    let a = stack.pop().unwrap();
                    stack.push(a.log10());
                }
                OpCode::Sqrt => {
                    let a = stack.pop().unwrap();
                    stack.push(a.sqrt());
                }
                OpCode::Abs => {
                    let a = stack.pop().unwrap();
                    stack.push(a.abs());
                }
            }
        }

        // The result is the last item on the stack. Compiled bytecode always
        // leaves exactly one; default to 0.0 for the empty program.
        stack.pop().unwrap_or_else(|| T::from_f64(0.0).unwrap())
    }
}

// --- AST ---

/// Abstract syntax tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    /// Operator is one of `+ - * / ^`.
    Binary(Box<Expr>, char, Box<Expr>),
    /// Unary minus.
    Unary(char, Box<Expr>),
    /// A 1-argument call to an allow-listed function.
    Call(String, Box<Expr>),
}

/// A parsed formula body: either the legacy single-output form (one bare
/// expression) or a sequence of `symbol = expression` statements.
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    Expression(Expr),
    Assignments(Vec<(String, Expr)>),
}

// --- Compiler ---

/// Compiles an AST into [`Bytecode`], resolving symbols to variable slots.
///
/// The slot table starts as the declared variable list; every assignment
/// target bound with [`Compiler::bind_target`] appends one more slot so that
/// later statements can reference earlier results.
pub struct Compiler {
    slots: HashMap<String, usize>,
    next_slot: usize,
}

impl Compiler {
    pub fn new(variables: &[String]) -> Self {
        let mut slots = HashMap::new();
        for (i, symbol) in variables.iter().enumerate() {
            slots.insert(symbol.clone(), i);
        }
        let next_slot = variables.len();
        Self { slots, next_slot }
    }

    /// Registers an assignment target so subsequent statements can read it.
    /// Reassigning an existing symbol shadows the earlier slot.
    pub fn bind_target(&mut self, symbol: &str) {
        self.slots.insert(symbol.to_string(), self.next_slot);
        self.next_slot += 1;
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, String> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), String> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&slot) = self.slots.get(name) {
                    ops.push(OpCode::LoadVar(slot));
                } else if let Some(value) = named_constant(name) {
                    ops.push(OpCode::LoadConst(value));
                } else {
                    return Err(format!("Unknown variable: {name}"));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                match op {
                    '+' => ops.push(OpCode::Add),
                    '-' => ops.push(OpCode::Sub),
                    '*' => ops.push(OpCode::Mul),
                    '/' => ops.push(OpCode::Div),
                    '^' => ops.push(OpCode::Pow),
                    _ => return Err(format!("Unknown binary operator: {op}")),
                }
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => return Err(format!("Unknown unary operator: {op}")),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                let opcode = match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" => OpCode::Ln,
                    "log" => OpCode::Log,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => return Err(format!("Unknown function: {func}")),
                };
                ops.push(opcode);
            }
        }
        Ok(())
    }
}

/// `pi` and `e` resolve at compile time unless shadowed by a declared symbol.
fn named_constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        _ => None,
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
    Equals,
    LParen,
    RParen,
    /// Statement separator: `;` or a newline.
    Separator,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == '\n' || c == ';' {
            tokens.push(Token::Separator);
            chars.next();
        } else if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            // An `e`/`E` directly after the digits starts an exponent only if
            // digits follow; otherwise it is the start of an identifier (the
            // constant `e` itself, for instance).
            if let Some(&d) = chars.peek() {
                if d == 'e' || d == 'E' {
                    let mut ahead = chars.clone();
                    ahead.next();
                    let signed = matches!(ahead.peek(), Some(&'+') | Some(&'-'));
                    if signed {
                        ahead.next();
                    }
                    if matches!(ahead.peek(), Some(x) if x.is_ascii_digit()) {
                        num.push(d);
                        chars.next();
                        if signed {
                            if let Some(sign) = chars.next() {
                                num.push(sign);
                            }
                        }
                        while let Some(&x) = chars.peek() {
                            if x.is_ascii_digit() {
                                num.push(x);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                }
            }
            let value: f64 = num
                .parse()
                .map_err(|_| format!("Invalid number literal: {num}"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            match c {
                '+' => tokens.push(Token::Plus),
                '-' => tokens.push(Token::Minus),
                '*' => tokens.push(Token::Star),
                '/' => tokens.push(Token::Slash),
                '^' => tokens.push(Token::Caret),
                '=' => tokens.push(Token::Equals),
                '(' => tokens.push(Token::LParen),
                ')' => tokens.push(Token::RParen),
                _ => return Err(format!("Unexpected character '{c}' in formula")),
            }
            chars.next();
        }
    }
    Ok(tokens)
}

// --- Parser ---

/// Bound on formula nesting: parentheses, calls, unary chains, and chained
/// binary operators all count toward it. Deeper bodies fail to compile,
/// which also caps the depth of the AST handed to the compiler.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Parses a formula body into a [`Formula`].
///
/// Grammar, precedence low to high:
///
/// ```text
/// program    := statement ((";" | newline) statement)* | expression
/// statement  := IDENT "=" expression
/// expression := term (("+" | "-") term)*
/// term       := power (("*" | "/") power)*
/// power      := unary ("^" unary)*
/// unary      := "-" unary | primary
/// primary    := NUMBER | IDENT | IDENT "(" expression ")" | "(" expression ")"
/// ```
///
/// Nesting deeper than [`MAX_NESTING_DEPTH`] is a parse error.
pub fn parse(input: &str) -> Result<Formula, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn peek_ahead(&self, offset: usize) -> Option<Token> {
        self.tokens.get(self.pos + offset).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        if self.pos < self.tokens.len() {
            let t = self.tokens[self.pos].clone();
            self.pos += 1;
            Some(t)
        } else {
            None
        }
    }

    fn skip_separators(&mut self) -> bool {
        let mut skipped = false;
        while let Some(Token::Separator) = self.peek() {
            self.consume();
            skipped = true;
        }
        skipped
    }

    fn looking_at_assignment(&self) -> bool {
        matches!(self.peek(), Some(Token::Identifier(_)))
            && matches!(self.peek_ahead(1), Some(Token::Equals))
    }

    fn expect_end(&mut self) -> Result<(), String> {
        self.skip_separators();
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("Unexpected {token:?} after end of formula")),
        }
    }

    fn parse_program(&mut self) -> Result<Formula, String> {
        self.skip_separators();

        if !self.looking_at_assignment() {
            let expr = self.parse_expression()?;
            self.expect_end()?;
            return Ok(Formula::Expression(expr));
        }

        let mut assignments = Vec::new();
        loop {
            if !self.looking_at_assignment() {
                return Err("Expected a `symbol = expression` statement".to_string());
            }
            let symbol = match self.consume() {
                Some(Token::Identifier(symbol)) => symbol,
                other => return Err(format!("Expected a symbol name, found {other:?}")),
            };
            self.consume(); // the '=' guaranteed by looking_at_assignment
            let expr = self.parse_expression()?;
            assignments.push((symbol, expr));

            if !self.skip_separators() || self.peek().is_none() {
                break;
            }
        }
        self.expect_end()?;
        Ok(Formula::Assignments(assignments))
    }

    /// Charges one nesting level. Restored by each caller on its success
    /// path; an error abandons the whole parse, so no unwinding is needed.
    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(format!("Formula nesting exceeds {MAX_NESTING_DEPTH} levels"));
        }
        Ok(())
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let enclosing = self.depth;
        self.descend()?;
        let mut left = self.parse_term()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.consume();
                    self.descend()?;
                    let right = self.parse_term()?;
                    left = Expr::Binary(Box::new(left), '+', Box::new(right));
                }
                Token::Minus => {
                    self.consume();
                    self.descend()?;
                    let right = self.parse_term()?;
                    left = Expr::Binary(Box::new(left), '-', Box::new(right));
                }
                _ => break,
            }
        }
        self.depth = enclosing;
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let enclosing = self.depth;
        let mut left = self.parse_power()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.consume();
                    self.descend()?;
                    let right = self.parse_power()?;
                    left = Expr::Binary(Box::new(left), '*', Box::new(right));
                }
                Token::Slash => {
                    self.consume();
                    self.descend()?;
                    let right = self.parse_power()?;
                    left = Expr::Binary(Box::new(left), '/', Box::new(right));
                }
                _ => break,
            }
        }
        self.depth = enclosing;
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let enclosing = self.depth;
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Caret => {
                    self.consume();
                    self.descend()?;
                    let right = self.parse_unary()?;
                    left = Expr::Binary(Box::new(left), '^', Box::new(right));
                }
                _ => break,
            }
        }
        self.depth = enclosing;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            self.descend()?;
            let expr = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(name, Box::new(arg))),
                        _ => Err("Expected ')'".to_string()),
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err("Expected ')'".to_string()),
                }
            }
            other => Err(format!("Unexpected {other:?} in formula")),
        }
    }
}

// --- FormulaProgram ---

/// Runtime evaluation failure. Absorbed by the sampling loop, never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// The supplied binding lacks a value for a declared variable.
    #[error("formula variable `{symbol}` is not present in the binding")]
    UnboundVariable { symbol: String },
}

/// A compiled formula: one bytecode program per named output, evaluated in
/// statement order against a [`VariableBinding`].
///
/// Built per simulation run from the schema's current variable set, so a
/// changed variable list is always reflected in the slot layout.
#[derive(Debug, Clone)]
pub struct FormulaProgram {
    variables: Vec<String>,
    statements: Vec<(String, Bytecode)>,
    fallback: bool,
    // Interior mutability for the VM stack to avoid allocation per sample.
    // Note: this makes the program !Sync, which matches the engine's
    // single-threaded contract.
    stack: RefCell<Vec<f64>>,
}

impl FormulaProgram {
    /// Declared variable symbols, in slot order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Output symbols in statement order.
    pub fn output_symbols(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().map(|(symbol, _)| symbol.as_str())
    }

    /// True when the body was blank and the constant-zero fallback was
    /// compiled instead.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Evaluates every statement against the binding, returning the named
    /// results in statement order. Later statements see earlier targets.
    pub fn eval(&self, binding: &VariableBinding) -> Result<Vec<(String, f64)>, EvalError> {
        let mut values = Vec::with_capacity(self.variables.len() + self.statements.len());
        for symbol in &self.variables {
            let value = binding.get(symbol).copied().ok_or_else(|| {
                EvalError::UnboundVariable {
                    symbol: symbol.clone(),
                }
            })?;
            values.push(value);
        }

        let mut stack = self.stack.borrow_mut();
        let mut results = Vec::with_capacity(self.statements.len());
        for (symbol, code) in &self.statements {
            let value = VM::execute(code, &values, &mut stack);
            values.push(value);
            results.push((symbol.clone(), value));
        }
        Ok(results)
    }
}

/// Compiles a formula body against the declared variable symbols.
///
/// A bare expression becomes a single statement for `scalar_symbol` (the
/// first declared output by convention). A blank body compiles to the
/// constant-zero fallback program rather than failing; any other malformed
/// body is an error, which the sampling layer absorbs as an empty dataset.
pub fn compile_formula(
    body: &str,
    variables: &[String],
    scalar_symbol: &str,
) -> Result<FormulaProgram> {
    let tokens = tokenize(body).map_err(|err| anyhow!(err))?;
    if tokens.iter().all(|t| *t == Token::Separator) {
        // The analogue of a body with no explicit result: fall back to the
        // constant-zero program so the run still produces a dataset.
        let zero = Formula::Expression(Expr::Number(0.0));
        return build_program(zero, variables, scalar_symbol, true);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let formula = parser.parse_program().map_err(|err| anyhow!(err))?;
    build_program(formula, variables, scalar_symbol, false)
}

fn build_program(
    formula: Formula,
    variables: &[String],
    scalar_symbol: &str,
    fallback: bool,
) -> Result<FormulaProgram> {
    let mut compiler = Compiler::new(variables);
    let mut statements = Vec::new();

    match formula {
        Formula::Expression(expr) => {
            let code = compiler.compile(&expr).map_err(|err| anyhow!(err))?;
            statements.push((scalar_symbol.to_string(), code));
        }
        Formula::Assignments(list) => {
            for (symbol, expr) in list {
                let code = compiler.compile(&expr).map_err(|err| anyhow!(err))?;
                compiler.bind_target(&symbol);
                statements.push((symbol, code));
            }
        }
    }

    Ok(FormulaProgram {
        variables: variables.to_vec(),
        statements,
        fallback,
        stack: RefCell::new(Vec::with_capacity(64)),
    })
}
