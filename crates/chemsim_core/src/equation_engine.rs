use crate::error::{Result, SimulationError};
use crate::symbol::{SymbolIndex, SymbolTable};
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a dynamic symbol (species mutated by reactions).
    LoadDynamic(usize),
    /// Pushes the value of a non-dynamic symbol (parameter, compartment, boundary species).
    LoadNonDynamic(usize),
    /// Pushes the value of a reaction-local parameter.
    LoadLocal(usize),
    /// Pushes the current simulated time.
    LoadTime,
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
    Sin,
    Cos,
    Exp,
    /// Natural logarithm.
    Log,
    Sqrt,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Indices of the non-dynamic symbols this code reads.
    pub fn non_dynamic_references(&self) -> impl Iterator<Item = usize> + '_ {
        self.ops.iter().filter_map(|op| match op {
            OpCode::LoadNonDynamic(idx) => Some(*idx),
            _ => None,
        })
    }
}

/// Where the VM reads symbol values from.
///
/// Non-dynamic symbols may themselves be expressions, so their lookup receives the
/// VM stack and may run nested bytecode on top of it.
pub trait SymbolSource {
    fn time(&self) -> f64;
    fn dynamic(&self, index: usize) -> f64;
    fn local(&self, index: usize) -> f64;
    fn non_dynamic(&mut self, index: usize, stack: &mut Vec<f64>) -> f64;
}

/// Stack-based Virtual Machine for evaluating expressions.
///
/// The VM is stateless. `execute` only uses the part of `stack` above its length on
/// entry, which lets a symbol lookup evaluate nested bytecode on the same buffer.
pub struct VM;

impl VM {
    pub fn execute<S: SymbolSource>(
        bytecode: &Bytecode,
        source: &mut S,
        stack: &mut Vec<f64>,
    ) -> f64 {
        let base = stack.len();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(*val),
                OpCode::LoadDynamic(idx) => stack.push(source.dynamic(*idx)),
                OpCode::LoadNonDynamic(idx) => {
                    let value = source.non_dynamic(*idx, stack);
                    stack.push(value);
                }
                OpCode::LoadLocal(idx) => stack.push(source.local(*idx)),
                OpCode::LoadTime => stack.push(source.time()),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, f64::powf),
                OpCode::Sin => unary(stack, f64::sin),
                OpCode::Cos => unary(stack, f64::cos),
                OpCode::Exp => unary(stack, f64::exp),
                OpCode::Log => unary(stack, f64::ln),
                OpCode::Sqrt => unary(stack, f64::sqrt),
                OpCode::Abs => unary(stack, f64::abs),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        let result = stack.pop().expect("compiled bytecode leaves one value on the stack");
        debug_assert_eq!(stack.len(), base);
        result
    }
}

fn binary(stack: &mut Vec<f64>, f: impl Fn(f64, f64) -> f64) {
    let b = stack.pop().expect("stack underflow");
    let a = stack.pop().expect("stack underflow");
    stack.push(f(a, b));
}

fn unary(stack: &mut Vec<f64>, f: impl Fn(f64) -> f64) {
    let a = stack.pop().expect("stack underflow");
    stack.push(f(a));
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>), // functions like sin(x)
}

/// Compiles an AST (`Expr`) into `Bytecode`.
///
/// Names resolve first against the reaction-local scope, then against the model's
/// symbol table. When `concentration_divisors` is set, every species read is divided
/// by the volume of its compartment (species index to compartment index).
pub struct Compiler<'a> {
    symbols: &'a SymbolTable,
    local_map: HashMap<&'a str, usize>,
    concentration_divisors: Option<&'a HashMap<SymbolIndex, usize>>,
}

impl<'a> Compiler<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self {
            symbols,
            local_map: HashMap::new(),
            concentration_divisors: None,
        }
    }

    pub fn with_locals(mut self, local_names: &'a [String]) -> Self {
        self.local_map = local_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        self
    }

    pub fn with_concentration_divisors(
        mut self,
        divisors: &'a HashMap<SymbolIndex, usize>,
    ) -> Self {
        self.concentration_divisors = Some(divisors);
        self
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.local_map.get(name.as_str()) {
                    ops.push(OpCode::LoadLocal(idx));
                    return Ok(());
                }
                let index = self.symbols.resolve(name)?;
                ops.push(match index {
                    SymbolIndex::Dynamic(idx) => OpCode::LoadDynamic(idx),
                    SymbolIndex::NonDynamic(idx) => OpCode::LoadNonDynamic(idx),
                    SymbolIndex::Time => OpCode::LoadTime,
                    SymbolIndex::Avogadro => OpCode::LoadConst(crate::symbol::AVOGADRO),
                });
                if let Some(&volume) = self.concentration_divisors.and_then(|d| d.get(&index)) {
                    ops.push(OpCode::LoadNonDynamic(volume));
                    ops.push(OpCode::Div);
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => {
                        return Err(SimulationError::Expression(format!(
                            "unknown binary operator '{op}'"
                        )))
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => {
                        return Err(SimulationError::Expression(format!(
                            "unknown unary operator '{op}'"
                        )))
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "log" => OpCode::Log,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => {
                        return Err(SimulationError::Expression(format!(
                            "unknown function \"{func}\""
                        )))
                    }
                });
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("Unexpected trailing token {token:?} in \"{input}\"")),
    }
}

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
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if d == 'e' || d == 'E' {
                    // Exponent, optionally signed.
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("Invalid number \"{num_str}\""))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
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
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => return Err(format!("Unexpected character '{c}'")),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative: a^b^c == a^(b^c).
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    if let Some(Token::RParen) = self.consume() {
                        Ok(Expr::Call(name, Box::new(arg)))
                    } else {
                        Err("Expected ')'".to_string())
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                if let Some(Token::RParen) = self.consume() {
                    Ok(expr)
                } else {
                    Err("Expected ')'".to_string())
                }
            }
            Some(token) => Err(format!("Unexpected token {token:?}")),
            None => Err("Unexpected end of expression".to_string()),
        }
    }
}
