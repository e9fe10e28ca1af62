//! Restricted literal evaluator for substituted parameter text.
//!
//! Supported: integers, floats, quoted strings, `None`/`True`/`False`, list
//! literals, `+ - * / // % **`, unary minus, parentheses and indexing. Anything
//! outside of that grammar is an evaluation failure, which callers turn into
//! [`Evaluated::Verbatim`].

use itertools::Itertools;
use std::{fmt, iter::Peekable, str::CharIndices};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unexpected character {found:?} at {position}")]
    UnexpectedCharacter { found: char, position: usize },
    #[error("malformed number at {0}")]
    MalformedNumber(usize),
    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown name {0}")]
    UnknownName(String),
    #[error("unsupported operand types for {op}: {left} and {right}")]
    Operands {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {0} out of range")]
    IndexOutOfRange(i64),
    #[error("integer overflow")]
    Overflow,
}

/// evaluated literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
        }
    }

    /// representation used inside of lists, strings are quoted
    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::Str(value) => format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else if value.is_nan() {
        "nan".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else {
        value.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // `None` stands for "nothing requested", e.g. an unset node list
            Self::None => Ok(()),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{}", format_float(*value)),
            Self::Str(value) => write!(f, "{value}"),
            Self::List(values) => write!(f, "[{}]", values.iter().map(Value::repr).join(", ")),
        }
    }
}

/// Outcome of evaluating fully substituted text. Falling back to the text
/// itself is a regular result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Literal(Value),
    Verbatim(String),
}

impl Evaluated {
    pub fn into_value(self) -> Value {
        match self {
            Self::Literal(value) => value,
            Self::Verbatim(text) => Value::Str(text),
        }
    }
}

/// evaluate `text`, keeping it verbatim whenever it isn't a valid expression
pub fn evaluate_or_verbatim(text: &str) -> Evaluated {
    match evaluate(text) {
        Ok(value) => Evaluated::Literal(value),
        Err(_) => Evaluated::Verbatim(text.to_owned()),
    }
}

pub fn evaluate(text: &str) -> Result<Value, EvalError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens: tokens.into_iter().peekable(),
    };
    let value = parser.expression()?;

    match parser.tokens.next() {
        None => Ok(value),
        Some(token) => Err(EvalError::UnexpectedToken(token.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Plus,
    Minus,
    Star,
    Power,
    Slash,
    FloorSlash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Name(name) => write!(f, "{name}"),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Star => write!(f, "*"),
            Self::Power => write!(f, "**"),
            Self::Slash => write!(f, "/"),
            Self::FloorSlash => write!(f, "//"),
            Self::Percent => write!(f, "%"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Comma => write!(f, ","),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, EvalError> {
    let mut chars = text.char_indices().peekable();
    let mut tokens = Vec::new();

    while let Some(&(position, current)) = chars.peek() {
        let token = match current {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
                continue;
            }
            '0'..='9' => number(&mut chars, text, position)?,
            '\'' | '"' => string(&mut chars, current, position)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();

                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }

                Token::Name(name)
            }
            _ => {
                chars.next();

                match current {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' if next_is(&mut chars, '*') => Token::Power,
                    '*' => Token::Star,
                    '/' if next_is(&mut chars, '/') => Token::FloorSlash,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    found => return Err(EvalError::UnexpectedCharacter { found, position }),
                }
            }
        };

        tokens.push(token);
    }

    Ok(tokens)
}

fn next_is(chars: &mut Peekable<CharIndices<'_>>, expected: char) -> bool {
    chars.next_if(|&(_, c)| c == expected).is_some()
}

fn number(
    chars: &mut Peekable<CharIndices<'_>>,
    text: &str,
    start: usize,
) -> Result<Token, EvalError> {
    let mut end = start;
    let mut is_float = false;

    while let Some(&(position, c)) = chars.peek() {
        match c {
            '0'..='9' => {}
            '.' if !is_float => is_float = true,
            _ => break,
        }
        end = position + c.len_utf8();
        chars.next();
    }

    // `3x`, `1.2.3` and friends are not numbers
    if let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' || c == '.' {
            return Err(EvalError::MalformedNumber(start));
        }
    }

    let literal = &text[start..end];

    if is_float {
        if literal.ends_with('.') {
            return Err(EvalError::MalformedNumber(start));
        }

        literal
            .parse()
            .map(Token::Float)
            .map_err(|_| EvalError::MalformedNumber(start))
    } else if literal.len() > 1 && literal.starts_with('0') {
        Err(EvalError::MalformedNumber(start))
    } else {
        literal
            .parse()
            .map(Token::Int)
            .map_err(|_| EvalError::Overflow)
    }
}

fn string(
    chars: &mut Peekable<CharIndices<'_>>,
    quote: char,
    start: usize,
) -> Result<Token, EvalError> {
    let mut value = String::new();
    chars.next();

    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c if c == quote => return Ok(Token::Str(value)),
            c => value.push(c),
        }
    }

    Err(EvalError::UnterminatedString(start))
}

struct Parser {
    tokens: Peekable<std::vec::IntoIter<Token>>,
}

impl Parser {
    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        match self.tokens.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(EvalError::UnexpectedToken(token.to_string())),
            None => Err(EvalError::UnexpectedEnd),
        }
    }

    fn expression(&mut self) -> Result<Value, EvalError> {
        let mut value = self.term()?;

        loop {
            value = match self.tokens.peek() {
                Some(Token::Plus) => {
                    self.tokens.next();
                    add(value, self.term()?)?
                }
                Some(Token::Minus) => {
                    self.tokens.next();
                    subtract(value, self.term()?)?
                }
                _ => return Ok(value),
            };
        }
    }

    fn term(&mut self) -> Result<Value, EvalError> {
        let mut value = self.unary()?;

        loop {
            value = match self.tokens.peek() {
                Some(Token::Star) => {
                    self.tokens.next();
                    multiply(value, self.unary()?)?
                }
                Some(Token::Slash) => {
                    self.tokens.next();
                    divide(value, self.unary()?)?
                }
                Some(Token::FloorSlash) => {
                    self.tokens.next();
                    floor_divide(value, self.unary()?)?
                }
                Some(Token::Percent) => {
                    self.tokens.next();
                    modulo(value, self.unary()?)?
                }
                _ => return Ok(value),
            };
        }
    }

    fn unary(&mut self) -> Result<Value, EvalError> {
        match self.tokens.peek() {
            Some(Token::Minus) => {
                self.tokens.next();

                match self.unary()? {
                    Value::Int(value) => value.checked_neg().map(Value::Int).ok_or(EvalError::Overflow),
                    Value::Float(value) => Ok(Value::Float(-value)),
                    other => Err(EvalError::Operands {
                        op: "unary -",
                        left: other.kind(),
                        right: other.kind(),
                    }),
                }
            }
            Some(Token::Plus) => {
                self.tokens.next();

                match self.unary()? {
                    number @ (Value::Int(_) | Value::Float(_)) => Ok(number),
                    other => Err(EvalError::Operands {
                        op: "unary +",
                        left: other.kind(),
                        right: other.kind(),
                    }),
                }
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Value, EvalError> {
        let base = self.postfix()?;

        if self.tokens.next_if_eq(&Token::Power).is_some() {
            // right associative, the exponent may carry its own sign
            power(base, self.unary()?)
        } else {
            Ok(base)
        }
    }

    fn postfix(&mut self) -> Result<Value, EvalError> {
        let mut value = self.primary()?;

        while self.tokens.next_if_eq(&Token::LBracket).is_some() {
            let index = self.expression()?;
            self.expect(Token::RBracket)?;
            value = select(value, index)?;
        }

        Ok(value)
    }

    fn primary(&mut self) -> Result<Value, EvalError> {
        match self.tokens.next() {
            Some(Token::Int(value)) => Ok(Value::Int(value)),
            Some(Token::Float(value)) => Ok(Value::Float(value)),
            Some(Token::Str(value)) => Ok(Value::Str(value)),
            Some(Token::Name(name)) => match name.as_str() {
                "None" => Ok(Value::None),
                "True" => Ok(Value::Bool(true)),
                "False" => Ok(Value::Bool(false)),
                _ => Err(EvalError::UnknownName(name)),
            },
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(Token::RParen)?;

                Ok(value)
            }
            Some(Token::LBracket) => {
                let mut values = Vec::new();

                loop {
                    if self.tokens.next_if_eq(&Token::RBracket).is_some() {
                        return Ok(Value::List(values));
                    }

                    values.push(self.expression()?);

                    match self.tokens.next() {
                        Some(Token::Comma) => {}
                        Some(Token::RBracket) => return Ok(Value::List(values)),
                        Some(token) => return Err(EvalError::UnexpectedToken(token.to_string())),
                        None => return Err(EvalError::UnexpectedEnd),
                    }
                }
            }
            Some(token) => Err(EvalError::UnexpectedToken(token.to_string())),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

fn operands(op: &'static str, left: &Value, right: &Value) -> EvalError {
    EvalError::Operands {
        op,
        left: left.kind(),
        right: right.kind(),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(value) => Some(*value as f64),
        Value::Float(value) => Some(*value),
        _ => None,
    }
}

/// shared handling for numeric operators, integers stay integers if possible
fn numeric(
    op: &'static str,
    left: Value,
    right: Value,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => int(*a, *b).map(Value::Int).ok_or(EvalError::Overflow),
        _ => match (as_float(&left), as_float(&right)) {
            (Some(a), Some(b)) => Ok(Value::Float(float(a, b))),
            _ => Err(operands(op, &left, &right)),
        },
    }
}

fn add(left: Value, right: Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (left, right) => numeric("+", left, right, i64::checked_add, |a, b| a + b),
    }
}

fn subtract(left: Value, right: Value) -> Result<Value, EvalError> {
    numeric("-", left, right, i64::checked_sub, |a, b| a - b)
}

/// longest string or list a repetition may produce
const MAX_REPEAT_LEN: usize = 1 << 20;

fn repeat<T: Clone>(items: &[T], count: i64) -> Result<Vec<T>, EvalError> {
    let count = usize::try_from(count).unwrap_or(0);
    let len = items
        .len()
        .checked_mul(count)
        .filter(|len| *len <= MAX_REPEAT_LEN)
        .ok_or(EvalError::Overflow)?;

    Ok(items.iter().cloned().cycle().take(len).collect())
}

fn multiply(left: Value, right: Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Str(text), Value::Int(count)) | (Value::Int(count), Value::Str(text)) => {
            Ok(Value::Str(
                repeat(&text.chars().collect_vec(), count)?.into_iter().collect(),
            ))
        }
        (Value::List(items), Value::Int(count)) | (Value::Int(count), Value::List(items)) => {
            Ok(Value::List(repeat(&items, count)?))
        }
        (left, right) => numeric("*", left, right, i64::checked_mul, |a, b| a * b),
    }
}

fn divisor(value: &Value) -> Result<(), EvalError> {
    match as_float(value) {
        Some(divisor) if divisor == 0.0 => Err(EvalError::DivisionByZero),
        _ => Ok(()),
    }
}

fn divide(left: Value, right: Value) -> Result<Value, EvalError> {
    divisor(&right)?;

    match (as_float(&left), as_float(&right)) {
        (Some(a), Some(b)) => Ok(Value::Float(a / b)),
        _ => Err(operands("/", &left, &right)),
    }
}

fn floor_divide(left: Value, right: Value) -> Result<Value, EvalError> {
    divisor(&right)?;

    numeric(
        "//",
        left,
        right,
        |a, b| {
            let quotient = a.checked_div(b)?;

            if a % b != 0 && ((a < 0) != (b < 0)) {
                quotient.checked_sub(1)
            } else {
                Some(quotient)
            }
        },
        |a, b| (a / b).floor(),
    )
}

fn modulo(left: Value, right: Value) -> Result<Value, EvalError> {
    divisor(&right)?;

    numeric(
        "%",
        left,
        right,
        |a, b| a.checked_rem(b).map(|rem| if rem != 0 && ((rem < 0) != (b < 0)) { rem + b } else { rem }),
        |a, b| a - b * (a / b).floor(),
    )
}

fn power(base: Value, exponent: Value) -> Result<Value, EvalError> {
    match (&base, &exponent) {
        (Value::Int(a), Value::Int(b)) if *b >= 0 => u32::try_from(*b)
            .ok()
            .and_then(|b| a.checked_pow(b))
            .map(Value::Int)
            .ok_or(EvalError::Overflow),
        _ => match (as_float(&base), as_float(&exponent)) {
            (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
            _ => Err(operands("**", &base, &exponent)),
        },
    }
}

fn select(value: Value, index: Value) -> Result<Value, EvalError> {
    let Value::Int(index) = index else {
        return Err(operands("[]", &value, &index));
    };

    let resolve = |len: usize| {
        let position = if index < 0 { index + len as i64 } else { index };

        usize::try_from(position)
            .ok()
            .filter(|position| *position < len)
            .ok_or(EvalError::IndexOutOfRange(index))
    };

    match value {
        Value::List(mut items) => {
            let position = resolve(items.len())?;
            Ok(items.swap_remove(position))
        }
        Value::Str(text) => {
            let chars = text.chars().collect_vec();
            let position = resolve(chars.len())?;
            Ok(Value::Str(chars[position].to_string()))
        }
        other => Err(operands("[]", &other, &Value::Int(index))),
    }
}
