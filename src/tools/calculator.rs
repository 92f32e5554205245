//! Arithmetic expression evaluator
//!
//! Recursive descent over a small grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary (('^' | '**') unary)?
//! primary := number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Exponentiation is right-associative and binds tighter than unary minus,
//! so `-2^2` is `-4`.

use super::Tool;
use crate::{Error, Result};

/// Evaluates arithmetic for the model
#[derive(Debug, Default)]
pub struct CalculatorTool;

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate a math expression, e.g. '2+2', 'sqrt(16)', 'sin(pi/2)'"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Math expression such as '2+2', 'sqrt(16)' or 'sin(3.14159/2)'"
                }
            },
            "required": ["expression"]
        })
    }

    fn call(&self, arguments: &serde_json::Value) -> Result<String> {
        let expression = arguments
            .get("expression")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::Tool("missing 'expression' argument".into()))?;

        let value = evaluate(expression)?;
        Ok(format!("计算结果：{expression} = {}", format_number(value)))
    }
}

/// Evaluate an expression
///
/// # Errors
///
/// Returns [`Error::Tool`] on syntax errors, unknown identifiers, division
/// by zero, domain errors, or a non-finite result
pub fn evaluate(expression: &str) -> Result<f64> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(Error::Tool("empty expression".into()));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(Error::Tool(format!("unexpected {token:?}")));
    }

    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::Tool("result is not a finite number".into()))
    }
}

/// Render integral values without a fractional part
#[must_use]
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        let text = format!("{value:.10}");
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent suffix: 1e3, 2.5E-4
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse()
                    .map_err(|_| Error::Tool(format!("invalid number: {text}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            _ => {
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' | '×' => Token::Star,
                    '/' | '÷' => Token::Slash,
                    '%' => Token::Percent,
                    '^' => Token::Pow,
                    '(' | '（' => Token::LParen,
                    ')' | '）' => Token::RParen,
                    ',' | '，' => Token::Comma,
                    other => return Err(Error::Tool(format!("unexpected character '{other}'"))),
                });
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Nesting of parentheses, signs and exponents allowed in one expression
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(Error::Tool(format!("expected {token:?}")))
        }
    }

    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        loop {
            if self.eat(&Token::Plus) {
                value += self.term()?;
            } else if self.eat(&Token::Minus) {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.unary()?;
        loop {
            if self.eat(&Token::Star) {
                value *= self.unary()?;
            } else if self.eat(&Token::Slash) {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err(Error::Tool("division by zero".into()));
                }
                value /= divisor;
            } else if self.eat(&Token::Percent) {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err(Error::Tool("modulo by zero".into()));
                }
                // Sign follows the divisor
                value = value - divisor * (value / divisor).floor();
            } else {
                return Ok(value);
            }
        }
    }

    /// Every level of nesting passes through here
    fn unary(&mut self) -> Result<f64> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::Tool("expression is nested too deeply".into()));
        }
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64> {
        if self.eat(&Token::Minus) {
            return Ok(-self.unary()?);
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<f64> {
        let base = self.primary()?;
        if self.eat(&Token::Pow) {
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = vec![self.expr()?];
                    while self.eat(&Token::Comma) {
                        args.push(self.expr()?);
                    }
                    self.expect(&Token::RParen)?;
                    apply_function(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(token) => Err(Error::Tool(format!("unexpected {token:?}"))),
            None => Err(Error::Tool("unexpected end of expression".into())),
        }
    }
}

fn constant(name: &str) -> Result<f64> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        _ => Err(Error::Tool(format!("unknown identifier: {name}"))),
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64> {
    let arity = |n: usize| -> Result<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(Error::Tool(format!(
                "{name}() takes {n} argument(s), got {}",
                args.len()
            )))
        }
    };

    match name {
        "sqrt" => {
            arity(1)?;
            if args[0] < 0.0 {
                return Err(Error::Tool("math domain error: sqrt of negative".into()));
            }
            Ok(args[0].sqrt())
        }
        "sin" => arity(1).map(|()| args[0].sin()),
        "cos" => arity(1).map(|()| args[0].cos()),
        "tan" => arity(1).map(|()| args[0].tan()),
        "exp" => arity(1).map(|()| args[0].exp()),
        "abs" => arity(1).map(|()| args[0].abs()),
        "log" => {
            let value = *args
                .first()
                .ok_or_else(|| Error::Tool("log() takes 1 or 2 arguments".into()))?;
            if value <= 0.0 {
                return Err(Error::Tool("math domain error: log of non-positive".into()));
            }
            match args {
                [_] => Ok(value.ln()),
                [_, base] if *base > 0.0 && (base - 1.0).abs() > f64::EPSILON => Ok(value.ln() / base.ln()),
                [_, _] => Err(Error::Tool("math domain error: invalid log base".into())),
                _ => Err(Error::Tool("log() takes 1 or 2 arguments".into())),
            }
        }
        "round" => match args {
            [value] => Ok(value.round()),
            [value, digits] => {
                let factor = 10f64.powf(digits.trunc());
                Ok((value * factor).round() / factor)
            }
            _ => Err(Error::Tool("round() takes 1 or 2 arguments".into())),
        },
        "pow" => {
            arity(2)?;
            Ok(args[0].powf(args[1]))
        }
        _ => Err(Error::Tool(format!("unknown function: {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str) -> f64 {
        evaluate(expression).unwrap()
    }

    #[test]
    fn test_precedence() {
        assert!((eval("2+3*4") - 14.0).abs() < 1e-9);
        assert!((eval("(2+3)*4") - 20.0).abs() < 1e-9);
        assert!((eval("10 - 4 - 3") - 3.0).abs() < 1e-9);
        assert!((eval("7 % 3") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_power_is_right_associative() {
        assert!((eval("2^3^2") - 512.0).abs() < 1e-9);
        assert!((eval("2**10") - 1024.0).abs() < 1e-9);
        assert!((eval("-2^2") + 4.0).abs() < 1e-9);
        assert!((eval("2^-1") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_functions_and_constants() {
        assert!((eval("sqrt(16)") - 4.0).abs() < 1e-9);
        assert!((eval("sin(pi/2)") - 1.0).abs() < 1e-9);
        assert!((eval("log(e)") - 1.0).abs() < 1e-9);
        assert!((eval("log(8, 2)") - 3.0).abs() < 1e-9);
        assert!((eval("pow(2, 8)") - 256.0).abs() < 1e-9);
        assert!((eval("round(3.14159, 2)") - 3.14).abs() < 1e-9);
        assert!((eval("abs(-3)") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors() {
        assert!(evaluate("1/0").is_err());
        assert!(evaluate("sqrt(-1)").is_err());
        assert!(evaluate("log(0)").is_err());
        assert!(evaluate("foo + 1").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1").is_err());
        assert!(evaluate("").is_err());
        assert!(evaluate("import os").is_err());
        assert!(evaluate("10^400").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let nested = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert!((eval(&nested) - 1.0).abs() < 1e-9);
        assert!((eval("--2^-2") - 0.25).abs() < 1e-9);

        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(matches!(evaluate(&parens), Err(Error::Tool(_))));
        assert!(evaluate(&"-".repeat(100_000)).is_err());
        assert!(evaluate(&"2^".repeat(50_000)).is_err());
        assert!(evaluate(&"sqrt(".repeat(50_000)).is_err());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-12.0), "-12");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1.0 / 3.0), "0.3333333333");
    }

    #[test]
    fn test_tool_output() {
        let text = CalculatorTool
            .call(&serde_json::json!({ "expression": "sqrt(16)" }))
            .unwrap();
        assert_eq!(text, "计算结果：sqrt(16) = 4");

        assert!(CalculatorTool.call(&serde_json::json!({})).is_err());
    }
}
