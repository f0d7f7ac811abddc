//! Expression language of the `json` data model.
//!
//! Expressions read the session data model directly by name:
//!
//! - `count` / `order.items[0].price` - data model paths
//! - `42`, `-1.5`, `"text"`, `'text'`, `true`, `null`, `[1, 2]`, `{"a": 1}` - literals
//! - `In('state')` - configuration membership
//! - `a == b`, `a != b`, `a > b`, `a >= b`, `a < b`, `a <= b` - comparison
//! - `a + b`, `a - b`, `a * b`, `a / b` - arithmetic (`+` also joins strings)
//! - `!expr`, `expr && expr`, `expr || expr` - logic (AND binds tighter than OR)
//! - `(expr)` - grouping
//!
//! Examples:
//! - `amount > 100 && approved`
//! - `In('running') || retries >= 3`
//! - `"order-" + order.id`

use crate::datamodel::{is_ident_char, ExecutionScope, Path, PathSegment};
use crate::error::EvaluationError;
use serde_json::{Number, Value};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    /// True when the named state is in the configuration.
    In(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parses an expression; trailing input is an error.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty expression".to_string());
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(format!(
                "unexpected input '{}' in expression '{}'",
                &s[parser.pos..],
                s
            ));
        }
        Ok(expr)
    }

    /// True when the expression only combines `In()` predicates and boolean
    /// literals.
    pub fn is_state_predicate(&self) -> bool {
        match self {
            Expr::In(_) | Expr::Literal(Value::Bool(_)) => true,
            Expr::Not(inner) => inner.is_state_predicate(),
            Expr::And(l, r) | Expr::Or(l, r) => l.is_state_predicate() && r.is_state_predicate(),
            _ => false,
        }
    }

    pub fn evaluate(&self, scope: &ExecutionScope<'_>) -> Result<Value, EvaluationError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => scope.data_model.lookup(path),
            Expr::In(id) => Ok(Value::Bool(scope.in_state(id))),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(scope)?))),
            Expr::And(left, right) => {
                if !is_truthy(&left.evaluate(scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(scope)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&left.evaluate(scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(scope)?)))
            }
            Expr::Compare(op, left, right) => {
                let l = left.evaluate(scope)?;
                let r = right.evaluate(scope)?;
                Ok(Value::Bool(compare(*op, &l, &r)))
            }
            Expr::Arith(op, left, right) => {
                let l = left.evaluate(scope)?;
                let r = right.evaluate(scope)?;
                arith(*op, &l, &r)
            }
        }
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(a, b),
        CompareOp::Ne => !values_equal(a, b),
        _ => {
            let ordering = match (a, b) {
                (Value::Number(x), Value::Number(y)) => {
                    x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))
                }
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Eq | CompareOp::Ne => unreachable!(),
            }
        }
    }
}

fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value, EvaluationError> {
    if op == ArithOp::Add && (a.is_string() || b.is_string()) {
        return Ok(Value::String(format!("{}{}", as_text(a), as_text(b))));
    }

    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(EvaluationError::execution(format!(
            "arithmetic on non-numeric operands {} and {}",
            a, b
        )));
    };

    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        let exact = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
            ArithOp::Mul => x.checked_mul(y),
            ArithOp::Div => {
                if y == 0 {
                    return Err(EvaluationError::execution("division by zero"));
                }
                if x % y == 0 {
                    x.checked_div(y)
                } else {
                    None
                }
            }
        };
        if let Some(n) = exact {
            return Ok(Value::Number(n.into()));
        }
    }

    let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) else {
        return Err(EvaluationError::execution("number out of range"));
    };
    let result = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => {
            if y == 0.0 {
                return Err(EvaluationError::execution("division by zero"));
            }
            x / y
        }
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| EvaluationError::execution("arithmetic result is not a finite number"))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        // Two-character operators first so `>=` is not read as `>`.
        let op = if self.peek_str("==") {
            Some((CompareOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((CompareOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((CompareOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((CompareOp::Le, 2))
        } else if self.peek_char() == Some('>') {
            Some((CompareOp::Gt, 1))
        } else if self.peek_char() == Some('<') {
            Some((CompareOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, len)) => {
                self.pos += len;
                let right = self.parse_additive()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => ArithOp::Add,
                Some('-') => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => ArithOp::Mul,
                Some('/') => ArithOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            None => Err("unexpected end of expression".to_string()),
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err("expected ')'".to_string());
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('\'') => Ok(Expr::Literal(Value::String(self.parse_quoted()?))),
            Some('"') => Ok(Expr::Literal(Value::String(self.parse_double_quoted()?))),
            Some('[') | Some('{') => Ok(Expr::Literal(self.parse_json()?)),
            Some(c) if c.is_ascii_digit() || c == '-' => Ok(Expr::Literal(self.parse_number()?)),
            Some(c) if is_ident_char(c, true) => self.parse_identifier(),
            Some(c) => Err(format!("unexpected character '{}'", c)),
        }
    }

    fn parse_identifier(&mut self) -> Result<Expr, String> {
        let name = self.parse_name();

        match name.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            "In" => {
                self.skip_whitespace();
                if self.peek_char() == Some('(') {
                    return self.parse_in();
                }
            }
            _ => {}
        }

        let mut path = Path::new(name);
        loop {
            match self.peek_char() {
                Some('.') => {
                    self.pos += 1;
                    let field = self.parse_name();
                    if field.is_empty() {
                        return Err(format!("empty field name after '{}'", path));
                    }
                    path.segments.push(PathSegment::Field(field));
                }
                Some('[') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    let start = self.pos;
                    while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    let index = self.input[start..self.pos]
                        .parse::<usize>()
                        .map_err(|_| format!("expected array index after '{}['", path))?;
                    self.skip_whitespace();
                    if self.peek_char() != Some(']') {
                        return Err("expected ']'".to_string());
                    }
                    self.pos += 1;
                    path.segments.push(PathSegment::Index(index));
                }
                _ => return Ok(Expr::Path(path)),
            }
        }
    }

    fn parse_in(&mut self) -> Result<Expr, String> {
        // Positioned on '('
        self.pos += 1;
        self.skip_whitespace();
        let id = match self.peek_char() {
            Some('\'') => self.parse_quoted()?,
            Some('"') => self.parse_double_quoted()?,
            _ => return Err("In() expects a quoted state id".to_string()),
        };
        self.skip_whitespace();
        if self.peek_char() != Some(')') {
            return Err("expected ')' after In(".to_string());
        }
        self.pos += 1;
        Ok(Expr::In(id))
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if is_ident_char(c, self.pos == start) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn parse_quoted(&mut self) -> Result<String, String> {
        // Positioned on the opening quote
        self.pos += 1;
        let mut out = String::new();
        let mut escaped = false;
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '\'' {
                return Ok(out);
            } else {
                out.push(c);
            }
        }
        Err("unterminated string".to_string())
    }

    /// JSON string literal, escapes included.
    fn parse_double_quoted(&mut self) -> Result<String, String> {
        let start = self.pos;
        self.pos += 1;
        let mut escaped = false;
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return serde_json::from_str(&self.input[start..self.pos])
                    .map_err(|e| format!("invalid string literal: {}", e));
            }
        }
        Err("unterminated string".to_string())
    }

    /// Arrays and objects; both are self-delimiting for the JSON reader.
    fn parse_json(&mut self) -> Result<Value, String> {
        let rest = &self.input[self.pos..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                self.pos += stream.byte_offset();
                Ok(value)
            }
            Some(Err(e)) => Err(format!("invalid literal: {}", e)),
            None => Err("expected literal".to_string()),
        }
    }

    fn parse_number(&mut self) -> Result<Value, String> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek_char() == Some('.') {
            self.pos += 1;
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }

        let num_str = &self.input[start..self.pos];
        if let Ok(n) = num_str.parse::<i64>() {
            return Ok(Value::Number(n.into()));
        }
        num_str
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid number: '{}'", num_str))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::{DataModel, StateQuery};
    use serde_json::json;

    struct Active(&'static [&'static str]);

    impl StateQuery for Active {
        fn is_active(&self, state_id: &str) -> bool {
            self.0.contains(&state_id)
        }
    }

    fn eval(expr: &str, data: Value) -> Result<Value, EvaluationError> {
        let mut dm = DataModel::new();
        if let Value::Object(map) = data {
            for (k, v) in map {
                dm.declare(&k, v);
            }
        }
        let states = Active(&["running"]);
        let scope = ExecutionScope::new("s1", &mut dm, &states);
        Expr::parse(expr).unwrap().evaluate(&scope)
    }

    #[test]
    fn test_truthy_path() {
        assert_eq!(eval("enabled", json!({"enabled": true})).unwrap(), json!(true));
        assert_eq!(eval("order.paid", json!({"order": {}})).unwrap(), Value::Null);
        assert!(eval("missing", json!({})).is_err());
    }

    #[test]
    fn test_comparison() {
        assert_eq!(eval("amount > 100", json!({"amount": 150})).unwrap(), json!(true));
        assert_eq!(eval("amount >= 100", json!({"amount": 100})).unwrap(), json!(true));
        assert_eq!(eval("amount < 100", json!({"amount": 100})).unwrap(), json!(false));
        assert_eq!(eval("status == \"active\"", json!({"status": "active"})).unwrap(), json!(true));
        assert_eq!(eval("status != 'active'", json!({"status": "idle"})).unwrap(), json!(true));
        assert_eq!(eval("x == null", json!({"x": null})).unwrap(), json!(true));
        assert_eq!(eval("1 == 1.0", json!({})).unwrap(), json!(true));
        assert_eq!(eval("'a' > 1", json!({})).unwrap(), json!(false));
    }

    #[test]
    fn test_logic_precedence() {
        let data = json!({"enabled": false, "amount": 0, "override": true});
        assert_eq!(eval("enabled && amount > 0 || override", data).unwrap(), json!(true));
        assert_eq!(eval("!(a || b)", json!({"a": false, "b": false})).unwrap(), json!(true));
        assert_eq!(eval("!!a", json!({"a": 1})).unwrap(), json!(true));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("false && missing", json!({})).unwrap(), json!(false));
        assert_eq!(eval("true || missing", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("x + 1", json!({"x": 1})).unwrap(), json!(2));
        assert_eq!(eval("x * 10 + 3", json!({"x": 2})).unwrap(), json!(23));
        assert_eq!(eval("(x + 1) * 2", json!({"x": 2})).unwrap(), json!(6));
        assert_eq!(eval("x - -1", json!({"x": 2})).unwrap(), json!(3));
        assert_eq!(eval("x-1", json!({"x": 2})).unwrap(), json!(1));
        assert_eq!(eval("7 / 2", json!({})).unwrap(), json!(3.5));
        assert_eq!(eval("6 / 2", json!({})).unwrap(), json!(3));
        assert_eq!(eval("'n=' + 1", json!({})).unwrap(), json!("n=1"));
        assert!(eval("1 / 0", json!({})).is_err());
        assert!(eval("x * 2", json!({"x": "a"})).is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("[1, 2, 3]", json!({})).unwrap(), json!([1, 2, 3]));
        assert_eq!(eval("{\"a\": [true]}", json!({})).unwrap(), json!({"a": [true]}));
        assert_eq!(eval("'it\\'s'", json!({})).unwrap(), json!("it's"));
        assert_eq!(eval("-2.5", json!({})).unwrap(), json!(-2.5));
    }

    #[test]
    fn test_indexed_path() {
        let data = json!({"items": [{"price": 5}, {"price": 7}]});
        assert_eq!(eval("items[1].price", data.clone()).unwrap(), json!(7));
        assert_eq!(eval("items[5].price", data).unwrap(), Value::Null);
    }

    #[test]
    fn test_in_predicate() {
        assert_eq!(eval("In('running')", json!({})).unwrap(), json!(true));
        assert_eq!(eval("In(\"stopped\")", json!({})).unwrap(), json!(false));
        assert!(Expr::parse("In('a') && !In('b')").unwrap().is_state_predicate());
        assert!(!Expr::parse("In('a') && x").unwrap().is_state_predicate());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("(a").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("a = 1").is_err());
        assert!(Expr::parse("'open").is_err());
        assert!(Expr::parse("a.").is_err());
        assert!(Expr::parse("In(x)").is_err());
        assert!(Expr::parse("a &&").is_err());
    }
}
