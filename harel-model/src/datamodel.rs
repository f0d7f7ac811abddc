//! Session data model and the explicit scope handed to evaluators.

use crate::error::EvaluationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Read-only variables maintained by the interpreter.
pub const SYSTEM_VARIABLES: [&str; 4] = ["_sessionid", "_name", "_event", "_ioprocessors"];

/// One step of a location path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A location inside the data model, e.g. `order.items[0].price`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<PathSegment>,
}

impl Path {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            segments: Vec::new(),
        }
    }

    /// Parses a dotted path with optional `[n]` indices.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let mut chars = input.char_indices().peekable();
        let mut root = String::new();
        let mut segments = Vec::new();

        while let Some(&(_, c)) = chars.peek() {
            if is_ident_char(c, root.is_empty()) {
                root.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if root.is_empty() {
            return Err(format!("invalid location '{}'", input));
        }

        while let Some((_, c)) = chars.next() {
            match c {
                '.' => {
                    let mut field = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if is_ident_char(c, field.is_empty()) {
                            field.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if field.is_empty() {
                        return Err(format!("empty field in location '{}'", input));
                    }
                    segments.push(PathSegment::Field(field));
                }
                '[' => {
                    let mut digits = String::new();
                    for (_, c) in chars.by_ref() {
                        if c == ']' {
                            break;
                        }
                        digits.push(c);
                    }
                    let index = digits
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| format!("invalid index '{}' in location '{}'", digits, input))?;
                    segments.push(PathSegment::Index(index));
                }
                other => {
                    return Err(format!(
                        "unexpected character '{}' in location '{}'",
                        other, input
                    ))
                }
            }
        }

        Ok(Self { root, segments })
    }

    pub fn is_root_only(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for segment in &self.segments {
            match segment {
                PathSegment::Field(name) => write!(f, ".{}", name)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

pub(crate) fn is_ident_char(c: char, first: bool) -> bool {
    if first {
        c.is_alphabetic() || c == '_' || c == '$'
    } else {
        c.is_alphanumeric() || c == '_' || c == '$'
    }
}

/// Variable bindings of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataModel {
    vars: Map<String, Value>,
}

impl DataModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_system_variable(name: &str) -> bool {
        SYSTEM_VARIABLES.contains(&name)
    }

    /// Declares (or re-initializes) a user variable.
    pub fn declare(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Writes a system variable. Only the interpreter calls this.
    pub fn set_system(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Resolves a path. Undeclared roots are an error, missing nested fields
    /// read as `null`.
    pub fn lookup(&self, path: &Path) -> Result<Value, EvaluationError> {
        let mut current = self.vars.get(&path.root).ok_or_else(|| {
            EvaluationError::execution(format!("'{}' is not declared", path.root))
        })?;

        for segment in &path.segments {
            let next = match (segment, current) {
                (PathSegment::Field(name), Value::Object(map)) => map.get(name),
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Value::Null),
            }
        }

        Ok(current.clone())
    }

    /// Assigns a value to a declared, writable location.
    pub fn assign(&mut self, path: &Path, value: Value) -> Result<(), EvaluationError> {
        if Self::is_system_variable(&path.root) {
            return Err(EvaluationError::execution(format!(
                "'{}' is a read-only system variable",
                path.root
            )));
        }
        let mut current = self.vars.get_mut(&path.root).ok_or_else(|| {
            EvaluationError::execution(format!("cannot assign to undeclared '{}'", path.root))
        })?;

        for segment in &path.segments {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Object(map)) => {
                    map.entry(name.clone()).or_insert(Value::Null)
                }
                (PathSegment::Index(i), Value::Array(items)) => {
                    if *i == items.len() {
                        items.push(Value::Null);
                    }
                    items.get_mut(*i).ok_or_else(|| {
                        EvaluationError::execution(format!("index {} out of bounds in '{}'", i, path))
                    })?
                }
                _ => {
                    return Err(EvaluationError::execution(format!(
                        "'{}' does not address a container",
                        path
                    )))
                }
            };
        }

        *current = value;
        Ok(())
    }

    /// Every binding, system variables included.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.vars.clone())
    }

    pub fn restore(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(vars) => Ok(Self { vars }),
            Value::Null => Ok(Self::default()),
            other => Err(format!("data model snapshot must be an object, got {}", other)),
        }
    }

    /// User variables only, in declaration order.
    pub fn user_variables(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars
            .iter()
            .filter(|(name, _)| !Self::is_system_variable(name))
    }
}

/// Configuration queries available to evaluators (`In()`).
pub trait StateQuery: Send + Sync {
    fn is_active(&self, state_id: &str) -> bool;
}

/// Everything an evaluator may touch while running. No ambient state.
pub struct ExecutionScope<'a> {
    pub session_id: &'a str,
    pub data_model: &'a mut DataModel,
    states: &'a dyn StateQuery,
}

impl<'a> ExecutionScope<'a> {
    pub fn new(
        session_id: &'a str,
        data_model: &'a mut DataModel,
        states: &'a dyn StateQuery,
    ) -> Self {
        Self {
            session_id,
            data_model,
            states,
        }
    }

    pub fn in_state(&self, state_id: &str) -> bool {
        self.states.is_active(state_id)
    }
}

impl fmt::Debug for ExecutionScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("session_id", &self.session_id)
            .field("data_model", &self.data_model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        let path = Path::parse("order.items[2].price").unwrap();
        assert_eq!(path.root, "order");
        assert_eq!(
            path.segments,
            vec![
                PathSegment::Field("items".to_string()),
                PathSegment::Index(2),
                PathSegment::Field("price".to_string()),
            ]
        );
        assert_eq!(path.to_string(), "order.items[2].price");

        assert!(Path::parse("").is_err());
        assert!(Path::parse("a.").is_err());
        assert!(Path::parse("a[x]").is_err());
        assert!(Path::parse("a b").is_err());
    }

    #[test]
    fn test_lookup() {
        let mut dm = DataModel::new();
        dm.declare("order", json!({"items": [{"price": 5}]}));

        let price = dm.lookup(&Path::parse("order.items[0].price").unwrap()).unwrap();
        assert_eq!(price, json!(5));

        let missing = dm.lookup(&Path::parse("order.customer").unwrap()).unwrap();
        assert_eq!(missing, Value::Null);

        assert!(dm.lookup(&Path::parse("nothing").unwrap()).is_err());
    }

    #[test]
    fn test_assign_nested() {
        let mut dm = DataModel::new();
        dm.declare("order", json!({"items": []}));

        dm.assign(&Path::parse("order.items[0]").unwrap(), json!("a")).unwrap();
        dm.assign(&Path::parse("order.total").unwrap(), json!(3)).unwrap();
        assert_eq!(dm.get("order"), Some(&json!({"items": ["a"], "total": 3})));

        let err = dm.assign(&Path::parse("order.items[5]").unwrap(), json!(1));
        assert!(err.is_err());
        let err = dm.assign(&Path::parse("order.total.x").unwrap(), json!(1));
        assert!(err.is_err());
    }

    #[test]
    fn test_assign_rejects_system_and_undeclared() {
        let mut dm = DataModel::new();
        dm.set_system("_sessionid", json!("s1"));

        let err = dm.assign(&Path::new("_sessionid"), json!("x")).unwrap_err();
        assert!(err.to_string().contains("read-only"));

        let err = dm.assign(&Path::new("undeclared"), json!(1)).unwrap_err();
        assert!(err.to_string().contains("undeclared"));
        assert_eq!(dm.get("_sessionid"), Some(&json!("s1")));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut dm = DataModel::new();
        dm.declare("x", json!(1));
        dm.set_system("_name", json!("m"));

        let restored = DataModel::restore(dm.snapshot()).unwrap();
        assert_eq!(restored, dm);
        assert_eq!(restored.user_variables().count(), 1);

        assert!(DataModel::restore(json!([1])).is_err());
    }
}
