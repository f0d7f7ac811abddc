//! Evaluator contracts.
//!
//! A [`DataModelHandler`] binds every expression of a document to an
//! evaluator object at build time. Evaluators run against an explicit
//! [`ExecutionScope`] and may suspend, so the contracts are async.

use crate::datamodel::ExecutionScope;
use crate::error::EvaluationError;
use crate::handler::{JsonDataModel, NullDataModel};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait ConditionEvaluator: fmt::Debug + Send + Sync {
    async fn evaluate_boolean(&self, scope: &mut ExecutionScope<'_>)
        -> Result<bool, EvaluationError>;
}

#[async_trait]
pub trait ValueEvaluator: fmt::Debug + Send + Sync {
    async fn evaluate_object(&self, scope: &mut ExecutionScope<'_>)
        -> Result<Value, EvaluationError>;

    /// Strings evaluate to themselves, anything else to its JSON text.
    async fn evaluate_string(
        &self,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<String, EvaluationError> {
        Ok(match self.evaluate_object(scope).await? {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

#[async_trait]
pub trait LocationEvaluator: fmt::Debug + Send + Sync {
    async fn get_value(&self, scope: &mut ExecutionScope<'_>) -> Result<Value, EvaluationError>;

    async fn set_value(
        &self,
        scope: &mut ExecutionScope<'_>,
        value: Value,
    ) -> Result<(), EvaluationError>;

    /// Declares the location if it is not declared yet.
    async fn declare_local_variable(
        &self,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<(), EvaluationError>;

    /// Source text of the location, used as the key for namelist data.
    fn location(&self) -> &str;
}

#[async_trait]
pub trait ScriptEvaluator: fmt::Debug + Send + Sync {
    async fn execute(&self, scope: &mut ExecutionScope<'_>) -> Result<(), EvaluationError>;
}

/// Binds expressions to evaluators. Errors name the unsupported construct
/// and become validation errors.
pub trait DataModelHandler: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn condition(&self, expr: &str) -> Result<Arc<dyn ConditionEvaluator>, String>;

    fn value(&self, expr: &str) -> Result<Arc<dyn ValueEvaluator>, String>;

    fn location(&self, expr: &str) -> Result<Arc<dyn LocationEvaluator>, String>;

    fn script(&self, source: &str) -> Result<Arc<dyn ScriptEvaluator>, String>;

    /// Whether `<data>` declarations are allowed.
    fn supports_data(&self) -> bool {
        true
    }
}

/// Maps document data-model names to handlers.
#[derive(Debug, Clone)]
pub struct DataModelRegistry {
    handlers: HashMap<String, Arc<dyn DataModelHandler>>,
    default: String,
}

impl DataModelRegistry {
    /// An empty registry whose default handler is `default`.
    pub fn empty(default: impl Into<String>) -> Self {
        Self {
            handlers: HashMap::new(),
            default: default.into(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn DataModelHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = name.into();
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataModelHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Handler for a document's `datamodel` attribute.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<dyn DataModelHandler>> {
        self.get(name.unwrap_or(&self.default))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for DataModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty(JsonDataModel::NAME);
        registry.register(Arc::new(NullDataModel));
        registry.register(Arc::new(JsonDataModel));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = DataModelRegistry::default();
        assert_eq!(registry.names(), vec!["json", "null"]);
        assert_eq!(registry.resolve(None).unwrap().name(), "json");
        assert_eq!(registry.resolve(Some("null")).unwrap().name(), "null");
        assert!(registry.resolve(Some("ecmascript")).is_none());
    }

    #[test]
    fn test_with_default() {
        let registry = DataModelRegistry::default().with_default("null");
        assert_eq!(registry.default_name(), "null");
        assert_eq!(registry.resolve(None).unwrap().name(), "null");
    }
}
