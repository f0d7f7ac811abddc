//! Reference data-model handlers: `null` and `json`.

use crate::datamodel::{ExecutionScope, Path};
use crate::error::EvaluationError;
use crate::evaluator::{
    ConditionEvaluator, DataModelHandler, LocationEvaluator, ScriptEvaluator, ValueEvaluator,
};
use crate::expr::{is_truthy, Expr};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// The null data model: no data, conditions limited to `In()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDataModel;

impl NullDataModel {
    pub const NAME: &'static str = "null";
}

impl DataModelHandler for NullDataModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn condition(&self, expr: &str) -> Result<Arc<dyn ConditionEvaluator>, String> {
        let parsed = Expr::parse(expr)?;
        if !parsed.is_state_predicate() {
            return Err(format!(
                "the null data model only supports In() conditions, got '{}'",
                expr
            ));
        }
        Ok(Arc::new(JsonCondition { expr: parsed }))
    }

    fn value(&self, expr: &str) -> Result<Arc<dyn ValueEvaluator>, String> {
        Err(format!(
            "the null data model does not support value expressions ('{}')",
            expr
        ))
    }

    fn location(&self, expr: &str) -> Result<Arc<dyn LocationEvaluator>, String> {
        Err(format!(
            "the null data model does not support locations ('{}')",
            expr
        ))
    }

    fn script(&self, _source: &str) -> Result<Arc<dyn ScriptEvaluator>, String> {
        Err("the null data model does not support scripts".to_string())
    }

    fn supports_data(&self) -> bool {
        false
    }
}

/// JSON data model with the expression language of [`crate::expr`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataModel;

impl JsonDataModel {
    pub const NAME: &'static str = "json";
}

impl DataModelHandler for JsonDataModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn condition(&self, expr: &str) -> Result<Arc<dyn ConditionEvaluator>, String> {
        Ok(Arc::new(JsonCondition {
            expr: Expr::parse(expr)?,
        }))
    }

    fn value(&self, expr: &str) -> Result<Arc<dyn ValueEvaluator>, String> {
        Ok(Arc::new(JsonValue {
            expr: Expr::parse(expr)?,
        }))
    }

    fn location(&self, expr: &str) -> Result<Arc<dyn LocationEvaluator>, String> {
        Ok(Arc::new(JsonLocation {
            source: expr.trim().to_string(),
            path: Path::parse(expr)?,
        }))
    }

    fn script(&self, _source: &str) -> Result<Arc<dyn ScriptEvaluator>, String> {
        Err("the json data model does not support scripts".to_string())
    }
}

#[derive(Debug)]
struct JsonCondition {
    expr: Expr,
}

#[async_trait]
impl ConditionEvaluator for JsonCondition {
    async fn evaluate_boolean(
        &self,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<bool, EvaluationError> {
        Ok(is_truthy(&self.expr.evaluate(scope)?))
    }
}

#[derive(Debug)]
struct JsonValue {
    expr: Expr,
}

#[async_trait]
impl ValueEvaluator for JsonValue {
    async fn evaluate_object(
        &self,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<Value, EvaluationError> {
        self.expr.evaluate(scope)
    }
}

#[derive(Debug)]
struct JsonLocation {
    source: String,
    path: Path,
}

#[async_trait]
impl LocationEvaluator for JsonLocation {
    async fn get_value(&self, scope: &mut ExecutionScope<'_>) -> Result<Value, EvaluationError> {
        scope.data_model.lookup(&self.path)
    }

    async fn set_value(
        &self,
        scope: &mut ExecutionScope<'_>,
        value: Value,
    ) -> Result<(), EvaluationError> {
        scope.data_model.assign(&self.path, value)
    }

    async fn declare_local_variable(
        &self,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<(), EvaluationError> {
        if scope.data_model.is_declared(&self.path.root) {
            return Ok(());
        }
        if !self.path.is_root_only() {
            return Err(EvaluationError::execution(format!(
                "cannot declare nested location '{}'",
                self.source
            )));
        }
        scope.data_model.declare(&self.path.root, Value::Null);
        Ok(())
    }

    fn location(&self) -> &str {
        &self.source
    }
}
