use crate::dom::{DataModel, ElementId};
use crate::error::{StrataError, StrataResult};
use crate::variant::Variant;
use std::collections::BTreeMap;

/// Result of evaluating a user expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionValue {
    Bool(bool),
    Value(Variant),
}

/// Names visible to an expression.
///
/// `element` is the full name of the element the expression belongs to
/// (exposed as `self`); `values` holds the named inputs such as `value`, `size`,
/// `count` or `offset`.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub element: String,
    pub values: BTreeMap<String, Variant>,
}

impl Scope {
    pub fn new(element: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: Variant) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }
}

/// Evaluates relation expressions and element constraints.
///
/// The engine never interprets expression text itself; a model without an
/// evaluator treats every expression as a soft error.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Scope) -> StrataResult<ExpressionValue>;
}

impl<F> ExpressionEvaluator for F
where
    F: Fn(&str, &Scope) -> StrataResult<ExpressionValue> + Send + Sync,
{
    fn evaluate(&self, expression: &str, scope: &Scope) -> StrataResult<ExpressionValue> {
        self(expression, scope)
    }
}

impl DataModel {
    pub(crate) fn evaluate(
        &self,
        expression: &str,
        scope: &Scope,
    ) -> StrataResult<ExpressionValue> {
        match self.evaluator() {
            Some(evaluator) => evaluator.evaluate(expression, scope),
            None => Err(StrataError::soft(format!(
                "No expression evaluator is configured to run '{expression}'."
            ))),
        }
    }

    /// Runs an expression that has to produce an integer.
    pub(crate) fn evaluate_integer(
        &self,
        owner: ElementId,
        expression: &str,
        inputs: &[(&str, i64)],
    ) -> StrataResult<Variant> {
        let scope = inputs
            .iter()
            .fold(Scope::new(self[owner].full_name()), |scope, (name, value)| {
                scope.with(name, Variant::Int(*value))
            });
        match self.evaluate(expression, &scope)? {
            ExpressionValue::Value(value) => Ok(value),
            ExpressionValue::Bool(_) => Err(StrataError::soft(format!(
                "Expression '{expression}' must return a value, not a boolean."
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn closures_act_as_evaluators() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        model.set_evaluator(Arc::new(|expr: &str, scope: &Scope| -> StrataResult<ExpressionValue> {
            assert_eq!(expr, "value * 2");
            let value = scope.values["value"].to_i64()?;
            Ok(ExpressionValue::Value(Variant::Int(value * 2)))
        }));
        let result = model.evaluate_integer(root, "value * 2", &[("value", 21)]).unwrap();
        assert_eq!(result, Variant::Int(42));
    }

    #[test]
    fn missing_evaluator_is_a_soft_error() {
        let model = DataModel::new("Model").unwrap();
        let err = model.evaluate("1", &Scope::new("Model")).unwrap_err();
        assert!(err.is_soft());
    }
}
