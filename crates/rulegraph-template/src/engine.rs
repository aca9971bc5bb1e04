//! Placeholder engine
//!
//! Built on an empty minijinja environment: no globals, no functions, no
//! tests, and `default` as the only filter. Undefined lookups are errors.

use minijinja::{Environment, UndefinedBehavior, Value as JinjaValue};
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

use crate::error::{TemplateError, TemplateResult};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// `value | default(fallback)`: missing and null values take the fallback
fn default_filter(value: Option<JinjaValue>, fallback: Option<JinjaValue>) -> JinjaValue {
    value.or(fallback).unwrap_or_else(|| JinjaValue::from(""))
}

/// The expression inside a string that is exactly one `{{ ... }}`
fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

/// Renders placeholders against a read-only JSON context
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    env: Arc<Environment<'static>>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::empty();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("default", default_filter);
        Self { env: Arc::new(env) }
    }

    /// Render a template to text
    pub fn render(&self, template: &str, context: &Value) -> TemplateResult<String> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }
        trace!(template, "Rendering template");

        let tmpl = self.env.template_from_str(template)?;
        Ok(tmpl.render(context)?)
    }

    /// Render every string inside a JSON value.
    ///
    /// A string that is exactly one placeholder keeps the resolved value's
    /// JSON type, so `"{{ trigger.value }}"` can yield a number.
    pub fn render_value(&self, value: &Value, context: &Value) -> TemplateResult<Value> {
        match value {
            Value::String(s) => match sole_placeholder(s) {
                Some(expression) => self.evaluate(expression, context),
                None => self.render(s, context).map(Value::String),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<TemplateResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.render_value(v, context)?)))
                .collect::<TemplateResult<serde_json::Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a bare expression such as `trigger.value | default(0)`
    pub fn evaluate(&self, expression: &str, context: &Value) -> TemplateResult<Value> {
        trace!(expression, "Evaluating expression");
        let expr = self.env.compile_expression(expression)?;
        let result = expr.eval(context)?;
        if result.is_undefined() {
            return Err(TemplateError::UndefinedVariable {
                name: expression.to_string(),
            });
        }
        serde_json::to_value(&result).map_err(|e| TemplateError::RenderError {
            message: e.to_string(),
        })
    }

    /// Render then test the result for truthiness
    pub fn evaluate_bool(&self, template: &str, context: &Value) -> TemplateResult<bool> {
        let rendered = self.render_value(&Value::String(template.to_string()), context)?;
        Ok(is_truthy(&rendered))
    }

    /// Check syntax without rendering
    pub fn check(&self, template: &str) -> TemplateResult<()> {
        self.env.template_from_str(template).map(|_| ())?;
        Ok(())
    }

    pub fn is_template(text: &str) -> bool {
        text.contains(OPEN) || text.contains("{%") || text.contains("{#")
    }
}

/// Truthiness of a rendered value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "on" | "1" | "enable" | "enabled"
        ),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}
