//! Expression evaluation and template rendering over a scope snapshot.
//!
//! The engine talks to expressions through the [`Evaluator`] trait so hosts
//! can plug in their own language. [`JexlEvaluator`] is the default: it wraps
//! `jexl_eval::Evaluator` with pre-registered standard transforms and renders
//! `{{ expr }}` templates by evaluating each placeholder.
//!
//! **Security note:** Scope data is always passed as the context object,
//! NEVER interpolated into expression strings.

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Evaluator trait
// ---------------------------------------------------------------------------

/// Evaluates expressions and renders templates against a JSON read view
/// of the scope (`{"node": .., "var": .., "iter": ..}`).
pub trait Evaluator: Send + Sync {
    /// Evaluate a bare expression (no `{{ }}` delimiters) to a JSON value.
    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ExpressionError>;

    /// Render text, replacing every `{{ expr }}` with the stringified value.
    fn render_template(&self, text: &str, data: &Value) -> Result<String, ExpressionError>;
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Input-field templates (e.g. `"Hello {{ node.hook.output.user }}"`)
/// - Switch operands (e.g. `{{ var.priority }}`)
/// - Foreach collections (e.g. `node.fetch.output.items`)
///
/// The transforms are registered once, in [`JexlEvaluator::new`].
pub struct JexlEvaluator {
    inner: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    pub fn new() -> Self {
        Self {
            inner: Self::build(),
        }
    }

    fn build() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("json", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(serde_json::to_string(&val).unwrap_or_default()))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JexlEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JexlEvaluator").finish_non_exhaustive()
    }
}

impl Evaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ExpressionError> {
        if !data.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.inner
            .eval_in_context(expression, data)
            .map_err(|e| ExpressionError::EvalFailed(format!("{expression}: {e}")))
    }

    fn render_template(&self, text: &str, data: &Value) -> Result<String, ExpressionError> {
        let mut rendered = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                // Unterminated placeholder is literal text.
                rendered.push_str(&rest[start..]);
                return Ok(rendered);
            };

            let expression = after_open[..end].trim();
            if !expression.is_empty() {
                let value = self.evaluate(expression, data)?;
                rendered.push_str(&value_to_string(&value));
            }
            rest = &after_open[end + 2..];
        }

        rendered.push_str(rest);
        Ok(rendered)
    }
}

// ---------------------------------------------------------------------------
// Operand resolution
// ---------------------------------------------------------------------------

/// If `text` is exactly one `{{ path }}` placeholder around a bare variable
/// reference, return the reference.
pub fn single_reference(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let inner = inner.trim();
    is_reference_path(inner).then_some(inner)
}

fn is_reference_path(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']'))
}

/// Resolve a string operand: a lone variable reference evaluates to its
/// typed value, anything else renders as template text.
pub fn resolve_operand(
    evaluator: &dyn Evaluator,
    text: &str,
    data: &Value,
) -> Result<Value, ExpressionError> {
    match single_reference(text) {
        Some(reference) => evaluator.evaluate(reference, data),
        None => evaluator.render_template(text, data).map(Value::String),
    }
}

/// Resolve every string leaf of `value` with [`resolve_operand`].
pub fn resolve_value(
    evaluator: &dyn Evaluator,
    value: &Value,
    data: &Value,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => resolve_operand(evaluator, s, data),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(evaluator, item, data))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(evaluator, item, data)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Convert a JSON value to its template text form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
