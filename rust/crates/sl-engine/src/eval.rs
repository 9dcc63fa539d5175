//! Expression bridge
//!
//! The engine never interprets user expressions itself; it delegates to an
//! `Evaluator`. Production deployments plug in the sandboxed evaluator of the
//! host script language. `SimpleEvaluator` is the built-in implementation:
//! literals, variable references, indexing, `len()`, comparisons, and
//! line-oriented `name = expr` bodies. It is re-entrant and shared across
//! workers.

use serde_json::Value;
use std::collections::BTreeMap;

use sl_core::{Error, Result};

/// Substep environment: bound variables visible to expressions
pub type Env = BTreeMap<String, Value>;

/// Adapter over the external expression evaluator
pub trait Evaluator: Send + Sync {
    /// Evaluate a single expression against an environment
    fn eval(&self, text: &str, env: &Env) -> Result<Value>;

    /// Execute a statement body, returning the bindings it introduced
    fn exec_body(&self, text: &str, env: &Env) -> Result<Env>;
}

/// Render a value into action text: strings bare, sequences space-joined
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Truthiness for `stop_if` conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Expand `{expr}` placeholders in text against an environment.
///
/// `{{` and `}}` escape literal braces. Each placeholder is a single
/// evaluator expression; values render with [`render_value`].
pub fn expand_text(text: &str, env: &Env, evaluator: &dyn Evaluator) -> Result<String> {
    let mut out = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut expr = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => expr.push(c),
                        None => {
                            return Err(Error::Eval(format!(
                                "unterminated placeholder in '{}'",
                                text
                            )))
                        }
                    }
                }
                out.push_str(&render_value(&evaluator.eval(&expr, env)?));
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Built-in minimal evaluator
#[derive(Debug, Default, Clone)]
pub struct SimpleEvaluator;

impl SimpleEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn eval_expr(&self, text: &str, env: &Env) -> Result<Value> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Eval("empty expression".to_string()));
        }

        // comparisons, lowest precedence
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if let Some((lhs, rhs)) = split_top_level(text, op) {
                let lhs = self.eval_expr(lhs, env)?;
                let rhs = self.eval_expr(rhs, env)?;
                return compare(op, &lhs, &rhs);
            }
        }

        // literals
        if let Some(stripped) = strip_quotes(text) {
            return Ok(Value::String(stripped.to_string()));
        }
        if text == "true" {
            return Ok(Value::Bool(true));
        }
        if text == "false" {
            return Ok(Value::Bool(false));
        }
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Value::Number(n.into()));
        }
        if let Ok(f) = text.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(Value::Number(n));
            }
        }

        // list literal
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if is_balanced(inner) {
                let mut items = Vec::new();
                for part in split_commas(inner) {
                    if !part.trim().is_empty() {
                        items.push(self.eval_expr(part, env)?);
                    }
                }
                return Ok(Value::Array(items));
            }
        }

        // len(expr)
        if let Some(inner) = text.strip_prefix("len(").and_then(|t| t.strip_suffix(')')) {
            let value = self.eval_expr(inner, env)?;
            let n = match &value {
                Value::Array(items) => items.len(),
                Value::String(s) => s.len(),
                other => {
                    return Err(Error::Eval(format!("len() of non-sequence {}", other)))
                }
            };
            return Ok(Value::Number((n as i64).into()));
        }

        // indexing: base[idx]
        if let Some(open) = find_index_bracket(text) {
            let base = &text[..open];
            let idx_text = &text[open + 1..text.len() - 1];
            let base_val = self.eval_expr(base, env)?;
            let idx = self.eval_expr(idx_text, env)?;
            let Value::Number(n) = idx else {
                return Err(Error::Eval(format!("non-integer index in '{}'", text)));
            };
            let i = n
                .as_i64()
                .ok_or_else(|| Error::Eval(format!("non-integer index in '{}'", text)))?;
            let Value::Array(items) = base_val else {
                return Err(Error::Eval(format!("indexing non-sequence '{}'", base)));
            };
            let i = if i < 0 { items.len() as i64 + i } else { i };
            return items
                .get(i as usize)
                .cloned()
                .ok_or_else(|| Error::Eval(format!("index {} out of range in '{}'", i, text)));
        }

        // variable reference; free variables are an error, not an implicit None
        if is_identifier(text) {
            return env
                .get(text)
                .cloned()
                .ok_or_else(|| Error::Eval(format!("undefined variable '{}'", text)));
        }

        Err(Error::Eval(format!("unsupported expression '{}'", text)))
    }
}

impl Evaluator for SimpleEvaluator {
    fn eval(&self, text: &str, env: &Env) -> Result<Value> {
        self.eval_expr(text, env)
    }

    fn exec_body(&self, text: &str, env: &Env) -> Result<Env> {
        let mut delta = Env::new();
        let mut scope = env.clone();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, expr)) = split_top_level(line, "=") else {
                return Err(Error::Eval(format!("unsupported statement '{}'", line)));
            };
            let name = name.trim();
            if !is_identifier(name) {
                return Err(Error::Eval(format!("bad assignment target '{}'", name)));
            }
            let value = self.eval_expr(expr, &scope)?;
            scope.insert(name.to_string(), value.clone());
            delta.insert(name.to_string(), value);
        }
        Ok(delta)
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn strip_quotes(text: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            let inner = &text[1..text.len() - 1];
            if !inner.contains(quote) {
                return Some(inner);
            }
        }
    }
    None
}

/// Split at the first occurrence of `op` outside quotes and brackets.
///
/// `=` does not match `==`/`!=`/`<=`/`>=`, and `<`/`>` do not match the
/// two-character forms.
fn split_top_level<'a>(text: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let bytes = text.as_bytes();
    let op_bytes = op.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i + op_bytes.len() <= bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'[' | b'(' => depth += 1,
            b']' | b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && &bytes[i..i + op_bytes.len()] == op_bytes {
            let before = if i > 0 { bytes[i - 1] } else { 0 };
            let after = bytes.get(i + op_bytes.len()).copied().unwrap_or(0);
            let clashes = match op {
                "=" => matches!(before, b'=' | b'!' | b'<' | b'>') || after == b'=',
                "<" | ">" => after == b'=',
                _ => false,
            };
            if !clashes {
                return Some((&text[..i], &text[i + op_bytes.len()..]));
            }
        }
        i += 1;
    }
    None
}

fn split_commas(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'[' | b'(' => depth += 1,
            b']' | b')' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn is_balanced(text: &str) -> bool {
    let mut depth = 0i32;
    for b in text.bytes() {
        match b {
            b'[' => depth += 1,
            b']' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}

/// Position of the `[` opening a trailing index expression
fn find_index_bracket(text: &str) -> Option<usize> {
    if !text.ends_with(']') {
        return None;
    }
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b']' => depth += 1,
            b'[' => {
                depth -= 1;
                if depth == 0 {
                    return if i > 0 { Some(i) } else { None };
                }
            }
            _ => {}
        }
    }
    None
}

fn compare(op: &str, lhs: &Value, rhs: &Value) -> Result<Value> {
    let result = match op {
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        _ => {
            let (Some(l), Some(r)) = (as_f64(lhs), as_f64(rhs)) else {
                return Err(Error::Eval(format!(
                    "cannot order {} and {}",
                    lhs, rhs
                )));
            };
            match op {
                "<" => l < r,
                ">" => l > r,
                "<=" => l <= r,
                ">=" => l >= r,
                _ => unreachable!("comparison operators are enumerated"),
            }
        }
    };
    Ok(Value::Bool(result))
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_i64().map(|i| i as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, Value)]) -> Env {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_literals_and_variables() {
        let ev = SimpleEvaluator::new();
        let e = env(&[("i", json!(2)), ("name", json!("s1"))]);
        assert_eq!(ev.eval("'a.txt'", &e).unwrap(), json!("a.txt"));
        assert_eq!(ev.eval("42", &e).unwrap(), json!(42));
        assert_eq!(ev.eval("i", &e).unwrap(), json!(2));
        assert_eq!(ev.eval("name", &e).unwrap(), json!("s1"));
        assert!(ev.eval("missing", &e).is_err());
    }

    #[test]
    fn test_indexing() {
        let ev = SimpleEvaluator::new();
        let e = env(&[("_vars", json!([1, 2, 3]))]);
        assert_eq!(ev.eval("_vars[0]", &e).unwrap(), json!(1));
        assert_eq!(ev.eval("_vars[-1]", &e).unwrap(), json!(3));
        assert!(ev.eval("_vars[9]", &e).is_err());
    }

    #[test]
    fn test_comparisons_and_len() {
        let ev = SimpleEvaluator::new();
        let e = env(&[("xs", json!(["a", "b"])), ("i", json!(3))]);
        assert_eq!(ev.eval("len(xs) == 2", &e).unwrap(), json!(true));
        assert_eq!(ev.eval("i > 5", &e).unwrap(), json!(false));
        assert_eq!(ev.eval("'a' != 'b'", &e).unwrap(), json!(true));
    }

    #[test]
    fn test_list_literal() {
        let ev = SimpleEvaluator::new();
        let e = env(&[("i", json!(1))]);
        assert_eq!(ev.eval("['a', i, 2]", &e).unwrap(), json!(["a", 1, 2]));
    }

    #[test]
    fn test_expand_text() {
        let ev = SimpleEvaluator::new();
        let e = env(&[
            ("_input", json!(["a.txt", "b.txt"])),
            ("_vars", json!([1, 2])),
        ]);
        assert_eq!(
            expand_text("cat {_input} > {_input[0]}{_vars[0]}", &e, &ev).unwrap(),
            "cat a.txt b.txt > a.txt1"
        );
        assert_eq!(expand_text("{{literal}}", &e, &ev).unwrap(), "{literal}");
        assert!(expand_text("{unclosed", &e, &ev).is_err());
    }

    #[test]
    fn test_exec_body_returns_delta() {
        let ev = SimpleEvaluator::new();
        let e = env(&[("base", json!(10))]);
        let delta = ev
            .exec_body("# setup\nx = base\ny = x == 10\n", &e)
            .unwrap();
        assert_eq!(delta.get("x"), Some(&json!(10)));
        assert_eq!(delta.get("y"), Some(&json!(true)));
        // the source environment is not mutated
        assert!(!e.contains_key("x"));
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!([1])));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn test_render_value_joins_sequences() {
        assert_eq!(render_value(&json!(["a.txt", "b.txt"])), "a.txt b.txt");
        assert_eq!(render_value(&json!("x")), "x");
        assert_eq!(render_value(&json!(3)), "3");
    }
}
