//! Variable resolution and the `${...}` expression language.
//!
//! Two evaluation surfaces:
//! - **interpolation**: text containing `${expr}` substrings has each
//!   expression evaluated and stringified in place;
//! - **bare expression**: when the whole input is a single `${...}`, the
//!   typed value is returned.
//!
//! Expressions support dotted/indexed path access, literals, a fixed set of
//! built-in functions, binary comparison/arithmetic operators, `and`/`or`,
//! `in`/`contains`, and unary `not`. Evaluation is pure: the scope is never
//! mutated, and undefined paths resolve to null rather than erroring.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Stateless resolver for workflow templates and conditions.
///
/// All methods take the scope by reference and never modify it.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableResolver;

impl VariableResolver {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `template` against `scope`.
    ///
    /// A bare `${...}` returns the typed value; anything else is string
    /// interpolation where each `${expr}` is replaced with its stringified
    /// result (null renders as the empty string).
    pub fn resolve(&self, template: &str, scope: &HashMap<String, Value>) -> Value {
        evaluate(template, scope)
    }

    /// Evaluate `template` and coerce the result to a string.
    pub fn resolve_string(&self, template: &str, scope: &HashMap<String, Value>) -> String {
        match evaluate(template, scope) {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => value_to_display(&other),
        }
    }

    /// Recursively resolve every string in a JSON map.
    pub fn resolve_map(
        &self,
        data: &serde_json::Map<String, Value>,
        scope: &HashMap<String, Value>,
    ) -> serde_json::Map<String, Value> {
        data.iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v, scope)))
            .collect()
    }

    /// Recursively resolve a JSON value: strings are evaluated, containers
    /// are walked, everything else passes through unchanged.
    pub fn resolve_value(&self, value: &Value, scope: &HashMap<String, Value>) -> Value {
        match value {
            Value::String(s) => evaluate(s, scope),
            Value::Object(map) => Value::Object(self.resolve_map(map, scope)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v, scope)).collect())
            }
            other => other.clone(),
        }
    }

    /// Evaluate a condition expression to a boolean using truthiness rules.
    pub fn evaluate_condition(&self, condition: &str, scope: &HashMap<String, Value>) -> bool {
        is_truthy(&evaluate(condition, scope))
    }
}

/// Evaluate an expression string against a scope.
///
/// See [`VariableResolver::resolve`] for the bare-vs-interpolation contract.
pub fn evaluate(expression: &str, scope: &HashMap<String, Value>) -> Value {
    let trimmed = expression.trim();
    if let Some(inner) = bare_expression(trimmed) {
        return evaluate_inner(inner, scope);
    }

    // String interpolation: replace each ${...} with its stringified value.
    let mut result = String::with_capacity(expression.len());
    let mut rest = expression;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        match find_closing_brace(&rest[start + 2..]) {
            Some(end) => {
                let inner = &rest[start + 2..start + 2 + end];
                let value = evaluate_inner(inner.trim(), scope);
                if !value.is_null() {
                    result.push_str(&value_to_display(&value));
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    Value::String(result)
}

/// JavaScript-like truthiness over JSON values.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Whether the whole input is a single `${...}` expression; returns the inner
/// text if so. A template like `"${a} and ${b}"` does not qualify.
fn bare_expression(input: &str) -> Option<&str> {
    let body = input.strip_prefix("${")?;
    let end = find_closing_brace(body)?;
    if end + 1 != body.len() {
        return None;
    }
    Some(body[..end].trim())
}

/// Index of the `}` closing an expression that began right after `${`,
/// skipping braces inside quoted strings and nested `{}`/`[]`/`()` pairs.
fn find_closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string: Option<u8> = None;
    for (i, c) in body.bytes().enumerate() {
        match in_string {
            Some(quote) => {
                if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                b'"' | b'\'' => in_string = Some(c),
                b'{' | b'[' | b'(' => depth += 1,
                b']' | b')' => depth -= 1,
                b'}' => {
                    if depth == 0 {
                        return Some(i);
                    }
                    depth -= 1;
                }
                _ => {}
            },
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Inner expression evaluation
// ---------------------------------------------------------------------------

/// Binary operators in split precedence order: the first operator found at
/// the top level becomes the root of the expression tree.
const OPERATORS: &[&str] = &[
    "==", "!=", ">=", "<=", ">", "<", "and", "or", "+", "-", "*", "/", "%", "in", "contains",
];

fn evaluate_inner(expr: &str, scope: &HashMap<String, Value>) -> Value {
    let expr = expr.trim();
    if expr.is_empty() {
        return Value::Null;
    }

    // Unary not
    if let Some(rest) = expr.strip_prefix("not ") {
        return Value::Bool(!is_truthy(&evaluate_inner(rest, scope)));
    }

    // Binary operators, respecting strings and bracket nesting
    for op in OPERATORS {
        if let Some(pos) = find_top_level_operator(expr, op) {
            let left = evaluate_inner(&expr[..pos], scope);
            let right = evaluate_inner(&expr[pos + op.len() + 2..], scope);
            return apply_operator(op, &left, &right);
        }
    }

    // Function call
    if let Some((name, args_str)) = parse_function_call(expr) {
        let args = split_args(args_str)
            .into_iter()
            .map(|a| evaluate_inner(&a, scope))
            .collect::<Vec<_>>();
        return call_builtin(name, &args);
    }

    // Literal
    if let Some(literal) = parse_literal(expr) {
        return literal;
    }

    // Variable path
    resolve_path(expr, scope)
}

/// Find ` op ` in `expr` outside quotes, parens, and brackets. Returns the
/// index of the operator token itself minus the leading space, i.e. the
/// position where the left operand ends.
fn find_top_level_operator(expr: &str, op: &str) -> Option<usize> {
    let needle = format!(" {op} ");
    let bytes = expr.as_bytes();
    let mut depth = 0i32;
    let mut in_string: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match in_string {
            Some(quote) => {
                if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                b'"' | b'\'' => in_string = Some(c),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth -= 1,
                b' ' if depth == 0 => {
                    if expr[i..].starts_with(&needle) {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// `name(args...)` with balanced parentheses around the whole argument list.
fn parse_function_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    if !expr.ends_with(')') || open == 0 {
        return None;
    }
    let name = &expr[..open];
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, &expr[open + 1..expr.len() - 1]))
}

/// Split a function argument list on top-level commas, respecting quotes
/// and nesting.
fn split_args(args_str: &str) -> Vec<String> {
    let trimmed = args_str.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;

    for c in trimmed.chars() {
        match in_string {
            Some(quote) => {
                current.push(c);
                if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    in_string = Some(c);
                    current.push(c);
                }
                '(' | '[' | '{' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' | '}' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    args.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn parse_literal(expr: &str) -> Option<Value> {
    let expr = expr.trim();

    // Quoted string
    if expr.len() >= 2 {
        let first = expr.chars().next().unwrap();
        if (first == '"' || first == '\'') && expr.ends_with(first) {
            return Some(Value::String(expr[1..expr.len() - 1].to_string()));
        }
    }

    match expr.to_ascii_lowercase().as_str() {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" | "none" => return Some(Value::Null),
        _ => {}
    }

    if let Ok(i) = expr.parse::<i64>() {
        return Some(json!(i));
    }
    if let Ok(f) = expr.parse::<f64>() {
        return Some(json!(f));
    }

    // JSON array/object literals
    if (expr.starts_with('[') && expr.ends_with(']'))
        || (expr.starts_with('{') && expr.ends_with('}'))
    {
        if let Ok(v) = serde_json::from_str::<Value>(expr) {
            return Some(v);
        }
    }

    None
}

/// Resolve a dotted/indexed path (`data.items[0].name`) against the scope.
/// Undefined segments yield null.
fn resolve_path(path: &str, scope: &HashMap<String, Value>) -> Value {
    enum Segment {
        Key(String),
        Index(String),
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;

    for c in path.chars() {
        match c {
            '.' if !in_bracket => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                in_bracket = true;
            }
            ']' => {
                if !current.is_empty() {
                    segments.push(Segment::Index(std::mem::take(&mut current)));
                }
                in_bracket = false;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }

    let mut segments = segments.into_iter();
    let mut value = match segments.next() {
        Some(Segment::Key(key)) => match scope.get(&key) {
            Some(v) => v.clone(),
            None => return Value::Null,
        },
        _ => return Value::Null,
    };

    for segment in segments {
        value = match segment {
            Segment::Key(key) => match value.get(&key) {
                Some(v) => v.clone(),
                None => return Value::Null,
            },
            Segment::Index(raw) => {
                let idx: usize = match raw.trim().parse() {
                    Ok(i) => i,
                    Err(_) => return Value::Null,
                };
                match value.get(idx) {
                    Some(v) => v.clone(),
                    None => return Value::Null,
                }
            }
        };
    }

    value
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn apply_operator(op: &str, left: &Value, right: &Value) -> Value {
    match op {
        "==" => Value::Bool(values_equal(left, right)),
        "!=" => Value::Bool(!values_equal(left, right)),
        ">" | ">=" | "<" | "<=" => compare(op, left, right),
        "and" => Value::Bool(is_truthy(left) && is_truthy(right)),
        "or" => Value::Bool(is_truthy(left) || is_truthy(right)),
        "+" => add(left, right),
        "-" => arithmetic(left, right, |a, b| a - b),
        "*" => arithmetic(left, right, |a, b| a * b),
        "/" => match as_number(right) {
            Some(r) if r != 0.0 => arithmetic(left, right, |a, b| a / b),
            _ => Value::Null,
        },
        "%" => match as_number(right) {
            Some(r) if r != 0.0 => arithmetic(left, right, |a, b| a % b),
            _ => Value::Null,
        },
        "in" => Value::Bool(membership(left, right)),
        "contains" => Value::Bool(membership(right, left)),
        _ => Value::Null,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    left == right
}

fn compare(op: &str, left: &Value, right: &Value) -> Value {
    let ordering = match (left, right) {
        (Value::String(l), Value::String(r)) => l.partial_cmp(r),
        _ => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
    };
    match ordering {
        Some(ord) => Value::Bool(match op {
            ">" => ord.is_gt(),
            ">=" => ord.is_ge(),
            "<" => ord.is_lt(),
            "<=" => ord.is_le(),
            _ => false,
        }),
        None => Value::Bool(false),
    }
}

fn add(left: &Value, right: &Value) -> Value {
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return Value::String(format!("{l}{r}"));
    }
    arithmetic(left, right, |a, b| a + b)
}

fn arithmetic(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Value {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => number(f(l, r)),
        _ => Value::Null,
    }
}

fn membership(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|i| values_equal(i, needle)),
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            _ => false,
        },
        Value::Object(map) => match needle {
            Value::String(n) => map.contains_key(n),
            _ => false,
        },
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Render an f64 back to a JSON number, preferring integers when exact.
fn number(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        json!(f as i64)
    } else {
        json!(f)
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Built-in functions
// ---------------------------------------------------------------------------

fn call_builtin(name: &str, args: &[Value]) -> Value {
    let first = args.first().cloned().unwrap_or(Value::Null);

    match name {
        // String helpers
        "upper" => Value::String(value_to_display(&first).to_uppercase()),
        "lower" => Value::String(value_to_display(&first).to_lowercase()),
        "trim" => Value::String(value_to_display(&first).trim().to_string()),
        "len" => json!(length_of(&first)),
        "substr" => {
            let s = value_to_display(&first);
            let start = args.get(1).and_then(as_number).unwrap_or(0.0) as usize;
            let end = args
                .get(2)
                .and_then(as_number)
                .map(|e| e as usize)
                .unwrap_or(s.chars().count());
            Value::String(s.chars().skip(start).take(end.saturating_sub(start)).collect())
        }
        "replace" => {
            let s = value_to_display(&first);
            let old = args.get(1).map(value_to_display).unwrap_or_default();
            let new = args.get(2).map(value_to_display).unwrap_or_default();
            Value::String(s.replace(&old, &new))
        }
        "split" => {
            let s = value_to_display(&first);
            let sep = args.get(1).map(value_to_display).unwrap_or_else(|| " ".to_string());
            json!(s.split(sep.as_str()).collect::<Vec<_>>())
        }
        "join" => {
            let sep = args.get(1).map(value_to_display).unwrap_or_else(|| ", ".to_string());
            match &first {
                Value::Array(items) => Value::String(
                    items.iter().map(value_to_display).collect::<Vec<_>>().join(&sep),
                ),
                _ => Value::Null,
            }
        }

        // Numeric helpers
        "int" => match &first {
            Value::String(s) => s.trim().parse::<f64>().map(|f| json!(f as i64)).unwrap_or(Value::Null),
            v => as_number(v).map(|f| json!(f as i64)).unwrap_or(Value::Null),
        },
        "float" => match &first {
            Value::String(s) => s.trim().parse::<f64>().map(|f| json!(f)).unwrap_or(Value::Null),
            v => as_number(v).map(|f| json!(f)).unwrap_or(Value::Null),
        },
        "abs" => as_number(&first).map(|f| number(f.abs())).unwrap_or(Value::Null),
        "round" => {
            let digits = args.get(1).and_then(as_number).unwrap_or(0.0) as i32;
            as_number(&first)
                .map(|f| {
                    let factor = 10f64.powi(digits);
                    number((f * factor).round() / factor)
                })
                .unwrap_or(Value::Null)
        }
        "min" => fold_numbers(args, f64::min),
        "max" => fold_numbers(args, f64::max),
        "sum" => match &first {
            Value::Array(items) => {
                number(items.iter().filter_map(as_number).sum::<f64>())
            }
            _ => Value::Null,
        },

        // Date/time helpers
        "now" => Value::String(Utc::now().to_rfc3339()),
        "today" => Value::String(Utc::now().format("%Y-%m-%d").to_string()),
        "timestamp" => json!(Utc::now().timestamp()),
        "format_date" => {
            let fmt = args
                .get(1)
                .map(value_to_display)
                .unwrap_or_else(|| "%Y-%m-%d".to_string());
            match &first {
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| Value::String(dt.format(&fmt).to_string()))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            }
        }

        // JSON helpers
        "json_parse" => match &first {
            Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "json_dump" => Value::String(first.to_string()),

        // Collection helpers
        "first" => match &first {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "last" => match &first {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "unique" => match &first {
            Value::Array(items) => {
                let mut seen = Vec::new();
                for item in items {
                    if !seen.contains(item) {
                        seen.push(item.clone());
                    }
                }
                Value::Array(seen)
            }
            _ => Value::Null,
        },
        "sort" => match &first {
            Value::Array(items) => {
                let mut sorted = items.clone();
                sorted.sort_by(|a, b| match (as_number(a), as_number(b)) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                    _ => value_to_display(a).cmp(&value_to_display(b)),
                });
                Value::Array(sorted)
            }
            _ => Value::Null,
        },
        "reverse" => match &first {
            Value::Array(items) => Value::Array(items.iter().rev().cloned().collect()),
            _ => Value::Null,
        },
        "filter_empty" => match &first {
            Value::Array(items) => {
                Value::Array(items.iter().filter(|i| is_truthy(i)).cloned().collect())
            }
            _ => Value::Null,
        },
        "keys" => match &first {
            Value::Object(map) => json!(map.keys().collect::<Vec<_>>()),
            _ => Value::Null,
        },
        "values" => match &first {
            Value::Object(map) => Value::Array(map.values().cloned().collect()),
            _ => Value::Null,
        },

        // Type helpers
        "type" => Value::String(
            match &first {
                Value::Null => "null",
                Value::Bool(_) => "bool",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Object(_) => "object",
            }
            .to_string(),
        ),
        "str" => Value::String(value_to_display(&first)),
        "bool" => Value::Bool(is_truthy(&first)),
        "default" => {
            if first.is_null() {
                args.get(1).cloned().unwrap_or(Value::Null)
            } else {
                first
            }
        }
        "coalesce" => args.iter().find(|a| !a.is_null()).cloned().unwrap_or(Value::Null),

        _ => Value::Null,
    }
}

fn length_of(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => 0,
    }
}

fn fold_numbers(args: &[Value], f: impl Fn(f64, f64) -> f64) -> Value {
    let mut numbers = args.iter().filter_map(as_number);
    match numbers.next() {
        Some(start) => number(numbers.fold(start, f)),
        None => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> HashMap<String, Value> {
        let mut scope = HashMap::new();
        scope.insert("name".to_string(), json!("Alice"));
        scope.insert("count".to_string(), json!(5));
        scope.insert("ratio".to_string(), json!(0.5));
        scope.insert("active".to_string(), json!(true));
        scope.insert(
            "data".to_string(),
            json!({"items": [{"name": "first"}, {"name": "second"}], "total": 2}),
        );
        scope.insert("tags".to_string(), json!(["rust", "workflow"]));
        scope
    }

    // -------------------------------------------------------------------
    // Interpolation vs bare expressions
    // -------------------------------------------------------------------

    #[test]
    fn interpolation_stringifies_in_place() {
        let result = evaluate("Hello ${name}, you have ${count} items", &scope());
        assert_eq!(result, json!("Hello Alice, you have 5 items"));
    }

    #[test]
    fn bare_expression_returns_typed_value() {
        assert_eq!(evaluate("${count}", &scope()), json!(5));
        assert_eq!(evaluate("${active}", &scope()), json!(true));
        assert_eq!(evaluate("${data.total}", &scope()), json!(2));
    }

    #[test]
    fn two_expressions_are_not_bare() {
        let result = evaluate("${count}${count}", &scope());
        assert_eq!(result, json!("55"));
    }

    #[test]
    fn undefined_path_is_null_not_error() {
        assert_eq!(evaluate("${missing.deeply.nested}", &scope()), Value::Null);
        // In interpolation, null renders as empty string
        assert_eq!(evaluate("x=${missing}", &scope()), json!("x="));
    }

    #[test]
    fn evaluation_does_not_mutate_scope() {
        let scope = scope();
        let before = scope.clone();
        let _ = evaluate("${upper(name)} ${count + 1}", &scope);
        assert_eq!(scope, before);
    }

    // -------------------------------------------------------------------
    // Path access
    // -------------------------------------------------------------------

    #[test]
    fn dotted_and_indexed_paths() {
        assert_eq!(evaluate("${data.items[0].name}", &scope()), json!("first"));
        assert_eq!(evaluate("${data.items[1].name}", &scope()), json!("second"));
        assert_eq!(evaluate("${tags[0]}", &scope()), json!("rust"));
    }

    #[test]
    fn out_of_range_index_is_null() {
        assert_eq!(evaluate("${tags[9]}", &scope()), Value::Null);
    }

    // -------------------------------------------------------------------
    // Literals
    // -------------------------------------------------------------------

    #[test]
    fn literals_parse() {
        let s = scope();
        assert_eq!(evaluate("${'hello'}", &s), json!("hello"));
        assert_eq!(evaluate("${42}", &s), json!(42));
        assert_eq!(evaluate("${3.25}", &s), json!(3.25));
        assert_eq!(evaluate("${true}", &s), json!(true));
        assert_eq!(evaluate("${null}", &s), Value::Null);
        assert_eq!(evaluate("${[1, 2, 3]}", &s), json!([1, 2, 3]));
    }

    // -------------------------------------------------------------------
    // Operators
    // -------------------------------------------------------------------

    #[test]
    fn comparison_operators() {
        let s = scope();
        assert_eq!(evaluate("${count == 5}", &s), json!(true));
        assert_eq!(evaluate("${count != 5}", &s), json!(false));
        assert_eq!(evaluate("${count > 3}", &s), json!(true));
        assert_eq!(evaluate("${count >= 5}", &s), json!(true));
        assert_eq!(evaluate("${count < 3}", &s), json!(false));
        assert_eq!(evaluate("${name == 'Alice'}", &s), json!(true));
    }

    #[test]
    fn arithmetic_operators() {
        let s = scope();
        assert_eq!(evaluate("${count + 3}", &s), json!(8));
        assert_eq!(evaluate("${count - 2}", &s), json!(3));
        assert_eq!(evaluate("${count * 2}", &s), json!(10));
        assert_eq!(evaluate("${count / 2}", &s), json!(2.5));
        assert_eq!(evaluate("${count % 2}", &s), json!(1));
    }

    #[test]
    fn division_by_zero_is_null() {
        assert_eq!(evaluate("${count / 0}", &scope()), Value::Null);
    }

    #[test]
    fn logical_operators() {
        let s = scope();
        assert_eq!(evaluate("${count > 3 and active}", &s), json!(true));
        assert_eq!(evaluate("${count > 9 or active}", &s), json!(true));
        assert_eq!(evaluate("${not active}", &s), json!(false));
    }

    #[test]
    fn membership_operators() {
        let s = scope();
        assert_eq!(evaluate("${'rust' in tags}", &s), json!(true));
        assert_eq!(evaluate("${'go' in tags}", &s), json!(false));
        assert_eq!(evaluate("${name contains 'lic'}", &s), json!(true));
        assert_eq!(evaluate("${'ice' in name}", &s), json!(true));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(evaluate("${name + '!'}", &scope()), json!("Alice!"));
    }

    #[test]
    fn operator_inside_string_literal_is_not_split() {
        assert_eq!(evaluate("${'a + b'}", &scope()), json!("a + b"));
    }

    // -------------------------------------------------------------------
    // Built-in functions
    // -------------------------------------------------------------------

    #[test]
    fn string_functions() {
        let s = scope();
        assert_eq!(evaluate("${upper(name)}", &s), json!("ALICE"));
        assert_eq!(evaluate("${lower(name)}", &s), json!("alice"));
        assert_eq!(evaluate("${trim('  hi  ')}", &s), json!("hi"));
        assert_eq!(evaluate("${len(name)}", &s), json!(5));
        assert_eq!(evaluate("${substr(name, 0, 2)}", &s), json!("Al"));
        assert_eq!(evaluate("${replace(name, 'A', 'E')}", &s), json!("Elice"));
        assert_eq!(evaluate("${split('a,b,c', ',')}", &s), json!(["a", "b", "c"]));
        assert_eq!(evaluate("${join(tags, '-')}", &s), json!("rust-workflow"));
    }

    #[test]
    fn numeric_functions() {
        let s = scope();
        assert_eq!(evaluate("${int('7')}", &s), json!(7));
        assert_eq!(evaluate("${float('2.5')}", &s), json!(2.5));
        assert_eq!(evaluate("${abs(0 - 4)}", &s), json!(4));
        assert_eq!(evaluate("${round(3.567, 1)}", &s), json!(3.6));
        assert_eq!(evaluate("${min(4, 2, 9)}", &s), json!(2));
        assert_eq!(evaluate("${max(4, 2, 9)}", &s), json!(9));
        assert_eq!(evaluate("${sum([1, 2, 3])}", &s), json!(6));
    }

    #[test]
    fn collection_functions() {
        let s = scope();
        assert_eq!(evaluate("${first(tags)}", &s), json!("rust"));
        assert_eq!(evaluate("${last(tags)}", &s), json!("workflow"));
        assert_eq!(evaluate("${unique([1, 2, 2, 3])}", &s), json!([1, 2, 3]));
        assert_eq!(evaluate("${sort([3, 1, 2])}", &s), json!([1, 2, 3]));
        assert_eq!(evaluate("${reverse([1, 2, 3])}", &s), json!([3, 2, 1]));
        assert_eq!(
            evaluate("${filter_empty(['a', '', 'b'])}", &s),
            json!(["a", "b"])
        );
    }

    #[test]
    fn type_functions() {
        let s = scope();
        assert_eq!(evaluate("${type(count)}", &s), json!("number"));
        assert_eq!(evaluate("${type(name)}", &s), json!("string"));
        assert_eq!(evaluate("${str(count)}", &s), json!("5"));
        assert_eq!(evaluate("${bool(0)}", &s), json!(false));
        assert_eq!(evaluate("${default(missing, 'fallback')}", &s), json!("fallback"));
        assert_eq!(evaluate("${coalesce(missing, null, name)}", &s), json!("Alice"));
    }

    #[test]
    fn json_functions() {
        let s = scope();
        assert_eq!(
            evaluate("${json_parse('{\"a\": 1}')}", &s),
            json!({"a": 1})
        );
        assert_eq!(evaluate("${json_dump([1, 2])}", &s), json!("[1,2]"));
    }

    #[test]
    fn date_functions_have_expected_shape() {
        let s = scope();
        let now = evaluate("${now()}", &s);
        assert!(now.as_str().unwrap().contains('T'));
        let today = evaluate("${today()}", &s);
        assert_eq!(today.as_str().unwrap().len(), 10);
        assert!(evaluate("${timestamp()}", &s).is_number());
    }

    #[test]
    fn unknown_function_is_null() {
        assert_eq!(evaluate("${frobnicate(1)}", &scope()), Value::Null);
    }

    // -------------------------------------------------------------------
    // Resolver facade
    // -------------------------------------------------------------------

    #[test]
    fn resolver_resolve_string_coerces() {
        let resolver = VariableResolver::new();
        assert_eq!(resolver.resolve_string("${count}", &scope()), "5");
        assert_eq!(resolver.resolve_string("${missing}", &scope()), "");
    }

    #[test]
    fn resolver_resolve_map_walks_containers() {
        let resolver = VariableResolver::new();
        let mut map = serde_json::Map::new();
        map.insert("greeting".to_string(), json!("Hi ${name}"));
        map.insert("nested".to_string(), json!({"n": "${count}"}));
        map.insert("listed".to_string(), json!(["${count}", 7]));

        let resolved = resolver.resolve_map(&map, &scope());
        assert_eq!(resolved["greeting"], json!("Hi Alice"));
        assert_eq!(resolved["nested"]["n"], json!(5));
        assert_eq!(resolved["listed"], json!([5, 7]));
    }

    #[test]
    fn evaluate_condition_uses_truthiness() {
        let resolver = VariableResolver::new();
        assert!(resolver.evaluate_condition("${count > 3}", &scope()));
        assert!(!resolver.evaluate_condition("${missing}", &scope()));
        assert!(resolver.evaluate_condition("${name}", &scope()));
    }
}
