//! Parameter substitution: `${task.path}` tokens resolved from prior
//! results.
//!
//! A substitution token is the exact form `${<ref>}` inside a string
//! value. `<ref>` has the grammar `task_id(.field | [n] | [key])*`; the
//! task id runs up to the first `.` or `[` (opaque ids may contain
//! dashes), fields are `[A-Za-z_][A-Za-z0-9_]*` identifiers, `[n]` indexes
//! arrays, and `[key]` indexes objects. Tokens are scanned left-to-right;
//! nesting is not supported.
//!
//! When an entire string value is exactly one token, the referenced value
//! replaces the string with its native type. Otherwise the value is
//! converted to its canonical string form (JSON serialization, without
//! surrounding quotes for strings) and spliced in; splicing a non-scalar
//! into a longer string is an error.
//!
//! Resolution is a pure function of `(params, prior_results)`: identical
//! inputs produce identical output bytes.

use gleitzeit_core::{CoreError, CoreResult, TaskId, TaskResult, TaskStatus};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// One parsed path step inside a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    /// `.field` or `[key]` object access.
    Key(String),
    /// `[n]` array access.
    Index(usize),
}

/// A parsed `task_id(.field)*` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    task_id: TaskId,
    path: Vec<PathStep>,
}

/// A segment of a tokenized string value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(Reference),
}

fn substitution_error(task_id: &str, reason: impl Into<String>) -> CoreError {
    CoreError::ParameterSubstitution {
        task_id: task_id.to_string(),
        reason: reason.into(),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses `task_id(.field | [n] | [key])*`.
fn parse_reference(task_id: &str, raw: &str) -> CoreResult<Reference> {
    let head_end = raw.find(['.', '[']).unwrap_or(raw.len());
    if head_end == 0 {
        return Err(substitution_error(
            task_id,
            format!("empty task reference in token ${{{}}}", raw),
        ));
    }

    let referenced = raw[..head_end].to_string();
    let mut path = Vec::new();
    let mut rest = &raw[head_end..];

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after_dot.len());
            let field = &after_dot[..end];
            if !is_identifier(field) {
                return Err(substitution_error(
                    task_id,
                    format!("invalid field {:?} in token ${{{}}}", field, raw),
                ));
            }
            path.push(PathStep::Key(field.to_string()));
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket.find(']').ok_or_else(|| {
                substitution_error(task_id, format!("unclosed '[' in token ${{{}}}", raw))
            })?;
            let inner = &after_bracket[..close];
            if inner.is_empty() {
                return Err(substitution_error(
                    task_id,
                    format!("empty index in token ${{{}}}", raw),
                ));
            }
            if inner.chars().all(|c| c.is_ascii_digit()) {
                path.push(PathStep::Index(inner.parse().map_err(|_| {
                    substitution_error(task_id, format!("bad index in token ${{{}}}", raw))
                })?));
            } else {
                path.push(PathStep::Key(inner.to_string()));
            }
            rest = &after_bracket[close + 1..];
        } else {
            let next = rest.chars().next().unwrap_or_default();
            return Err(substitution_error(
                task_id,
                format!("unexpected {:?} in token ${{{}}}", next, raw),
            ));
        }
    }

    Ok(Reference {
        task_id: referenced,
        path,
    })
}

/// Splits a string into literal and token segments, left-to-right.
fn tokenize(task_id: &str, input: &str) -> CoreResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let close = rest[start + 2..].find('}').ok_or_else(|| {
            substitution_error(task_id, format!("unterminated token in {:?}", input))
        })?;

        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let raw = &rest[start + 2..start + 2 + close];
        segments.push(Segment::Token(parse_reference(task_id, raw)?));
        rest = &rest[start + 2 + close + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

/// Looks up a reference in the prior results.
fn lookup<'a>(
    task_id: &str,
    reference: &Reference,
    known_tasks: &HashSet<TaskId>,
    results: &'a HashMap<TaskId, TaskResult>,
) -> CoreResult<&'a Value> {
    if !known_tasks.contains(&reference.task_id) {
        return Err(substitution_error(
            task_id,
            format!("referenced task {} is not in the workflow", reference.task_id),
        ));
    }

    let result = results
        .get(&reference.task_id)
        .filter(|r| r.status == TaskStatus::Completed)
        .ok_or_else(|| {
            substitution_error(
                task_id,
                format!("referenced task {} has not completed", reference.task_id),
            )
        })?;

    let mut value = &result.result;
    for step in &reference.path {
        value = match step {
            PathStep::Key(key) => value.get(key.as_str()),
            PathStep::Index(index) => value.get(index),
        }
        .ok_or_else(|| {
            substitution_error(
                task_id,
                format!(
                    "path does not exist in result of task {}: ${{{}{}}}",
                    reference.task_id,
                    reference.task_id,
                    format_path(&reference.path)
                ),
            )
        })?;
    }
    Ok(value)
}

fn format_path(path: &[PathStep]) -> String {
    path.iter()
        .map(|step| match step {
            PathStep::Key(key) => format!(".{}", key),
            PathStep::Index(index) => format!("[{}]", index),
        })
        .collect()
}

/// Canonical string form of a scalar for mixed-string splicing.
fn splice_scalar(task_id: &str, value: &Value) -> CoreResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) | Value::Null => Ok(value.to_string()),
        Value::Array(_) | Value::Object(_) => Err(substitution_error(
            task_id,
            "cannot splice a non-scalar value into a string".to_string(),
        )),
    }
}

fn resolve_string(
    task_id: &str,
    input: &str,
    known_tasks: &HashSet<TaskId>,
    results: &HashMap<TaskId, TaskResult>,
) -> CoreResult<Value> {
    let segments = tokenize(task_id, input)?;

    // Whole-string token: the referenced value replaces the string,
    // preserving its native type.
    if let [Segment::Token(reference)] = segments.as_slice() {
        return Ok(lookup(task_id, reference, known_tasks, results)?.clone());
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Literal(literal) => out.push_str(literal),
            Segment::Token(reference) => {
                let value = lookup(task_id, reference, known_tasks, results)?;
                out.push_str(&splice_scalar(task_id, value)?);
            }
        }
    }
    Ok(Value::String(out))
}

fn resolve_value(
    task_id: &str,
    value: &Value,
    known_tasks: &HashSet<TaskId>,
    results: &HashMap<TaskId, TaskResult>,
) -> CoreResult<Value> {
    match value {
        Value::String(s) => resolve_string(task_id, s, known_tasks, results),
        Value::Array(items) => {
            let resolved: CoreResult<Vec<Value>> = items
                .iter()
                .map(|item| resolve_value(task_id, item, known_tasks, results))
                .collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(
                    key.clone(),
                    resolve_value(task_id, item, known_tasks, results)?,
                );
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves every `${task.path}` token in a task's parameters.
pub fn resolve_params(
    task_id: &str,
    params: &Map<String, Value>,
    known_tasks: &HashSet<TaskId>,
    results: &HashMap<TaskId, TaskResult>,
) -> CoreResult<Map<String, Value>> {
    let mut resolved = Map::new();
    for (key, value) in params {
        resolved.insert(
            key.clone(),
            resolve_value(task_id, value, known_tasks, results)?,
        );
    }
    Ok(resolved)
}
