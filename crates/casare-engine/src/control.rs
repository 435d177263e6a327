//! Control-flow state: frames, loop iteration sources and the condition
//! evaluator
//!
//! The run driver owns a frame stack mirroring the variable store's scope
//! stack. Loop frames track iteration, try frames track failure routing,
//! retry frames track block-level re-execution. The driver interprets
//! control nodes against this state; nodes themselves stay graph-agnostic.

use std::collections::HashMap;

use casare_workflow::{NodeId, Value};

use crate::error::{EngineError, Result};

/// Where a for-loop draws its items from
#[derive(Debug, Clone)]
pub enum LoopSource {
    /// Materialised items (list elements, dict keys, string code points)
    Items { items: Vec<Value>, next: usize },
    /// Half-open integer range `[current, end)` with non-zero step
    Range { current: i64, end: i64, step: i64 },
}

impl LoopSource {
    /// Build a source from the loop's parameters.
    ///
    /// `mode: "range"` iterates `start`/`end`/`step`; otherwise the
    /// `items` value is iterated: lists element-wise, dicts by key,
    /// strings by code point.
    pub fn from_params(node_id: &str, params: &HashMap<String, Value>) -> Result<LoopSource> {
        let mode = params
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("items");
        if mode == "range" {
            let get = |key: &str, default: i64| -> Result<i64> {
                match params.get(key) {
                    None | Some(Value::Null) => Ok(default),
                    Some(v) => v.as_f64().map(|f| f as i64).ok_or_else(|| {
                        EngineError::TypeMismatch {
                            port: key.to_string(),
                            expected: "Integer".into(),
                            actual: format!("{:?}", v.data_type()),
                        }
                    }),
                }
            };
            let start = get("start", 0)?;
            let end = get("end", 0)?;
            let step = get("step", 1)?;
            if step == 0 {
                return Err(EngineError::internal(format!(
                    "loop '{}' configured with zero step",
                    node_id
                )));
            }
            return Ok(LoopSource::Range {
                current: start,
                end,
                step,
            });
        }

        let items = match params.get("items") {
            Some(Value::List(items)) => items.clone(),
            Some(Value::Dict(map)) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                keys.into_iter().map(|k| Value::Str(k.clone())).collect()
            }
            Some(Value::Str(s)) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(EngineError::TypeMismatch {
                    port: "items".into(),
                    expected: "List, Dict or String".into(),
                    actual: format!("{:?}", other.data_type()),
                })
            }
        };
        Ok(LoopSource::Items { items, next: 0 })
    }

    /// The next item, advancing the source
    pub fn next(&mut self) -> Option<Value> {
        match self {
            LoopSource::Items { items, next } => {
                let item = items.get(*next).cloned()?;
                *next += 1;
                Some(item)
            }
            LoopSource::Range { current, end, step } => {
                let in_range = if *step > 0 { current < end } else { current > end };
                if !in_range {
                    return None;
                }
                let item = Value::Int(*current);
                *current += *step;
                Some(item)
            }
        }
    }
}

/// An active loop
#[derive(Debug)]
pub struct LoopFrame {
    pub start_node: NodeId,
    pub end_node: NodeId,
    /// `None` for while loops (condition re-evaluated each entry)
    pub source: Option<LoopSource>,
    pub item_var: String,
    pub index_var: String,
    /// Iterations started so far
    pub index: u64,
    pub max_iterations: u64,
    /// Set by Break; the next loop-start entry exits
    pub breaking: bool,
}

/// Failure-routing state of a try frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryState {
    /// Executing the body; failures route to catch
    Body,
    /// A failure was routed to the catch branch
    Catching,
    /// The finally node has run; the frame is finished
    Finished,
}

/// An active try block
#[derive(Debug)]
pub struct TryFrame {
    pub try_node: NodeId,
    pub catch_node: Option<NodeId>,
    pub finally_node: Option<NodeId>,
    pub state: TryState,
    /// Error awaiting re-raise after finally (no catch consumed it)
    pub pending_error: Option<EngineError>,
}

/// An active retry block
#[derive(Debug)]
pub struct RetryFrame {
    pub retry_node: NodeId,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// One entry of the driver's control stack
#[derive(Debug)]
pub enum Frame {
    Loop(LoopFrame),
    Try(TryFrame),
    Retry(RetryFrame),
}

impl Frame {
    pub fn as_loop(&self) -> Option<&LoopFrame> {
        match self {
            Frame::Loop(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Evaluate a condition string after placeholder resolution.
///
/// Supports a single comparison (`==`, `!=`, `>=`, `<=`, `>`, `<`) between
/// two scalars, numeric when both sides parse as numbers; anything else
/// falls back to truthiness of the whole resolved text.
pub fn eval_condition(resolved: &Value) -> bool {
    let text = match resolved {
        Value::Str(s) => s.trim(),
        other => return other.is_truthy(),
    };

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(idx) = find_operator(text, op) {
            let lhs = text[..idx].trim();
            let rhs = text[idx + op.len()..].trim();
            return compare(lhs, rhs, op);
        }
    }
    Value::Str(text.to_string()).is_truthy()
}

/// First occurrence of `op` that is not part of a longer operator
fn find_operator(text: &str, op: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(op) {
        let idx = from + pos;
        let next = text[idx + op.len()..].chars().next();
        // ">" must not match the head of ">="
        if (op == ">" || op == "<") && next == Some('=') {
            from = idx + op.len() + 1;
            continue;
        }
        return Some(idx);
    }
    None
}

fn compare(lhs: &str, rhs: &str, op: &str) -> bool {
    let unquote = |s: &str| -> String {
        let s = s.trim();
        let stripped = s
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
        stripped.unwrap_or(s).to_string()
    };

    if let (Ok(l), Ok(r)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            ">=" => l >= r,
            "<=" => l <= r,
            ">" => l > r,
            "<" => l < r,
            _ => false,
        };
    }

    let (l, r) = (unquote(lhs), unquote(rhs));
    match op {
        "==" => l == r,
        "!=" => l != r,
        ">=" => l >= r,
        "<=" => l <= r,
        ">" => l > r,
        "<" => l < r,
        _ => false,
    }
}

/// Pick the Switch output port for a value: the matching case name, else
/// `default`
pub fn switch_port(value: &Value, cases: &[String]) -> String {
    let rendered = value.render();
    cases
        .iter()
        .find(|case| **case == rendered)
        .cloned()
        .unwrap_or_else(|| "default".to_string())
}
