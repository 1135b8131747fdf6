//! Server-side evaluation of filter expressions.
//!
//! Expressions are JSON objects keyed by `op`:
//! `eq {bin, value}`, `exists {bin}`, `and {args}`, `or {args}`, `not {arg}`.

use serde_json::Value;

use ckv_common::Bins;

/// Evaluates `expr` against the record bins.
///
/// Returns `Err` with a message when the expression is malformed.
pub fn evaluate(expr: &Value, bins: &Bins) -> Result<bool, String> {
    let op = expr
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| "filter expression requires an op".to_string())?;

    match op {
        "eq" => {
            let bin = bin_name(expr)?;
            let value = expr
                .get("value")
                .ok_or_else(|| "eq requires a value".to_string())?;
            Ok(bins.get(bin) == Some(value))
        }
        "exists" => Ok(bins.contains_key(bin_name(expr)?)),
        "and" => {
            for arg in args(expr)? {
                if !evaluate(arg, bins)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "or" => {
            for arg in args(expr)? {
                if evaluate(arg, bins)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "not" => {
            let arg = expr
                .get("arg")
                .ok_or_else(|| "not requires an arg".to_string())?;
            Ok(!evaluate(arg, bins)?)
        }
        other => Err(format!("unknown filter op {}", other)),
    }
}

fn bin_name(expr: &Value) -> Result<&str, String> {
    expr.get("bin")
        .and_then(Value::as_str)
        .ok_or_else(|| "filter expression requires a bin".to_string())
}

fn args(expr: &Value) -> Result<&Vec<Value>, String> {
    expr.get("args")
        .and_then(Value::as_array)
        .ok_or_else(|| "filter expression requires args".to_string())
}
