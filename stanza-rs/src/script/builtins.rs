//! Built-in functions and value methods.
//!
//! Each function receives already-evaluated arguments and returns
//! `Result<Value, Error>`.  [`call_builtin`] is the last resort of a global
//! call; [`call_method`] handles `value.name(args)` and falls back to the
//! builtin of the same name with the receiver as first argument, so
//! `'abc'.upper()` and `upper('abc')` are the same call.

use std::cmp::Ordering;

use super::value::Value;
use crate::error::Error;
use crate::pattern::{MatchMode, Pattern};

/// Longest string `repeat` will build, in bytes.
pub const MAX_REPEAT_LEN: usize = 16 * 1024 * 1024;

/// Dispatch a built-in function call.
///
/// Returns `None` if the function name is not a built-in.
pub fn call_builtin(name: &str, args: &[Value]) -> Option<Result<Value, Error>> {
    // Ok(None) → not a builtin; `.transpose()` turns it into Option<Result>.
    fn inner(name: &str, args: &[Value]) -> Result<Option<Value>, Error> {
        Ok(Some(match name {
            "raise" => {
                let msg = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
                return Err(Error::Raised(msg));
            }

            // ── Introspection / conversion ───────────────────────────────────
            "typeof" => Value::Str(arg(args, 0, name)?.type_name().to_owned()),
            "str" | "toString" => Value::Str(args.first().map(Value::to_string).unwrap_or_default()),
            "int" => Value::Int(arg(args, 0, name)?.as_int()),
            "float" => Value::Float(arg(args, 0, name)?.as_float()),
            "bool" => Value::Bool(arg(args, 0, name)?.as_bool()),
            "size" | "length" => match arg(args, 0, name)? {
                Value::List(l) => Value::from(l.read().len()),
                Value::Map(m) => Value::from(m.len()),
                Value::Null => Value::Int(0),
                v => Value::from(v.to_string().chars().count()),
            },
            "empty" | "isEmpty" => Value::Bool(match args.first() {
                None | Some(Value::Null) => true,
                Some(Value::Str(s)) => s.is_empty(),
                Some(Value::List(l)) => l.read().is_empty(),
                Some(Value::Map(m)) => m.is_empty(),
                Some(_) => false,
            }),

            // ── Strings ──────────────────────────────────────────────────────
            "upper" | "toupper" => Value::Str(get_str(args, 0, name)?.to_uppercase()),
            "lower" | "tolower" => Value::Str(get_str(args, 0, name)?.to_lowercase()),
            "trim" => Value::Str(get_str(args, 0, name)?.trim().to_owned()),
            "substr" => {
                let s = get_str(args, 0, name)?;
                let chars: Vec<char> = s.chars().collect();
                let start = (get_int(args, 1, name)?.max(0) as usize).min(chars.len());
                let end = match args.get(2) {
                    Some(n) => start.saturating_add(n.as_int().max(0) as usize).min(chars.len()),
                    None => chars.len(),
                };
                Value::Str(chars[start..end].iter().collect())
            }
            "startsWith" => Value::Bool(get_str(args, 0, name)?.starts_with(&get_str(args, 1, name)?)),
            "endsWith" => Value::Bool(get_str(args, 0, name)?.ends_with(&get_str(args, 1, name)?)),
            "replace" => {
                let s = get_str(args, 0, name)?;
                Value::Str(s.replace(&get_str(args, 1, name)?, &get_str(args, 2, name)?))
            }
            "repeat" => {
                let s = get_str(args, 0, name)?;
                let n = usize::try_from(get_int(args, 1, name)?.max(0)).unwrap_or(usize::MAX);
                match s.len().checked_mul(n) {
                    Some(len) if len <= MAX_REPEAT_LEN => Value::Str(s.repeat(n)),
                    _ => {
                        return Err(Error::type_error(format!(
                            "repeat: result longer than {MAX_REPEAT_LEN} bytes"
                        )))
                    }
                }
            }
            "split" => {
                let s = get_str(args, 0, name)?;
                let sep = args.get(1).map(Value::to_string).unwrap_or_default();
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::Str(c.to_string())).collect()
                } else {
                    s.split(sep.as_str()).map(Value::from).collect()
                };
                Value::list(parts)
            }
            "matches" => {
                let text = get_str(args, 0, name)?;
                let re = Pattern::cached(&get_str(args, 1, name)?, MatchMode::Regex)
                    .map_err(|e| Error::type_error(e.to_string()))?;
                match re.captures(&text) {
                    Some(groups) => Value::list(groups.into_iter().map(Value::Str).collect()),
                    None => Value::Null,
                }
            }

            // ── Collections ──────────────────────────────────────────────────
            "list" => Value::list(args.to_vec()),
            "range" => {
                // range(end) or range(start, end[, step]); end exclusive
                let (start, end) = match args.len() {
                    0 => return Err(too_few(name)),
                    1 => (0, get_int(args, 0, name)?),
                    _ => (get_int(args, 0, name)?, get_int(args, 1, name)?),
                };
                let step = args.get(2).map(Value::as_int).unwrap_or(1);
                if step == 0 {
                    return Err(Error::type_error("range: step must not be zero"));
                }
                let mut out = Vec::new();
                let mut i = start;
                while (step > 0 && i < end) || (step < 0 && i > end) {
                    out.push(Value::Int(i));
                    i += step;
                }
                Value::list(out)
            }
            "keys" => match arg(args, 0, name)? {
                Value::Map(m) => Value::list(m.keys().into_iter().map(Value::Str).collect()),
                v => return Err(wrong_type(name, v)),
            },
            "values" => match arg(args, 0, name)? {
                Value::Map(m) => Value::list(m.entries().into_iter().map(|(_, v)| v).collect()),
                v => return Err(wrong_type(name, v)),
            },
            "contains" => {
                let needle = arg(args, 1, name)?;
                Value::Bool(match arg(args, 0, name)? {
                    Value::List(l) => l.read().iter().any(|v| v.loose_eq(needle)),
                    Value::Map(m) => m.contains(&needle.to_string()),
                    Value::Null => false,
                    v => v.to_string().contains(&needle.to_string()),
                })
            }
            "indexOf" => {
                let needle = arg(args, 1, name)?;
                let pos = match arg(args, 0, name)? {
                    Value::List(l) => l.read().iter().position(|v| v.loose_eq(needle)),
                    v => {
                        let s = v.to_string();
                        s.find(&needle.to_string()).map(|b| s[..b].chars().count())
                    }
                };
                pos.map(Value::from).unwrap_or(Value::Int(-1))
            }
            "join" => {
                let sep = args.get(1).map(Value::to_string).unwrap_or_default();
                match arg(args, 0, name)? {
                    Value::List(l) => Value::Str(
                        l.read().iter().map(Value::to_string).collect::<Vec<_>>().join(&sep),
                    ),
                    v => Value::Str(v.to_string()),
                }
            }
            "first" => list_items(args, name)?.first().cloned().unwrap_or_default(),
            "last" => list_items(args, name)?.last().cloned().unwrap_or_default(),
            "reverse" => match arg(args, 0, name)? {
                Value::Str(s) => Value::Str(s.chars().rev().collect()),
                _ => Value::list(list_items(args, name)?.into_iter().rev().collect()),
            },
            "sort" => {
                let mut items = list_items(args, name)?;
                items.sort_by(Value::cmp_value);
                Value::list(items)
            }
            "slice" => {
                let items = list_items(args, name)?;
                let len = items.len() as i64;
                let clamp = |i: i64| (if i < 0 { i + len } else { i }).clamp(0, len) as usize;
                let start = clamp(get_int(args, 1, name)?);
                let end = args.get(2).map(|v| clamp(v.as_int())).unwrap_or(items.len());
                Value::list(items.get(start..end.max(start)).map(<[Value]>::to_vec).unwrap_or_default())
            }

            // ── Math ─────────────────────────────────────────────────────────
            "abs" => match arg(args, 0, name)? {
                Value::Float(x) => Value::Float(x.abs()),
                v => Value::Int(v.as_int().wrapping_abs()),
            },
            "min" | "max" => {
                let items = if let [Value::List(l)] = args { l.read().clone() } else { args.to_vec() };
                let want = if name == "min" { Ordering::Less } else { Ordering::Greater };
                items
                    .into_iter()
                    .reduce(|best, v| if v.cmp_value(&best) == want { v } else { best })
                    .unwrap_or_default()
            }
            "pow" => Value::Float(get_float(args, 0, name)?.powf(get_float(args, 1, name)?)),
            "sqrt" => Value::Float(get_float(args, 0, name)?.sqrt()),
            "round" => Value::Int(get_float(args, 0, name)?.round() as i64),
            "floor" => Value::Int(get_float(args, 0, name)?.floor() as i64),
            "ceil" => Value::Int(get_float(args, 0, name)?.ceil() as i64),

            // ── Time ─────────────────────────────────────────────────────────
            "time" => {
                let secs = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Value::from(secs as usize)
            }

            _ => return Ok(None),
        }))
    }

    inner(name, args).transpose()
}

/// Dispatch `base.name(args)` for built-in value types.
///
/// Returns `None` when neither a method nor a same-named builtin exists.
pub fn call_method(base: &Value, name: &str, args: &[Value]) -> Option<Result<Value, Error>> {
    match (base, name) {
        (Value::List(l), "add" | "push") => {
            l.write().extend(args.iter().cloned());
            return Some(Ok(base.clone()));
        }
        (Value::List(l), "pop") => return Some(Ok(l.write().pop().unwrap_or_default())),
        (Value::List(l), "get") => {
            let items = l.read();
            let i = args.first().map(Value::as_int).unwrap_or(0);
            let v = usize::try_from(i).ok().and_then(|i| items.get(i)).cloned();
            return Some(Ok(v.unwrap_or_default()));
        }
        (Value::Map(m), "get") => {
            let key = args.first().map(Value::to_string).unwrap_or_default();
            return Some(Ok(m.get(&key).unwrap_or_default()));
        }
        (Value::Map(m), "remove") => {
            let key = args.first().map(Value::to_string).unwrap_or_default();
            return Some(Ok(m.remove(&key).unwrap_or_default()));
        }
        (Value::Map(m), "containsKey" | "has") => {
            let key = args.first().map(Value::to_string).unwrap_or_default();
            return Some(Ok(Value::Bool(m.contains(&key))));
        }
        (Value::Error(e), "message") => return Some(Ok(Value::Str(e.message.clone()))),
        (Value::Error(e), "kind") => return Some(Ok(Value::Str(e.kind.clone()))),
        (Value::Error(e), "cause") => return Some(Ok(Value::Str(e.cause.clone()))),
        _ => {}
    }
    if name == "raise" {
        return None;
    }
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(base.clone());
    full.extend_from_slice(args);
    call_builtin(name, &full)
}

// ── Argument helpers ──────────────────────────────────────────────────────────

fn too_few(name: &str) -> Error {
    Error::type_error(format!("{name}: too few args"))
}

fn wrong_type(name: &str, v: &Value) -> Error {
    Error::type_error(format!("{name}: unsupported {} argument", v.type_name()))
}

fn arg<'a>(args: &'a [Value], idx: usize, name: &str) -> Result<&'a Value, Error> {
    args.get(idx).ok_or_else(|| too_few(name))
}

fn get_str(args: &[Value], idx: usize, name: &str) -> Result<String, Error> {
    arg(args, idx, name).map(Value::to_string)
}

fn get_int(args: &[Value], idx: usize, name: &str) -> Result<i64, Error> {
    arg(args, idx, name).map(Value::as_int)
}

fn get_float(args: &[Value], idx: usize, name: &str) -> Result<f64, Error> {
    arg(args, idx, name).map(Value::as_float)
}

fn list_items(args: &[Value], name: &str) -> Result<Vec<Value>, Error> {
    match arg(args, 0, name)? {
        Value::List(l) => Ok(l.read().clone()),
        v => Err(wrong_type(name, v)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
