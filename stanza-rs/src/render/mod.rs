//! Renderers.
//!
//! | Module | Walks | Produces |
//! |--------|-------|----------|
//! | [`text`] | a parsed [`Template`](crate::template::ast::Template) | a `String` |
//! | [`xml`] | an XML source tree | calls on an [`events::EventSink`] |
//!
//! Both share the tag semantics below: attribute evaluation, loop plans,
//! `catch` binding, `log`, `script`, `param` and include resolution.

pub mod events;
pub mod text;
pub mod xml;

use std::time::Instant;

use tracing::{event, Level};

use crate::error::Error;
use crate::flow::{self, coerce_bool};
use crate::interp::{Interp, LogRecord};
use crate::scope::Scope;
use crate::script::value::{ErrorObject, Value};
use crate::template::ast::ExprNode;
use crate::template::loader::{resolve_relative, with_default_extension};
use crate::template::tags::{AttrValue, TagDef};

/// Default name the `catch` tag binds the error under.
pub const CAUGHT_EXCEPTION: &str = "caughtException";

// ── Expressions and attributes ────────────────────────────────────────────────

/// Evaluate a placeholder to its text.  Deferred placeholders come back as
/// `${…}` source.
pub fn render_expression(interp: &mut Interp, node: &ExprNode) -> Result<String, Error> {
    if node.deferred {
        return Ok(node.deferred_text());
    }
    let expr = node.compiled()?;
    let value = flow::consume(interp.eval(&expr)).map_err(|e| e.in_expr(node.source.trim()))?;
    Ok(value.to_string())
}

/// Evaluate one compiled attribute.
pub(crate) fn eval_attr(interp: &mut Interp, value: &AttrValue) -> Result<Value, Error> {
    Ok(match value {
        AttrValue::Const(s) => Value::Str(s.clone()),
        AttrValue::Expr { source, expr } => flow::consume(interp.eval(expr)).map_err(|e| e.in_expr(source))?,
        AttrValue::Interp(t) => {
            let mut out = String::new();
            text::render_nodes(interp, &t.nodes, &mut out)?;
            Value::Str(out)
        }
    })
}

pub(crate) fn attr_value(interp: &mut Interp, def: &TagDef, name: &str) -> Result<Option<Value>, Error> {
    def.attr(name).map(|v| eval_attr(interp, v)).transpose()
}

pub(crate) fn attr_string(interp: &mut Interp, def: &TagDef, name: &str) -> Result<Option<String>, Error> {
    Ok(attr_value(interp, def, name)?.map(|v| v.to_string()))
}

pub(crate) fn attr_int(interp: &mut Interp, def: &TagDef, name: &str) -> Result<Option<i64>, Error> {
    match attr_value(interp, def, name)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Str(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::type_error(format!("attribute '{name}' is not an integer: '{s}'"))),
        Some(v) => Ok(Some(v.as_int())),
    }
}

pub(crate) fn attr_flag(interp: &mut Interp, def: &TagDef, name: &str) -> Result<bool, Error> {
    Ok(attr_value(interp, def, name)?.is_some_and(|v| coerce_bool(&v)))
}

/// The `test` attribute as a boolean.
pub(crate) fn eval_test(interp: &mut Interp, def: &TagDef) -> Result<bool, Error> {
    Ok(attr_value(interp, def, "test")?.is_some_and(|v| coerce_bool(&v)))
}

// ── Loops ─────────────────────────────────────────────────────────────────────

/// One `foreach` round.
pub(crate) struct Iteration {
    pub item: Value,
    pub status: Scope,
}

/// Items of a collection attribute.  Strings split on commas.
fn collection(v: Value) -> Vec<Value> {
    match v {
        Value::Null => Vec::new(),
        Value::List(items) => items.read().clone(),
        Value::Map(m) => m
            .entries()
            .into_iter()
            .map(|(k, v)| Value::Map([("key", Value::Str(k)), ("value", v)].into_iter().collect()))
            .collect(),
        Value::Str(s) if s.trim().is_empty() => Vec::new(),
        Value::Str(s) => s.split(',').map(|p| Value::from(p.trim())).collect(),
        other => vec![other],
    }
}

/// The rounds of a `foreach`, produced one at a time.
pub(crate) struct ForeachPlan {
    /// Materialized `items`; `None` for a plain numeric range.
    list: Option<Vec<Value>>,
    items: Value,
    begin: Option<i64>,
    end: Option<i64>,
    step: Option<i64>,
    stride: i64,
    next: Option<i64>,
    last: i64,
    total: u128,
    done: u128,
}

impl Iterator for ForeachPlan {
    type Item = Iteration;

    fn next(&mut self) -> Option<Iteration> {
        let index = self.next.filter(|&i| i <= self.last)?;
        self.next = index.checked_add(self.stride);
        self.done += 1;

        let item = match &self.list {
            Some(list) => list.get(usize::try_from(index).ok()?)?.clone(),
            None => Value::Int(index),
        };
        let opt = |v: Option<i64>| v.map(Value::Int).unwrap_or_default();
        let count = i64::try_from(self.done).unwrap_or(i64::MAX);
        let status: Scope = [
            ("index", Value::Int(index)),
            ("count", Value::Int(count)),
            ("first", Value::Bool(self.done == 1)),
            ("last", Value::Bool(self.done == self.total)),
            ("begin", opt(self.begin)),
            ("end", opt(self.end)),
            ("step", opt(self.step)),
            ("current", item.clone()),
            ("items", self.items.clone()),
        ]
        .into_iter()
        .collect();
        Some(Iteration { item, status })
    }
}

/// Evaluate a `foreach` tag's attributes into its plan.
pub(crate) fn foreach_plan(interp: &mut Interp, def: &TagDef) -> Result<ForeachPlan, Error> {
    let items = attr_value(interp, def, "items")?;
    let begin = attr_int(interp, def, "begin")?;
    let end = attr_int(interp, def, "end")?;
    let step = attr_int(interp, def, "step")?;
    let stride = step.unwrap_or(1);
    if stride < 1 {
        return Err(Error::type_error(format!("foreach step must be at least 1, got {stride}")));
    }

    let (list, first, last) = match items.clone() {
        Some(v) => {
            let list = collection(v);
            let len = i64::try_from(list.len()).unwrap_or(i64::MAX);
            let last = end.map_or(len - 1, |e| e.min(len - 1));
            (Some(list), begin.unwrap_or(0).max(0), last)
        }
        None => {
            let Some(last) = end else {
                return Err(Error::type_error("foreach needs 'items' or 'end'"));
            };
            (None, begin.unwrap_or(0), last)
        }
    };
    let total = if first > last { 0 } else { (last as i128 - first as i128) as u128 / stride as u128 + 1 };

    Ok(ForeachPlan {
        list,
        items: items.unwrap_or_default(),
        begin,
        end,
        step,
        stride,
        next: Some(first),
        last,
        total,
        done: 0,
    })
}

/// Fresh child of the current scope for one loop round.
pub(crate) fn round_scope(interp: &Interp, def: &TagDef, var: Option<(&str, Value)>, status: Option<Scope>) -> Scope {
    let scope = interp.scope().child();
    if let Some((name, item)) = var {
        scope.set(name, item);
    }
    if let (Some(name), Some(status)) = (def.attr("varStatus").and_then(AttrValue::as_const), status) {
        scope.set(name, Value::Map(status));
    }
    scope
}

/// Iteration budget of a `while` tag.
pub(crate) struct WhileGuard {
    start: Instant,
    max: Option<i64>,
    pub count: i64,
    test: String,
}

impl WhileGuard {
    pub fn new(interp: &mut Interp, def: &TagDef) -> Result<Self, Error> {
        let max = attr_int(interp, def, "max")?;
        Ok(WhileGuard {
            start: Instant::now(),
            max,
            count: 0,
            test: def.raw_attr("test").unwrap_or_default().to_owned(),
        })
    }

    /// Count one more round; fails once the budget is spent.
    pub fn advance(&mut self) -> Result<Scope, Error> {
        self.count += 1;
        if let Some(max) = self.max {
            if self.count > max {
                return Err(Error::Retries {
                    attempts: max,
                    elapsed: self.start.elapsed().as_secs_f64(),
                    test: self.test.clone(),
                });
            }
        }
        let n = self.count;
        Ok([
            ("index", Value::Int(n - 1)),
            ("count", Value::Int(n)),
            ("first", Value::Bool(n == 1)),
        ]
        .into_iter()
        .collect())
    }
}

// ── Side-effect tags ──────────────────────────────────────────────────────────

/// Bind a failure caught by `catch` in the current scope.
pub(crate) fn bind_caught(interp: &Interp, def: &TagDef, err: &Error) {
    let var = def.attr("var").and_then(AttrValue::as_const).unwrap_or(CAUGHT_EXCEPTION);
    tracing::debug!(tag = %def.qname, error = %err, "caught");
    interp.scope().set(var, Value::error(ErrorObject::from_error(err)));
}

/// Send a `log` tag's rendered body to the `stanza::log` target.
pub(crate) fn emit_log(interp: &mut Interp, def: &TagDef, message: String) -> Result<(), Error> {
    let level_name = attr_string(interp, def, "level")?.unwrap_or_default();
    let level = match level_name.trim().to_ascii_lowercase().as_str() {
        "trace" => {
            event!(target: "stanza::log", Level::TRACE, "{message}");
            Level::TRACE
        }
        "debug" => {
            event!(target: "stanza::log", Level::DEBUG, "{message}");
            Level::DEBUG
        }
        "info" | "" => {
            event!(target: "stanza::log", Level::INFO, "{message}");
            Level::INFO
        }
        "warn" | "warning" => {
            event!(target: "stanza::log", Level::WARN, "{message}");
            Level::WARN
        }
        "error" | "fatal" => {
            event!(target: "stanza::log", Level::ERROR, "{message}");
            Level::ERROR
        }
        other => return Err(Error::type_error(format!("unknown log level '{other}'"))),
    };
    interp.log_records.push(LogRecord { level, message });
    Ok(())
}

/// Run a `script` tag.  Returns the text to output, if `output="true"`.
pub(crate) fn run_script(interp: &mut Interp, def: &TagDef) -> Result<Option<String>, Error> {
    let Some(chunk) = def.script() else {
        return Err(Error::Script("script tag was not compiled".into()));
    };
    let public = attr_flag(interp, def, "public")?;
    let output = attr_flag(interp, def, "output")?;
    let scope = interp.scope().clone();
    let result = interp.lua.run(chunk, &scope)?;
    if public {
        for (name, value) in result.bindings {
            scope.set(name, value);
        }
    }
    Ok(output.then(|| result.value.to_string()))
}

/// Evaluate a `param` tag, bind it in the current scope and return its text.
pub(crate) fn bind_param(interp: &mut Interp, def: &TagDef) -> Result<String, Error> {
    let name = attr_string(interp, def, "name")?.unwrap_or_default();
    if name.is_empty() {
        return Err(Error::type_error("param name must not be empty"));
    }
    let value = attr_value(interp, def, "value")?.unwrap_or_default();
    let text = value.to_string();
    interp.scope().set(name, value);
    Ok(text)
}

// ── Includes ──────────────────────────────────────────────────────────────────

/// Resolve an `include` tag's page against the including template and check
/// the include chain.
pub(crate) fn include_target(interp: &mut Interp, def: &TagDef) -> Result<String, Error> {
    let page = attr_string(interp, def, "page")?.unwrap_or_default();
    let base = interp.includes.last().map(String::as_str);
    let ext = interp.engine().config().default_extension.clone();
    let target = with_default_extension(&resolve_relative(base, &page), &ext);

    if interp.includes.iter().any(|u| *u == target) {
        let mut chain = interp.includes.clone();
        chain.push(target);
        return Err(Error::CircularInclude { chain: chain.join(" -> ") });
    }
    let max = interp.engine().config().max_include_depth;
    if interp.includes.len() >= max {
        return Err(Error::IncludeDepth(max));
    }
    Ok(target)
}

/// Run `f` with `uri` on top of the include chain.
pub(crate) fn with_include<R>(interp: &mut Interp, uri: String, f: impl FnOnce(&mut Interp) -> R) -> R {
    interp.includes.push(uri);
    let out = f(interp);
    interp.includes.pop();
    out
}
