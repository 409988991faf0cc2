//! Execution context and resolver chain.
//!
//! An [`Interp`] is created per render (or per `Engine::eval`) and carries
//! everything a single synchronous evaluation needs: the current scope, the
//! execution stack of control-flow/steps frames, the fixed root objects, the
//! include chain and the collected `log` records.  It implements
//! [`EvalContext`] so the expression evaluator can call back into it.
//!
//! ## Bare-name resolution
//!
//! | Order | Source |
//! |-------|--------|
//! | 1 | pseudo-keys `$self`, `$parent`, `$local`, `$static` |
//! | 2 | fixed roots passed at render time |
//! | 3 | execution-stack frames, innermost first (own entries only) |
//! | 4 | the current scope and its parent chain |
//! | 5 | the static model |
//! | 6 | null, or [`Error::Undefined`] in strict mode |
//!
//! ## Global calls `name(args)`
//!
//! roots → frames → current scope chain (closure, or action yielding null) →
//! steps stored under `$$name` → control-flow intrinsic → static model →
//! builtin functions.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{trace, Level};

use crate::engine::Engine;
use crate::error::Error;
use crate::flow::{self, Outcome, Signal};
use crate::lua::LuaRuntime;
use crate::scope::{static_model, Scope, STEPS_PREFIX};
use crate::script::builtins::{call_builtin, call_method};
use crate::script::expr::{eval_expr, EvalContext, Expr, LambdaDef};
use crate::script::value::{Closure, Value};
use crate::steps;

/// Nesting limit for closure and steps calls.
pub const MAX_CALL_DEPTH: usize = 64;

/// One message emitted by a `log` tag.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

/// Per-evaluation execution context.
pub struct Interp {
    engine: Engine,
    scope: Scope,
    /// Execution stack (innermost frame last).
    frames: Vec<Scope>,
    roots: Arc<IndexMap<String, Value>>,
    /// URIs of the templates currently being rendered, outermost first.
    pub(crate) includes: Vec<String>,
    depth: usize,
    /// Messages produced by `log` tags during this evaluation.
    pub log_records: Vec<LogRecord>,
    pub(crate) lua: LuaRuntime,
}

impl Interp {
    pub fn new(engine: Engine, scope: Scope) -> Self {
        Interp {
            engine,
            scope,
            frames: Vec::new(),
            roots: Arc::new(IndexMap::new()),
            includes: Vec::new(),
            depth: 0,
            log_records: Vec::new(),
            lua: LuaRuntime::default(),
        }
    }

    pub fn with_roots(mut self, roots: Arc<IndexMap<String, Value>>) -> Self {
        self.roots = roots;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The scope bare names currently resolve against.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // ── Stack discipline ──────────────────────────────────────────────────────

    /// Run `f` with `frame` pushed on the execution stack.
    pub fn with_frame<R>(&mut self, frame: Scope, f: impl FnOnce(&mut Interp) -> R) -> R {
        self.frames.push(frame);
        let out = f(self);
        self.frames.pop();
        out
    }

    /// Run `f` with `scope` as the current scope.
    pub fn with_scope<R>(&mut self, scope: Scope, f: impl FnOnce(&mut Interp) -> R) -> R {
        let saved = std::mem::replace(&mut self.scope, scope);
        let out = f(self);
        self.scope = saved;
        out
    }

    fn enter_call(&mut self) -> Result<(), Error> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::type_error(format!("call nesting deeper than {MAX_CALL_DEPTH}")));
        }
        self.depth += 1;
        Ok(())
    }

    // ── Evaluation helpers ────────────────────────────────────────────────────

    /// Parse (through the engine's expression cache) and evaluate `src`.
    pub fn eval_str(&mut self, src: &str) -> Outcome {
        let expr = self.engine.compile(src)?;
        eval_expr(&expr, self)
    }

    pub fn eval(&mut self, expr: &Expr) -> Outcome {
        eval_expr(expr, self)
    }

    /// Call a closure or run an action.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Outcome {
        match callee {
            Value::Closure(c) => self.call_closure(c, args),
            Value::Action(c) => {
                self.call_closure(c, Vec::new())?;
                Ok(Value::Null)
            }
            other => Err(Error::type_error(format!("{} is not callable", other.type_name())).into()),
        }
    }

    /// Like [`call`](Self::call), but non-callable values are returned as-is.
    pub fn call_or_value(&mut self, v: &Value, args: Vec<Value>) -> Outcome {
        if v.is_callable() {
            self.call(v, args)
        } else {
            Ok(v.clone())
        }
    }

    fn call_closure(&mut self, c: &Arc<Closure>, args: Vec<Value>) -> Outcome {
        self.enter_call()?;
        let locals = c.scope.child();
        let mut args = args.into_iter();
        for p in &c.params {
            locals.set(p.clone(), args.next().unwrap_or_default());
        }
        let body = c.body.clone();
        let out = self.with_scope(locals, |i| eval_expr(&body, i));
        self.depth -= 1;
        out
    }

    fn run_steps(&mut self, receiver: &Scope, name: &str, source: &str, args: Vec<Value>) -> Outcome {
        self.enter_call()?;
        let out = steps::run(self, receiver, name, source, args);
        self.depth -= 1;
        out
    }

    // ── Resolver chain ────────────────────────────────────────────────────────

    fn pseudo(&self, name: &str) -> Option<Value> {
        match name {
            "$self" => Some(Value::Map(self.scope.clone())),
            "$parent" => Some(self.scope.parent().cloned().map(Value::Map).unwrap_or_default()),
            "$local" => Some(self.frames.last().cloned().map(Value::Map).unwrap_or_default()),
            "$static" => Some(Value::Map(static_model().clone())),
            _ => None,
        }
    }

    /// Invoke `name` on a map receiver: callable entry, steps, intrinsic.
    fn invoke_on_scope(&mut self, receiver: &Scope, name: &str, args: Vec<Value>) -> Option<Outcome> {
        if let Some(v) = receiver.get(name).filter(Value::is_callable) {
            trace!(name, "resolved as callable entry");
            return Some(self.call(&v, args));
        }
        if let Some(src) = receiver.get(&format!("{STEPS_PREFIX}{name}")) {
            trace!(name, "resolved as steps");
            return Some(self.run_steps(receiver, name, &src.to_string(), args));
        }
        if flow::is_intrinsic(name) {
            return Some(flow::invoke(self, receiver, name, args));
        }
        None
    }

    /// Methods on lists that take closures.
    fn list_method(&mut self, list: &Value, name: &str, args: &[Value]) -> Option<Outcome> {
        let Value::List(items) = list else { return None };
        let f = args.first().filter(|f| f.is_callable())?;
        let snapshot = items.read().clone();
        let out = (|| -> Outcome {
            match name {
                "map" => {
                    let mut out = Vec::with_capacity(snapshot.len());
                    for v in snapshot {
                        out.push(self.call(f, vec![v])?);
                    }
                    Ok(Value::list(out))
                }
                "filter" => {
                    let mut out = Vec::new();
                    for v in snapshot {
                        if self.call(f, vec![v.clone()])?.as_bool() {
                            out.push(v);
                        }
                    }
                    Ok(Value::list(out))
                }
                "each" => {
                    for (i, v) in snapshot.into_iter().enumerate() {
                        self.call(f, vec![v, Value::from(i)])?;
                    }
                    Ok(list.clone())
                }
                "find" => {
                    for v in snapshot {
                        if self.call(f, vec![v.clone()])?.as_bool() {
                            return Ok(v);
                        }
                    }
                    Ok(Value::Null)
                }
                "reduce" => {
                    let mut acc = args.get(1).cloned().unwrap_or_default();
                    for v in snapshot {
                        acc = self.call(f, vec![acc, v])?;
                    }
                    Ok(acc)
                }
                _ => Err(Error::UnknownMethod { name: name.to_owned(), target: "list".into() }.into()),
            }
        })();
        Some(out)
    }

    fn unknown(name: &str, target: &Value) -> Signal {
        Error::UnknownMethod {
            name: name.to_owned(),
            target: target.type_name().to_owned(),
        }
        .into()
    }
}

/// Short human description of a scope for diagnostics.
pub fn describe_scope(scope: &Scope) -> String {
    if scope.ptr_eq(static_model()) {
        return "$static".into();
    }
    let keys: Vec<String> = scope
        .keys()
        .into_iter()
        .filter(|k| !k.starts_with(STEPS_PREFIX))
        .collect();
    if keys.len() > 4 {
        format!("scope{{{}, …}}", keys[..4].join(", "))
    } else {
        format!("scope{{{}}}", keys.join(", "))
    }
}

// ── EvalContext impl ──────────────────────────────────────────────────────────

impl EvalContext for Interp {
    fn lookup(&mut self, name: &str) -> Outcome {
        if let Some(v) = self.pseudo(name) {
            return Ok(v);
        }
        if let Some(v) = self.roots.get(name) {
            trace!(name, "resolved from roots");
            return Ok(v.clone());
        }
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.get_own(name) {
                trace!(name, "resolved from execution stack");
                return Ok(v);
            }
        }
        if let Some(v) = self.scope.get(name) {
            return Ok(v);
        }
        if let Some(v) = static_model().get(name) {
            trace!(name, "resolved from static model");
            return Ok(v);
        }
        if self.engine.config().strict {
            return Err(Error::Undefined(name.to_owned()).into());
        }
        trace!(name, "unresolved, using null");
        Ok(Value::Null)
    }

    fn assign(&mut self, name: &str, value: Value) -> Outcome<()> {
        if self.pseudo(name).is_some() {
            return Err(Error::type_error(format!("cannot assign to {name}")).into());
        }
        if self.roots.contains_key(name) {
            return Err(Error::type_error(format!("cannot assign to fixed root '{name}'")).into());
        }
        if let Some(frame) = self.frames.iter().rev().find(|f| f.contains_own(name)) {
            frame.set(name, value);
            return Ok(());
        }
        let target = self
            .scope
            .owner(name)
            .or_else(|| static_model().contains_own(name).then(|| static_model().clone()))
            .unwrap_or_else(|| self.scope.clone());
        target.set(name, value);
        Ok(())
    }

    fn get_property(&mut self, base: &Value, name: &str) -> Outcome {
        Ok(match base {
            Value::Map(m) => match name {
                "$self" => base.clone(),
                "$parent" => m.parent().cloned().map(Value::Map).unwrap_or_default(),
                _ => m.get(name).unwrap_or_default(),
            },
            Value::Error(e) => match name {
                "message" => Value::Str(e.message.clone()),
                "kind" => Value::Str(e.kind.clone()),
                "cause" => Value::Str(e.cause.clone()),
                _ => Value::Null,
            },
            Value::Object(o) => o.get_property(name).unwrap_or_default(),
            Value::List(l) if name == "length" || name == "size" => Value::from(l.read().len()),
            Value::Str(s) if name == "length" => Value::from(s.chars().count()),
            _ => Value::Null,
        })
    }

    fn set_property(&mut self, base: &Value, name: &str, value: Value) -> Outcome<()> {
        match base {
            Value::Map(m) => {
                m.set(name, value);
                Ok(())
            }
            other => Err(Error::type_error(format!(
                "cannot set property '{name}' on {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn invoke(&mut self, base: Option<&Value>, name: &str, args: Vec<Value>) -> Outcome {
        let Some(base) = base else {
            if let Some(v) = self.roots.get(name).filter(|v| v.is_callable()).cloned() {
                return self.call(&v, args);
            }
            let framed = self
                .frames
                .iter()
                .rev()
                .find_map(|f| f.get_own(name).filter(Value::is_callable));
            if let Some(v) = framed {
                return self.call(&v, args);
            }
            let receiver = self.scope.clone();
            if let Some(out) = self.invoke_on_scope(&receiver, name, args.clone()) {
                return out;
            }
            if let Some(out) = self.invoke_on_scope(static_model(), name, args.clone()) {
                return out;
            }
            return match call_builtin(name, &args) {
                Some(res) => Ok(res?),
                None => Err(Error::UnknownMethod {
                    name: name.to_owned(),
                    target: "global scope".into(),
                }
                .into()),
            };
        };

        match base {
            Value::Map(m) => {
                if let Some(out) = self.invoke_on_scope(m, name, args.clone()) {
                    return out;
                }
            }
            Value::Object(o) => {
                if let Some(res) = o.invoke_method(name, &args) {
                    return Ok(res?);
                }
            }
            Value::Closure(_) | Value::Action(_) if name == "call" => return self.call(base, args),
            Value::List(_) => {
                if let Some(out) = self.list_method(base, name, &args) {
                    return out;
                }
            }
            _ => {}
        }
        match call_method(base, name, &args) {
            Some(res) => Ok(res?),
            None => Err(Self::unknown(name, base)),
        }
    }

    fn apply(&mut self, callee: &Value, args: Vec<Value>) -> Outcome {
        self.call(callee, args)
    }

    fn make_closure(&mut self, def: &Arc<LambdaDef>) -> Value {
        Value::Closure(Arc::new(Closure {
            params: def.params.clone(),
            body: def.body.clone(),
            source: def.source.clone(),
            scope: self.scope.clone(),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
