//! Signals and the control-flow intrinsics.
//!
//! Evaluation returns an [`Outcome`]: either a value, or a [`Signal`] that
//! unwinds the walk.  `Signal::Return` is the early-return protocol and is
//! consumed by the nearest steps sequence, expression node or test position;
//! `Signal::Error` carries a real failure.
//!
//! # Intrinsics
//!
//! | Call | Result |
//! |------|--------|
//! | `ifThen(test, then)` | the receiver |
//! | `ifThenElse(test, then, else)` | the chosen branch's result |
//! | `whileDo(test, body, maxLoops[, onTimeout])` | last body result, or `onTimeout(elapsed)` |
//! | `tryExcept(body, onError[, onFinally])` | body result, or `onError(error)` |
//! | `put(name, action)` | null; binds `name` on the receiver |
//! | `return(value)` | raises `Signal::Return` |
//!
//! Arguments that are closures are called; anything else is used as a
//! constant.  Every intrinsic except `put` and `return` runs inside a fresh
//! child frame of the receiver pushed on the execution stack.

use std::time::Instant;

use tracing::{debug, trace};

use crate::error::Error;
use crate::interp::Interp;
use crate::scope::Scope;
use crate::script::value::{ErrorObject, Value};

/// Non-value exits from an evaluation.
#[derive(Debug)]
pub enum Signal {
    /// Early return carrying its value.
    Return(Value),
    Error(Error),
}

impl From<Error> for Signal {
    fn from(e: Error) -> Self {
        Signal::Error(e)
    }
}

impl Signal {
    /// Apply `f` to an error; returns pass through untouched.
    pub fn map_error(self, f: impl FnOnce(Error) -> Error) -> Signal {
        match self {
            Signal::Error(e) => Signal::Error(f(e)),
            ret => ret,
        }
    }
}

pub type Outcome<T = Value> = Result<T, Signal>;

/// Turn a pending return into a normal result.
pub fn consume(outcome: Outcome) -> Result<Value, Error> {
    match outcome {
        Ok(v) | Err(Signal::Return(v)) => Ok(v),
        Err(Signal::Error(e)) => Err(e),
    }
}

/// Boolean reading of a test result; `"true"` / `"false"` text is parsed.
pub fn coerce_bool(v: &Value) -> bool {
    match v {
        Value::Str(s) if s.trim().eq_ignore_ascii_case("true") => true,
        Value::Str(s) if s.trim().eq_ignore_ascii_case("false") => false,
        v => v.as_bool(),
    }
}

// ── Intrinsics ────────────────────────────────────────────────────────────────

pub const INTRINSICS: &[&str] = &["ifThen", "ifThenElse", "whileDo", "tryExcept", "put", "return"];

pub fn is_intrinsic(name: &str) -> bool {
    INTRINSICS.contains(&name)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Error> {
    if args.len() < min || args.len() > max {
        let want = if min == max { min.to_string() } else { format!("{min}..{max}") };
        return Err(Error::type_error(format!(
            "{name}() takes {want} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Run intrinsic `name` against `receiver`.  The caller has checked
/// [`is_intrinsic`].
pub fn invoke(interp: &mut Interp, receiver: &Scope, name: &str, args: Vec<Value>) -> Outcome {
    trace!(name, "control-flow intrinsic");
    match name {
        "return" => {
            arity(name, &args, 0, 1)?;
            Err(Signal::Return(args.into_iter().next().unwrap_or_default()))
        }
        "put" => {
            arity(name, &args, 2, 2)?;
            let mut it = args.into_iter();
            let key = it.next().unwrap_or_default().to_string();
            let action = match it.next().unwrap_or_default() {
                Value::Closure(c) => Value::Action(c),
                other => other,
            };
            receiver.set(key, action);
            Ok(Value::Null)
        }
        "ifThen" => {
            arity(name, &args, 2, 2)?;
            interp.with_frame(receiver.child(), |interp| {
                if test(interp, &args[0])? {
                    interp.call_or_value(&args[1], Vec::new())?;
                }
                Ok(Value::Map(receiver.clone()))
            })
        }
        "ifThenElse" => {
            arity(name, &args, 3, 3)?;
            interp.with_frame(receiver.child(), |interp| {
                let branch = if test(interp, &args[0])? { &args[1] } else { &args[2] };
                interp.call_or_value(branch, Vec::new())
            })
        }
        "whileDo" => {
            arity(name, &args, 3, 4)?;
            interp.with_frame(receiver.child(), |interp| while_do(interp, &args))
        }
        "tryExcept" => {
            arity(name, &args, 2, 3)?;
            interp.with_frame(receiver.child(), |interp| try_except(interp, &args))
        }
        _ => Err(Error::UnknownMethod {
            name: name.to_owned(),
            target: "control flow".into(),
        }
        .into()),
    }
}

/// Evaluate a test argument; a return raised inside it yields the test value.
fn test(interp: &mut Interp, cond: &Value) -> Outcome<bool> {
    match interp.call_or_value(cond, Vec::new()) {
        Ok(v) | Err(Signal::Return(v)) => Ok(coerce_bool(&v)),
        Err(e) => Err(e),
    }
}

/// Text shown for a test in loop-exhaustion errors.
fn test_text(cond: &Value) -> String {
    match cond {
        Value::Closure(c) | Value::Action(c) => c.source.clone(),
        other => other.to_string(),
    }
}

fn while_do(interp: &mut Interp, args: &[Value]) -> Outcome {
    let (cond, body) = (&args[0], &args[1]);
    let max_loops = args[2].as_int();
    if max_loops < 0 {
        return Err(Error::type_error(format!("whileDo maxLoops must not be negative, got {max_loops}")).into());
    }
    let on_timeout = args.get(3);

    let start = Instant::now();
    let mut count: i64 = 0;
    let mut last = Value::Null;
    while test(interp, cond)? {
        count += 1;
        if count > max_loops {
            let elapsed = start.elapsed().as_secs_f64();
            debug!(max_loops, elapsed, "whileDo budget exhausted");
            return match on_timeout {
                Some(handler) => interp.call_or_value(handler, vec![Value::Float(elapsed)]),
                None => Err(Error::Retries {
                    attempts: max_loops,
                    elapsed,
                    test: test_text(cond),
                }
                .into()),
            };
        }
        last = interp.call_or_value(body, vec![Value::Int(count)])?;
    }
    Ok(last)
}

fn try_except(interp: &mut Interp, args: &[Value]) -> Outcome {
    let (body, on_error) = (&args[0], &args[1]);
    let start = Instant::now();
    let result = match interp.call_or_value(body, Vec::new()) {
        Err(Signal::Error(e)) => {
            debug!(error = %e, "tryExcept caught");
            let obj = ErrorObject::from_error(&e);
            interp.call_or_value(on_error, vec![Value::error(obj)])
        }
        other => other,
    };
    if let Some(on_finally) = args.get(2) {
        let elapsed = start.elapsed().as_secs_f64();
        interp.call_or_value(on_finally, vec![Value::Float(elapsed)])?;
    }
    result
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn run(src: &str, scope: &Scope) -> Result<Value, Error> {
        Engine::default().eval(src, scope)
    }

    #[test]
    fn consume_unwraps_return() {
        assert_eq!(consume(Err(Signal::Return(Value::Int(3)))).unwrap(), Value::Int(3));
        assert!(consume(Err(Signal::Error(Error::Raised("x".into())))).is_err());
    }

    #[test]
    fn map_error_leaves_return_alone() {
        let sig = Signal::Return(Value::Int(1)).map_error(|e| e.in_tag("c:if"));
        assert!(matches!(sig, Signal::Return(Value::Int(1))));
    }

    #[test]
    fn coerce_bool_parses_text() {
        assert!(coerce_bool(&Value::from("TRUE")));
        assert!(!coerce_bool(&Value::from(" false ")));
        assert!(coerce_bool(&Value::Int(2)));
    }

    #[test]
    fn if_then_returns_receiver_and_runs_branch() {
        let scope = Scope::new();
        let v = run("ifThen(true, () -> $static.flow_if_ran = 1)", &scope).unwrap();
        assert!(matches!(v, Value::Map(m) if m.ptr_eq(&scope)));
        assert_eq!(crate::scope::static_model().get("flow_if_ran"), Some(Value::Int(1)));
    }

    #[test]
    fn if_then_else_picks_one_branch() {
        let scope = Scope::new();
        scope.set("x", Value::Int(5));
        assert_eq!(run("ifThenElse(x > 3, () -> 'big', () -> 'small')", &scope).unwrap(), Value::from("big"));
        assert_eq!(run("ifThenElse(x > 9, 'big', 'small')", &scope).unwrap(), Value::from("small"));
    }

    #[test]
    fn while_do_counts_iterations() {
        let scope = Scope::new();
        scope.set("n", Value::Int(0));
        let v = run("whileDo(() -> n < 4, i -> n = n + 1, 10)", &scope).unwrap();
        assert_eq!(v, Value::Int(4));
        assert_eq!(scope.get("n"), Some(Value::Int(4)));
    }

    #[test]
    fn while_do_passes_iteration_number() {
        let scope = Scope::new();
        scope.set("seen", Value::list(vec![]));
        run("whileDo(() -> seen.size() < 3, i -> seen.add(i), 5)", &scope).unwrap();
        assert_eq!(scope.get("seen").unwrap().to_string(), "[1, 2, 3]");
    }

    #[test]
    fn while_do_exhaustion_raises_retries() {
        let scope = Scope::new();
        scope.set("runs", Value::Int(0));
        let err = run("whileDo(() -> true, () -> runs = runs + 1, 3)", &scope).unwrap_err();
        match err.root_cause() {
            Error::Retries { attempts, test, elapsed } => {
                assert_eq!(*attempts, 3);
                assert_eq!(test, "() -> true");
                assert!(*elapsed >= 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(scope.get("runs"), Some(Value::Int(3)));
    }

    #[test]
    fn while_do_timeout_handler_receives_elapsed() {
        let scope = Scope::new();
        let v = run("whileDo(true, 0, 2, secs -> 'gave up')", &scope).unwrap();
        assert_eq!(v, Value::from("gave up"));
    }

    #[test]
    fn while_do_zero_budget() {
        let scope = Scope::new();
        assert_eq!(run("whileDo(false, 1, 0)", &scope).unwrap(), Value::Null);
        assert!(run("whileDo(true, 1, 0)", &scope).is_err());
        assert!(run("whileDo(false, 1, -1)", &scope).is_err());
    }

    #[test]
    fn return_inside_test_is_the_test_value() {
        let scope = Scope::new();
        let v = run("ifThenElse(() -> return('true'), 'yes', 'no')", &scope).unwrap();
        assert_eq!(v, Value::from("yes"));
    }

    #[test]
    fn try_except_hands_root_cause_to_handler() {
        let scope = Scope::new();
        let v = run("tryExcept(() -> raise('boom'), e -> e.message + '/' + e.kind)", &scope).unwrap();
        assert_eq!(v, Value::from("boom/raised"));
    }

    #[test]
    fn try_except_finally_always_runs() {
        let scope = Scope::new();
        scope.set("done", Value::Bool(false));
        let v = run("tryExcept(() -> 7, e -> 0, t -> done = t >= 0)", &scope).unwrap();
        assert_eq!(v, Value::Int(7));
        assert_eq!(scope.get("done"), Some(Value::Bool(true)));
    }

    #[test]
    fn try_except_lets_return_through() {
        let scope = Scope::new();
        scope.define_steps("early", "tryExcept(() -> return(5), e -> 0); 99");
        assert_eq!(run("early()", &scope).unwrap(), Value::Int(5));
    }

    #[test]
    fn put_binds_an_action() {
        let scope = Scope::new();
        scope.set("hits", Value::Int(0));
        run("put('bump', () -> hits = hits + 1)", &scope).unwrap();
        assert!(matches!(scope.get_own("bump"), Some(Value::Action(_))));
        assert_eq!(run("bump()", &scope).unwrap(), Value::Null);
        assert_eq!(scope.get("hits"), Some(Value::Int(1)));
    }

    #[test]
    fn frames_are_balanced_after_failure() {
        let engine = Engine::default();
        let scope = Scope::new();
        let mut interp = Interp::new(engine, scope);
        let _ = interp.eval_str("tryExcept(() -> whileDo(true, 1, 1), e -> raise('again'))");
        assert_eq!(interp.frame_depth(), 0);
    }
}
