//! Runtime value type for template expressions and steps.
//!
//! Values are dynamically typed.  Strings coerce to numbers whenever they
//! parse as one, so `"2" * 3` is `6` while `"a" + 1` concatenates.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::expr::Expr;
use crate::error::Error;
use crate::scope::Scope;

/// Shared, mutable list storage.
pub type List = Arc<RwLock<Vec<Value>>>;

/// A script-level function: parameter names, a body and the scope it closed over.
pub struct Closure {
    pub params: Vec<String>,
    pub body: Arc<Expr>,
    /// Source text of the whole lambda, used in diagnostics and `Retries`.
    pub source: String,
    pub scope: Scope,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure").field("source", &self.source).finish()
    }
}

/// A caught error as seen by script code (`e.message`, `e.kind`, `e.cause`).
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub message: String,
    pub kind: String,
    /// Full chain text of the error that was caught.
    pub cause: String,
}

impl ErrorObject {
    /// Describe `err` by its root cause, keeping the whole chain in `cause`.
    pub fn from_error(err: &Error) -> Self {
        let root = err.root_cause();
        ErrorObject {
            message: root.to_string(),
            kind: root.kind().to_owned(),
            cause: err.chain(),
        }
    }
}

/// Capability interface for host objects exposed to expressions.
pub trait Object: Send + Sync {
    fn type_name(&self) -> &str;

    fn get_property(&self, _name: &str) -> Option<Value> {
        None
    }

    /// `None` when the object has no method of that name.
    fn invoke_method(&self, _name: &str, _args: &[Value]) -> Option<Result<Value, Error>> {
        None
    }

    fn display(&self) -> String {
        format!("<{}>", self.type_name())
    }
}

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(List),
    Map(Scope),
    Closure(Arc<Closure>),
    /// Zero-argument runnable bound by `put`; running it yields `Null`.
    Action(Arc<Closure>),
    Error(Arc<ErrorObject>),
    Object(Arc<dyn Object>),
}

/// Numeric view of a value.
#[derive(Debug, Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn f(self) -> f64 {
        match self {
            Num::I(n) => n as f64,
            Num::F(x) => x,
        }
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(RwLock::new(items)))
    }

    pub fn error(obj: ErrorObject) -> Value {
        Value::Error(Arc::new(obj))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Action(_))
    }

    /// Truthiness: null, `false`, zero, `""`, `"false"`, `"0"` and empty
    /// collections are false.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
            Value::List(l) => !l.read().is_empty(),
            Value::Map(m) => !m.is_empty(),
            _ => true,
        }
    }

    /// Coerce to `i64`; non-numeric values become 0.
    pub fn as_int(&self) -> i64 {
        match self.numeric() {
            Some(Num::I(n)) => n,
            Some(Num::F(x)) => x as i64,
            None => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        self.numeric().map(Num::f).unwrap_or(0.0)
    }

    /// Borrow the text of a `Str` without formatting.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Closure(_) => "closure",
            Value::Action(_) => "action",
            Value::Error(_) => "error",
            Value::Object(o) => o.type_name(),
        }
    }

    fn numeric(&self) -> Option<Num> {
        match self {
            Value::Null => Some(Num::I(0)),
            Value::Bool(b) => Some(Num::I(*b as i64)),
            Value::Int(n) => Some(Num::I(*n)),
            Value::Float(x) => Some(Num::F(*x)),
            Value::Str(s) => {
                let t = s.trim();
                if let Ok(n) = t.parse::<i64>() {
                    Some(Num::I(n))
                } else {
                    t.parse::<f64>().ok().filter(|x| x.is_finite()).map(Num::F)
                }
            }
            _ => None,
        }
    }

    /// Numeric view that refuses values which only coerce by default.
    fn strict_numeric(&self) -> Option<Num> {
        match self {
            Value::Null | Value::Bool(_) => None,
            v => v.numeric(),
        }
    }

    // ── Arithmetic helpers ────────────────────────────────────────────────────

    fn operands(&self, rhs: &Value, op: &str) -> Result<(Num, Num), Error> {
        match (self.numeric(), rhs.numeric()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::type_error(format!(
                "cannot apply '{op}' to {} and {}",
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn int_or_float(
        a: Num,
        b: Num,
        int: impl Fn(i64, i64) -> Option<i64>,
        float: impl Fn(f64, f64) -> f64,
    ) -> Value {
        match (a, b) {
            (Num::I(x), Num::I(y)) => match int(x, y) {
                Some(n) => Value::Int(n),
                None => Value::Float(float(x as f64, y as f64)),
            },
            _ => Value::Float(float(a.f(), b.f())),
        }
    }

    /// `+`: numeric addition, list concatenation, otherwise string concatenation.
    pub fn arith_add(&self, rhs: &Value) -> Result<Value, Error> {
        if let (Value::List(a), Value::List(b)) = (self, rhs) {
            let mut out = a.read().clone();
            out.extend(b.read().iter().cloned());
            return Ok(Value::list(out));
        }
        let concat = matches!(self, Value::Str(_)) || matches!(rhs, Value::Str(_));
        match (self.strict_numeric(), rhs.strict_numeric()) {
            (Some(a), Some(b)) => Ok(Self::int_or_float(a, b, i64::checked_add, |x, y| x + y)),
            _ if concat => Ok(Value::Str(format!("{self}{rhs}"))),
            _ => {
                let (a, b) = self.operands(rhs, "+")?;
                Ok(Self::int_or_float(a, b, i64::checked_add, |x, y| x + y))
            }
        }
    }

    pub fn arith_sub(&self, rhs: &Value) -> Result<Value, Error> {
        let (a, b) = self.operands(rhs, "-")?;
        Ok(Self::int_or_float(a, b, i64::checked_sub, |x, y| x - y))
    }

    pub fn arith_mul(&self, rhs: &Value) -> Result<Value, Error> {
        let (a, b) = self.operands(rhs, "*")?;
        Ok(Self::int_or_float(a, b, i64::checked_mul, |x, y| x * y))
    }

    /// Integer operands divide as integers.
    pub fn arith_div(&self, rhs: &Value) -> Result<Value, Error> {
        let (a, b) = self.operands(rhs, "/")?;
        if b.f() == 0.0 {
            return Err(Error::type_error("division by zero"));
        }
        Ok(Self::int_or_float(a, b, i64::checked_div, |x, y| x / y))
    }

    pub fn arith_rem(&self, rhs: &Value) -> Result<Value, Error> {
        let (a, b) = self.operands(rhs, "%")?;
        if b.f() == 0.0 {
            return Err(Error::type_error("modulo by zero"));
        }
        Ok(Self::int_or_float(a, b, i64::checked_rem, |x, y| x % y))
    }

    pub fn arith_neg(&self) -> Result<Value, Error> {
        match self.numeric() {
            Some(Num::I(n)) => Ok(Value::Int(n.wrapping_neg())),
            Some(Num::F(x)) => Ok(Value::Float(-x)),
            None => Err(Error::type_error(format!("cannot negate {}", self.type_name()))),
        }
    }

    /// Ordering used by `<`, `>`, `sort()` and friends: numeric when both sides
    /// are numbers, otherwise by display text.
    pub fn cmp_value(&self, rhs: &Value) -> Ordering {
        match (self.strict_numeric(), rhs.strict_numeric()) {
            (Some(a), Some(b)) => match (a, b) {
                (Num::I(x), Num::I(y)) => x.cmp(&y),
                _ => a.f().partial_cmp(&b.f()).unwrap_or(Ordering::Equal),
            },
            _ => self.to_string().cmp(&rhs.to_string()),
        }
    }

    /// Equality used by `==`: `"1" == 1`, `null` equals only `null`.
    pub fn loose_eq(&self, rhs: &Value) -> bool {
        match (self, rhs) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ if !self.is_scalar() || !rhs.is_scalar() => self == rhs,
            _ => match (self.strict_numeric(), rhs.strict_numeric()) {
                (Some(Num::I(a)), Some(Num::I(b))) => a == b,
                (Some(a), Some(b)) => a.f() == b.f(),
                _ => self.to_string() == rhs.to_string(),
            },
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    /// Convert parsed JSON into runtime values; objects become maps.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let scope = Scope::new();
                for (k, v) in map {
                    scope.set(k.clone(), Value::from_json(v));
                }
                Value::Map(scope)
            }
        }
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > 8 {
            return f.write_str("...");
        }
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.read().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("]")
            }
            Value::Map(scope) => {
                f.write_str("{")?;
                for (i, (k, v)) in scope.entries().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: ")?;
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("}")
            }
            Value::Closure(c) => f.write_str(&c.source),
            Value::Action(c) => write!(f, "<action {}>", c.source),
            Value::Error(e) => f.write_str(&e.message),
            Value::Object(o) => f.write_str(&o.display()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(l) => f.debug_tuple("List").field(&*l.read()).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(&m.keys()).finish(),
            Value::Closure(c) => write!(f, "Closure({:?})", c.source),
            Value::Action(c) => write!(f, "Action({:?})", c.source),
            Value::Error(e) => write!(f, "Error({:?})", e.message),
            Value::Object(o) => write!(f, "Object({})", o.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b) || *a.read() == *b.read(),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b) || a.entries() == b.entries(),
            (Value::Closure(a), Value::Closure(b)) | (Value::Action(a), Value::Action(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<Scope> for Value {
    fn from(scope: Scope) -> Self {
        Value::Map(scope)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_scalars() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(-7).to_string(), "-7");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
    }

    #[test]
    fn display_collections() {
        let l = Value::list(vec![1.into(), "a".into()]);
        assert_eq!(l.to_string(), "[1, a]");
        let m: Scope = [("k", Value::Int(1))].into_iter().collect();
        assert_eq!(Value::Map(m).to_string(), "{k: 1}");
    }

    #[test]
    fn display_self_referencing_map_terminates() {
        let m = Scope::new();
        m.set("me", Value::Map(m.clone()));
        let text = Value::Map(m).to_string();
        assert!(text.contains("..."));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.as_bool());
        assert!(!Value::Str("false".into()).as_bool());
        assert!(!Value::Str("0".into()).as_bool());
        assert!(!Value::Str(String::new()).as_bool());
        assert!(Value::Str("no".into()).as_bool());
        assert!(!Value::list(vec![]).as_bool());
        assert!(Value::list(vec![Value::Null]).as_bool());
        assert!(!Value::Float(0.0).as_bool());
    }

    #[test]
    fn arithmetic() {
        let a = Value::Int(10);
        let b = Value::Int(3);
        assert_eq!(a.arith_add(&b).unwrap(), Value::Int(13));
        assert_eq!(a.arith_sub(&b).unwrap(), Value::Int(7));
        assert_eq!(a.arith_mul(&b).unwrap(), Value::Int(30));
        assert_eq!(a.arith_div(&b).unwrap(), Value::Int(3));
        assert_eq!(a.arith_rem(&b).unwrap(), Value::Int(1));
        assert_eq!(Value::Int(7).arith_add(&Value::Float(2.0)).unwrap(), Value::Float(9.0));
    }

    #[test]
    fn numeric_strings_coerce() {
        assert_eq!(Value::from("2").arith_mul(&Value::Int(3)).unwrap(), Value::Int(6));
        assert_eq!(Value::from("3").arith_add(&Value::Int(4)).unwrap(), Value::Int(7));
    }

    #[test]
    fn string_concatenation() {
        let v = Value::from("a").arith_add(&Value::Int(1)).unwrap();
        assert_eq!(v, Value::Str("a1".into()));
        let v = Value::Null.arith_add(&Value::from("x")).unwrap();
        assert_eq!(v, Value::Str("x".into()));
    }

    #[test]
    fn type_errors() {
        assert!(Value::from("a").arith_sub(&Value::Int(1)).is_err());
        assert!(Value::Int(1).arith_div(&Value::Int(0)).is_err());
        assert!(Value::Int(1).arith_rem(&Value::Int(0)).is_err());
    }

    #[test]
    fn overflow_falls_back_to_float() {
        let v = Value::Int(i64::MAX).arith_add(&Value::Int(1)).unwrap();
        assert!(matches!(v, Value::Float(_)));
    }

    #[test]
    fn loose_equality() {
        assert!(Value::from("1").loose_eq(&Value::Int(1)));
        assert!(Value::Int(2).loose_eq(&Value::Float(2.0)));
        assert!(Value::Null.loose_eq(&Value::Null));
        assert!(!Value::Null.loose_eq(&Value::from("")));
        assert!(Value::Bool(true).loose_eq(&Value::from("true")));
    }

    #[test]
    fn ordering() {
        assert_eq!(Value::from("10").cmp_value(&Value::Int(9)), Ordering::Greater);
        assert_eq!(Value::from("abc").cmp_value(&Value::from("abd")), Ordering::Less);
    }

    #[test]
    fn from_json() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": 1, "b": [true, 2.5], "c": null}"#).unwrap();
        let v = Value::from_json(&json);
        let Value::Map(m) = v else { panic!("expected map") };
        assert_eq!(m.get("a"), Some(Value::Int(1)));
        assert_eq!(m.get("b").unwrap().to_string(), "[true, 2.5]");
        assert_eq!(m.get("c"), Some(Value::Null));
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Int(0).type_name(), "integer");
        assert_eq!(Value::Float(0.0).type_name(), "float");
        assert_eq!(Value::from("").type_name(), "string");
        assert_eq!(Value::list(vec![]).type_name(), "list");
    }
}
