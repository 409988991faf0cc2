//! Expression language.
//!
//! - [`expr`]: lexer, parser and tree-walking evaluator for `${…}` bodies,
//!   steps statements and tag attributes
//! - [`value`]: runtime values
//! - [`builtins`]: global functions and methods on plain values
//!
//! Name resolution and calls are supplied by the caller through
//! [`EvalContext`]; the engine's implementation is [`crate::interp::Interp`].
//!
//! ```rust
//! use stanza::{Engine, Scope, Value};
//!
//! let scope: Scope = [("x", Value::Int(6))].into_iter().collect();
//! let v = Engine::default().eval("x * 7", &scope).unwrap();
//! assert_eq!(v, Value::Int(42));
//! ```

pub mod builtins;
pub mod expr;
pub mod value;

pub use expr::EvalContext;
pub use value::Value;
