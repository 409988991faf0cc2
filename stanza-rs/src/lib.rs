//! `stanza`: a tag template engine with an embedded expression language.
//!
//! Templates mix literal text, `${expr}` placeholders (`#{expr}` defers to a
//! later pass) and library tags such as `<c:if>`, `<c:foreach>` and
//! `<c:include>`.  They render either to text or, from XML sources, to an
//! [`EventSink`](render::events::EventSink).
//!
//! ```rust
//! use stanza::{Engine, Scope, Value};
//!
//! let scope: Scope = [("names", Value::list(vec!["a".into(), "b".into()]))].into_iter().collect();
//! let out = Engine::default()
//!     .expand_text("<c:foreach items=\"${names}\" var=\"n\">[${n}]</c:foreach>", &scope)
//!     .unwrap();
//! assert_eq!(out, "[a][b]");
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod interp;
pub mod lua;
pub mod pattern;
pub mod render;
pub mod scope;
pub mod script;
pub mod steps;
pub mod template;

pub use config::EngineConfig;
pub use engine::{Engine, RenderOptions, Rendered};
pub use error::{Error, LoadError, ParseError};
pub use scope::Scope;
pub use script::value::Value;
