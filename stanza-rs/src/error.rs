//! Error taxonomy.
//!
//! | Class | Variants | When |
//! |-------|----------|------|
//! | structural | [`Error::Parse`], [`Error::CircularInclude`], [`Error::IncludeDepth`] | template build |
//! | evaluation | [`Error::Eval`], [`Error::Syntax`], [`Error::Raised`], [`Error::Undefined`], [`Error::UnknownMethod`], [`Error::Type`] | render |
//! | loop budget | [`Error::Retries`] | `whileDo` / `<c:while max>` |
//! | resource | [`Error::Resource`] | template or include load |
//! | context | [`Error::Step`], [`Error::Tag`] | wrap a deeper failure |
//! | output | [`Error::Script`], [`Error::Xml`] | script engine, event sink or XML source |
//!
//! The early-return signal is not an error; see [`crate::flow::Signal`].

use thiserror::Error;

/// Failure reported by a [`ResourceLoader`](crate::template::loader::ResourceLoader).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("resource not found")]
    NotFound,
    #[error("path escapes the template root")]
    Forbidden,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A structural problem found while building a template.
#[derive(Debug, Clone, Error)]
#[error("{}line {line}: {message}", .uri.as_deref().map(|u| format!("{u}: ")).unwrap_or_default())]
pub struct ParseError {
    pub message: String,
    /// 1-based line of the offending construct.
    pub line: usize,
    pub uri: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self { message: message.into(), line, uri: None }
    }

    pub fn with_uri(mut self, uri: Option<&str>) -> Self {
        if self.uri.is_none() {
            self.uri = uri.map(str::to_owned);
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("circular include: {chain}")]
    CircularInclude { chain: String },

    #[error("include nesting deeper than {0}")]
    IncludeDepth(usize),

    #[error("cannot load '{uri}'")]
    Resource {
        uri: String,
        #[source]
        source: LoadError,
    },

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("error evaluating '{expr}'")]
    Eval {
        expr: String,
        #[source]
        source: Box<Error>,
    },

    /// Raised explicitly by script code (`raise('message')`).
    #[error("{0}")]
    Raised(String),

    #[error("undefined variable '{0}'")]
    Undefined(String),

    #[error("unknown method '{name}' on {target}")]
    UnknownMethod { name: String, target: String },

    #[error("{0}")]
    Type(String),

    #[error("loop `{test}` gave up after {attempts} attempts ({elapsed:.3}s)")]
    Retries {
        attempts: i64,
        elapsed: f64,
        test: String,
    },

    #[error("statement {index} of {receiver}.{name} failed: {statement}")]
    Step {
        index: usize,
        statement: String,
        receiver: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("<{tag}> failed")]
    Tag {
        tag: String,
        #[source]
        source: Box<Error>,
    },

    #[error("script error: {0}")]
    Script(String),

    /// An event sink or XML source failed.
    #[error("xml: {0}")]
    Xml(String),
}

impl Error {
    pub fn type_error(msg: impl Into<String>) -> Self {
        Error::Type(msg.into())
    }

    pub fn in_expr(self, expr: &str) -> Self {
        match self {
            // Already located; avoid stacking the same text twice.
            e @ Error::Eval { .. } => e,
            e => Error::Eval { expr: expr.to_owned(), source: Box::new(e) },
        }
    }

    pub fn in_tag(self, tag: &str) -> Self {
        Error::Tag { tag: tag.to_owned(), source: Box::new(self) }
    }

    /// Walk the context wrappers down to the failure that started it all.
    pub fn root_cause(&self) -> &Error {
        let mut cur = self;
        loop {
            match cur {
                Error::Eval { source, .. }
                | Error::Step { source, .. }
                | Error::Tag { source, .. } => cur = source,
                _ => return cur,
            }
        }
    }

    /// Short machine-friendly classification, exposed to scripts as `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse",
            Error::CircularInclude { .. } => "circular-include",
            Error::IncludeDepth(_) => "include-depth",
            Error::Resource { .. } => "resource",
            Error::Syntax(_) => "syntax",
            Error::Eval { .. } => "eval",
            Error::Raised(_) => "raised",
            Error::Undefined(_) => "undefined",
            Error::UnknownMethod { .. } => "unknown-method",
            Error::Type(_) => "type",
            Error::Retries { .. } => "retries",
            Error::Step { .. } => "step",
            Error::Tag { .. } => "tag",
            Error::Script(_) => "script",
            Error::Xml(_) => "xml",
        }
    }

    /// The whole causal chain joined into one line.
    pub fn chain(&self) -> String {
        let mut parts = vec![self.to_string()];
        let mut src = std::error::Error::source(self);
        while let Some(e) = src {
            parts.push(e.to_string());
            src = e.source();
        }
        parts.join(": ")
    }
}
