//! Template tree.
//!
//! A [`Template`] is immutable once built and is shared between renders (and
//! threads) through the URI cache.  The only interior mutability is the
//! compiled-expression slot of each [`ExprNode`], written at most once.

use std::sync::{Arc, OnceLock};

use super::tags::TagDef;
use crate::error::Error;
use crate::script::expr::{parse_expr, Expr};

#[derive(Debug)]
pub struct Template {
    /// Where the template came from; `None` for anonymous text.
    pub uri: Option<String>,
    pub nodes: Vec<Node>,
}

impl Template {
    pub fn new(uri: Option<String>, nodes: Vec<Node>) -> Self {
        Template { uri, nodes }
    }

    /// Number of nodes in the whole tree.
    pub fn node_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| match n {
                Node::Tag(t) => 1 + t.body.as_ref().map_or(0, Template::node_count),
                _ => 1,
            })
            .sum()
    }

    /// True when the template is only literal text.
    pub fn is_static(&self) -> bool {
        self.nodes.iter().all(|n| matches!(n, Node::Literal(_)))
    }
}

#[derive(Debug)]
pub enum Node {
    Literal(String),
    Expression(ExprNode),
    Tag(TagNode),
}

/// A `${…}` or `#{…}` placeholder.
#[derive(Debug)]
pub struct ExprNode {
    /// Text between the braces, untrimmed.
    pub source: String,
    /// `#{…}`: rendered back as `${…}` instead of evaluated.
    pub deferred: bool,
    pub line: usize,
    compiled: OnceLock<Arc<Expr>>,
}

impl ExprNode {
    pub fn new(source: impl Into<String>, deferred: bool, line: usize) -> Self {
        ExprNode { source: source.into(), deferred, line, compiled: OnceLock::new() }
    }

    /// The parsed expression, compiled on first use.
    pub fn compiled(&self) -> Result<Arc<Expr>, Error> {
        if let Some(expr) = self.compiled.get() {
            return Ok(expr.clone());
        }
        let expr = Arc::new(parse_expr(&self.source)?);
        Ok(self.compiled.get_or_init(|| expr).clone())
    }

    /// The text a deferred placeholder renders as.
    pub fn deferred_text(&self) -> String {
        format!("${{{}}}", self.source)
    }
}

#[derive(Debug)]
pub struct TagNode {
    pub def: TagDef,
    /// Inner content; `None` for a self-closing tag.
    pub body: Option<Template>,
}

impl TagNode {
    /// Inner nodes, empty for a self-closing tag.
    pub fn children(&self) -> &[Node] {
        self.body.as_ref().map_or(&[], |b| &b.nodes)
    }
}
