//! The closed tag vocabulary and per-tag compiled state.
//!
//! | Tag | Attributes (required in **bold**) | Body |
//! |-----|-----------------------------------|------|
//! | `if` | **test** | yes |
//! | `while` | **test**, var, max | yes |
//! | `foreach` | items, var, varStatus, begin, end, step | yes |
//! | `choose` | | `when` / `otherwise` only |
//! | `when` | **test** | yes, inside `choose` |
//! | `otherwise` | | yes, inside `choose` |
//! | `catch` | var | yes |
//! | `include` | **page** | no |
//! | `log` | level | yes |
//! | `script` | lang, public, output | raw text |
//! | `param` | **name**, **value** | no |
//! | `comment` | | yes |
//!
//! A [`TagDef`] is created with raw string attributes when its open tag is
//! seen, then [`normalize`](TagDef::normalize)d exactly once when it closes.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use super::ast::{Node, Template};
use super::loader::{resolve_relative, with_default_extension};
use super::parse::{parse_text, ParseOptions};
use crate::error::{Error, ParseError};
use crate::lua::Chunk;
use crate::script::expr::{parse_expr, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    If,
    While,
    Foreach,
    Choose,
    When,
    Otherwise,
    Catch,
    Include,
    Log,
    Script,
    Param,
    Comment,
}

impl TagKind {
    pub const ALL: [TagKind; 12] = [
        TagKind::If,
        TagKind::While,
        TagKind::Foreach,
        TagKind::Choose,
        TagKind::When,
        TagKind::Otherwise,
        TagKind::Catch,
        TagKind::Include,
        TagKind::Log,
        TagKind::Script,
        TagKind::Param,
        TagKind::Comment,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        TagKind::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            TagKind::If => "if",
            TagKind::While => "while",
            TagKind::Foreach => "foreach",
            TagKind::Choose => "choose",
            TagKind::When => "when",
            TagKind::Otherwise => "otherwise",
            TagKind::Catch => "catch",
            TagKind::Include => "include",
            TagKind::Log => "log",
            TagKind::Script => "script",
            TagKind::Param => "param",
            TagKind::Comment => "comment",
        }
    }

    /// False for tags that must not contain text or other tags.
    pub fn allows_body(self) -> bool {
        !matches!(self, TagKind::Include | TagKind::Param)
    }

    /// Body is taken verbatim, without placeholder or tag recognition.
    pub fn raw_body(self) -> bool {
        self == TagKind::Script
    }

    /// Only legal as a direct child of `choose`.
    pub fn is_branch(self) -> bool {
        matches!(self, TagKind::When | TagKind::Otherwise)
    }

    pub fn required(self) -> &'static [&'static str] {
        match self {
            TagKind::If | TagKind::While | TagKind::When => &["test"],
            TagKind::Include => &["page"],
            TagKind::Param => &["name", "value"],
            _ => &[],
        }
    }

    pub fn known(self) -> &'static [&'static str] {
        match self {
            TagKind::If | TagKind::When => &["test"],
            TagKind::While => &["test", "var", "max"],
            TagKind::Foreach => &["items", "var", "varStatus", "begin", "end", "step"],
            TagKind::Catch => &["var"],
            TagKind::Include => &["page"],
            TagKind::Log => &["level"],
            TagKind::Script => &["lang", "public", "output"],
            TagKind::Param => &["name", "value"],
            TagKind::Choose | TagKind::Otherwise | TagKind::Comment => &[],
        }
    }
}

// ── Attribute values ──────────────────────────────────────────────────────────

/// A compiled attribute.
#[derive(Debug)]
pub enum AttrValue {
    /// Plain text.
    Const(String),
    /// Exactly one `${…}`: evaluates to a typed value.
    Expr { source: String, expr: Arc<Expr> },
    /// Text mixed with placeholders: renders to a string.
    Interp(Template),
}

impl AttrValue {
    pub fn compile(raw: &str, line: usize, uri: Option<&str>) -> Result<Self, Error> {
        let mut template = parse_text(raw, line, uri)?;
        if template.is_static() {
            return Ok(AttrValue::Const(raw.to_owned()));
        }
        if let [Node::Expression(e)] = template.nodes.as_slice() {
            if !e.deferred {
                let expr = Arc::new(parse_expr(&e.source).map_err(|err| locate(err, line, uri))?);
                return Ok(AttrValue::Expr { source: e.source.trim().to_owned(), expr });
            }
        }
        for node in &template.nodes {
            if let Node::Expression(e) = node {
                e.compiled().map_err(|err| locate(err, line, uri))?;
            }
        }
        template.uri = uri.map(str::to_owned);
        Ok(AttrValue::Interp(template))
    }

    pub fn as_const(&self) -> Option<&str> {
        match self {
            AttrValue::Const(s) => Some(s),
            _ => None,
        }
    }
}

fn locate(err: Error, line: usize, uri: Option<&str>) -> Error {
    match err {
        Error::Syntax(msg) => ParseError::new(msg, line).with_uri(uri).into(),
        other => other,
    }
}

// ── TagDef ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TagDef {
    pub kind: TagKind,
    /// Qualified name as written, e.g. `c:if`.
    pub qname: String,
    pub line: usize,
    raw: IndexMap<String, String>,
    attrs: IndexMap<String, AttrValue>,
    script: Option<Chunk>,
}

impl TagDef {
    pub fn open(kind: TagKind, qname: impl Into<String>, raw: IndexMap<String, String>, line: usize) -> Self {
        TagDef {
            kind,
            qname: qname.into(),
            line,
            raw,
            attrs: IndexMap::new(),
            script: None,
        }
    }

    pub fn raw_attr(&self, name: &str) -> Option<&str> {
        self.raw.get(name).map(String::as_str)
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn script(&self) -> Option<&Chunk> {
        self.script.as_ref()
    }

    fn error(&self, message: impl Into<String>, opts: &ParseOptions) -> Error {
        ParseError::new(message, self.line).with_uri(opts.uri.as_deref()).into()
    }

    /// Check and compile the attributes.  `body` is the raw text of a
    /// `script` tag.
    pub fn normalize(&mut self, opts: &ParseOptions, body: Option<&str>) -> Result<(), Error> {
        for req in self.kind.required() {
            if !self.raw.contains_key(*req) {
                return Err(self.error(format!("<{}> requires attribute '{req}'", self.qname), opts));
            }
        }
        for name in self.raw.keys() {
            if !self.kind.known().contains(&name.as_str()) {
                warn!(tag = %self.qname, attribute = %name, line = self.line, "ignoring unknown attribute");
            }
        }

        let uri = opts.uri.as_deref();
        let mut attrs = IndexMap::with_capacity(self.raw.len());
        for (name, raw) in &self.raw {
            attrs.insert(name.clone(), AttrValue::compile(raw, self.line, uri)?);
        }
        self.attrs = attrs;

        match self.kind {
            TagKind::Script => {
                let lang = self.raw_attr("lang").unwrap_or("lua");
                if !lang.eq_ignore_ascii_case("lua") {
                    return Err(self.error(format!("unsupported script language '{lang}'"), opts));
                }
                let name = match uri {
                    Some(u) => format!("{u}:{}", self.line),
                    None => format!("script:{}", self.line),
                };
                let chunk = Chunk::compile(&name, body.unwrap_or_default())
                    .map_err(|e| self.error(e.to_string(), opts))?;
                self.script = Some(chunk);
            }
            TagKind::Include => {
                if let (Some(page), Some(uri)) = (self.attr("page").and_then(AttrValue::as_const), uri) {
                    let target = with_default_extension(&resolve_relative(Some(uri), page), &opts.default_extension);
                    if target == uri {
                        return Err(Error::CircularInclude { chain: format!("{uri} -> {target}") });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Ordering rules for the children of `choose`: any number of `when`, then at
/// most one `otherwise`, last.
pub fn check_branches(
    branches: impl IntoIterator<Item = (TagKind, usize)>,
    opts: &ParseOptions,
) -> Result<(), Error> {
    let mut otherwise_line = None;
    for (kind, line) in branches {
        match (kind, otherwise_line) {
            (TagKind::Otherwise, Some(_)) => {
                return Err(ParseError::new("more than one <otherwise> in <choose>", line)
                    .with_uri(opts.uri.as_deref())
                    .into())
            }
            (TagKind::When, Some(_)) => {
                return Err(ParseError::new("<when> after <otherwise> in <choose>", line)
                    .with_uri(opts.uri.as_deref())
                    .into())
            }
            (TagKind::Otherwise, None) => otherwise_line = Some(line),
            _ => {}
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn def(kind: TagKind, attrs: &[(&str, &str)]) -> TagDef {
        let raw = attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        TagDef::open(kind, format!("c:{}", kind.name()), raw, 1)
    }

    #[test]
    fn names_round_trip() {
        for kind in TagKind::ALL {
            assert_eq!(TagKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(TagKind::from_name("forEach"), None);
    }

    #[test]
    fn attribute_classification() {
        assert!(matches!(AttrValue::compile("plain", 1, None).unwrap(), AttrValue::Const(s) if s == "plain"));
        assert!(matches!(AttrValue::compile("${a + 1}", 1, None).unwrap(), AttrValue::Expr { source, .. } if source == "a + 1"));
        assert!(matches!(AttrValue::compile("n=${a}", 1, None).unwrap(), AttrValue::Interp(_)));
        assert!(matches!(AttrValue::compile("#{a}", 1, None).unwrap(), AttrValue::Interp(_)));
    }

    #[test]
    fn bad_attribute_expression_is_a_parse_error() {
        let err = AttrValue::compile("${a +}", 4, Some("p.tpl")).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError { line: 4, .. })));
    }

    #[test]
    fn missing_required_attribute() {
        let mut s = def(TagKind::If, &[]);
        let err = s.normalize(&ParseOptions::default(), None).unwrap_err();
        assert!(err.to_string().contains("requires attribute 'test'"), "{err}");
    }

    #[test]
    fn direct_self_include_is_detected() {
        let opts = ParseOptions { uri: Some("pages/home.tpl".into()), ..ParseOptions::default() };
        let mut s = def(TagKind::Include, &[("page", "home")]);
        assert!(matches!(s.normalize(&opts, None), Err(Error::CircularInclude { .. })));
        let mut s = def(TagKind::Include, &[("page", "other")]);
        assert!(s.normalize(&opts, None).is_ok());
    }

    #[test]
    fn branch_order() {
        let opts = ParseOptions::default();
        assert!(check_branches([(TagKind::When, 1), (TagKind::Otherwise, 2)], &opts).is_ok());
        assert!(check_branches([(TagKind::Otherwise, 1), (TagKind::When, 2)], &opts).is_err());
        assert!(check_branches([(TagKind::Otherwise, 1), (TagKind::Otherwise, 2)], &opts).is_err());
    }

    #[test]
    fn unsupported_script_language() {
        let mut s = def(TagKind::Script, &[("lang", "python")]);
        assert!(s.normalize(&ParseOptions::default(), Some("x = 1")).is_err());
    }
}
