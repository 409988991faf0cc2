//! Event-mode renderer.
//!
//! The source is a well-formed XML document.  Elements whose prefix is the
//! configured tag prefix are tags; every other element is passed through to
//! the [`EventSink`] with its attributes and text expanded.
//!
//! Each source node keeps what it derives from itself in `OnceLock` slots:
//!
//! | Node | Memo |
//! |------|------|
//! | tag element | compiled [`TagDef`] (filled while parsing) |
//! | plain element | compiled attribute values |
//! | text | placeholder [`Template`] |
//! | `include` | resolved target and its parsed document |
//!
//! The slots are written at most once; a lost race just drops the duplicate.

use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use super::events::{Attribute, EventSink, RecordingSink};
use super::{
    bind_caught, bind_param, emit_log, eval_attr, eval_test, foreach_plan, include_target, round_scope,
    run_script, with_include, WhileGuard,
};
use crate::error::{Error, ParseError};
use crate::interp::Interp;
use crate::scope::Scope;
use crate::script::value::Value;
use crate::template::ast::Template;
use crate::template::parse::{parse_text, ParseOptions};
use crate::template::tags::{check_branches, AttrValue, TagKind, TagDef};

// ── Source tree ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct XmlDocument {
    pub uri: Option<String>,
    pub nodes: Vec<XmlNode>,
}

#[derive(Debug)]
pub enum XmlNode {
    Element(XmlElement),
    Text(XmlText),
}

#[derive(Debug)]
pub struct XmlElement {
    pub qname: String,
    pub prefix: Option<String>,
    pub local: String,
    /// Attributes as written, entity references resolved.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub line: usize,
    kind: Option<TagKind>,
    def: OnceLock<TagDef>,
    attr_values: OnceLock<Vec<AttrValue>>,
    include: OnceLock<(String, Arc<XmlDocument>)>,
}

#[derive(Debug)]
pub struct XmlText {
    pub text: String,
    pub line: usize,
    template: OnceLock<Template>,
}

impl XmlElement {
    fn new(qname: String, attrs: Vec<(String, String)>, line: usize, prefix: &str) -> Self {
        let (pfx, local) = match qname.split_once(':') {
            Some((p, l)) => (Some(p.to_owned()), l.to_owned()),
            None => (None, qname.clone()),
        };
        let kind = if pfx.as_deref() == Some(prefix) { TagKind::from_name(&local) } else { None };
        XmlElement {
            qname,
            prefix: pfx,
            local,
            attrs,
            children: Vec::new(),
            line,
            kind,
            def: OnceLock::new(),
            attr_values: OnceLock::new(),
            include: OnceLock::new(),
        }
    }

    /// The tag this element stands for, if it is one.
    pub fn tag_kind(&self) -> Option<TagKind> {
        self.kind
    }

    /// Concatenated text of the direct children.
    fn body_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                XmlNode::Text(t) => Some(t.text.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }
}

/// Fill `slot` from `build` unless it is already set.
fn memo<T>(slot: &OnceLock<T>, build: impl FnOnce() -> Result<T, Error>) -> Result<&T, Error> {
    if let Some(v) = slot.get() {
        return Ok(v);
    }
    let v = build()?;
    Ok(slot.get_or_init(|| v))
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn utf8(bytes: &[u8]) -> Result<String, Error> {
    std::str::from_utf8(bytes).map(str::to_owned).map_err(|e| Error::Xml(e.to_string()))
}

fn start_attrs(e: &BytesStart<'_>, err: impl Fn(String) -> Error) -> Result<Vec<(String, String)>, Error> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|x| err(x.to_string()))?;
        let value = attr.unescape_value().map_err(|x| err(x.to_string()))?;
        out.push((utf8(attr.key.as_ref())?, value.into_owned()));
    }
    Ok(out)
}

fn push_child(node: XmlNode, stack: &mut [XmlElement], root: &mut Vec<XmlNode>) {
    let target = match stack.last_mut() {
        Some(parent) => &mut parent.children,
        None => root,
    };
    if let (XmlNode::Text(new), Some(XmlNode::Text(prev))) = (&node, target.last_mut()) {
        prev.text.push_str(&new.text);
        return;
    }
    target.push(node);
}

/// Parse and validate an XML template.
pub fn parse_xml(text: &str, opts: &ParseOptions) -> Result<XmlDocument, Error> {
    let mut reader = Reader::from_str(text);
    let uri = opts.uri.as_deref();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Vec<XmlNode> = Vec::new();
    // (byte offset already counted, line at that offset)
    let mut counted = (0usize, 1usize);

    loop {
        let at = (reader.buffer_position() as usize).min(text.len());
        if at > counted.0 {
            counted.1 += text.as_bytes()[counted.0..at].iter().filter(|&&b| b == b'\n').count();
            counted.0 = at;
        }
        let line = counted.1;
        let err = |msg: String| -> Error { ParseError::new(msg, line).with_uri(uri).into() };
        let event = reader.read_event().map_err(|e| err(e.to_string()))?;
        match event {
            Event::Start(e) => {
                let qname = utf8(e.name().as_ref())?;
                let attrs = start_attrs(&e, err)?;
                stack.push(XmlElement::new(qname, attrs, line, &opts.prefix));
            }
            Event::Empty(e) => {
                let qname = utf8(e.name().as_ref())?;
                let attrs = start_attrs(&e, err)?;
                let el = XmlElement::new(qname, attrs, line, &opts.prefix);
                push_child(XmlNode::Element(el), &mut stack, &mut root);
            }
            Event::End(e) => {
                let qname = utf8(e.name().as_ref())?;
                let Some(mut el) = stack.pop() else {
                    return Err(err(format!("unexpected </{qname}>")));
                };
                if el.qname != qname {
                    return Err(err(format!("mismatched </{qname}>, expected </{}>", el.qname)));
                }
                if el.kind == Some(TagKind::Choose) {
                    el.children
                        .retain(|n| matches!(n, XmlNode::Element(c) if c.kind.is_some_and(TagKind::is_branch)));
                }
                push_child(XmlNode::Element(el), &mut stack, &mut root);
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|x| err(x.to_string()))?.into_owned();
                push_child(XmlNode::Text(XmlText { text, line, template: OnceLock::new() }), &mut stack, &mut root);
            }
            Event::CData(e) => {
                let text = utf8(&e.into_inner())?;
                push_child(XmlNode::Text(XmlText { text, line, template: OnceLock::new() }), &mut stack, &mut root);
            }
            Event::Eof => break,
            // comments, declarations, processing instructions, doctype
            _ => {}
        }
    }
    if let Some(open) = stack.last() {
        return Err(ParseError::new(format!("unclosed <{}>", open.qname), open.line).with_uri(uri).into());
    }

    validate(&root, None, opts)?;
    debug!(uri = ?opts.uri, nodes = root.len(), "xml template parsed");
    Ok(XmlDocument { uri: opts.uri.clone(), nodes: root })
}

/// Check tag structure and compile every tag's def.
fn validate(nodes: &[XmlNode], parent: Option<&XmlElement>, opts: &ParseOptions) -> Result<(), Error> {
    let err = |msg: String, line: usize| -> Error { ParseError::new(msg, line).with_uri(opts.uri.as_deref()).into() };
    for node in nodes {
        let XmlNode::Element(el) = node else { continue };
        if el.prefix.as_deref() == Some(opts.prefix.as_str()) && el.kind.is_none() {
            return Err(err(format!("unknown tag <{}>", el.qname), el.line));
        }
        if let Some(kind) = el.kind {
            let parent_kind = parent.and_then(|p| p.kind);
            if kind.is_branch() && parent_kind != Some(TagKind::Choose) {
                return Err(err(format!("<{}> outside <{}:choose>", el.qname, opts.prefix), el.line));
            }
            if !kind.allows_body() || kind.raw_body() {
                for child in &el.children {
                    match child {
                        XmlNode::Element(c) => {
                            return Err(err(format!("<{}> cannot contain elements", el.qname), c.line))
                        }
                        XmlNode::Text(t) if !kind.raw_body() && !t.text.trim().is_empty() => {
                            return Err(err(format!("unexpected text inside <{}>", el.qname), t.line))
                        }
                        XmlNode::Text(_) => {}
                    }
                }
            }
            if kind == TagKind::Choose {
                check_branches(
                    el.children.iter().filter_map(|n| match n {
                        XmlNode::Element(c) => c.kind.map(|k| (k, c.line)),
                        XmlNode::Text(_) => None,
                    }),
                    opts,
                )?;
            }
            let raw: IndexMap<String, String> = el.attrs.iter().cloned().collect();
            let mut def = TagDef::open(kind, el.qname.clone(), raw, el.line);
            let body = kind.raw_body().then(|| el.body_text());
            def.normalize(opts, body.as_deref())?;
            let _ = el.def.set(def);
        }
        validate(&el.children, Some(el), opts)?;
    }
    Ok(())
}

// ── Walking ───────────────────────────────────────────────────────────────────

/// In-scope namespace declarations, innermost last.
#[derive(Debug, Default)]
struct Namespaces {
    decls: Vec<(String, String)>,
}

impl Namespaces {
    /// Push the `xmlns` declarations among `attrs`; returns the mark to pop to.
    fn enter(&mut self, attrs: &[(String, String)]) -> usize {
        let mark = self.decls.len();
        for (name, value) in attrs {
            if name == "xmlns" {
                self.decls.push((String::new(), value.clone()));
            } else if let Some(p) = name.strip_prefix("xmlns:") {
                self.decls.push((p.to_owned(), value.clone()));
            }
        }
        mark
    }

    fn leave(&mut self, mark: usize) {
        self.decls.truncate(mark);
    }

    fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        let p = prefix.unwrap_or_default();
        self.decls
            .iter()
            .rev()
            .find(|(k, _)| k == p)
            .map(|(_, uri)| uri.as_str())
            .filter(|uri| !uri.is_empty())
    }
}

struct Walker<'s> {
    sink: &'s mut dyn EventSink,
    ns: Namespaces,
}

/// Render `doc` into `sink`.
pub fn emit_document(interp: &mut Interp, doc: &XmlDocument, sink: &mut dyn EventSink) -> Result<(), Error> {
    let mut walker = Walker { sink, ns: Namespaces::default() };
    walker.nodes(interp, &doc.nodes)
}

impl Walker<'_> {
    fn nodes(&mut self, interp: &mut Interp, nodes: &[XmlNode]) -> Result<(), Error> {
        for node in nodes {
            match node {
                XmlNode::Text(t) => self.text(interp, t)?,
                XmlNode::Element(el) => match el.kind {
                    Some(_) => self.tag(interp, el)?,
                    None => self.element(interp, el)?,
                },
            }
        }
        Ok(())
    }

    fn nodes_in(&mut self, interp: &mut Interp, scope: Scope, nodes: &[XmlNode]) -> Result<(), Error> {
        interp.with_scope(scope, |i| self.nodes(i, nodes))
    }

    fn nodes_child(&mut self, interp: &mut Interp, nodes: &[XmlNode]) -> Result<(), Error> {
        let scope = interp.scope().child();
        self.nodes_in(interp, scope, nodes)
    }

    /// Run `f` with the sink swapped for a fresh recording.
    fn recorded(
        &mut self,
        interp: &mut Interp,
        f: impl FnOnce(&mut Walker<'_>, &mut Interp) -> Result<(), Error>,
    ) -> (RecordingSink, Result<(), Error>) {
        let mut rec = RecordingSink::new();
        let mut inner = Walker { sink: &mut rec, ns: Namespaces { decls: self.ns.decls.clone() } };
        let result = f(&mut inner, interp);
        (rec, result)
    }

    fn text(&mut self, interp: &mut Interp, node: &XmlText) -> Result<(), Error> {
        let uri = interp_uri(interp);
        let template = memo(&node.template, || parse_text(&node.text, node.line, uri.as_deref()))?;
        if template.is_static() {
            return self.sink.characters(&node.text);
        }
        let mut out = String::new();
        super::text::render_nodes(interp, &template.nodes, &mut out)?;
        self.sink.characters(&out)
    }

    fn element(&mut self, interp: &mut Interp, el: &XmlElement) -> Result<(), Error> {
        let uri = interp_uri(interp);
        let compiled = memo(&el.attr_values, || {
            el.attrs
                .iter()
                .map(|(_, raw)| AttrValue::compile(raw, el.line, uri.as_deref()))
                .collect()
        })?;
        let mark = self.ns.enter(&el.attrs);
        let result = self.element_inner(interp, el, compiled);
        self.ns.leave(mark);
        result
    }

    fn element_inner(&mut self, interp: &mut Interp, el: &XmlElement, compiled: &[AttrValue]) -> Result<(), Error> {
        let mut attrs = Vec::with_capacity(el.attrs.len());
        for ((qname, _), value) in el.attrs.iter().zip(compiled) {
            let value = eval_attr(interp, value)?.to_string();
            let (prefix, local) = match qname.split_once(':') {
                Some((p, l)) => (Some(p), l),
                None => (None, qname.as_str()),
            };
            let ns = match prefix {
                Some("xmlns") | None => None,
                Some(p) => self.ns.resolve(Some(p)).map(str::to_owned),
            };
            attrs.push(Attribute { ns, local: local.to_owned(), qname: qname.clone(), value });
        }
        let ns = self.ns.resolve(el.prefix.as_deref()).map(str::to_owned);
        self.sink.start_element(ns.as_deref(), &el.local, &el.qname, &attrs)?;
        self.nodes(interp, &el.children)?;
        self.sink.end_element(ns.as_deref(), &el.local, &el.qname)
    }

    fn tag(&mut self, interp: &mut Interp, el: &XmlElement) -> Result<(), Error> {
        let Some(def) = el.def.get() else {
            return Err(Error::type_error(format!("<{}> was not validated", el.qname)));
        };
        let own = |e: Error| e.in_tag(&def.qname);

        match def.kind {
            TagKind::If => {
                if eval_test(interp, def).map_err(own)? {
                    self.nodes_child(interp, &el.children)?;
                }
                Ok(())
            }
            TagKind::While => {
                let mut guard = WhileGuard::new(interp, def).map_err(own)?;
                let var = def.attr("var").and_then(AttrValue::as_const);
                while eval_test(interp, def).map_err(own)? {
                    let status = guard.advance().map_err(own)?;
                    let scope = interp.scope().child();
                    if let Some(var) = var {
                        scope.set(var, Value::Map(status));
                    }
                    self.nodes_in(interp, scope, &el.children)?;
                }
                Ok(())
            }
            TagKind::Foreach => {
                let var = def.attr("var").and_then(AttrValue::as_const);
                for round in foreach_plan(interp, def).map_err(own)? {
                    let scope = round_scope(interp, def, var.map(|v| (v, round.item)), Some(round.status));
                    self.nodes_in(interp, scope, &el.children)?;
                }
                Ok(())
            }
            TagKind::Choose => {
                for node in &el.children {
                    let XmlNode::Element(branch) = node else { continue };
                    let Some(bdef) = branch.def.get() else { continue };
                    let taken = match bdef.kind {
                        TagKind::When => eval_test(interp, bdef).map_err(|e| e.in_tag(&bdef.qname))?,
                        _ => true,
                    };
                    if taken {
                        return self.nodes_child(interp, &branch.children);
                    }
                }
                Ok(())
            }
            TagKind::When | TagKind::Otherwise => Err(own(Error::type_error("branch outside <choose>"))),
            TagKind::Catch => {
                let (rec, result) = self.recorded(interp, |w, i| w.nodes_child(i, &el.children));
                match result {
                    Ok(()) => rec.replay(self.sink)?,
                    Err(e) => bind_caught(interp, def, &e),
                }
                Ok(())
            }
            TagKind::Include => {
                let target = include_target(interp, def).map_err(own)?;
                let doc = match el.include.get() {
                    Some((uri, doc)) if *uri == target => doc.clone(),
                    _ => {
                        let doc = interp.engine().xml_document(&target).map_err(own)?;
                        let _ = el.include.set((target.clone(), doc.clone()));
                        doc
                    }
                };
                with_include(interp, target, |i| self.nodes(i, &doc.nodes))
            }
            TagKind::Log => {
                let (rec, result) = self.recorded(interp, |w, i| w.nodes_child(i, &el.children));
                result?;
                emit_log(interp, def, rec.text()).map_err(own)
            }
            TagKind::Script => {
                if let Some(text) = run_script(interp, def).map_err(own)? {
                    self.sink.characters(&text)?;
                }
                Ok(())
            }
            TagKind::Param => {
                let text = bind_param(interp, def).map_err(own)?;
                self.sink.characters(&text)
            }
            TagKind::Comment => Ok(()),
        }
    }
}

fn interp_uri(interp: &Interp) -> Option<String> {
    interp.includes.last().cloned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
