//! Template text → [`Template`] tree.
//!
//! Two layers:
//!
//! 1. **Tags.**  An Aho-Corasick pass finds every `<c:` / `</c:` candidate,
//!    then an anchored regex reads the tag.  Open tags are kept on a stack;
//!    balance is strict.
//! 2. **Placeholders.**  The text between tags goes through a small state
//!    machine:
//!
//! | State | Input | Next |
//! |-------|-------|------|
//! | outside | `$` or `#` | entering |
//! | outside | `\${` / `\#{` | outside, emits the pilot and `{` literally |
//! | entering | `{` | inside |
//! | entering | other | outside, pilot kept as text |
//! | inside | `}` at depth 0, outside quotes | outside, emits an expression |
//!
//! Unterminated sequences at end of input are kept as literal text.

use std::sync::{Arc, LazyLock};

use aho_corasick::AhoCorasick;
use dashmap::DashMap;
use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use super::ast::{ExprNode, Node, TagNode, Template};
use super::tags::{check_branches, TagKind, TagDef};
use crate::config::EngineConfig;
use crate::error::{Error, ParseError};

/// Build-time settings for one template.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub prefix: String,
    pub strip_comments: bool,
    pub default_extension: String,
    pub uri: Option<String>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions::from_config(&EngineConfig::default(), None)
    }
}

impl ParseOptions {
    pub fn from_config(config: &EngineConfig, uri: Option<&str>) -> Self {
        ParseOptions {
            prefix: config.tag_prefix.clone(),
            strip_comments: config.strip_comments,
            default_extension: config.default_extension.clone(),
            uri: uri.map(str::to_owned),
        }
    }

    fn error(&self, message: impl Into<String>, line: usize) -> Error {
        ParseError::new(message, line).with_uri(self.uri.as_deref()).into()
    }
}

// ── Placeholders ──────────────────────────────────────────────────────────────

enum State {
    Outside,
    Entering { pilot: char },
    Inside { deferred: bool, start: usize, line: usize, depth: usize, quote: Option<char> },
}

/// Parse placeholders only; tags are left as literal text.
pub fn parse_text(text: &str, line: usize, uri: Option<&str>) -> Result<Template, Error> {
    let mut nodes = Vec::new();
    push_placeholders(text, line, uri, &mut nodes)?;
    Ok(Template::new(uri.map(str::to_owned), nodes))
}

fn push_literal(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    match nodes.last_mut() {
        Some(Node::Literal(prev)) => prev.push_str(text),
        _ => nodes.push(Node::Literal(text.to_owned())),
    }
}

fn push_placeholders(text: &str, mut line: usize, uri: Option<&str>, nodes: &mut Vec<Node>) -> Result<(), Error> {
    let mut state = State::Outside;
    let mut lit = String::new();
    let mut escaped = false;
    let mut chars = text.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        state = match state {
            State::Outside => match ch {
                '\\' if matches!(chars.peek(), Some((_, '$' | '#'))) && text[i + 1..].chars().nth(1) == Some('{') => {
                    if let Some((_, pilot)) = chars.next() {
                        lit.push(pilot);
                    }
                    State::Outside
                }
                '$' | '#' => State::Entering { pilot: ch },
                _ => {
                    lit.push(ch);
                    State::Outside
                }
            },
            State::Entering { pilot } => match ch {
                '{' => {
                    push_literal(nodes, &std::mem::take(&mut lit));
                    State::Inside { deferred: pilot == '#', start: i + 1, line, depth: 0, quote: None }
                }
                '$' | '#' => {
                    lit.push(pilot);
                    State::Entering { pilot: ch }
                }
                _ => {
                    lit.push(pilot);
                    lit.push(ch);
                    State::Outside
                }
            },
            State::Inside { deferred, start, line: at, depth, quote } => {
                if escaped {
                    escaped = false;
                    State::Inside { deferred, start, line: at, depth, quote }
                } else {
                    match (ch, quote) {
                        ('\\', Some(_)) => {
                            escaped = true;
                            State::Inside { deferred, start, line: at, depth, quote }
                        }
                        (c, Some(q)) if c == q => State::Inside { deferred, start, line: at, depth, quote: None },
                        (_, Some(_)) => State::Inside { deferred, start, line: at, depth, quote },
                        ('\'' | '"', None) => State::Inside { deferred, start, line: at, depth, quote: Some(ch) },
                        ('{', None) => State::Inside { deferred, start, line: at, depth: depth + 1, quote },
                        ('}', None) if depth > 0 => State::Inside { deferred, start, line: at, depth: depth - 1, quote },
                        ('}', None) => {
                            let source = &text[start..i];
                            if source.trim().is_empty() {
                                return Err(ParseError::new("empty expression", at).with_uri(uri).into());
                            }
                            nodes.push(Node::Expression(ExprNode::new(source, deferred, at)));
                            State::Outside
                        }
                        _ => State::Inside { deferred, start, line: at, depth, quote },
                    }
                }
            }
        };
        if ch == '\n' {
            line += 1;
        }
    }

    match state {
        State::Outside => {}
        State::Entering { pilot } => lit.push(pilot),
        State::Inside { deferred, start, .. } => {
            lit.push(if deferred { '#' } else { '$' });
            lit.push('{');
            lit.push_str(&text[start..]);
        }
    }
    push_literal(nodes, &lit);
    Ok(())
}

// ── Comments ──────────────────────────────────────────────────────────────────

/// Remove `<!-- … -->`, keeping the newlines so line numbers stay right.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<!--") {
        let Some(close) = rest[open + 4..].find("-->") else { break };
        out.push_str(&rest[..open]);
        let comment = &rest[open..open + 4 + close + 3];
        out.extend(comment.chars().filter(|&c| c == '\n'));
        rest = &rest[open + 4 + close + 3..];
    }
    out.push_str(rest);
    out
}

// ── Tag scanning ──────────────────────────────────────────────────────────────

struct TagScanner {
    finder: AhoCorasick,
    open: Regex,
    close: Regex,
    attr: Regex,
}

static SCANNERS: LazyLock<DashMap<String, Arc<TagScanner>>> = LazyLock::new(DashMap::new);

fn scanner(prefix: &str) -> Result<Arc<TagScanner>, Error> {
    if let Some(s) = SCANNERS.get(prefix) {
        return Ok(s.clone());
    }
    let p = regex::escape(prefix);
    let build = |re: String| Regex::new(&re).map_err(|e| Error::Syntax(format!("tag prefix '{prefix}': {e}")));
    let scanner = Arc::new(TagScanner {
        finder: AhoCorasick::new([format!("<{prefix}:"), format!("</{prefix}:")]),
        open: build(format!(
            r#"^<{p}:([A-Za-z]+)((?:\s+[A-Za-z_][\w:.-]*\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#
        ))?,
        close: build(format!(r"^</{p}:([A-Za-z]+)\s*>"))?,
        attr: build(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#.to_owned())?,
    });
    SCANNERS.insert(prefix.to_owned(), scanner.clone());
    Ok(scanner)
}

fn unescape_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_owned();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn parse_attrs(re: &Regex, src: &str) -> IndexMap<String, String> {
    re.captures_iter(src)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_owned(), unescape_entities(value))
        })
        .collect()
}

/// A tag still waiting for its close.
struct Open {
    def: TagDef,
    nodes: Vec<Node>,
}

/// Parse a full template: tags and placeholders.
pub fn parse_template(text: &str, opts: &ParseOptions) -> Result<Template, Error> {
    let stripped;
    let text = if opts.strip_comments && text.contains("<!--") {
        stripped = strip_comments(text);
        stripped.as_str()
    } else {
        text
    };
    let scanner = scanner(&opts.prefix)?;
    let uri = opts.uri.as_deref();

    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut pos = 0usize;
    let mut line = 1usize;

    let line_at = |from: usize, to: usize, line: usize| line + text[from..to].bytes().filter(|&b| b == b'\n').count();

    for m in scanner.finder.find_iter(text) {
        let at = m.start();
        if at < pos {
            // inside a raw script body already consumed
            continue;
        }

        // Text before the tag.
        let segment = &text[pos..at];
        append_text(segment, line, &mut stack, &mut root, opts)?;
        line = line_at(pos, at, line);
        let rest = &text[at..];

        if m.pattern() == 1 {
            let caps = scanner
                .close
                .captures(rest)
                .ok_or_else(|| opts.error("malformed closing tag", line))?;
            let name = &caps[1];
            let Some(open) = stack.pop() else {
                return Err(opts.error(format!("unexpected </{}:{name}>", opts.prefix), line));
            };
            if open.def.kind.name() != name {
                return Err(opts.error(
                    format!("mismatched </{}:{name}>, expected </{}>", opts.prefix, open.def.qname),
                    line,
                ));
            }
            let node = close(open, opts)?;
            push_node(node, &mut stack, &mut root);
            let end = at + caps[0].len();
            line = line_at(at, end, line);
            pos = end;
            continue;
        }

        let caps = scanner
            .open
            .captures(rest)
            .ok_or_else(|| opts.error("malformed tag", line))?;
        let name = &caps[1];
        let kind = TagKind::from_name(name)
            .ok_or_else(|| opts.error(format!("unknown tag <{}:{name}>", opts.prefix), line))?;
        if let Some(parent) = stack.last() {
            if !parent.def.kind.allows_body() {
                return Err(opts.error(format!("<{}> cannot contain tags", parent.def.qname), line));
            }
        }
        if kind.is_branch() && stack.last().map(|o| o.def.kind) != Some(TagKind::Choose) {
            return Err(opts.error(format!("<{}:{name}> outside <{}:choose>", opts.prefix, opts.prefix), line));
        }
        let self_closing = !caps[3].is_empty();
        let def = TagDef::open(kind, format!("{}:{name}", opts.prefix), parse_attrs(&scanner.attr, &caps[2]), line);
        let tag_end = at + caps[0].len();

        if self_closing {
            let node = close(Open { def, nodes: Vec::new() }, opts)
                .map(|n| match n {
                    Node::Tag(mut t) => {
                        t.body = None;
                        Node::Tag(t)
                    }
                    other => other,
                })?;
            push_node(node, &mut stack, &mut root);
            line = line_at(at, tag_end, line);
            pos = tag_end;
        } else if kind.raw_body() {
            let close_tag = format!("</{}:{name}", opts.prefix);
            let body_end = text[tag_end..]
                .find(&close_tag)
                .map(|i| tag_end + i)
                .ok_or_else(|| opts.error(format!("unclosed <{}>", def.qname), line))?;
            let close_caps = scanner
                .close
                .captures(&text[body_end..])
                .ok_or_else(|| opts.error("malformed closing tag", line_at(at, body_end, line)))?;
            let mut def = def;
            let body = &text[tag_end..body_end];
            def.normalize(opts, Some(body))?;
            let node = Node::Tag(TagNode {
                def,
                body: Some(Template::new(opts.uri.clone(), vec![Node::Literal(body.to_owned())])),
            });
            push_node(node, &mut stack, &mut root);
            let end = body_end + close_caps[0].len();
            line = line_at(at, end, line);
            pos = end;
        } else {
            stack.push(Open { def, nodes: Vec::new() });
            line = line_at(at, tag_end, line);
            pos = tag_end;
        }
    }

    append_text(&text[pos..], line, &mut stack, &mut root, opts)?;
    if let Some(open) = stack.last() {
        return Err(opts.error(format!("unclosed <{}>", open.def.qname), open.def.line));
    }
    debug!(uri = ?opts.uri, nodes = root.len(), "template parsed");
    Ok(Template::new(opts.uri.clone(), root))
}

fn append_text(
    segment: &str,
    line: usize,
    stack: &mut [Open],
    root: &mut Vec<Node>,
    opts: &ParseOptions,
) -> Result<(), Error> {
    if segment.is_empty() {
        return Ok(());
    }
    let target = match stack.last_mut() {
        Some(open) if !open.def.kind.allows_body() => {
            if !segment.trim().is_empty() {
                return Err(opts.error(format!("unexpected text inside <{}>", open.def.qname), line));
            }
            return Ok(());
        }
        Some(open) => &mut open.nodes,
        None => root,
    };
    push_placeholders(segment, line, opts.uri.as_deref(), target)
}

fn push_node(node: Node, stack: &mut [Open], root: &mut Vec<Node>) {
    match stack.last_mut() {
        Some(open) => open.nodes.push(node),
        None => root.push(node),
    }
}

fn close(open: Open, opts: &ParseOptions) -> Result<Node, Error> {
    let Open { mut def, mut nodes } = open;
    if def.kind == TagKind::Choose {
        nodes.retain(|n| matches!(n, Node::Tag(t) if t.def.kind.is_branch()));
        check_branches(
            nodes.iter().filter_map(|n| match n {
                Node::Tag(t) => Some((t.def.kind, t.def.line)),
                _ => None,
            }),
            opts,
        )?;
    }
    def.normalize(opts, None)?;
    Ok(Node::Tag(TagNode { def, body: Some(Template::new(opts.uri.clone(), nodes)) }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
