//! Steps: semicolon-separated expression statements stored on a scope.
//!
//! Source text registered under `$$name` runs as a little procedure when
//! `receiver.name(args)` is invoked:
//!
//! ```text
//! # comment lines are dropped
//! total = $1 + $2;
//! return(total * factor)
//! ```
//!
//! Lines are rejoined with spaces and split on `;` outside quotes and
//! brackets.  Each statement runs in one fresh child frame of the receiver
//! binding `$functionName`, `$1..$n` and `$args`.  A statement containing a
//! placeholder is text-expanded before it is evaluated; a `return` inside one
//! of its placeholders ends the whole sequence.  Expanded text is parsed
//! afresh each time and never enters the engine's expression cache.

use std::sync::Arc;

use tracing::debug;

use crate::error::Error;
use crate::flow::{Outcome, Signal};
use crate::interp::{describe_scope, Interp};
use crate::render::text::render_nodes;
use crate::scope::Scope;
use crate::script::expr::parse_expr;
use crate::script::value::Value;
use crate::template::ast::Node;
use crate::template::parse::parse_text;

/// Split steps source into trimmed, non-empty statements.
pub fn split_statements(source: &str) -> Vec<String> {
    let joined = source
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut chars = joined.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote.is_some() => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                continue;
            }
            c if quote == Some(c) => quote = None,
            '\'' | '"' if quote.is_none() => quote = Some(ch),
            '(' | '[' | '{' if quote.is_none() => depth += 1,
            ')' | ']' | '}' if quote.is_none() => depth = depth.saturating_sub(1),
            ';' if quote.is_none() && depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Run steps `source` as `receiver.name(args)`.
///
/// A `return` stops the sequence and yields its value; otherwise the value of
/// the last statement is the result.
pub fn run(interp: &mut Interp, receiver: &Scope, name: &str, source: &str, args: Vec<Value>) -> Outcome {
    let statements: Arc<[String]> = interp.engine().statements(source);
    debug!(name, count = statements.len(), "running steps");

    let frame = receiver.child();
    frame.set("$functionName", Value::from(name));
    for (i, arg) in args.iter().enumerate() {
        frame.set(format!("${}", i + 1), arg.clone());
    }
    frame.set("$args", Value::list(args));

    let result: Outcome = interp.with_frame(frame.clone(), |interp| {
        interp.with_scope(frame, |interp| {
            let mut last = Value::Null;
            for (idx, statement) in statements.iter().enumerate() {
                last = run_statement(interp, statement).map_err(|sig| {
                    sig.map_error(|e| Error::Step {
                        index: idx + 1,
                        statement: statement.clone(),
                        receiver: describe_scope(receiver),
                        name: name.to_owned(),
                        source: Box::new(e),
                    })
                })?;
            }
            Ok(last)
        })
    });

    match result {
        Err(Signal::Return(v)) => Ok(v),
        other => other,
    }
}

fn run_statement(interp: &mut Interp, statement: &str) -> Outcome {
    if statement.contains("${") || statement.contains("#{") {
        let expanded = expand_statement(interp, statement)?;
        let expr = parse_expr(&expanded)?;
        interp.eval(&expr)
    } else {
        interp.eval_str(statement)
    }
}

/// Text-expand one statement, letting `Signal::Return` through.
fn expand_statement(interp: &mut Interp, statement: &str) -> Outcome<String> {
    let template = parse_text(statement, 1, None)?;
    let mut out = String::new();
    for node in &template.nodes {
        match node {
            Node::Expression(e) if !e.deferred => {
                let expr = e.compiled()?;
                let value = interp.eval(&expr).map_err(|sig| sig.map_error(|err| err.in_expr(e.source.trim())))?;
                out.push_str(&value.to_string());
            }
            other => render_nodes(interp, std::slice::from_ref(other), &mut out)?,
        }
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
