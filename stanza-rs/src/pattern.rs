//! Pattern matching behind the `=~` / `!~` (glob) and `=/` / `!/` (regex)
//! operators and the `matches()` builtin.
//!
//! | Mode | Syntax | Case |
//! |------|--------|------|
//! | [`MatchMode::Glob`]  | `*`, `?`, `[…]`, `[^…]`, `{a\|b}`, `\x` | always insensitive |
//! | [`MatchMode::Regex`] | [`regex`] crate syntax, unanchored | insensitive unless the pattern has an unescaped uppercase letter |
//!
//! Globs are translated to anchored regexes once.  Compiled patterns are kept
//! in a process-wide cache because template expressions re-evaluate the same
//! pattern text on every render.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchMode {
    Glob,
    Regex,
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("regex error: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("glob error: {0}")]
    InvalidGlob(String),
}

/// A compiled pattern.  Cloning is a reference-count bump.
#[derive(Debug, Clone)]
pub struct Pattern {
    src: Arc<str>,
    mode: MatchMode,
    re: Arc<Regex>,
}

/// Compiled patterns kept in the shared cache before it is reset.
const MAX_CACHED: usize = 1024;

static CACHE: LazyLock<DashMap<(MatchMode, String), Pattern>> = LazyLock::new(DashMap::new);

impl Pattern {
    pub fn new(src: &str, mode: MatchMode) -> Result<Self, PatternError> {
        let re = match mode {
            MatchMode::Regex => RegexBuilder::new(src)
                .case_insensitive(!has_unescaped_upper(src))
                .dot_matches_new_line(true)
                .build()?,
            MatchMode::Glob => RegexBuilder::new(&glob_to_regex(src)?)
                .case_insensitive(true)
                .dot_matches_new_line(true)
                .build()?,
        };
        Ok(Self { src: src.into(), mode, re: Arc::new(re) })
    }

    /// Compile through the shared cache.
    pub fn cached(src: &str, mode: MatchMode) -> Result<Self, PatternError> {
        let key = (mode, src.to_owned());
        if let Some(p) = CACHE.get(&key) {
            return Ok(p.clone());
        }
        let p = Pattern::new(src, mode)?;
        if CACHE.len() >= MAX_CACHED {
            CACHE.clear();
        }
        CACHE.insert(key, p.clone());
        Ok(p)
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// An empty pattern matches everything.
    pub fn matches(&self, text: &str) -> bool {
        self.src.is_empty() || self.re.is_match(text)
    }

    /// The whole match followed by each capture group (`""` when a group did
    /// not participate).  `None` when there is no match.
    pub fn captures(&self, text: &str) -> Option<Vec<String>> {
        let caps = self.re.captures(text)?;
        Some(
            caps.iter()
                .map(|m| m.map(|m| m.as_str().to_owned()).unwrap_or_default())
                .collect(),
        )
    }
}

/// Match `text` against `pattern`, compiling through the cache.
pub fn is_match(pattern: &str, text: &str, mode: MatchMode) -> Result<bool, PatternError> {
    Ok(Pattern::cached(pattern, mode)?.matches(text))
}

fn has_unescaped_upper(pattern: &str) -> bool {
    let mut escaped = false;
    let mut in_bracket = false;
    for ch in pattern.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '[' if !in_bracket => in_bracket = true,
            ']' if in_bracket => in_bracket = false,
            // Uppercase inside a class is a range bound, not a literal.
            c if !in_bracket && c.is_uppercase() => return true,
            _ => {}
        }
    }
    false
}

// ── Glob translation ──────────────────────────────────────────────────────────

fn glob_to_regex(glob: &str) -> Result<String, PatternError> {
    let mut out = String::with_capacity(glob.len() * 2 + 4);
    out.push_str("^(?:");
    let mut chars = glob.chars().peekable();
    let mut in_alt = false;
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(esc) => out.push_str(&regex::escape(&esc.to_string())),
                None => out.push_str(r"\\"),
            },
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for cc in chars.by_ref() {
                    if cc == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(cc, '[' | '\\' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(cc);
                }
                if !closed {
                    return Err(PatternError::InvalidGlob("unmatched '['".into()));
                }
                out.push(']');
            }
            '{' if !in_alt => {
                in_alt = true;
                out.push_str("(?:");
            }
            '{' => return Err(PatternError::InvalidGlob("nested '{'".into())),
            '|' if in_alt => out.push('|'),
            '}' if in_alt => {
                in_alt = false;
                out.push(')');
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    if in_alt {
        return Err(PatternError::InvalidGlob("unmatched '{'".into()));
    }
    out.push_str(")$");
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
