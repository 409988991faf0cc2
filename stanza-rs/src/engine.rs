//! The public entry point.
//!
//! An [`Engine`] owns the configuration, the resource loader and the shared
//! caches.  It is cheap to clone and can be shared between threads; every
//! evaluation or render builds its own [`Interp`].
//!
//! | Surface | Methods |
//! |---------|---------|
//! | expressions | [`eval`](Engine::eval), [`compile`](Engine::compile) |
//! | steps | [`run_steps`](Engine::run_steps) |
//! | text templates | [`expand_text`](Engine::expand_text), [`expand_uri`](Engine::expand_uri), [`build_template`](Engine::build_template), [`template`](Engine::template), [`render_with`](Engine::render_with) |
//! | XML event output | [`emit_xml`](Engine::emit_xml), [`emit_uri`](Engine::emit_uri), [`xml_document`](Engine::xml_document) |

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, LoadError};
use crate::flow;
use crate::interp::{Interp, LogRecord};
use crate::render::events::EventSink;
use crate::render::text::render_template;
use crate::render::xml::{self, parse_xml, XmlDocument};
use crate::scope::Scope;
use crate::script::expr::{parse_expr, Expr};
use crate::script::value::Value;
use crate::steps::{self, split_statements};
use crate::template::ast::Template;
use crate::template::cache::UriCache;
use crate::template::loader::{file_loader, resolve_relative, with_default_extension, ResourceLoader};
use crate::template::parse::{parse_template, ParseOptions};

/// Entries kept in each expression and statement cache before it is reset.
pub const MAX_CACHED: usize = 4096;

/// Settings for one [`Engine::render_with`] call.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Read-only names resolved before anything in scope.
    pub roots: IndexMap<String, Value>,
}

/// Result of [`Engine::render_with`].
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub text: String,
    /// Messages from `log` tags, in order.
    pub log: Vec<LogRecord>,
}

struct EngineInner {
    config: EngineConfig,
    loader: ResourceLoader,
    templates: UriCache<Template>,
    documents: UriCache<XmlDocument>,
    exprs: DashMap<String, Arc<Expr>>,
    statements: DashMap<String, Arc<[String]>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

fn no_loader() -> ResourceLoader {
    Arc::new(|_: &str| Err(LoadError::NotFound))
}

impl Engine {
    /// An engine reading templates from `config.template_root`, if set.
    pub fn new(config: EngineConfig) -> Self {
        let loader = match &config.template_root {
            Some(root) => file_loader(root.clone()),
            None => no_loader(),
        };
        Self::build(config, loader)
    }

    fn build(config: EngineConfig, loader: ResourceLoader) -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                config,
                loader,
                templates: UriCache::new(),
                documents: UriCache::new(),
                exprs: DashMap::new(),
                statements: DashMap::new(),
            }),
        }
    }

    /// Same configuration, different loader and fresh caches.
    pub fn with_loader(self, loader: ResourceLoader) -> Self {
        Self::build(self.inner.config.clone(), loader)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn interp(&self, scope: &Scope) -> Interp {
        Interp::new(self.clone(), scope.clone())
    }

    // ── Expressions and steps ─────────────────────────────────────────────────

    /// Parse `src`, reusing an earlier parse of the same text.
    pub fn compile(&self, src: &str) -> Result<Arc<Expr>, Error> {
        if let Some(hit) = self.inner.exprs.get(src) {
            return Ok(hit.clone());
        }
        let expr = Arc::new(parse_expr(src)?);
        if self.inner.exprs.len() >= MAX_CACHED {
            debug!(entries = self.inner.exprs.len(), "resetting expression cache");
            self.inner.exprs.clear();
        }
        self.inner.exprs.insert(src.to_owned(), expr.clone());
        Ok(expr)
    }

    /// Split steps source into statements, reusing an earlier split.
    pub fn statements(&self, source: &str) -> Arc<[String]> {
        if let Some(hit) = self.inner.statements.get(source) {
            return hit.clone();
        }
        let parts: Arc<[String]> = split_statements(source).into();
        if self.inner.statements.len() >= MAX_CACHED {
            debug!(entries = self.inner.statements.len(), "resetting statement cache");
            self.inner.statements.clear();
        }
        self.inner.statements.insert(source.to_owned(), parts.clone());
        parts
    }

    /// Evaluate one expression against `scope`.
    pub fn eval(&self, src: &str, scope: &Scope) -> Result<Value, Error> {
        let mut interp = self.interp(scope);
        let expr = self.compile(src).map_err(|e| e.in_expr(src))?;
        flow::consume(interp.eval(&expr)).map_err(|e| e.in_expr(src))
    }

    /// Run steps `source` with `scope` as the receiver.
    pub fn run_steps(&self, source: &str, scope: &Scope, args: Vec<Value>) -> Result<Value, Error> {
        let mut interp = self.interp(scope);
        flow::consume(steps::run(&mut interp, scope, "run", source, args))
    }

    // ── Text templates ────────────────────────────────────────────────────────

    fn normalize_uri(&self, uri: &str) -> String {
        with_default_extension(&resolve_relative(None, uri), &self.inner.config.default_extension)
    }

    fn load(&self, uri: &str) -> Result<String, Error> {
        (self.inner.loader)(uri).map_err(|source| Error::Resource { uri: uri.to_owned(), source })
    }

    /// Parse `text` as a template without touching the cache.
    pub fn build_template(&self, text: &str, uri: Option<&str>) -> Result<Template, Error> {
        parse_template(text, &ParseOptions::from_config(&self.inner.config, uri))
    }

    /// The template at `uri`, built once and shared.
    pub fn template(&self, uri: &str) -> Result<Arc<Template>, Error> {
        let uri = self.normalize_uri(uri);
        let build = || {
            let text = self.load(&uri)?;
            debug!(uri = %uri, "building template");
            self.build_template(&text, Some(&uri))
        };
        if self.inner.config.cache_templates {
            self.inner.templates.get_or_build(&uri, build)
        } else {
            build().map(Arc::new)
        }
    }

    /// Forget every cached template and XML document.
    pub fn drop_templates(&self) {
        self.inner.templates.clear();
        self.inner.documents.clear();
    }

    /// Successful template and document builds so far.
    pub fn build_count(&self) -> usize {
        self.inner.templates.build_count() + self.inner.documents.build_count()
    }

    /// Render an anonymous template.
    pub fn expand_text(&self, text: &str, scope: &Scope) -> Result<String, Error> {
        let template = self.build_template(text, None)?;
        let mut interp = self.interp(scope);
        let mut out = String::new();
        render_template(&mut interp, &template, &mut out)?;
        Ok(out)
    }

    /// Render the template at `uri`.
    pub fn expand_uri(&self, uri: &str, scope: &Scope) -> Result<String, Error> {
        let template = self.template(uri)?;
        Ok(self.render_with(&template, scope, &RenderOptions::default())?.text)
    }

    pub fn render_with(&self, template: &Template, scope: &Scope, options: &RenderOptions) -> Result<Rendered, Error> {
        let mut interp = self.interp(scope).with_roots(Arc::new(options.roots.clone()));
        interp.includes.extend(template.uri.clone());
        let mut text = String::new();
        render_template(&mut interp, template, &mut text)?;
        Ok(Rendered { text, log: std::mem::take(&mut interp.log_records) })
    }

    // ── XML event output ──────────────────────────────────────────────────────

    /// Parse and validate an XML template without touching the cache.
    pub fn build_xml(&self, text: &str, uri: Option<&str>) -> Result<XmlDocument, Error> {
        parse_xml(text, &ParseOptions::from_config(&self.inner.config, uri))
    }

    /// The XML document at `uri`, built once and shared.
    pub fn xml_document(&self, uri: &str) -> Result<Arc<XmlDocument>, Error> {
        let uri = self.normalize_uri(uri);
        let build = || {
            let text = self.load(&uri)?;
            debug!(uri = %uri, "building xml document");
            self.build_xml(&text, Some(&uri))
        };
        if self.inner.config.cache_templates {
            self.inner.documents.get_or_build(&uri, build)
        } else {
            build().map(Arc::new)
        }
    }

    pub fn emit_document(&self, doc: &XmlDocument, scope: &Scope, sink: &mut dyn EventSink) -> Result<(), Error> {
        let mut interp = self.interp(scope);
        interp.includes.extend(doc.uri.clone());
        xml::emit_document(&mut interp, doc, sink)
    }

    /// Render anonymous XML source into `sink`.
    pub fn emit_xml(&self, text: &str, scope: &Scope, sink: &mut dyn EventSink) -> Result<(), Error> {
        let doc = self.build_xml(text, None)?;
        self.emit_document(&doc, scope, sink)
    }

    /// Render the XML document at `uri` into `sink`.
    pub fn emit_uri(&self, uri: &str, scope: &Scope, sink: &mut dyn EventSink) -> Result<(), Error> {
        let doc = self.xml_document(uri)?;
        self.emit_document(&doc, scope, sink)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
