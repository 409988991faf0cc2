//! Command-line interface.
//!
//! Usage:
//!   stanza [--config <file>] [-v…] render <uri|file> [--var k=v]… [--vars <json>] [--xml]
//!   stanza [--config <file>] [-v…] eval <expr> [--var k=v]… [--vars <json>]
//!   stanza [--config <file>] [-v…] steps <source> [<arg>…] [--var k=v]… [--vars <json>]
//!
//! `--var` values are read as JSON when they parse as JSON (`n=3`,
//! `flags=[1,2]`) and as plain strings otherwise.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::EngineConfig;
use crate::engine::{Engine, RenderOptions};
use crate::render::events::XmlWriterSink;
use crate::scope::Scope;
use crate::script::value::Value;

// ── Arguments ─────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "stanza", version, about = "Render tag templates")]
pub struct Cli {
    /// Config file; otherwise $STANZA_CONFIG, ./stanza.toml, then the user config dir
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Render a template file or a URI under the template root
    Render {
        target: String,
        /// Treat the template as XML and write the events back as XML
        #[arg(long)]
        xml: bool,
        #[command(flatten)]
        vars: VarArgs,
    },
    /// Evaluate one expression
    Eval {
        expr: String,
        #[command(flatten)]
        vars: VarArgs,
    },
    /// Run steps source; extra arguments become $1, $2, …
    Steps {
        source: String,
        args: Vec<String>,
        #[command(flatten)]
        vars: VarArgs,
    },
}

#[derive(Debug, Default, Args)]
pub struct VarArgs {
    /// Bind a variable, `name=value`
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// JSON object whose entries become variables
    #[arg(long = "vars", value_name = "FILE")]
    pub vars_file: Option<PathBuf>,
}

/// Parse `name=value`.
pub fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_owned(), value.to_owned())),
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}

/// A command-line value: JSON when it parses, text otherwise.
pub fn arg_value(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(&json),
        Err(_) => Value::from(raw),
    }
}

impl VarArgs {
    /// The top-level scope: `--vars` file first, `--var` entries over it.
    pub fn scope(&self) -> Result<Scope> {
        let scope = Scope::new();
        if let Some(path) = &self.vars_file {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let json: serde_json::Value =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            let Some(obj) = json.as_object() else {
                bail!("{} must hold a JSON object", path.display());
            };
            for (k, v) in obj {
                scope.set(k.clone(), Value::from_json(v));
            }
        }
        for (name, raw) in &self.vars {
            scope.set(name.clone(), arg_value(raw));
        }
        Ok(scope)
    }
}

// ── Running ───────────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    Ok(match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::discover()?,
    })
}

/// Run the selected command and return what it prints.
pub fn run(cli: &Cli) -> Result<String> {
    let mut config = load_config(cli)?;
    match &cli.command {
        Command::Render { target, xml, vars } => {
            let scope = vars.scope()?;
            let path = Path::new(target);
            if path.is_file() {
                let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
                config.template_root.get_or_insert_with(|| dir.to_owned());
                let uri = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                let engine = Engine::new(config);
                if *xml {
                    let doc = engine.build_xml(&text, Some(&uri))?;
                    let mut sink = XmlWriterSink::to_memory();
                    engine.emit_document(&doc, &scope, &mut sink)?;
                    Ok(sink.into_string()?)
                } else {
                    let template = engine.build_template(&text, Some(&uri))?;
                    Ok(engine.render_with(&template, &scope, &RenderOptions::default())?.text)
                }
            } else {
                config.template_root.get_or_insert_with(|| PathBuf::from("."));
                let engine = Engine::new(config);
                if *xml {
                    let mut sink = XmlWriterSink::to_memory();
                    engine.emit_uri(target, &scope, &mut sink)?;
                    Ok(sink.into_string()?)
                } else {
                    Ok(engine.expand_uri(target, &scope)?)
                }
            }
        }
        Command::Eval { expr, vars } => {
            let scope = vars.scope()?;
            let value = Engine::new(config).eval(expr, &scope)?;
            Ok(format!("{value}\n"))
        }
        Command::Steps { source, args, vars } => {
            let scope = vars.scope()?;
            let args = args.iter().map(|a| arg_value(a)).collect();
            let value = Engine::new(config).run_steps(source, &scope, args)?;
            Ok(format!("{value}\n"))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stanza").chain(argv.iter().copied())).unwrap()
    }

    fn with_config(argv: &[&str]) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("stanza.toml");
        std::fs::write(&cfg, "").unwrap();
        let mut full = vec!["--config", cfg.to_str().unwrap()];
        full.extend_from_slice(argv);
        let cli = parse(&full);
        (dir, cli)
    }

    #[test]
    fn var_parsing() {
        assert_eq!(parse_var("a=1"), Ok(("a".into(), "1".into())));
        assert_eq!(parse_var("s=x=y"), Ok(("s".into(), "x=y".into())));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn var_values_are_json_or_text() {
        assert_eq!(arg_value("3"), Value::Int(3));
        assert_eq!(arg_value("true"), Value::Bool(true));
        assert_eq!(arg_value("hello"), Value::from("hello"));
    }

    #[test]
    fn render_flags() {
        let cli = parse(&["-vv", "render", "page", "--var", "x=1", "--var", "y=two", "--xml"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Render { target, xml, vars } => {
                assert_eq!(target, "page");
                assert!(xml);
                assert_eq!(vars.vars.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn eval_command() {
        let (_dir, cli) = with_config(&["eval", "x * 2", "--var", "x=21"]);
        assert_eq!(run(&cli).unwrap(), "42\n");
    }

    #[test]
    fn steps_command() {
        let (_dir, cli) = with_config(&["steps", "a = $1; a + $2", "2", "3"]);
        assert_eq!(run(&cli).unwrap(), "5\n");
    }

    #[test]
    fn render_file_with_vars_file() {
        let (dir, _) = with_config(&["eval", "1"]);
        let page = dir.path().join("page.tpl");
        std::fs::write(&page, "Hi ${name}<c:include page=\"part\"/>").unwrap();
        std::fs::write(dir.path().join("part.tpl"), "!").unwrap();
        let vars = dir.path().join("vars.json");
        std::fs::write(&vars, r#"{"name": "Ann"}"#).unwrap();
        let cfg = dir.path().join("stanza.toml");
        let cli = parse(&[
            "--config",
            cfg.to_str().unwrap(),
            "render",
            page.to_str().unwrap(),
            "--vars",
            vars.to_str().unwrap(),
        ]);
        assert_eq!(run(&cli).unwrap(), "Hi Ann!");
    }

    #[test]
    fn render_xml_file() {
        let (dir, _) = with_config(&["eval", "1"]);
        let page = dir.path().join("page.xml");
        std::fs::write(&page, "<p><c:if test=\"${n > 1}\">big</c:if></p>").unwrap();
        let cfg = dir.path().join("stanza.toml");
        let cli = parse(&["--config", cfg.to_str().unwrap(), "render", page.to_str().unwrap(), "--xml", "--var", "n=2"]);
        assert_eq!(run(&cli).unwrap(), "<p>big</p>");
    }
}
