//! Text-mode renderer: walks a [`Template`] and appends to a `String`.
//!
//! Inner content renders in a fresh child scope, so names a body binds stay
//! local to it.  `param`, public `script` and `catch` write to the scope the
//! tag sits in.

use super::{
    bind_caught, bind_param, emit_log, eval_test, foreach_plan, include_target, render_expression,
    round_scope, run_script, with_include, WhileGuard,
};
use crate::error::Error;
use crate::interp::Interp;
use crate::scope::Scope;
use crate::script::value::Value;
use crate::template::ast::{Node, TagNode, Template};
use crate::template::tags::{AttrValue, TagKind};

pub fn render_template(interp: &mut Interp, template: &Template, out: &mut String) -> Result<(), Error> {
    render_nodes(interp, &template.nodes, out)
}

pub fn render_nodes(interp: &mut Interp, nodes: &[Node], out: &mut String) -> Result<(), Error> {
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Expression(e) => out.push_str(&render_expression(interp, e)?),
            Node::Tag(tag) => render_tag(interp, tag, out)?,
        }
    }
    Ok(())
}

fn render_in(interp: &mut Interp, scope: Scope, nodes: &[Node], out: &mut String) -> Result<(), Error> {
    interp.with_scope(scope, |i| render_nodes(i, nodes, out))
}

fn render_child(interp: &mut Interp, nodes: &[Node], out: &mut String) -> Result<(), Error> {
    let scope = interp.scope().child();
    render_in(interp, scope, nodes, out)
}

fn render_tag(interp: &mut Interp, tag: &TagNode, out: &mut String) -> Result<(), Error> {
    let def = &tag.def;
    let own = |e: Error| e.in_tag(&def.qname);

    match def.kind {
        TagKind::If => {
            let scope = interp.scope().child();
            interp.with_scope(scope, |i| {
                if eval_test(i, def).map_err(own)? {
                    render_nodes(i, tag.children(), out)?;
                }
                Ok(())
            })
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
                render_in(interp, scope, tag.children(), out)?;
            }
            Ok(())
        }
        TagKind::Foreach => {
            let var = def.attr("var").and_then(AttrValue::as_const);
            for round in foreach_plan(interp, def).map_err(own)? {
                let scope = round_scope(interp, def, var.map(|v| (v, round.item)), Some(round.status));
                render_in(interp, scope, tag.children(), out)?;
            }
            Ok(())
        }
        TagKind::Choose => {
            for node in tag.children() {
                let Node::Tag(branch) = node else { continue };
                let taken = match branch.def.kind {
                    TagKind::When => eval_test(interp, &branch.def).map_err(|e| e.in_tag(&branch.def.qname))?,
                    _ => true,
                };
                if taken {
                    return render_child(interp, branch.children(), out);
                }
            }
            Ok(())
        }
        TagKind::When | TagKind::Otherwise => Err(own(Error::type_error("branch outside <choose>"))),
        TagKind::Catch => {
            let mut buf = String::new();
            match render_child(interp, tag.children(), &mut buf) {
                Ok(()) => out.push_str(&buf),
                Err(e) => bind_caught(interp, def, &e),
            }
            Ok(())
        }
        TagKind::Include => {
            let target = include_target(interp, def).map_err(own)?;
            let template = interp.engine().template(&target).map_err(own)?;
            with_include(interp, target, |i| render_nodes(i, &template.nodes, out))
        }
        TagKind::Log => {
            let mut message = String::new();
            render_child(interp, tag.children(), &mut message)?;
            emit_log(interp, def, message).map_err(own)
        }
        TagKind::Script => {
            if let Some(text) = run_script(interp, def).map_err(own)? {
                out.push_str(&text);
            }
            Ok(())
        }
        TagKind::Param => {
            out.push_str(&bind_param(interp, def).map_err(own)?);
            Ok(())
        }
        TagKind::Comment => {
            let mut inner = String::new();
            render_child(interp, tag.children(), &mut inner)?;
            out.push_str("<!--");
            out.push_str(&inner);
            out.push_str("-->");
            Ok(())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, RenderOptions};
    use crate::template::loader::memory_loader;
    use tracing::Level;

    fn expand(src: &str, scope: &Scope) -> String {
        match Engine::default().expand_text(src, scope) {
            Ok(s) => s,
            Err(e) => panic!("{src:?} failed: {}", e.chain()),
        }
    }

    fn list(items: &[i64]) -> Value {
        Value::list(items.iter().map(|&n| Value::Int(n)).collect())
    }

    #[test]
    fn expressions_and_deferred() {
        let scope: Scope = [("x", Value::Int(3)), ("y", Value::Int(4))].into_iter().collect();
        assert_eq!(expand("${x+y}", &scope), "7");
        assert_eq!(expand("#{x+y}", &scope), "${x+y}");
        assert_eq!(expand("[${missing}]", &scope), "[]");
    }

    #[test]
    fn if_renders_only_when_true() {
        let scope: Scope = [("n", Value::Int(2))].into_iter().collect();
        assert_eq!(expand("a<c:if test=\"${n > 1}\">B</c:if>c", &scope), "aBc");
        assert_eq!(expand("a<c:if test=\"${n > 5}\">B</c:if>c", &scope), "ac");
        assert_eq!(expand("<c:if test=\"true\">T</c:if>", &scope), "T");
    }

    #[test]
    fn if_body_bindings_stay_inside() {
        let scope = Scope::new();
        expand("<c:if test='true'><c:param name='inner' value='1'/></c:if>", &scope);
        assert!(!scope.contains_own("inner"));
    }

    #[test]
    fn foreach_over_items_with_status() {
        let scope: Scope = [("xs", list(&[10, 20, 30]))].into_iter().collect();
        let out = expand(
            "<c:foreach items=\"${xs}\" var=\"x\" varStatus=\"s\">${s.count}:${x}${s.last ? '' : ','}</c:foreach>",
            &scope,
        );
        assert_eq!(out, "1:10,2:20,3:30");
        assert!(!scope.contains_own("x"));
    }

    #[test]
    fn foreach_numeric_range() {
        let scope = Scope::new();
        assert_eq!(expand("<c:foreach begin=\"1\" end=\"3\">x</c:foreach>", &scope), "xxx");
        assert_eq!(expand("<c:foreach begin=\"0\" end=\"9\" step=\"4\" var=\"i\">${i} </c:foreach>", &scope), "0 4 8 ");
        assert_eq!(expand("<c:foreach begin=\"3\" end=\"1\">x</c:foreach>", &scope), "");
    }

    #[test]
    fn foreach_range_near_integer_limits() {
        let scope = Scope::new();
        let huge = i64::MAX;
        let src = format!("<c:foreach begin=\"1\" end=\"5\" step=\"{huge}\">x</c:foreach>");
        assert_eq!(expand(&src, &scope), "x");
        let src = format!(
            "<c:foreach begin=\"{}\" end=\"{huge}\" var=\"i\" varStatus=\"s\">${{s.count}}${{s.last}} </c:foreach>",
            huge - 1
        );
        assert_eq!(expand(&src, &scope), "1false 2true ");
    }

    #[test]
    fn foreach_rounds_are_not_built_up_front() {
        let scope: Scope = [("n", Value::Int(0))].into_iter().collect();
        let src = "<c:catch><c:foreach begin=\"0\" end=\"1000000000000\">${n = n + 1, n > 2 ? raise('stop') : ''}</c:foreach></c:catch>";
        assert_eq!(expand(src, &scope), "");
        assert_eq!(scope.get("n"), Some(Value::Int(3)));
    }

    #[test]
    fn foreach_items_clipped_to_range() {
        let scope: Scope = [("xs", list(&[0, 1, 2, 3, 4]))].into_iter().collect();
        let out = expand("<c:foreach items=\"${xs}\" var=\"x\" begin=\"1\" end=\"3\">${x}</c:foreach>", &scope);
        assert_eq!(out, "123");
        let out = expand("<c:foreach items=\"a, b\" var=\"x\">[${x}]</c:foreach>", &scope);
        assert_eq!(out, "[a][b]");
    }

    #[test]
    fn foreach_bad_step_is_a_tag_error() {
        let err = Engine::default()
            .expand_text("<c:foreach begin='1' end='2' step='0'>x</c:foreach>", &Scope::new())
            .unwrap_err();
        assert!(matches!(err, Error::Tag { ref tag, .. } if tag == "c:foreach"), "{err:?}");
    }

    #[test]
    fn while_loop_and_status() {
        let scope: Scope = [("n", Value::Int(0))].into_iter().collect();
        let out = expand("<c:while test=\"${n < 3}\" var=\"st\">${st.index}${n = n + 1, ''}</c:while>", &scope);
        assert_eq!(out, "012");
        assert_eq!(scope.get("n"), Some(Value::Int(3)));
    }

    #[test]
    fn while_max_raises_retries() {
        let err = Engine::default()
            .expand_text("<c:while test=\"true\" max=\"3\">.</c:while>", &Scope::new())
            .unwrap_err();
        assert!(matches!(err.root_cause(), Error::Retries { attempts: 3, test, .. } if test == "true"));
    }

    #[test]
    fn choose_renders_one_branch() {
        let src = "<c:choose><c:when test=\"${v == 1}\">one</c:when><c:when test=\"${v < 5}\">small</c:when><c:otherwise>big</c:otherwise></c:choose>";
        for (v, want) in [(1, "one"), (3, "small"), (9, "big")] {
            let scope: Scope = [("v", Value::Int(v))].into_iter().collect();
            assert_eq!(expand(src, &scope), want);
        }
        let scope: Scope = [("v", Value::Int(1))].into_iter().collect();
        assert_eq!(expand("<c:choose><c:when test='${v > 1}'>x</c:when></c:choose>", &scope), "");
    }

    #[test]
    fn catch_binds_error_and_suppresses_output() {
        let scope = Scope::new();
        let out = expand("a<c:catch var=\"e\">partial${raise('boom')}</c:catch>b", &scope);
        assert_eq!(out, "ab");
        assert_eq!(expand("${e.message}", &scope), "boom");
        assert_eq!(expand("${e.kind}", &scope), "raised");

        let out = expand("<c:catch>ok</c:catch>", &scope);
        assert_eq!(out, "ok");
        assert!(!scope.contains_own("caughtException"));
        expand("<c:catch>${raise('x')}</c:catch>", &scope);
        assert!(scope.contains_own("caughtException"));
    }

    #[test]
    fn param_binds_outward_and_renders() {
        let scope = Scope::new();
        assert_eq!(expand("<c:param name=\"p\" value=\"${2 * 21}\"/>/${p + 1}", &scope), "42/43");
        assert_eq!(scope.get("p"), Some(Value::Int(42)));
    }

    #[test]
    fn comment_wraps_body() {
        let scope: Scope = [("x", Value::from("hi"))].into_iter().collect();
        assert_eq!(expand("<c:comment> ${x} </c:comment>", &scope), "<!-- hi -->");
    }

    #[test]
    fn log_goes_to_records_not_output() {
        let engine = Engine::default();
        let template = engine.build_template("a<c:log level=\"warn\">n=${1 + 1}</c:log>b", None).unwrap();
        let rendered = engine.render_with(&template, &Scope::new(), &RenderOptions::default()).unwrap();
        assert_eq!(rendered.text, "ab");
        assert_eq!(rendered.log.len(), 1);
        assert_eq!(rendered.log[0].level, Level::WARN);
        assert_eq!(rendered.log[0].message, "n=2");
    }

    #[test]
    fn include_renders_in_current_scope() {
        let (loader, _) = memory_loader([
            ("pages/main.tpl", "[<c:include page=\"part\"/>]"),
            ("pages/part.tpl", "${who}"),
        ]);
        let engine = Engine::default().with_loader(loader);
        let scope: Scope = [("who", Value::from("me"))].into_iter().collect();
        assert_eq!(engine.expand_uri("pages/main", &scope).unwrap(), "[me]");
    }

    #[test]
    fn circular_include_is_detected() {
        let (loader, _) = memory_loader([
            ("a.tpl", "<c:include page=\"b.tpl\"/>"),
            ("b.tpl", "<c:include page=\"a.tpl\"/>"),
        ]);
        let engine = Engine::default().with_loader(loader);
        let err = engine.expand_uri("a.tpl", &Scope::new()).unwrap_err();
        match err.root_cause() {
            Error::CircularInclude { chain } => assert_eq!(chain, "a.tpl -> b.tpl -> a.tpl"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(feature = "lua")]
    #[test]
    fn public_script_leaves_untouched_bindings_alone() {
        let engine = Engine::default();
        let scope = Scope::new();
        engine.eval("cfg = {n: 1, f: x -> x * 2}", &scope).unwrap();
        let out = expand("<c:script public=\"true\">y = cfg.n + 1</c:script>${cfg.f(2)}/${y}", &scope);
        assert_eq!(out, "4/2");
        assert_eq!(engine.eval("cfg.f(5)", &scope).unwrap(), Value::Int(10));
    }

    #[cfg(feature = "lua")]
    #[test]
    fn script_output_and_public_bindings() {
        let scope: Scope = [("n", Value::Int(4))].into_iter().collect();
        let out = expand("<c:script output=\"true\">return n * 2</c:script>", &scope);
        assert_eq!(out, "8");
        expand("<c:script public=\"true\">shared = n + 1</c:script>", &scope);
        assert_eq!(scope.get("shared"), Some(Value::Int(5)));
        expand("<c:script>hidden = 1</c:script>", &scope);
        assert!(!scope.contains_own("hidden"));
    }
}
