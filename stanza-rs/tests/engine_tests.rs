use std::sync::{Arc, Barrier};

use stanza::render::events::XmlWriterSink;
use stanza::template::loader::{file_loader, memory_loader};
use stanza::{Engine, Error, Scope, Value};

fn xy() -> Scope {
    [("x", Value::Int(3)), ("y", Value::Int(4))].into_iter().collect()
}

fn expand(engine: &Engine, src: &str, scope: &Scope) -> String {
    engine
        .expand_text(src, scope)
        .unwrap_or_else(|e| panic!("{src:?} failed: {}", e.chain()))
}

#[test]
fn child_scope_shadows_parent() {
    let parent: Scope = [("only_parent", Value::from("p")), ("both", Value::from("p"))].into_iter().collect();
    let child = parent.child();
    child.set("both", Value::from("c"));
    let engine = Engine::default();
    assert_eq!(engine.eval("only_parent", &child).unwrap(), Value::from("p"));
    assert_eq!(engine.eval("both", &child).unwrap(), Value::from("c"));
    assert_eq!(engine.eval("both", &parent).unwrap(), Value::from("p"));
}

#[test]
fn immediate_expression() {
    assert_eq!(expand(&Engine::default(), "${x+y}", &xy()), "7");
}

#[test]
fn deferred_expression_then_second_pass() {
    let engine = Engine::default();
    let first = expand(&engine, "#{x+y}", &Scope::new());
    assert_eq!(first, "${x+y}");
    assert_eq!(expand(&engine, &first, &xy()), "7");
}

#[test]
fn choose_renders_exactly_one_branch() {
    let engine = Engine::default();
    let src = "<c:choose><c:when test=\"${false}\">A</c:when><c:otherwise>B</c:otherwise></c:choose>";
    assert_eq!(expand(&engine, src, &Scope::new()), "B");

    let scope: Scope = [("hits", Value::list(Vec::new()))].into_iter().collect();
    let marked = "<c:choose>\
        <c:when test=\"${hits.add('w1'), true}\">${hits.add('b1'), ''}</c:when>\
        <c:when test=\"${hits.add('w2'), true}\">${hits.add('b2'), ''}</c:when>\
        <c:otherwise>${hits.add('o'), ''}</c:otherwise>\
        </c:choose>";
    expand(&engine, marked, &scope);
    assert_eq!(engine.eval("hits.join(',')", &scope).unwrap(), Value::from("w1,b1"));
}

#[test]
fn foreach_range_is_inclusive() {
    let out = expand(&Engine::default(), "<c:foreach begin=\"${1}\" end=\"${3}\">x</c:foreach>", &Scope::new());
    assert_eq!(out, "xxx");
}

#[test]
fn while_do_exhaustion() {
    let err = Engine::default().eval("whileDo(() -> true, () -> 0, 3)", &Scope::new()).unwrap_err();
    match err.root_cause() {
        Error::Retries { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn catch_binds_error_and_leaves_scope_alone() {
    let engine = Engine::default();
    let scope: Scope = [("keep", Value::Int(1))].into_iter().collect();
    let out = expand(&engine, "<c:catch var=\"e\">${ raise('boom') }</c:catch>", &scope);
    assert_eq!(out, "");
    assert_eq!(engine.eval("e.message", &scope).unwrap(), Value::from("boom"));
    let mut keys = scope.keys();
    keys.sort();
    assert_eq!(keys, vec!["e", "keep"]);
}

#[test]
fn anonymous_templates_are_independent() {
    let engine = Engine::default();
    let src = "<c:foreach items=\"${xs}\" var=\"v\">${v}</c:foreach>";
    let a = engine.build_template(src, None).unwrap();
    let b = engine.build_template(src, None).unwrap();
    assert!(!std::ptr::eq(&a.nodes[0], &b.nodes[0]));

    let scope: Scope = [("xs", Value::list(vec![Value::Int(1), Value::Int(2)]))].into_iter().collect();
    let ra = engine.render_with(&a, &scope, &Default::default()).unwrap();
    let rb = engine.render_with(&b, &scope, &Default::default()).unwrap();
    assert_eq!(ra.text, "12");
    assert_eq!(rb.text, "12");
    assert_eq!(engine.build_count(), 0);
}

#[test]
fn concurrent_first_requests_build_once() {
    let (loader, _) = memory_loader([("shared.tpl", "<c:if test=\"true\">${n}</c:if>")]);
    let engine = Engine::default().with_loader(loader);
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let (engine, barrier) = (engine.clone(), barrier.clone());
            std::thread::spawn(move || {
                barrier.wait();
                let scope: Scope = [("n", Value::from(n as i64))].into_iter().collect();
                engine.expand_uri("shared", &scope).unwrap()
            })
        })
        .collect();
    let outputs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(engine.build_count(), 1);
    for (n, out) in outputs.iter().enumerate() {
        assert_eq!(*out, n.to_string());
    }
}

#[test]
fn templates_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("parts")).unwrap();
    std::fs::write(dir.path().join("index.tpl"), "<c:include page=\"parts/head\"/>|${title}").unwrap();
    std::fs::write(dir.path().join("parts/head.tpl"), "<c:param name=\"title\" value=\"Home\"/>").unwrap();
    let engine = Engine::default().with_loader(file_loader(dir.path()));
    assert_eq!(engine.expand_uri("index", &Scope::new()).unwrap(), "Home|Home");

    let err = engine.expand_uri("../outside", &Scope::new()).unwrap_err();
    assert!(matches!(err, Error::Resource { .. }));
}

#[test]
fn event_mode_end_to_end() {
    let engine = Engine::default();
    let scope: Scope = [("items", Value::list(vec![Value::from("a"), Value::from("b")]))].into_iter().collect();
    let src = "<ul><c:foreach items=\"${items}\" var=\"i\" varStatus=\"s\"><li n=\"${s.count}\">${i}</li></c:foreach></ul>";
    let mut sink = XmlWriterSink::to_memory();
    engine.emit_xml(src, &scope, &mut sink).unwrap();
    assert_eq!(sink.into_string().unwrap(), "<ul><li n=\"1\">a</li><li n=\"2\">b</li></ul>");
}

#[test]
fn parse_errors_carry_location() {
    let err = Engine::default().build_template("line one\n<c:if>x</c:if>", Some("page.tpl")).unwrap_err();
    match err {
        Error::Parse(p) => {
            assert_eq!(p.line, 2);
            assert_eq!(p.uri.as_deref(), Some("page.tpl"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}
