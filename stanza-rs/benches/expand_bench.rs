use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stanza::template::loader::memory_loader;
use stanza::{Engine, Scope, Value};

const PAGE: &str = "<c:foreach items=\"${rows}\" var=\"r\" varStatus=\"s\">\
<c:choose><c:when test=\"${s.index % 2 == 0}\">even</c:when><c:otherwise>odd</c:otherwise></c:choose>\
 ${r.name}: ${r.qty * price}<c:if test=\"${s.last}\">.</c:if>\n</c:foreach>";

fn rows(n: i64) -> Scope {
    let rows = (0..n)
        .map(|i| {
            let row: Scope = [("name", Value::from(format!("item{i}"))), ("qty", Value::Int(i))].into_iter().collect();
            Value::Map(row)
        })
        .collect();
    [("rows", Value::list(rows)), ("price", Value::Int(3))].into_iter().collect()
}

fn bench_expand(c: &mut Criterion) {
    let scope = rows(100);
    let (loader, _) = memory_loader([("page.tpl", PAGE)]);
    let engine = Engine::default().with_loader(loader);

    let mut g = c.benchmark_group("expand");

    g.bench_function("parse_and_render", |b| {
        b.iter(|| engine.expand_text(black_box(PAGE), black_box(&scope)).unwrap())
    });
    g.bench_function("cached_render", |b| {
        b.iter(|| engine.expand_uri(black_box("page"), black_box(&scope)).unwrap())
    });
    g.bench_function("build_only", |b| {
        b.iter(|| engine.build_template(black_box(PAGE), None).unwrap())
    });

    g.finish();
}

fn bench_eval(c: &mut Criterion) {
    let engine = Engine::default();
    let scope: Scope = [("x", Value::Int(3)), ("y", Value::Int(4))].into_iter().collect();
    scope.define_steps("hyp", "a = $1 * $1; b = $2 * $2; a + b");

    let mut g = c.benchmark_group("eval");
    g.bench_function("arith", |b| b.iter(|| engine.eval(black_box("x * y + (x - y) / 2"), &scope).unwrap()));
    g.bench_function("steps_call", |b| b.iter(|| engine.eval(black_box("hyp(x, y)"), &scope).unwrap()));
    g.finish();
}

criterion_group!(benches, bench_expand, bench_eval);
criterion_main!(benches);
