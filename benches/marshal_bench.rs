// Marshaling and call benchmarks for PL/Lua

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pllua::host::MemoryHost;
use pllua::marshal::Marshaler;
use pllua::routine::RoutineDefinition;
use pllua::types::{oid, TypeCache};
use pllua::value::ArrayValue;
use pllua::{CallContext, Datum, Engine, Options};
use std::hint::black_box;
use std::rc::Rc;

fn benchmark_array_marshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_marshal");
    let host = MemoryHost::new();
    let types = TypeCache::new();
    let options = Options::default();
    let m = Marshaler::new(&types, &host, &options);

    for size in [10, 100, 1000].iter() {
        let elements = (0..*size).map(|i| Some(Datum::Int4(i))).collect();
        let arr = Datum::Array(ArrayValue::from_vec(oid::INT4, elements));

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &arr, |b, arr| {
            b.iter(|| {
                let script = m.to_script(Some(arr), oid::INT4_ARRAY).unwrap();
                let back = m.to_relational(&script, oid::INT4_ARRAY, -1).unwrap();
                black_box(back);
            });
        });
    }

    group.finish();
}

fn benchmark_function_call(c: &mut Criterion) {
    let host = Rc::new(MemoryHost::new());
    let add = host.create_routine(
        RoutineDefinition::new(0, "add", "return a + b", oid::INT4).arg("a", oid::INT4).arg("b", oid::INT4),
    );
    let engine = Engine::new(host.clone(), Options::default()).unwrap();
    let args = [Some(Datum::Int4(2)), Some(Datum::Int4(3))];

    c.bench_function("function_call", |b| {
        b.iter(|| {
            let outcome = engine.invoke(add, black_box(&args), CallContext::Function).unwrap();
            black_box(outcome);
        });
    });
}

fn benchmark_json_call(c: &mut Criterion) {
    let host = Rc::new(MemoryHost::new());
    let f = host.create_routine(
        RoutineDefinition::new(0, "touch", "doc.seen = true return doc", oid::JSON).arg("doc", oid::JSON),
    );
    let engine = Engine::new(host.clone(), Options::default()).unwrap();
    let doc = serde_json::json!({ "id": 1, "tags": ["a", "b", "c"], "nested": { "depth": [1, 2, 3] } });
    let args = [Some(Datum::Json(doc))];

    c.bench_function("json_call", |b| {
        b.iter(|| {
            let outcome = engine.invoke(f, black_box(&args), CallContext::Function).unwrap();
            black_box(outcome);
        });
    });
}

criterion_group!(benches, benchmark_array_marshal, benchmark_function_call, benchmark_json_call);
criterion_main!(benches);
