//! Hot-path microbenches: request matching against a mid-sized rule set.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ubx_engine::{
    compile_filter_lists, CompileOptions, Engine, EngineConfig, RequestInfo,
};

fn build_engine() -> Engine {
    let mut list = String::new();
    for i in 0..2000 {
        list.push_str(&format!("||tracker{i:04}.test^\n"));
    }
    for i in 0..500 {
        list.push_str(&format!("/pixel{i:03}/*$image\n"));
    }
    list.push_str("@@||cdn.friendly.test^\n");
    list.push_str("*$removeparam=gclid\n");
    list.push_str("||heavy.test/lib.js$script,redirect=noop.js\n");

    let out = compile_filter_lists(&[&list], &CompileOptions::default()).expect("compile");
    let mut engine = Engine::new(EngineConfig::default());
    engine.install(out.snapshot_bytes).expect("install");
    engine
}

fn request<'a>(url: &'a str, type_name: &'a str) -> RequestInfo<'a> {
    RequestInfo {
        url,
        type_name,
        initiator: Some("https://news.site.test/section/page"),
        tab_id: 1,
        frame_id: 0,
        request_id: 1,
    }
}

fn bench_match_request(c: &mut Criterion) {
    let mut engine = build_engine();

    c.bench_function("match_request/no_match", |b| {
        let req = request("https://images.site.test/photos/a/b/c.jpg", "image");
        b.iter(|| black_box(engine.match_request(black_box(&req))));
    });

    c.bench_function("match_request/domain_block", |b| {
        let req = request("https://tracker0042.test/collect?id=1", "script");
        b.iter(|| black_box(engine.match_request(black_box(&req))));
    });

    c.bench_function("match_request/token_verify", |b| {
        let req = request("https://site.test/pixel042/1x1.gif", "image");
        b.iter(|| black_box(engine.match_request(black_box(&req))));
    });

    c.bench_function("match_request/cached", |b| {
        let req = request("https://repeat.site.test/same/url/every/time.js", "script");
        engine.match_request(&req);
        b.iter(|| black_box(engine.match_request(black_box(&req))));
    });
}

fn bench_cosmetics(c: &mut Criterion) {
    let mut list = String::new();
    for i in 0..300 {
        list.push_str(&format!("##.generic-ad-{i}\n"));
    }
    for i in 0..100 {
        list.push_str(&format!("site{i}.test##.site-ad-{i}\n"));
    }
    let out = compile_filter_lists(&[&list], &CompileOptions::default()).expect("compile");
    let mut engine = Engine::new(EngineConfig::default());
    engine.install(out.snapshot_bytes).expect("install");

    c.bench_function("match_cosmetics/site", |b| {
        let req = request("https://site42.test/", "main_frame");
        b.iter(|| black_box(engine.match_cosmetics(black_box(&req))));
    });
}

fn bench_compile(c: &mut Criterion) {
    let mut list = String::new();
    for i in 0..2000 {
        list.push_str(&format!("||tracker{i:04}.test^$third-party\n"));
    }

    c.bench_function("compile/2k_rules", |b| {
        b.iter(|| {
            let out =
                compile_filter_lists(&[black_box(&list)], &CompileOptions::default()).unwrap();
            black_box(out.snapshot_bytes.len())
        });
    });
}

criterion_group!(benches, bench_match_request, bench_cosmetics, bench_compile);
criterion_main!(benches);
