use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use envy::identity::Identity;
use envy::spec::options::{canonical_key, OptionValue};

/// Benchmark options canonicalization, the hot path of instance
/// memoization during resolution.
fn bench_canonicalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonical_options");

    let lua = mlua::Lua::new();
    for (label, src) in [
        ("flat", r#"{ a = 1, b = "two", c = true }"#),
        (
            "nested",
            r#"{ target = { os = "linux", arch = "x86_64" }, features = { lto = true, pgo = false }, jobs = 16 }"#,
        ),
    ] {
        let value: mlua::Value = lua.load(src).eval().unwrap();
        let opts = OptionValue::from_lua(&value).unwrap();
        group.bench_with_input(BenchmarkId::new("canonical_text", label), &opts, |b, opts| {
            b.iter(|| black_box(opts.canonical_text()));
        });
    }
    group.finish();
}

/// Benchmark the variant hash input construction plus BLAKE3.
fn bench_variant_hash(c: &mut Criterion) {
    let identity: Identity = "acme.toolchain@v13.2.0".parse().unwrap();
    let lua = mlua::Lua::new();
    let value: mlua::Value = lua
        .load(r#"{ variant = "lto", sanitizers = { asan = true } }"#)
        .eval()
        .unwrap();
    let opts = OptionValue::from_lua(&value).unwrap();

    c.bench_function("variant_hash", |b| {
        b.iter(|| {
            let mut input = canonical_key(&identity, Some(&opts));
            input.push_str("|tool=local.provider@v1");
            black_box(blake3::hash(input.as_bytes()).to_hex().to_string())
        });
    });
}

/// Benchmark fuzzy identity matching across a candidate pool.
fn bench_identity_matching(c: &mut Criterion) {
    let pool: Vec<Identity> = (0..200)
        .map(|i| format!("acme.tool{}@v{}", i, i % 7).parse().unwrap())
        .collect();

    c.bench_function("match_query_200", |b| {
        b.iter(|| {
            black_box(
                pool.iter()
                    .filter(|id| id.matches_query("tool42"))
                    .count(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_canonicalization,
    bench_variant_hash,
    bench_identity_matching
);
criterion_main!(benches);
