use ark_bn254::Fr;
use ark_std::{test_rng, UniformRand};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lazy_core::persist::system::{load_lazy_r1cs, write_lazy_r1cs};
use lazy_core::{CircuitBuilder, CompiledR1CS, ConstraintSink, LazyR1CS, StorageConfig};

fn poseidon_chain(blocks: usize) -> CompiledR1CS<Fr> {
    let mut rng = test_rng();
    let mut builder = CircuitBuilder::<Fr>::new();
    let mut state = builder.secret_input(Fr::rand(&mut rng)).unwrap();
    for _ in 0..blocks {
        let input = builder.secret_input(Fr::rand(&mut rng)).unwrap();
        state = builder.poseidon_hash(&[state, input]).unwrap();
    }
    builder.finish()
}

fn mimc_chain(blocks: usize) -> CompiledR1CS<Fr> {
    let mut rng = test_rng();
    let mut builder = CircuitBuilder::<Fr>::new();
    let data = (0..blocks)
        .map(|_| builder.secret_input(Fr::rand(&mut rng)).unwrap())
        .collect::<Vec<_>>();
    let digest = builder.mimc_hash(&data).unwrap();
    for block in &data {
        let doubled = builder.add(block, block).unwrap();
        builder.mul(&doubled, &digest).unwrap();
    }
    builder.finish()
}

fn benchmark_lazify(c: &mut Criterion, name: &str, build: fn(usize) -> CompiledR1CS<Fr>, blocks: usize) {
    c.bench_function(&format!("LazyR1CS::lazify {name} x {blocks}"), |b| {
        b.iter_with_setup(
            || build(blocks),
            |compiled| black_box(LazyR1CS::lazify(compiled).unwrap()),
        );
    });
}

fn benchmark_fetch(c: &mut Criterion, blocks: usize) {
    let lazy = LazyR1CS::lazify(poseidon_chain(blocks)).unwrap();
    let total = lazy.total_constraint_count();
    c.bench_function(&format!("LazyR1CS::fetch all of {total} rows"), |b| {
        b.iter(|| {
            for i in 0..total {
                black_box(lazy.fetch(i).unwrap());
            }
        });
    });
    c.bench_function(&format!("LazyR1CS::par_expand {total} rows"), |b| {
        b.iter(|| black_box(lazy.par_expand().unwrap()));
    });
}

fn benchmark_persist(c: &mut Criterion, blocks: usize, parallelism: usize) {
    let dir = tempfile::tempdir().unwrap();
    let lazy = LazyR1CS::lazify(mimc_chain(blocks)).unwrap();
    let config = StorageConfig::new(dir.path(), "bench")
        .with_batch_size(1 << 12)
        .with_parallelism(parallelism);
    c.bench_function(&format!("write_lazy_r1cs mimc x {blocks}"), |b| {
        b.iter(|| black_box(write_lazy_r1cs(&lazy, &config).unwrap()));
    });
    c.bench_function(
        &format!("load_lazy_r1cs mimc x {blocks} [{parallelism} threads]"),
        |b| {
            b.iter(|| black_box(load_lazy_r1cs::<Fr>(&config).unwrap()));
        },
    );
}

fn lazy_benches(c: &mut Criterion) {
    benchmark_lazify(c, "poseidon", poseidon_chain, 256);
    benchmark_lazify(c, "mimc", mimc_chain, 64);
    benchmark_fetch(c, 256);
    benchmark_persist(c, 128, 1);
    benchmark_persist(c, 128, 4);
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = lazy_benches
}
criterion_main!(benches);
