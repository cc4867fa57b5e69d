use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytefuzz::asm::InstructionIterator;
use bytefuzz::cfg::Cfg;

/// A dispatcher-shaped byte pattern repeated to a few kilobytes.
fn sample_bytecode() -> Vec<u8> {
    let unit = hex::decode("6000358060e01c63a9059cbb1461001d57005b60043560005500").unwrap();
    let mut code = Vec::new();
    for _ in 0..64 {
        code.extend_from_slice(&unit);
    }
    code
}

fn bench_disassemble(c: &mut Criterion) {
    let code = sample_bytecode();
    c.bench_function("disassemble", |b| {
        b.iter(|| {
            let n = InstructionIterator::new(black_box(&code)).count();
            black_box(n)
        })
    });
}

fn bench_cfg_build(c: &mut Criterion) {
    let code = sample_bytecode();
    c.bench_function("cfg_build", |b| {
        b.iter(|| black_box(Cfg::new(black_box(&code))))
    });
}

criterion_group!(benches, bench_disassemble, bench_cfg_build);
criterion_main!(benches);
