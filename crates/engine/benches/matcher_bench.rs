//! Benchmarks for the policy matcher.
//!
//! Run with: cargo bench -p rvtap-engine --bench matcher_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rvtap_engine::insn::{assemble_add, assemble_mv, assemble_sb};
use rvtap_engine::{EngineError, Insn, InsnKind, MockHost, Policy, TagEngine};

fn step_nop(_host: &mut MockHost, _insn: Insn, pc: u64) -> Result<u64, EngineError> {
    Ok(pc + 4)
}

/// Engine with one enforcing context holding `len` non-terminal policies.
fn setup_engine(len: usize, kind: InsnKind) -> (TagEngine, MockHost) {
    let mut engine = TagEngine::new();
    let mut host = MockHost::new();
    engine.run_tag_command(&mut host, 0);
    for i in 0..len {
        engine.install_policy(
            &mut host,
            &Policy {
                insn_type: kind,
                rs1val_mask: 0xFF,
                rs1val_match: i as u8,
                ..Policy::default()
            },
        );
    }
    (engine, host)
}

// ============================================================================
// Policy-list scan cost
// ============================================================================

fn bench_policy_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("Matcher-Scan");

    for len in [1usize, 8, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
            let (mut engine, mut host) = setup_engine(len, InsnKind::Op);
            let insn = assemble_add(5, 6, 7);
            b.iter(|| {
                engine
                    .execute_insn(&mut host, 0x100, insn, step_nop)
                    .unwrap();
                black_box(&engine);
            })
        });
    }

    group.finish();
}

// ============================================================================
// Kind mismatch: the cheapest reject path
// ============================================================================

fn bench_kind_mismatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Matcher-KindMismatch");

    group.bench_function("64_policies", |b| {
        let (mut engine, mut host) = setup_engine(64, InsnKind::Store64);
        // A copy never matches the Store64 policies.
        let insn = assemble_mv(5, 6);
        b.iter(|| {
            engine
                .execute_insn(&mut host, 0x100, insn, step_nop)
                .unwrap();
            black_box(&engine);
        })
    });

    group.finish();
}

// ============================================================================
// Tag-touching policies: lazy operand loads plus writeback
// ============================================================================

fn bench_tag_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Matcher-TagPropagation");

    group.bench_function("copy_propagate", |b| {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        engine.run_tag_command(&mut host, 0);
        engine.install_policy(
            &mut host,
            &Policy {
                insn_type: InsnKind::Copy,
                tag_arg1_mask: 0xFF,
                tag_arg1_match: 0x02,
                tag_out_tomodify: 0xFF,
                tag_out_set: 0x02,
                ..Policy::default()
            },
        );
        host.reg_tags[6] = 0x02;
        let insn = assemble_mv(5, 6);
        b.iter(|| {
            // Reset the destination so the writeback happens every iteration.
            host.reg_tags[5] = 0;
            engine
                .execute_insn(&mut host, 0x100, insn, step_nop)
                .unwrap();
            black_box(&engine);
        })
    });

    group.bench_function("memory_operand", |b| {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        engine.run_tag_command(&mut host, 0);
        // The store's destination tag lives in memory; matching on it costs
        // one MMU tag load per instruction.
        engine.install_policy(
            &mut host,
            &Policy {
                insn_type: InsnKind::Store,
                tag_out_mask: 0x01,
                tag_out_match: 0x01,
                ..Policy::default()
            },
        );
        host.regs[6] = 0x2000;
        let insn = assemble_sb(6, 7, 0);
        b.iter(|| {
            engine
                .execute_insn(&mut host, 0x100, insn, step_nop)
                .unwrap();
            black_box(&engine);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_policy_scan,
    bench_kind_mismatch,
    bench_tag_propagation,
);

criterion_main!(benches);
