//! Analysis throughput over synthetic traces
//!
//! Measures the merge-and-detect pipeline on in-memory traces so the numbers
//! exclude disk I/O. Run with `cargo bench`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vigia::analysis::{analyze_trace, AnalysisOptions};
use vigia::trace::element::{ChannelOp, ElementKind, MutexOp, SourcePos, TraceElement};
use vigia::trace::Trace;

/// Build a trace of `routines` producer/consumer pairs over shared channels,
/// with a mutex-protected section per routine
fn synthetic_trace(routines: usize, ops_per_routine: usize) -> Trace {
    let mut trace = Trace::new();
    let mut t = 1u64;
    for r in 1..=routines {
        for k in 0..ops_per_routine {
            // paired routines share the op id so the sends rendezvous
            let pair = (r + 1) / 2;
            let op_id = (pair * ops_per_routine + k) as u64;
            let (op, chan) = if r % 2 == 0 {
                (ChannelOp::Recv, pair as u64)
            } else {
                (ChannelOp::Send, pair as u64)
            };
            trace.push(TraceElement::new(
                r,
                t,
                t + 1,
                SourcePos::new("bench.go", k as u32 + 1),
                ElementKind::Channel {
                    id: chan,
                    op,
                    closed: false,
                    op_id,
                    q_size: 0,
                    partner: None,
                },
            ));
            t += 2;
            trace.push(TraceElement::new(
                r,
                t,
                t + 1,
                SourcePos::new("bench.go", 100),
                ElementKind::Mutex {
                    id: 500,
                    op: MutexOp::Lock,
                    success: true,
                },
            ));
            t += 2;
            trace.push(TraceElement::new(
                r,
                t,
                t + 1,
                SourcePos::new("bench.go", 101),
                ElementKind::Mutex {
                    id: 500,
                    op: MutexOp::Unlock,
                    success: true,
                },
            ));
            t += 2;
        }
        trace.push(TraceElement::new(
            r,
            t,
            t,
            SourcePos::new("", 0),
            ElementKind::RoutineEnd,
        ));
        t += 1;
    }
    trace
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze_trace");
    for &(routines, ops) in &[(4usize, 50usize), (8, 100), (16, 200)] {
        let trace = synthetic_trace(routines, ops);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{routines}r_{ops}ops")),
            &trace,
            |b, trace| {
                b.iter(|| {
                    let mut copy = trace.clone();
                    let bugs =
                        analyze_trace(&mut copy, &AnalysisOptions::default()).expect("analysis");
                    black_box(bugs)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_analysis);
criterion_main!(benches);
