//! Benchmarks for workflow validation and frontier computation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use draftflow::workflow::{Stage, Workflow, WorkflowBuilder};
use std::collections::BTreeSet;

/// `layers` layers of `width` stages, each depending on every stage of the
/// previous layer.
fn layered(layers: usize, width: usize) -> Vec<Stage> {
    let mut stages = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for slot in 0..width {
            let mut stage = Stage::new(format!("s_{layer}_{slot}"), "noop").parallel();
            if layer > 0 {
                stage = stage.with_dependencies((0..width).map(|p| format!("s_{}_{p}", layer - 1)));
            }
            stages.push(stage);
        }
    }
    stages
}

fn build(stages: &[Stage]) -> Workflow {
    stages
        .iter()
        .cloned()
        .fold(WorkflowBuilder::new("bench"), WorkflowBuilder::stage)
        .build()
        .unwrap()
}

fn frontier_benchmark(c: &mut Criterion) {
    let stages = layered(20, 10);

    c.bench_function("validate_200_stages", |b| {
        b.iter(|| build(black_box(&stages)));
    });

    let workflow = build(&stages);
    c.bench_function("drain_frontiers_200_stages", |b| {
        b.iter(|| {
            let mut completed = BTreeSet::new();
            while !workflow.is_complete(&completed) {
                let ready: Vec<String> = workflow
                    .next_frontier(&completed)
                    .into_iter()
                    .map(|s| s.name.clone())
                    .collect();
                completed.extend(ready);
            }
            black_box(completed.len())
        });
    });
}

criterion_group!(benches, frontier_benchmark);
criterion_main!(benches);
