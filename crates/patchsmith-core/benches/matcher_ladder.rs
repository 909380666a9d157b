use criterion::{black_box, criterion_group, criterion_main, Criterion};
use patchsmith_core::diff::{round_trips, unified_diff};
use patchsmith_core::edits::parse_completion;
use patchsmith_core::matcher::PatchMatcher;
use patchsmith_core::syntax::{Language, TreeSitterValidator};
use patchsmith_core::EditCommand;

fn synthetic_module(function_count: usize) -> String {
    let mut out = String::from("import os\nimport sys\n\n");
    for i in 0..function_count {
        out.push_str(&format!(
            "\ndef handler_{i}(value):\n    if value > {i}:\n        return value - {i}\n    return {i}\n\n"
        ));
    }
    out
}

fn synthetic_completion(function_count: usize) -> String {
    let mut out = String::from("```python\n### pkg/handlers.py\n");
    for i in (0..function_count).step_by(10) {
        out.push_str(&format!(
            "<<<<<<< SEARCH\n    return {i}\n=======\n    return {i} + 1\n>>>>>>> REPLACE\n"
        ));
    }
    out.push_str("```\n");
    out
}

fn bench_parse(c: &mut Criterion) {
    let completion = synthetic_completion(400);
    c.bench_function("parse_completion_40_commands", |b| {
        b.iter(|| {
            let parsed = parse_completion(black_box(&completion), "python");
            black_box(parsed.batch.command_count());
        })
    });
}

fn bench_direct_match(c: &mut Criterion) {
    let original = synthetic_module(400);
    let validator = TreeSitterValidator;
    let commands: Vec<EditCommand> = (0..400)
        .step_by(10)
        .map(|i| EditCommand::new(format!("    return {i}"), format!("    return {i} + 1")))
        .collect();

    c.bench_function("synthesize_direct_400_functions", |b| {
        b.iter(|| {
            let matcher = PatchMatcher::new(&validator, Language::Python);
            let candidate = matcher.synthesize("pkg/handlers.py", black_box(&original), &commands);
            black_box(candidate.is_ok());
        })
    });
}

fn bench_full_ladder_miss(c: &mut Criterion) {
    let original = synthetic_module(200);
    let validator = TreeSitterValidator;
    let commands = vec![EditCommand::new("    return missing", "    return found")];

    c.bench_function("synthesize_ladder_exhausted_200_functions", |b| {
        b.iter(|| {
            let matcher = PatchMatcher::new(&validator, Language::Python);
            let candidate = matcher.synthesize("pkg/handlers.py", black_box(&original), &commands);
            black_box(candidate.is_err());
        })
    });
}

fn bench_diff_round_trip(c: &mut Criterion) {
    let original = synthetic_module(400);
    let candidate = original.replace("    return 17\n", "    return 18\n");

    c.bench_function("diff_round_trip_400_functions", |b| {
        b.iter(|| {
            let diff = unified_diff("pkg/handlers.py", black_box(&original), &candidate);
            black_box(round_trips(&original, &candidate, &diff));
        })
    });
}

criterion_group!(
    perf_core,
    bench_parse,
    bench_direct_match,
    bench_full_ladder_miss,
    bench_diff_round_trip
);
criterion_main!(perf_core);
