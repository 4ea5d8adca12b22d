use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use engine_core::eval::UniformEvaluator;
use engine_core::search::{SearchParams, UnlimitedTimeControls};
use engine_core::{Board, Player, Rules, Search};

fn run_search(num_visits: i64, num_threads: usize) {
    let mut params = SearchParams::for_testing(num_visits);
    params.num_threads = num_threads;
    let eval = Arc::new(UniformEvaluator::new(9, 9));
    let mut search = Search::new(
        params,
        eval,
        "bench-seed",
        Board::new(9, 9),
        Player::Black,
        Rules::default(),
    )
    .unwrap();
    let stop = AtomicBool::new(false);
    search
        .run_whole_search(&stop, None, false, &UnlimitedTimeControls, 1.0)
        .unwrap();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    group.sample_size(20);
    group.bench_function("visits_500_threads_1", |b| b.iter(|| run_search(500, 1)));
    group.bench_function("visits_500_threads_4", |b| b.iter(|| run_search(500, 4)));
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
