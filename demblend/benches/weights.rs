use criterion::{black_box, criterion_group, criterion_main, Criterion};

use demblend::raster::Grid;
use demblend::weights::{compute_weights, WeightMode};

const ND: f64 = -9999.0;

/// A 1024x1024 grid with a diagonal band of holes, roughly the shape of a
/// cropped source window during tile evaluation.
fn make_grid() -> Grid {
    let n = 1024;
    let mut grid = Grid::filled(n, n, 1500.0);
    for i in 0..n {
        grid.set(i, i, ND);
        grid.set(i, n / 2, ND);
    }
    grid
}

fn bench_grassfire(c: &mut Criterion) {
    let grid = make_grid();
    c.bench_function("grassfire_1024", |b| {
        b.iter(|| black_box(compute_weights(black_box(&grid), ND, WeightMode::Blended, 0)))
    });
}

fn bench_grassfire_eroded(c: &mut Criterion) {
    let grid = make_grid();
    c.bench_function("grassfire_1024_erode_20", |b| {
        b.iter(|| black_box(compute_weights(black_box(&grid), ND, WeightMode::Blended, 20)))
    });
}

fn bench_draft(c: &mut Criterion) {
    let grid = make_grid();
    c.bench_function("draft_1024", |b| {
        b.iter(|| black_box(compute_weights(black_box(&grid), ND, WeightMode::Draft, 0)))
    });
}

criterion_group!(benches, bench_grassfire, bench_grassfire_eroded, bench_draft);
criterion_main!(benches);
