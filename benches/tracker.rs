//! Criterion benchmarks for the per-frame tracking hot path.
//!
//! The tracker runs on the capture thread for every frame, so its cost per
//! point bounds the frame rate that can be tracked live.
//!
//! Run with: cargo bench --bench tracker

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nanotrack::tracker::ContinuousTracker;
use nanotrack_core::{Frame, TrackedPoint};
use nanotrack_driver_mock::{render_spots, Spot};

fn frame_with_spots(width: usize, height: usize, spots: &[Spot]) -> Frame {
    let pixels = render_spots(width, height, spots, 100, 20, 7);
    Frame::from_u16(0, width, height, pixels).unwrap()
}

/// Refine a growing number of points on a 512x512 frame.
fn tracker_points(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_points");
    let tracker = ContinuousTracker::new(16);

    for n in [1usize, 10, 100] {
        let spots: Vec<Spot> = (0..n)
            .map(|i| Spot::new(20.0 + (i % 10) as f64 * 48.0, 20.0 + (i / 10) as f64 * 48.0))
            .collect();
        let frame = frame_with_spots(512, 512, &spots);
        let start: Vec<TrackedPoint> = spots
            .iter()
            .map(|s| TrackedPoint::new(s.x + 1.5, s.y - 1.5))
            .collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut points = start.clone();
                tracker.refine(black_box(frame.pixels.view()), &mut points);
                black_box(points)
            })
        });
    }
    group.finish();
}

/// Cost of one point as the search window grows.
fn tracker_radius(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_radius");
    let frame = frame_with_spots(256, 256, &[Spot::new(128.0, 128.0)]);

    for radius in [4usize, 8, 16, 32] {
        let tracker = ContinuousTracker::new(radius);
        group.bench_with_input(BenchmarkId::from_parameter(radius), &radius, |b, _| {
            b.iter(|| {
                let mut point = TrackedPoint::new(126.0, 130.0);
                tracker.refine_point(black_box(frame.pixels.view()), &mut point);
                black_box(point)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, tracker_points, tracker_radius);
criterion_main!(benches);
