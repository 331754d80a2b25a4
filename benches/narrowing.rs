use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// The capture hot loop: narrow staged 32-bit frames to little-endian
/// 16-bit samples. Benchmarked standalone so regressions in the conversion
/// show up without driver noise.
fn narrow_frames(scratch: &[i32], out: &mut [u8]) {
    for (i, &word) in scratch.iter().enumerate() {
        let sample = (word >> 16) as i16;
        out[2 * i..2 * i + 2].copy_from_slice(&sample.to_le_bytes());
    }
}

fn ramp(words: usize) -> Vec<i32> {
    (0..words).map(|i| (i as i32) << 16).collect()
}

fn bench_narrowing(c: &mut Criterion) {
    let mut group = c.benchmark_group("narrow_frames");

    for words in [256usize, 1024, 4096].iter() {
        let scratch = ramp(*words);
        let mut out = vec![0u8; words * 2];
        group.bench_with_input(BenchmarkId::from_parameter(words), words, |b, _| {
            b.iter(|| {
                narrow_frames(black_box(&scratch), black_box(&mut out));
            });
        });
    }

    group.finish();
}

fn bench_chunk_split(c: &mut Criterion) {
    // Splitting a capture buffer into receiver-sized chunks is on the write
    // path for every buffer.
    let buffer = vec![0u8; 19_200 * 4];

    c.bench_function("chunk_split_19200", |b| {
        b.iter(|| {
            let mut total = 0usize;
            for chunk in black_box(&buffer).chunks(19_200) {
                total += chunk.len();
            }
            black_box(total)
        });
    });
}

criterion_group!(benches, bench_narrowing, bench_chunk_split);
criterion_main!(benches);
