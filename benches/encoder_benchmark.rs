use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use luster_mp3::{Config, Encoder, VbrMode};

fn test_signal(seconds: usize) -> Vec<i16> {
    (0..44100 * seconds)
        .map(|i| {
            let t = i as f64 / 44100.0;
            let v = (2.0 * std::f64::consts::PI * 440.0 * t).sin() * 0.4
                + (2.0 * std::f64::consts::PI * 3137.0 * t).sin() * 0.2;
            (v * 28000.0) as i16
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let samples = test_signal(1);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(samples.len() as u64));

    group.bench_function("cbr_128_stereo", |b| {
        b.iter(|| {
            let mut enc = Encoder::new(&Config::default()).unwrap();
            let mut out = enc
                .encode_buffer_i16(black_box(&samples), black_box(&samples))
                .unwrap();
            out.extend(enc.flush().unwrap());
            out
        })
    });

    group.bench_function("vbr_q4_stereo", |b| {
        b.iter(|| {
            let cfg = Config {
                vbr: VbrMode::Rh,
                vbr_quality: 4,
                ..Default::default()
            };
            let mut enc = Encoder::new(&cfg).unwrap();
            let mut out = enc
                .encode_buffer_i16(black_box(&samples), black_box(&samples))
                .unwrap();
            out.extend(enc.flush().unwrap());
            out
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
