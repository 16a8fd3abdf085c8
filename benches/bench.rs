use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use sekai_env::animation::{ATTR_POSITION, CurveKey, Keyframe};
use sekai_env::rla::{self, RlaVersion};
use sekai_env::{Curve, CurveValue};

fn position_curve(keys: usize) -> Curve {
    let mut curve = Curve::new(CurveKey {
        path: sekai_env::animation::crc32("Root/Hips"),
        attribute: ATTR_POSITION,
        type_id: sekai_env::unity::TRANSFORM_TYPE_ID,
    });
    for i in 0..keys {
        let t = i as f32 / 30.0;
        let value = CurveValue::Vec3([t.sin(), t.cos(), t]);
        let slope = CurveValue::Vec3([t.cos(), -t.sin(), 1.0]);
        curve
            .add_keyframe(Keyframe::hermite(t, value, slope, slope))
            .unwrap();
    }
    curve
}

fn curve_evaluation(c: &mut Criterion) {
    let curve = position_curve(3000);
    let end = curve.end_time().unwrap();

    let mut group = c.benchmark_group("curve");
    group.bench_function("evaluate 1000 samples", |b| {
        b.iter(|| {
            for i in 0..1000 {
                black_box(curve.evaluate(end * i as f32 / 1000.0));
            }
        })
    });
    group.bench_function("resample at 60 fps", |b| {
        b.iter(|| black_box(curve.resample_at_rate(60.0).unwrap()))
    });
}

/// A motion record without poses, sequence 7, target time 1234.
fn motion_frame() -> Vec<u8> {
    let body = [7, 0xd2, 0x04];
    let mut data = (4 + body.len() as u32).to_le_bytes().to_vec();
    data.extend_from_slice(&body);
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&[0x90, 0x00]);

    let mut payload = vec![0];
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload.extend_from_slice(&data);
    rla::encode_envelope(0, &payload, true)
}

fn rla_decoding(c: &mut Criterion) {
    let frame = motion_frame();
    let mut stream = Vec::new();
    for tick in 1..=5000u64 {
        stream.extend_from_slice(&tick.to_le_bytes());
        stream.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        stream.extend_from_slice(&frame);
    }
    stream.extend_from_slice(&0u64.to_le_bytes());
    let version = RlaVersion(1, 4);

    let mut group = c.benchmark_group("rla");
    group.bench_function("read_rla", |b| {
        b.iter(|| black_box(rla::read_rla(stream.as_slice(), version, true).unwrap()))
    });
    group.bench_function("read_rla_par", |b| {
        b.iter(|| black_box(rla::read_rla_par(stream.as_slice(), version, true).unwrap()))
    });
}

criterion_group!(benches, curve_evaluation, rla_decoding);
criterion_main!(benches);
