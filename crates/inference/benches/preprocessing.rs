use capture::Frame;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use inference::{InferenceParams, Letterbox, PreProcessor, decode_yolo};
use ndarray::{Array, IxDyn};

fn gray_frame(width: u32, height: u32) -> Frame {
    Frame::new(width, height, vec![128u8; (width * height * 3) as usize]).unwrap()
}

/// YOLO head with `anchors` candidates, `hits` of them above threshold in
/// overlapping clusters of four.
fn mock_yolo_head(anchors: usize, classes: usize, hits: usize) -> Array<f32, IxDyn> {
    let channels = 4 + classes;
    let mut data = vec![0.01f32; channels * anchors];
    for i in 0..hits.min(anchors) {
        let cluster = (i / 4) as f32;
        data[i] = 40.0 + cluster * 30.0 + (i % 4) as f32;
        data[anchors + i] = 160.0;
        data[2 * anchors + i] = 24.0;
        data[3 * anchors + i] = 24.0;
        data[(4 + i % classes) * anchors + i] = 0.9;
    }
    Array::from_shape_vec(IxDyn(&[1, channels, anchors]), data).unwrap()
}

fn benchmark_preprocessing(c: &mut Criterion) {
    let mut group = c.benchmark_group("preprocessing");

    for (width, height) in [(320, 240), (640, 480), (1280, 720)] {
        let frame = gray_frame(width, height);
        let mut pre = PreProcessor::new(320);

        group.bench_with_input(
            BenchmarkId::new("letterbox_320", format!("{}x{}", width, height)),
            &frame,
            |b, frame| b.iter(|| pre.preprocess(black_box(frame)).unwrap()),
        );
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("postprocessing");
    let letterbox = Letterbox::compute(640, 480, 320);
    let params = InferenceParams::default();

    for hits in [0, 8, 64] {
        let head = mock_yolo_head(2100, 2, hits);
        group.bench_with_input(BenchmarkId::new("decode_yolo", hits), &head, |b, head| {
            b.iter(|| decode_yolo(black_box(&head.view()), &letterbox, &params).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_preprocessing, benchmark_decode);
criterion_main!(benches);
