use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use candle_core::{DType, Device, Tensor};
use kornia_coca::{Coca, CocaConfig};

fn small_config(depth: usize) -> CocaConfig {
    CocaConfig {
        img_patch_size: 16,
        encoder_depth: depth,
        encoder_heads: 4,
        encoder_width: 64,
        encoder_intermediate_dim: 128,
        vocab_size: 1000,
        text_width: 64,
        unimodal_decoder_depth: depth,
        multimodal_decoder_depth: depth,
        decoder_intermediate_dim: 128,
        unimodal_decoder_heads: 4,
        multimodal_decoder_heads: 4,
        captioning_query_length: 32,
        contrastive_attn_heads: 4,
        captioning_attn_heads: 4,
        ..Default::default()
    }
}

fn bench_coca_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("CocaForward");
    let device = Device::Cpu;

    for (depth, batch, name) in [(1, 1, "depth1_b1"), (2, 1, "depth2_b1"), (2, 4, "depth2_b4")] {
        let mut model = Coca::new(small_config(depth), &device).unwrap();
        model
            .build(&[vec![batch, 224, 224, 3], vec![batch, 32]])
            .unwrap();

        let images = Tensor::rand(0f32, 1., (batch, 224, 224, 3), &device).unwrap();
        let texts = Tensor::zeros((batch, 32), DType::U32, &device).unwrap();

        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(
            BenchmarkId::new("captioning", name),
            &(&images, &texts),
            |b, (images, texts)| b.iter(|| black_box(model.call(images, texts).unwrap())),
        );

        group.bench_with_input(
            BenchmarkId::new("with_contrastive", name),
            &(&images, &texts),
            |b, (images, texts)| {
                b.iter(|| black_box(model.forward(images, texts, true).unwrap()))
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_coca_forward);
criterion_main!(benches);
