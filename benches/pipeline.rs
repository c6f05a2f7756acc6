//! Benchmarks for template wrapping and tokenization

#![allow(missing_docs)]

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use prompt_peft::plm::tokenizer::TokenizerConfig;
use prompt_peft::prompts::DEFAULT_TEMPLATE;
use prompt_peft::{InputExample, MixedTemplate, T5TokenizerWrapper, WordVocab};

fn example() -> InputExample {
    InputExample::new(
        "It was a complex language. Not written down but handed down. One might say it was peeled down.",
        "the language was peeled down",
        0,
        0,
    )
}

fn benchmark_prompting(c: &mut Criterion) {
    let example = example();
    let vocab = WordVocab::from_corpus(&[example.text_a.as_str(), example.text_b.as_str()], 4);
    let embeddings = Tensor::randn(0f32, 1f32, (vocab.len(), 64), &Device::Cpu).expect("embeddings");
    let template = MixedTemplate::new(DEFAULT_TEMPLATE, &vocab, &embeddings).expect("template");
    let wrapper = T5TokenizerWrapper::new(&vocab, TokenizerConfig::default()).expect("wrapper");
    let wrapped = template.wrap_one_example(&example).expect("wrap");

    let mut group = c.benchmark_group("prompting");
    group.bench_function("wrap_one_example", |b| {
        b.iter(|| template.wrap_one_example(black_box(&example)));
    });
    group.bench_function("tokenize_one_example", |b| {
        b.iter(|| wrapper.tokenize_one_example(black_box(&wrapped)));
    });
    group.finish();
}

criterion_group!(benches, benchmark_prompting);
criterion_main!(benches);
