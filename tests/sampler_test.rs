//! Integration tests for Sampler.

use std::collections::HashSet;

use candle_core::{Device, Tensor};
use paged_llm::config::SamplingConfig;
use paged_llm::engine::SamplingParameters;
use paged_llm::{InputParameters, Sampler};

fn params(configs: &[SamplingConfig]) -> SamplingParameters {
    let mut params = SamplingParameters::default();
    for config in configs {
        params.push(config);
    }
    params
}

fn no_history(n: usize) -> InputParameters {
    InputParameters {
        token_ids: vec![vec![]; n],
        seq_lens: vec![0; n],
        ..Default::default()
    }
}

#[test]
fn test_greedy_sampling() {
    let mut sampler = Sampler::with_seed(42);
    let logits = Tensor::new(&[[0.1f32, 0.2, 0.3, 10.0, 0.4]], &Device::Cpu).unwrap();

    let out = sampler
        .sample(&logits, &params(&[SamplingConfig::greedy()]), &no_history(1))
        .unwrap();
    assert_eq!(out.next_tokens, vec![3]);
}

#[test]
fn test_temperature_sampling() {
    let mut sampler = Sampler::with_seed(42);
    let logits = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0, 1.0]], &Device::Cpu).unwrap();
    let p = params(&[SamplingConfig::default()]);
    let h = no_history(1);

    let mut seen = HashSet::new();
    for _ in 0..100 {
        let out = sampler.sample(&logits, &p, &h).unwrap();
        seen.insert(out.next_tokens[0]);
        // Uniform over 5 tokens
        assert!((out.logprobs[0] - (0.2f32).ln()).abs() < 1e-5);
    }
    assert!(seen.len() > 1, "Should sample different tokens");
}

#[test]
fn test_mixed_configs_per_row() {
    let mut sampler = Sampler::with_seed(7);
    let logits = Tensor::new(
        &[[5.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 5.0], [0.0, 9.0, 8.0, 0.0]],
        &Device::Cpu,
    )
    .unwrap();
    let top1 = SamplingConfig {
        top_k: 1,
        ..SamplingConfig::default()
    };
    let out = sampler
        .sample(
            &logits,
            &params(&[SamplingConfig::greedy(), top1.clone(), top1]),
            &no_history(3),
        )
        .unwrap();
    assert_eq!(out.next_tokens, vec![0, 3, 1]);
}

#[test]
fn test_frequency_penalty_uses_history() {
    let mut sampler = Sampler::with_seed(0);
    let config = SamplingConfig {
        frequency_penalty: 1.0,
        ..SamplingConfig::greedy()
    };
    let logits = Tensor::new(&[[2.5f32, 2.0, 0.0]], &Device::Cpu).unwrap();
    let history = InputParameters {
        token_ids: vec![vec![0, 0, 1]],
        seq_lens: vec![3],
        ..Default::default()
    };

    // Token 0 seen twice: 2.5 - 2 = 0.5; token 1 once: 2.0 - 1 = 1.0.
    let out = sampler.sample(&logits, &params(&[config]), &history).unwrap();
    assert_eq!(out.next_tokens, vec![1]);
}

#[test]
fn test_row_count_mismatch() {
    let mut sampler = Sampler::with_seed(0);
    let logits = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
    let p = params(&[SamplingConfig::greedy(), SamplingConfig::greedy()]);
    assert!(sampler.sample(&logits, &p, &no_history(2)).is_err());
}

#[test]
fn test_same_seed_same_tokens() {
    let logits = Tensor::new(&[[0.5f32, 1.0, 1.5, 1.0], [1.0, 1.0, 1.0, 1.0]], &Device::Cpu).unwrap();
    let p = params(&[SamplingConfig::default(), SamplingConfig::default()]);
    let h = no_history(2);

    let mut a = Sampler::with_seed(99);
    let mut b = Sampler::with_seed(99);
    for _ in 0..20 {
        assert_eq!(
            a.sample(&logits, &p, &h).unwrap(),
            b.sample(&logits, &p, &h).unwrap()
        );
    }
}
