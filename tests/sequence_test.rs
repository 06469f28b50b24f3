//! Integration tests for Sequence.

use paged_llm::{SamplingConfig, Sequence};

#[test]
fn test_sequence_creation() {
    let seq = Sequence::new(1, vec![10, 20, 30, 40], 16);

    assert_eq!(seq.seq_id(), 1);
    assert_eq!(seq.prompt_len(), 4);
    assert_eq!(seq.num_generated_tokens(), 0);
    assert_eq!(seq.len(), 4);
    assert_eq!(seq.num_cached_tokens(), 0);
    assert_eq!(seq.num_new_tokens(), 4);
    assert!(seq.is_prefill());
    assert!(seq.block_table().is_empty());
    assert_eq!(seq.block_table().block_size(), 16);
}

#[test]
fn test_append_tokens() {
    let mut seq = Sequence::new(1, vec![1, 2, 3], 16);

    seq.append_token(100);
    seq.append_token(101);

    assert_eq!(seq.num_generated_tokens(), 2);
    assert_eq!(seq.len(), 5);
    assert_eq!(seq.prompt_token_ids(), &[1, 2, 3]);
    assert_eq!(seq.output_token_ids(), &[100, 101]);
    assert_eq!(seq.last_token_id(), Some(101));
}

#[test]
fn test_cached_tokens_follow_appends() {
    let mut seq = Sequence::new(1, vec![1, 2, 3, 4, 5], 4);
    assert_eq!(seq.num_required_blocks(), 2);

    seq.append_token(6);
    assert!(!seq.is_prefill());
    assert_eq!(seq.num_cached_tokens(), 5);
    assert_eq!(seq.num_new_tokens(), 1);

    seq.append_token(7);
    seq.append_token(8);
    seq.append_token(9);
    assert_eq!(seq.num_new_tokens(), 1);
    assert_eq!(seq.num_required_blocks(), 3);
}

#[test]
fn test_sampling_config_and_equality() {
    let seq = Sequence::new(7, vec![1], 16).with_sampling_config(SamplingConfig::greedy());
    assert_eq!(seq.sampling_config().temperature, 0.0);

    // Sequences are identified by id only.
    assert_eq!(seq, Sequence::new(7, vec![2, 3], 16));
    assert_ne!(seq, Sequence::new(8, vec![1], 16));
}

#[test]
fn test_reached_max_tokens() {
    let mut seq = Sequence::new(1, vec![1, 2], 16).with_sampling_config(SamplingConfig {
        max_tokens: 2,
        ..SamplingConfig::greedy()
    });
    assert!(!seq.reached_max_tokens());
    seq.append_token(3);
    assert!(!seq.reached_max_tokens());
    seq.append_token(4);
    assert!(seq.reached_max_tokens());
}
