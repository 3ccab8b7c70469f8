mod common;

use common::{context, context_with, feed, model, params, step, tokens};
use sim_backend::{SimBackend, SimVocab};
use strand_core::abi::{Model, Token};
use strand_core::{AbortFlag, Batch, Context, Error, PoolingType};

#[test]
fn overflow_leaves_cache_untouched() {
    let mut ctx = context(8, 1);
    feed(&mut ctx, 0, 0, &tokens("abcdefgh"));
    assert_eq!(ctx.kv_cache().used_cells(), 8);
    let logits_before = ctx.logits().to_vec();

    let mut batch = Batch::for_tokens(1);
    batch.add(SimVocab::byte_token(b'i'), 8, &[0], true).unwrap();
    let err = ctx.decode(&batch).unwrap_err();
    assert!(matches!(err, Error::ContextOverflow { seq: 0, needed: 9, n_ctx: 8 }));
    assert!(err.is_recoverable());

    assert_eq!(ctx.kv_cache().used_cells(), 8);
    assert_eq!(ctx.kv_cache().max_position(0).unwrap(), 7);
    assert_eq!(ctx.logits(), logits_before.as_slice());
}

#[test]
fn outputs_are_indexed_by_batch_entry() {
    let mut ctx = context(16, 1);
    let toks = tokens("xyz");
    let mut batch = Batch::for_tokens(3);
    batch.add(toks[0], 0, &[0], true).unwrap();
    batch.add(toks[1], 1, &[0], false).unwrap();
    batch.add(toks[2], 2, &[0], true).unwrap();
    ctx.decode(&batch).unwrap();

    let n_vocab = ctx.n_vocab();
    assert_eq!(ctx.n_outputs(), 2);
    assert_eq!(ctx.logits().len(), 2 * n_vocab);
    assert_eq!(ctx.logits_ith(2).unwrap(), &ctx.logits()[n_vocab..]);
    assert_eq!(ctx.logits_ith(-1).unwrap(), ctx.logits_ith(2).unwrap());
    assert_eq!(ctx.logits_ith(-2).unwrap(), ctx.logits_ith(0).unwrap());
    assert!(matches!(ctx.logits_ith(1), Err(Error::InvalidArgument(_))));
    assert!(matches!(ctx.logits_ith(3), Err(Error::InvalidArgument(_))));
    assert!(matches!(ctx.logits_ith(-3), Err(Error::InvalidArgument(_))));
}

#[test]
fn sequences_are_masked_from_each_other() {
    // two prompts in one batch must match two separate single-sequence runs
    let mut joint = context(16, 2);
    let a = tokens("ab");
    let b = tokens("cd");
    let mut batch = Batch::new(4, 0, 2);
    batch.add(a[0], 0, &[0], false).unwrap();
    batch.add(b[0], 0, &[1], false).unwrap();
    batch.add(a[1], 1, &[0], true).unwrap();
    batch.add(b[1], 1, &[1], true).unwrap();
    joint.decode(&batch).unwrap();

    let mut solo_a = context(16, 1);
    feed(&mut solo_a, 0, 0, &a);
    let mut solo_b = context(16, 1);
    feed(&mut solo_b, 0, 0, &b);

    assert_eq!(joint.logits_ith(2).unwrap(), solo_a.logits_ith(-1).unwrap());
    assert_eq!(joint.logits_ith(3).unwrap(), solo_b.logits_ith(-1).unwrap());
}

#[test]
fn invalid_batches_are_rejected_before_the_backend() {
    let mut ctx = context(16, 2);
    let mut batch = Batch::for_tokens(1);
    batch.add(Token(100_000), 0, &[0], true).unwrap();
    assert!(matches!(ctx.decode(&batch), Err(Error::InvalidArgument(_))));

    let empty = Batch::for_tokens(1);
    assert!(matches!(ctx.decode(&empty), Err(Error::InvalidArgument(_))));

    let mut too_big = Batch::for_tokens(32);
    too_big.fill_sequence(&tokens("0123456789abcdefg"), 0, 0).unwrap();
    assert!(matches!(ctx.decode(&too_big), Err(Error::InvalidArgument(_))));

    assert_eq!(ctx.backend().decode_calls(), 0);
    assert_eq!(ctx.kv_cache().used_cells(), 0);
}

#[test]
fn backend_failure_is_atomic() {
    let mut ctx = context(16, 1);
    feed(&mut ctx, 0, 0, &tokens("hi"));
    let logits = ctx.logits().to_vec();

    ctx.backend_mut().fail_next("device lost");
    let mut batch = Batch::for_tokens(2);
    batch.fill_sequence(&tokens("!?"), 2, 0).unwrap();
    let err = ctx.decode(&batch).unwrap_err();
    assert!(matches!(err, Error::BackendFailure(_)));
    assert!(err.is_recoverable());
    assert_eq!(ctx.kv_cache().used_cells(), 2);
    assert_eq!(ctx.logits(), logits.as_slice());

    // the same batch goes through on retry
    ctx.decode(&batch).unwrap();
    assert_eq!(ctx.kv_cache().max_position(0).unwrap(), 3);
}

#[test]
fn abort_is_atomic() {
    let flag = AbortFlag::new();
    let mut ctx = Context::with_hooks(
        model(),
        SimBackend::new(),
        params(16, 1),
        Box::new(flag.clone()),
    )
    .unwrap();
    feed(&mut ctx, 0, 0, &tokens("ok"));

    flag.trigger();
    let mut batch = Batch::for_tokens(1);
    batch.add(SimVocab::byte_token(b'.'), 2, &[0], true).unwrap();
    assert!(matches!(ctx.decode(&batch), Err(Error::Aborted)));
    assert_eq!(ctx.kv_cache().used_cells(), 2);

    flag.reset();
    ctx.decode(&batch).unwrap();
    assert_eq!(ctx.kv_cache().used_cells(), 3);
}

#[test]
fn timings_count_prompt_and_generation() {
    let mut ctx = context(16, 1);
    feed(&mut ctx, 0, 0, &tokens("abcd"));
    step(&mut ctx, 0, 4, SimVocab::byte_token(b'e'));
    step(&mut ctx, 0, 5, SimVocab::byte_token(b'f'));
    let t = ctx.timings();
    assert_eq!(t.n_p_eval, 4);
    assert_eq!(t.n_eval, 2);
    assert!(ctx.perf_summary().contains("prompt eval"));
    ctx.reset_timings();
    assert_eq!(ctx.timings().n_eval, 0);
}

#[test]
fn pooled_embeddings_per_sequence() {
    let p = params(16, 2).with_embeddings(PoolingType::Mean);
    let mut ctx = context_with(model(), p);
    let n_embd = ctx.model().info().n_embd;

    let mut batch = Batch::new(3, 0, 2);
    let t = tokens("abc");
    batch.add(t[0], 0, &[0], true).unwrap();
    batch.add(t[1], 1, &[0], true).unwrap();
    batch.add(t[2], 0, &[1], true).unwrap();
    ctx.decode(&batch).unwrap();

    let e0 = ctx.embeddings_ith(0).unwrap().to_vec();
    let e1 = ctx.embeddings_ith(1).unwrap().to_vec();
    let mean: Vec<f32> = e0.iter().zip(&e1).map(|(a, b)| (a + b) * 0.5).collect();
    let pooled = ctx.embeddings_seq(0).unwrap();
    assert_eq!(pooled.len(), n_embd);
    for (p, m) in pooled.iter().zip(&mean) {
        assert!((p - m).abs() < 1e-6);
    }
    assert_eq!(ctx.embeddings_seq(1).unwrap(), ctx.embeddings_ith(2).unwrap());
}

#[test]
fn embeddings_are_not_kept_when_disabled() {
    let mut ctx = context(16, 1);
    feed(&mut ctx, 0, 0, &tokens("ab"));
    assert!(ctx.embeddings_ith(-1).is_err());
    assert!(ctx.embeddings_seq(0).is_none());
}
