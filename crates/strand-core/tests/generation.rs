mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use common::{context, greedy_no_eos, tokens};
use sim_backend::vocab::EOS;
use sim_backend::{SimBackend, SimVocab};
use strand_core::abi::{Model, SamplingParams};
use strand_core::{Error, Generator, Grammar, Sampler, StopReason};

fn generator(n_ctx: u32) -> Generator<SimBackend> {
    Generator::new(context(n_ctx, 1), greedy_no_eos())
}

#[test]
fn greedy_generation_is_deterministic() {
    let mut a = generator(64);
    let mut b = generator(64);
    a.set_max_tokens(Some(8));
    b.set_max_tokens(Some(8));

    let ga = a.generate("hello").unwrap();
    let gb = b.generate("hello").unwrap();
    assert_eq!(ga, gb);
    assert_eq!(ga.stop, StopReason::StepLimit);
    assert_eq!(ga.tokens.len(), 8);
    // BOS + "hello"
    assert_eq!(ga.n_prompt, 6);
    assert_eq!(a.history().len(), 6 + 8);
    assert_eq!(a.context().kv_cache().used_cells(), 14);
}

#[test]
fn streamed_deltas_add_up_to_the_text() {
    let mut g = generator(64);
    g.set_max_tokens(Some(12));
    let mut streamed = String::new();
    let out = g.generate_stream("abc", |d| streamed.push_str(d)).unwrap();
    assert_eq!(streamed, out.text);
}

#[test]
fn cached_prefix_is_reused() {
    let mut g = generator(64);
    g.set_max_tokens(Some(4));
    let prompt = tokens("the cat");
    g.generate_tokens(&prompt, |_| {}).unwrap();
    let before = g.context().backend().tokens_evaluated();

    // continue the conversation: everything cached so far plus one token
    let mut next = g.history().to_vec();
    next.push(SimVocab::byte_token(b'!'));
    let out = g.generate_tokens(&next, |_| {}).unwrap();
    assert_eq!(out.n_reused, next.len() - 1);
    // one prompt token, then one per generated token
    assert_eq!(g.context().backend().tokens_evaluated() - before, 1 + 4);
}

#[test]
fn identical_prompt_re_evaluates_the_last_token() {
    let mut g = generator(64);
    g.set_max_tokens(Some(2));
    let prompt = tokens("same");
    g.generate_tokens(&prompt, |_| {}).unwrap();

    // the whole prompt is cached; its last token is evaluated again
    let out = g.generate_tokens(&prompt, |_| {}).unwrap();
    assert_eq!(out.n_reused, prompt.len() - 1);
    assert_eq!(g.history().len(), prompt.len() + 2);
    let positions = g.context().kv_cache().seq_positions(0);
    assert_eq!(positions, (0..g.history().len() as i32).collect::<Vec<_>>());
}

#[test]
fn diverged_prompt_drops_the_stale_tail() {
    let mut g = generator(64);
    g.set_max_tokens(Some(3));
    g.generate_tokens(&tokens("abcdef"), |_| {}).unwrap();
    let out = g.generate_tokens(&tokens("abXY"), |_| {}).unwrap();
    assert_eq!(out.n_reused, 2);
    assert_eq!(g.history().len(), 4 + 3);
    assert_eq!(g.context().kv_cache().used_cells(), 7);
}

#[test]
fn context_shift_keeps_generating() {
    let mut g = Generator::new(context(16, 1), greedy_no_eos()).with_n_keep(2);
    g.set_max_tokens(Some(20));
    let out = g.generate_tokens(&tokens("0123456789"), |_| {}).unwrap();
    assert_eq!(out.stop, StopReason::StepLimit);
    assert_eq!(out.tokens.len(), 20);

    let n = g.history().len();
    assert!(n <= 16);
    // prefix kept, positions contiguous
    assert_eq!(&g.history()[..2], &tokens("01")[..]);
    let kv = g.context().kv_cache();
    assert_eq!(kv.seq_positions(0), (0..n as i32).collect::<Vec<_>>());
    assert_eq!(kv.used_cells(), n);
}

#[test]
fn stop_handle_ends_generation() {
    let ctx = context(64, 1);
    let grammar = Grammar::new("root ::= [a-z]+", "root", ctx.model().vocab()).unwrap();
    let mut g = Generator::new(ctx, greedy_no_eos().with_grammar(grammar));
    g.set_max_tokens(Some(10));

    let stop = g.stop_handle();
    let out = g
        .generate_tokens(&tokens("go"), |_| stop.store(true, Ordering::Relaxed))
        .unwrap();
    assert_eq!(out.stop, StopReason::Stopped);
    assert_eq!(out.tokens.len(), 1);

    // the next call clears the flag
    let out = g.generate_tokens(&tokens("go"), |_| {}).unwrap();
    assert_eq!(out.stop, StopReason::StepLimit);
}

#[test]
fn end_of_generation_token_stops() {
    let mut p = SamplingParams::greedy();
    p.logit_bias = Some(HashMap::from([(EOS.0 as u32, 1.0e9)]));
    let mut g = Generator::new(context(64, 1), Sampler::new(p));
    let out = g.generate("hi").unwrap();
    assert_eq!(out.stop, StopReason::EndOfGeneration);
    assert!(out.tokens.is_empty());
    assert!(out.text.is_empty());
}

#[test]
fn bad_inputs_are_rejected() {
    let mut g = generator(64);
    assert!(matches!(
        g.generate_tokens(&[], |_| {}),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        generator(64).with_sequence(3),
        Err(Error::InvalidSequenceSet(_))
    ));
}

#[test]
fn reset_forgets_the_sequence() {
    let mut g = generator(64);
    g.set_max_tokens(Some(3));
    g.generate_tokens(&tokens("abc"), |_| {}).unwrap();
    g.reset().unwrap();
    assert!(g.history().is_empty());
    assert_eq!(g.context().kv_cache().used_cells(), 0);

    let out = g.generate_tokens(&tokens("abc"), |_| {}).unwrap();
    assert_eq!(out.n_reused, 0);
}
