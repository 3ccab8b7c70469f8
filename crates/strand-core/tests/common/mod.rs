#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use sim_backend::{SimBackend, SimModel, SimVocab, vocab::EOS};
use strand_core::abi::{Pos, SeqId, Token};
use strand_core::abi::SamplingParams;
use strand_core::{Batch, Context, ContextParams, Sampler};

pub fn model() -> Arc<SimModel> {
    Arc::new(SimModel::tiny())
}

pub fn params(n_ctx: u32, n_seq_max: u32) -> ContextParams {
    ContextParams::default()
        .with_n_ctx(n_ctx)
        .with_n_batch(n_ctx)
        .with_n_seq_max(n_seq_max)
        .with_seed(1234)
}

pub fn context(n_ctx: u32, n_seq_max: u32) -> Context<SimBackend> {
    context_with(model(), params(n_ctx, n_seq_max))
}

pub fn context_with(model: Arc<SimModel>, params: ContextParams) -> Context<SimBackend> {
    Context::new(model, SimBackend::new(), params).expect("context")
}

/// Byte tokens of `text`.
pub fn tokens(text: &str) -> Vec<Token> {
    text.bytes().map(SimVocab::byte_token).collect()
}

/// Decode `toks` for `seq` at positions `from..`, logits for the last one.
pub fn feed(ctx: &mut Context<SimBackend>, seq: SeqId, from: Pos, toks: &[Token]) {
    let mut batch = Batch::new(toks.len(), 0, ctx.n_seq_max());
    batch.fill_sequence(toks, from, seq).expect("fill");
    ctx.decode(&batch).expect("decode");
}

/// Decode one token for `seq` at `pos` and return its logits.
pub fn step(ctx: &mut Context<SimBackend>, seq: SeqId, pos: Pos, tok: Token) -> Vec<f32> {
    feed(ctx, seq, pos, &[tok]);
    ctx.logits_ith(0).expect("logits").to_vec()
}

/// Argmax sampling that never picks EOS, so runs last until the step limit.
pub fn greedy_no_eos() -> Sampler {
    let mut p = SamplingParams::greedy();
    p.repetition_penalty = None;
    p.logit_bias = Some(HashMap::from([(EOS.0 as u32, -1.0e9)]));
    Sampler::new(p)
}
