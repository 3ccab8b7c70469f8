mod common;

use std::fs::File;
use std::io::{BufReader, BufWriter};

use common::{context, feed, step, tokens};
use sim_backend::SimVocab;
use strand_core::abi::Model;
use strand_core::{Error, RequiredSize};

#[test]
fn session_file_restores_the_exact_state() {
    let prompt = tokens("once upon a time");
    let mut ctx = context(64, 1);
    feed(&mut ctx, 0, 0, &prompt);
    let mut history = prompt.clone();
    for (i, b) in b" there".iter().enumerate() {
        let t = SimVocab::byte_token(*b);
        step(&mut ctx, 0, (prompt.len() + i) as i32, t);
        history.push(t);
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.session");
    ctx.save_session(BufWriter::new(File::create(&path).unwrap()), &history)
        .unwrap();

    let mut restored = context(64, 1);
    let loaded = restored
        .load_session(BufReader::new(File::open(&path).unwrap()), 64)
        .unwrap();
    assert_eq!(loaded, history);
    assert_eq!(
        restored.kv_cache().max_position(0).unwrap(),
        ctx.kv_cache().max_position(0).unwrap()
    );
    assert_eq!(restored.logits(), ctx.logits());

    let next = SimVocab::byte_token(b'.');
    let pos = history.len() as i32;
    assert_eq!(step(&mut restored, 0, pos, next), step(&mut ctx, 0, pos, next));
}

#[test]
fn token_capacity_is_enforced() {
    let mut ctx = context(32, 1);
    feed(&mut ctx, 0, 0, &tokens("abcdef"));
    let mut buf = Vec::new();
    ctx.save_session(&mut buf, &tokens("abcdef")).unwrap();

    let mut other = context(32, 1);
    let err = other.load_session(buf.as_slice(), 4).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded(_)));
    assert_eq!(other.kv_cache().used_cells(), 0);
}

#[test]
fn state_blob_round_trip_and_sizes() {
    let mut ctx = context(32, 2);
    feed(&mut ctx, 0, 0, &tokens("abc"));
    ctx.kv_cache_mut().copy(0, 1, 0, -1).unwrap();
    feed(&mut ctx, 1, 3, &tokens("d"));

    let blob = ctx.copy_state_data();
    assert_eq!(blob.len(), ctx.state_size());

    let mut small = vec![0u8; blob.len() - 1];
    assert_eq!(
        ctx.copy_state_data_into(&mut small),
        Err(RequiredSize(blob.len()))
    );
    let mut exact = vec![0u8; blob.len() + 16];
    assert_eq!(ctx.copy_state_data_into(&mut exact), Ok(blob.len()));
    assert_eq!(&exact[..blob.len()], blob.as_slice());

    let mut restored = context(32, 2);
    assert_eq!(restored.set_state_data(&blob).unwrap(), blob.len());
    let kv = restored.kv_cache();
    assert_eq!(kv.used_cells(), 4);
    assert_eq!(kv.seq_positions(0), vec![0, 1, 2]);
    assert_eq!(kv.seq_positions(1), vec![0, 1, 2, 3]);
    assert_eq!(restored.logits_ith(-1).unwrap(), ctx.logits_ith(-1).unwrap());
}

#[test]
fn incompatible_state_is_rejected_untouched() {
    let mut ctx = context(32, 1);
    feed(&mut ctx, 0, 0, &tokens("abc"));
    let blob = ctx.copy_state_data();

    let mut bigger = context(64, 1);
    feed(&mut bigger, 0, 0, &tokens("zz"));
    assert!(matches!(
        bigger.set_state_data(&blob),
        Err(Error::IncompatibleState(_))
    ));
    assert_eq!(bigger.kv_cache().used_cells(), 2);

    let mut same = context(32, 1);
    assert!(matches!(
        same.set_state_data(&blob[..blob.len() / 2]),
        Err(Error::IncompatibleState(_))
    ));
    assert!(matches!(
        same.set_state_data(b"not a state blob at all"),
        Err(Error::IncompatibleState(_))
    ));
    assert_eq!(same.kv_cache().used_cells(), 0);
}

#[test]
fn output_tables_must_match_their_rows() {
    let mut ctx = context(32, 1);
    feed(&mut ctx, 0, 0, &tokens("abc"));
    let blob = ctx.copy_state_data();
    // header, then n_ids = 3 and the ids [-1, -1, 0]
    let ids_at = 6 * 4 + 4;
    assert_eq!(&blob[ids_at + 8..ids_at + 12], &0i32.to_le_bytes());

    let mut bad_row = blob.clone();
    bad_row[ids_at + 8..ids_at + 12].copy_from_slice(&5i32.to_le_bytes());
    let mut dup_row = blob.clone();
    dup_row[ids_at + 4..ids_at + 8].copy_from_slice(&0i32.to_le_bytes());

    // one stray embedding value after the logits
    let embd_at = ids_at + 3 * 4 + 8 + 4 * ctx.model().n_vocab();
    assert_eq!(&blob[embd_at..embd_at + 8], &0u64.to_le_bytes());
    let mut stray_embd = blob[..embd_at].to_vec();
    stray_embd.extend_from_slice(&1u64.to_le_bytes());
    stray_embd.extend_from_slice(&0.5f32.to_le_bytes());
    stray_embd.extend_from_slice(&blob[embd_at + 8..]);

    let mut target = context(32, 1);
    for corrupt in [bad_row, dup_row, stray_embd] {
        assert!(matches!(
            target.set_state_data(&corrupt),
            Err(Error::IncompatibleState(_))
        ));
        assert_eq!(target.kv_cache().used_cells(), 0);
    }
    assert_eq!(target.set_state_data(&blob).unwrap(), blob.len());
    assert_eq!(target.logits_ith(2).unwrap(), ctx.logits_ith(2).unwrap());
}
