// State blob and session byte layout. All integers little-endian.
//
// state blob:
//   magic u32 | version u32 | n_ctx u32 | n_seq_max u32 | n_vocab u32 | n_embd u32
//   n_ids u32 | output_ids i32 * n_ids
//   n_logits u64 | logits f32 * n_logits
//   n_embd_vals u64 | embeddings f32 * n_embd_vals
//   n_cells u32 | per cell: pos i32, delta i32, n_seq u32, seq i32 * n_seq,
//                           n_state u32, state f32 * n_state
//
// session:
//   token_count u64 | tokens i32 * token_count | state blob
//
// The RNG is not part of the blob; reseed explicitly after a restore.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeSet;
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

use strand_abi::{Model, Token};
use tracing::debug;

use super::Context;
use crate::backend::ComputeBackend;
use crate::error::{Error, Result};
use crate::kv_cache::KvCell;

const STATE_MAGIC: u32 = 0x5654_5253; // "SRTV"
const STATE_VERSION: u32 = 1;

/// Destination buffer too small; carries the byte count needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("state needs {0} bytes")]
pub struct RequiredSize(pub usize);

#[derive(Default)]
struct CountingWriter(usize);

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct RawState {
    magic: u32,
    version: u32,
    n_ctx: u32,
    n_seq_max: u32,
    n_vocab: u32,
    n_embd: u32,
    output_ids: Vec<i32>,
    logits: Vec<f32>,
    embd: Vec<f32>,
    cells: Vec<KvCell>,
}

fn read_f32s<R: Read>(r: &mut R, n: u64) -> io::Result<Vec<f32>> {
    let mut out = Vec::new();
    for _ in 0..n {
        out.push(r.read_f32::<LittleEndian>()?);
    }
    Ok(out)
}

fn parse_state<R: Read>(r: &mut R) -> io::Result<RawState> {
    let magic = r.read_u32::<LittleEndian>()?;
    let version = r.read_u32::<LittleEndian>()?;
    let n_ctx = r.read_u32::<LittleEndian>()?;
    let n_seq_max = r.read_u32::<LittleEndian>()?;
    let n_vocab = r.read_u32::<LittleEndian>()?;
    let n_embd = r.read_u32::<LittleEndian>()?;

    let n_ids = r.read_u32::<LittleEndian>()?;
    let mut output_ids = Vec::new();
    for _ in 0..n_ids {
        output_ids.push(r.read_i32::<LittleEndian>()?);
    }
    let n_logits = r.read_u64::<LittleEndian>()?;
    let logits = read_f32s(r, n_logits)?;
    let n_embd_vals = r.read_u64::<LittleEndian>()?;
    let embd = read_f32s(r, n_embd_vals)?;

    let n_cells = r.read_u32::<LittleEndian>()?;
    if n_cells > n_ctx {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{n_cells} cells in a table of {n_ctx}"),
        ));
    }
    let mut cells = Vec::with_capacity(n_cells as usize);
    for _ in 0..n_cells {
        let pos = r.read_i32::<LittleEndian>()?;
        let delta = r.read_i32::<LittleEndian>()?;
        let n_seq = r.read_u32::<LittleEndian>()?;
        let mut seq = BTreeSet::new();
        for _ in 0..n_seq {
            seq.insert(r.read_i32::<LittleEndian>()?);
        }
        let n_state = r.read_u32::<LittleEndian>()?;
        let state = read_f32s(r, u64::from(n_state))?;
        cells.push(KvCell::restored(pos, delta, seq, state));
    }

    Ok(RawState {
        magic,
        version,
        n_ctx,
        n_seq_max,
        n_vocab,
        n_embd,
        output_ids,
        logits,
        embd,
        cells,
    })
}

impl<B: ComputeBackend> Context<B> {
    fn write_state<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(STATE_MAGIC)?;
        w.write_u32::<LittleEndian>(STATE_VERSION)?;
        w.write_u32::<LittleEndian>(self.params.n_ctx)?;
        w.write_u32::<LittleEndian>(self.params.n_seq_max)?;
        w.write_u32::<LittleEndian>(self.model.n_vocab() as u32)?;
        w.write_u32::<LittleEndian>(self.model.n_embd() as u32)?;

        w.write_u32::<LittleEndian>(self.output_ids.len() as u32)?;
        for id in &self.output_ids {
            w.write_i32::<LittleEndian>(*id)?;
        }
        w.write_u64::<LittleEndian>(self.logits.len() as u64)?;
        for v in &self.logits {
            w.write_f32::<LittleEndian>(*v)?;
        }
        w.write_u64::<LittleEndian>(self.embd.len() as u64)?;
        for v in &self.embd {
            w.write_f32::<LittleEndian>(*v)?;
        }

        w.write_u32::<LittleEndian>(self.kv.used_cells() as u32)?;
        for cell in self.kv.occupied() {
            w.write_i32::<LittleEndian>(cell.pos())?;
            w.write_i32::<LittleEndian>(cell.delta())?;
            w.write_u32::<LittleEndian>(cell.n_seq() as u32)?;
            for s in cell.seq_ids() {
                w.write_i32::<LittleEndian>(s)?;
            }
            let state = cell.state();
            w.write_u32::<LittleEndian>(state.len() as u32)?;
            for v in state {
                w.write_f32::<LittleEndian>(*v)?;
            }
        }
        Ok(())
    }

    /// Exact byte length [`Context::copy_state_data`] produces right now.
    pub fn state_size(&self) -> usize {
        let mut counter = CountingWriter::default();
        // CountingWriter never fails.
        let _ = self.write_state(&mut counter);
        counter.0
    }

    /// Serialize cache, outputs and configuration tag.
    pub fn copy_state_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.state_size());
        // Writing into a Vec never fails.
        let _ = self.write_state(&mut buf);
        buf
    }

    /// Write the state into `dst` if it fits, else report the size needed.
    pub fn copy_state_data_into(&self, dst: &mut [u8]) -> std::result::Result<usize, RequiredSize> {
        let need = self.state_size();
        if dst.len() < need {
            return Err(RequiredSize(need));
        }
        let mut cur = &mut dst[..need];
        self.write_state(&mut cur).map_err(|_| RequiredSize(need))?;
        Ok(need)
    }

    /// Restore a blob from [`Context::copy_state_data`]. Returns bytes consumed.
    ///
    /// The blob is parsed and checked in full before anything is replaced.
    pub fn set_state_data(&mut self, src: &[u8]) -> Result<usize> {
        let mut cur = Cursor::new(src);
        let raw = parse_state(&mut cur)
            .map_err(|e| Error::IncompatibleState(format!("corrupt state blob: {e}")))?;
        self.check_compatible(&raw)?;

        self.n_outputs = raw.output_ids.iter().filter(|id| **id >= 0).count();
        self.output_ids = raw.output_ids;
        self.logits = raw.logits;
        self.embd = raw.embd;
        self.seq_embd.clear();
        self.kv.restore(raw.cells);
        debug!(
            bytes = cur.position(),
            cells = self.kv.used_cells(),
            "state restored"
        );
        Ok(cur.position() as usize)
    }

    fn check_compatible(&self, raw: &RawState) -> Result<()> {
        if raw.magic != STATE_MAGIC || raw.version != STATE_VERSION {
            return Err(Error::IncompatibleState(format!(
                "unknown state format (magic {:#x}, version {})",
                raw.magic, raw.version
            )));
        }
        if raw.n_ctx != self.params.n_ctx || raw.n_seq_max != self.params.n_seq_max {
            return Err(Error::IncompatibleState(format!(
                "blob has n_ctx = {}, n_seq_max = {}; context has n_ctx = {}, n_seq_max = {}",
                raw.n_ctx, raw.n_seq_max, self.params.n_ctx, self.params.n_seq_max
            )));
        }
        let n_vocab = self.model.n_vocab();
        if raw.n_vocab as usize != n_vocab || raw.n_embd as usize != self.model.n_embd() {
            return Err(Error::IncompatibleState(format!(
                "blob was written for n_vocab = {}, n_embd = {}",
                raw.n_vocab, raw.n_embd
            )));
        }
        let rows: Vec<i32> = raw.output_ids.iter().copied().filter(|id| *id >= 0).collect();
        let n_out = rows.len();
        if rows.iter().collect::<BTreeSet<_>>().len() != n_out
            || rows.iter().any(|r| *r as usize >= n_out)
        {
            return Err(Error::IncompatibleState(format!(
                "output rows {rows:?} do not index {n_out} outputs"
            )));
        }
        if raw.logits.len() != n_out * n_vocab {
            return Err(Error::IncompatibleState(format!(
                "{} logits for {n_out} outputs",
                raw.logits.len()
            )));
        }
        if !raw.embd.is_empty() && raw.embd.len() != n_out * self.model.n_embd() {
            return Err(Error::IncompatibleState(format!(
                "{} embedding values for {n_out} outputs",
                raw.embd.len()
            )));
        }
        let n_seq_max = self.params.n_seq_max as i32;
        for cell in &raw.cells {
            if cell.is_empty() || cell.pos() < 0 {
                return Err(Error::IncompatibleState("blob holds an empty cell".into()));
            }
            if cell.seq_ids().any(|s| s < 0 || s >= n_seq_max) {
                return Err(Error::IncompatibleState(format!(
                    "cell owned by a sequence outside [0, {n_seq_max})"
                )));
            }
        }
        Ok(())
    }

    // ========== SESSIONS ==========

    /// Write `(token_count, tokens, state blob)`.
    pub fn save_session<W: Write>(&self, mut w: W, tokens: &[Token]) -> Result<()> {
        w.write_u64::<LittleEndian>(tokens.len() as u64)?;
        for t in tokens {
            w.write_i32::<LittleEndian>(t.0)?;
        }
        self.write_state(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Read a session written by [`Context::save_session`] and restore its state.
    /// Fails with `CapacityExceeded` when it holds more than `token_capacity` tokens.
    pub fn load_session<R: Read>(&mut self, mut r: R, token_capacity: usize) -> Result<Vec<Token>> {
        let count = r.read_u64::<LittleEndian>()?;
        if count > token_capacity as u64 {
            return Err(Error::CapacityExceeded(format!(
                "session holds {count} tokens, capacity is {token_capacity}"
            )));
        }
        let mut tokens = Vec::with_capacity(count as usize);
        for _ in 0..count {
            tokens.push(Token(r.read_i32::<LittleEndian>()?));
        }
        let mut blob = Vec::new();
        r.read_to_end(&mut blob)?;
        self.set_state_data(&blob)?;
        Ok(tokens)
    }
}
