//! Per-context attention-state store and its sequence algebra.
//!
//! The cache is a fixed table of `n_ctx` cells. A live cell carries the set of
//! sequences that own it, its position, the positional delta accumulated since
//! the backend last re-encoded it, and the opaque state the backend computed
//! for it. `copy` aliases cells (dst joins the owner set); shifting a cell that
//! other sequences still own splits it into a fresh cell first.

use std::collections::BTreeSet;
use std::sync::Arc;

use strand_abi::{POS_NULL, Pos, SeqId};
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct KvCell {
    pos: Pos,
    delta: Pos,
    seq: BTreeSet<SeqId>,
    state: Option<Arc<[f32]>>,
}

impl Default for KvCell {
    fn default() -> Self {
        Self {
            pos: POS_NULL,
            delta: 0,
            seq: BTreeSet::new(),
            state: None,
        }
    }
}

impl KvCell {
    pub(crate) fn restored(pos: Pos, delta: Pos, seq: BTreeSet<SeqId>, state: Vec<f32>) -> Self {
        Self {
            pos,
            delta,
            seq,
            state: Some(state.into()),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    #[inline]
    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// Shift applied since the backend last re-encoded this cell.
    #[inline]
    pub fn delta(&self) -> Pos {
        self.delta
    }

    #[inline]
    pub fn has_seq(&self, seq: SeqId) -> bool {
        self.seq.contains(&seq)
    }

    pub fn seq_ids(&self) -> impl Iterator<Item = SeqId> + '_ {
        self.seq.iter().copied()
    }

    pub fn n_seq(&self) -> usize {
        self.seq.len()
    }

    /// Backend state for this cell (empty for free cells).
    pub fn state(&self) -> &[f32] {
        self.state.as_deref().unwrap_or(&[])
    }

    fn shares_any(&self, seqs: &[SeqId]) -> bool {
        seqs.iter().any(|s| self.seq.contains(s))
    }

    fn reset(&mut self) {
        self.pos = POS_NULL;
        self.delta = 0;
        self.seq.clear();
        self.state = None;
    }
}

pub struct KvCache {
    cells: Vec<KvCell>,
    head: usize,
    used: usize,
    n_seq_max: usize,
    has_shift: bool,
    do_defrag: bool,
    defrag_thold: f32,
}

/// `p0 < 0` means 0, `p1 < 0` means "to the end". An inverted range is empty.
fn clamp_range(p0: Pos, p1: Pos) -> (Pos, Pos) {
    (p0.max(0), if p1 < 0 { Pos::MAX } else { p1 })
}

impl KvCache {
    pub fn new(n_ctx: usize, n_seq_max: usize) -> Self {
        Self {
            cells: vec![KvCell::default(); n_ctx],
            head: 0,
            used: 0,
            n_seq_max: n_seq_max.max(1),
            has_shift: false,
            do_defrag: false,
            defrag_thold: 0.0,
        }
    }

    /// Fragmentation ratio above which a compaction is scheduled after decode.
    /// `<= 0` disables automatic scheduling.
    pub fn with_defrag_threshold(mut self, thold: f32) -> Self {
        self.defrag_thold = thold;
        self
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn n_seq_max(&self) -> usize {
        self.n_seq_max
    }

    /// Number of occupied cells.
    #[inline]
    pub fn used_cells(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn free_cells(&self) -> usize {
        self.cells.len() - self.used
    }

    /// Sum of owners over all cells: an aliased cell counts once per sequence.
    pub fn token_count(&self) -> usize {
        self.cells.iter().map(|c| c.seq.len()).sum()
    }

    pub fn cells(&self) -> &[KvCell] {
        &self.cells
    }

    /// Cells attended by an entry owned by `seqs` at position `max_pos`, in table order.
    pub fn visible<'a>(
        &'a self,
        seqs: &'a [SeqId],
        max_pos: Pos,
    ) -> impl Iterator<Item = &'a KvCell> + 'a {
        self.cells
            .iter()
            .filter(move |c| !c.is_empty() && c.pos <= max_pos && c.shares_any(seqs))
    }

    fn check_seq(&self, seq: SeqId) -> Result<()> {
        if seq < 0 || seq as usize >= self.n_seq_max {
            return Err(Error::InvalidArgument(format!(
                "sequence id {seq} outside [0, {})",
                self.n_seq_max
            )));
        }
        Ok(())
    }

    fn free_cell(&mut self, i: usize) {
        self.cells[i].reset();
        self.used -= 1;
        if i < self.head {
            self.head = i;
        }
    }

    // ========== SEQUENCE ALGEBRA ==========

    /// Drop every cell of every sequence.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.reset();
        }
        self.head = 0;
        self.used = 0;
        self.has_shift = false;
        self.do_defrag = false;
    }

    /// Drop `seq`'s cells with position in `[p0, p1)`. A negative `seq` matches
    /// every sequence. Returns whether anything matched.
    pub fn remove(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> Result<bool> {
        if seq >= 0 {
            self.check_seq(seq)?;
        }
        let (p0, p1) = clamp_range(p0, p1);
        let mut matched = false;
        for i in 0..self.cells.len() {
            let cell = &mut self.cells[i];
            if cell.is_empty() || cell.pos < p0 || cell.pos >= p1 {
                continue;
            }
            if seq < 0 {
                cell.seq.clear();
            } else if !cell.seq.remove(&seq) {
                continue;
            }
            matched = true;
            if cell.seq.is_empty() {
                self.free_cell(i);
            }
        }
        Ok(matched)
    }

    /// Make `dst` additionally own every `src` cell in `[p0, p1)`. Cells dst
    /// already owns stay; no cells are consumed.
    pub fn copy(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) -> Result<()> {
        self.check_seq(src)?;
        self.check_seq(dst)?;
        if src == dst {
            return Ok(());
        }
        let (p0, p1) = clamp_range(p0, p1);
        for cell in &mut self.cells {
            if cell.pos >= p0 && cell.pos < p1 && cell.seq.contains(&src) {
                cell.seq.insert(dst);
            }
        }
        Ok(())
    }

    /// Drop everything not owned by `seq`; shared cells keep `seq` as sole owner.
    pub fn keep(&mut self, seq: SeqId) -> Result<()> {
        self.check_seq(seq)?;
        for i in 0..self.cells.len() {
            let cell = &mut self.cells[i];
            if cell.is_empty() {
                continue;
            }
            if cell.seq.contains(&seq) {
                cell.seq.retain(|s| *s == seq);
            } else {
                self.free_cell(i);
            }
        }
        Ok(())
    }

    /// Add `delta` to the position of `seq`'s cells in `[p0, p1)`.
    /// Cells pushed below position 0 are dropped for `seq`.
    pub fn shift(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) -> Result<()> {
        self.check_seq(seq)?;
        if delta == 0 {
            return Ok(());
        }
        let (p0, p1) = clamp_range(p0, p1);
        for i in self.targets(seq, p0, p1) {
            let new_pos = self.cells[i].pos.saturating_add(delta);
            self.relocate(i, seq, new_pos);
        }
        self.head = 0;
        Ok(())
    }

    /// Integer-divide the position of `seq`'s cells in `[p0, p1)` by `d`.
    pub fn divide(&mut self, seq: SeqId, p0: Pos, p1: Pos, d: i32) -> Result<()> {
        self.check_seq(seq)?;
        if d <= 0 {
            return Err(Error::InvalidArgument(format!("divisor must be positive, got {d}")));
        }
        if d == 1 {
            return Ok(());
        }
        let (p0, p1) = clamp_range(p0, p1);
        for i in self.targets(seq, p0, p1) {
            let new_pos = self.cells[i].pos / d;
            self.relocate(i, seq, new_pos);
        }
        Ok(())
    }

    fn targets(&self, seq: SeqId, p0: Pos, p1: Pos) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pos >= p0 && c.pos < p1 && c.seq.contains(&seq))
            .map(|(i, _)| i)
            .collect()
    }

    /// Move `seq`'s view of cell `i` to `new_pos`, splitting shared cells.
    fn relocate(&mut self, i: usize, seq: SeqId, new_pos: Pos) {
        if new_pos < 0 {
            self.cells[i].seq.remove(&seq);
            if self.cells[i].seq.is_empty() {
                self.free_cell(i);
            }
            return;
        }
        let d = new_pos - self.cells[i].pos;
        if d == 0 {
            return;
        }
        self.has_shift = true;

        if self.cells[i].seq.len() > 1 {
            if let Some(j) = self.find_free_cell() {
                let src = &mut self.cells[i];
                src.seq.remove(&seq);
                let split = KvCell {
                    pos: new_pos,
                    delta: src.delta + d,
                    seq: BTreeSet::from([seq]),
                    state: src.state.clone(),
                };
                self.cells[j] = split;
                self.used += 1;
                return;
            }
            warn!(
                cell = i,
                seq, "kv cache full: shifting shared cell for all owners"
            );
        }
        let cell = &mut self.cells[i];
        cell.pos = new_pos;
        cell.delta += d;
    }

    fn find_free_cell(&self) -> Option<usize> {
        let n = self.cells.len();
        (0..n)
            .map(|k| (self.head + k) % n)
            .find(|&j| self.cells[j].is_empty())
    }

    /// Highest position cached for `seq`, or [`POS_NULL`].
    pub fn max_position(&self, seq: SeqId) -> Result<Pos> {
        self.check_seq(seq)?;
        Ok(self
            .cells
            .iter()
            .filter(|c| c.seq.contains(&seq))
            .map(|c| c.pos)
            .max()
            .unwrap_or(POS_NULL))
    }

    /// Lowest position cached for `seq`, or [`POS_NULL`].
    pub fn min_position(&self, seq: SeqId) -> Result<Pos> {
        self.check_seq(seq)?;
        Ok(self
            .cells
            .iter()
            .filter(|c| c.seq.contains(&seq))
            .map(|c| c.pos)
            .min()
            .unwrap_or(POS_NULL))
    }

    /// Cells owned by `seq` (0 for ids the cache does not know).
    pub fn seq_cell_count(&self, seq: SeqId) -> usize {
        self.cells.iter().filter(|c| c.seq.contains(&seq)).count()
    }

    /// Sorted positions held by `seq`.
    pub fn seq_positions(&self, seq: SeqId) -> Vec<Pos> {
        let mut out: Vec<Pos> = self
            .cells
            .iter()
            .filter(|c| c.seq.contains(&seq))
            .map(|c| c.pos)
            .collect();
        out.sort_unstable();
        out
    }

    // ========== MAINTENANCE ==========

    /// Schedule a compaction. It runs on the next context update or decode.
    pub fn defragment(&mut self) {
        self.do_defrag = true;
    }

    #[inline]
    pub fn defrag_pending(&self) -> bool {
        self.do_defrag
    }

    #[inline]
    pub fn shift_pending(&self) -> bool {
        self.has_shift
    }

    /// `1 - used / span`, where span ends at the last occupied cell.
    pub fn fragmentation(&self) -> f32 {
        match self.cells.iter().rposition(|c| !c.is_empty()) {
            None => 0.0,
            Some(last) => 1.0 - self.used as f32 / (last + 1) as f32,
        }
    }

    pub(crate) fn schedule_defrag_if_fragmented(&mut self) {
        if self.defrag_thold > 0.0 && self.fragmentation() > self.defrag_thold {
            debug!(
                fragmentation = self.fragmentation(),
                thold = self.defrag_thold,
                "scheduling kv defrag"
            );
            self.do_defrag = true;
        }
    }

    /// Pack live cells to the front, keeping their relative order.
    /// Returns how many cells moved.
    pub(crate) fn run_defrag(&mut self) -> usize {
        let mut write = 0;
        let mut moves = 0;
        for read in 0..self.cells.len() {
            if self.cells[read].is_empty() {
                continue;
            }
            if read != write {
                self.cells.swap(read, write);
                moves += 1;
            }
            write += 1;
        }
        self.head = write;
        self.do_defrag = false;
        moves
    }

    /// Hand every shifted cell to `reencode(state, pos, delta)`; a returned vector
    /// replaces the state. Deltas are reset afterwards.
    pub(crate) fn apply_shift(&mut self, mut reencode: impl FnMut(&[f32], Pos, Pos) -> Option<Vec<f32>>) {
        for cell in self.cells.iter_mut().filter(|c| !c.is_empty()) {
            if cell.delta != 0 {
                if let Some(next) = reencode(cell.state(), cell.pos, cell.delta) {
                    cell.state = Some(next.into());
                }
            }
            cell.delta = 0;
        }
        self.has_shift = false;
    }

    // ========== DECODE SUPPORT ==========

    /// First index of `n` contiguous free cells, searching from `head` and wrapping.
    pub(crate) fn find_slot(&self, n: usize) -> Option<usize> {
        let size = self.cells.len();
        if n == 0 || n > size {
            return None;
        }
        let mut start = if self.head + n > size { 0 } else { self.head };
        let mut tested = 0;
        while tested < size {
            if start + n > size {
                tested += size - start;
                start = 0;
                continue;
            }
            match self.cells[start..start + n]
                .iter()
                .rposition(|c| !c.is_empty())
            {
                None => return Some(start),
                Some(busy) => {
                    start += busy + 1;
                    tested += busy + 1;
                }
            }
        }
        None
    }

    /// Write one cell per batch entry starting at `start`.
    pub(crate) fn commit(&mut self, start: usize, batch: &Batch, states: Vec<Arc<[f32]>>) {
        for (i, state) in states.into_iter().enumerate().take(batch.len()) {
            let cell = &mut self.cells[start + i];
            cell.pos = batch.pos(i);
            cell.delta = 0;
            cell.seq = batch.seq_ids(i).iter().copied().collect();
            cell.state = Some(state);
        }
        self.used += batch.len();
        self.head = start + batch.len();
        if self.head >= self.cells.len() {
            self.head = 0;
        }
    }

    /// Occupied cells in table order.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = &KvCell> {
        self.cells.iter().filter(|c| !c.is_empty())
    }

    /// Replace the whole table with `live` packed at the front.
    pub(crate) fn restore(&mut self, live: Vec<KvCell>) {
        self.clear();
        self.has_shift = live.iter().any(|c| c.delta != 0);
        self.used = live.len();
        for (slot, cell) in self.cells.iter_mut().zip(live) {
            *slot = cell;
        }
        self.head = if self.used >= self.cells.len() { 0 } else { self.used };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_abi::Token;

    fn state(v: f32) -> Arc<[f32]> {
        Arc::from(vec![v])
    }

    /// Append `n` cells for `seq` starting at `from`.
    fn fill(cache: &mut KvCache, seq: SeqId, from: Pos, n: usize) {
        let mut b = Batch::new(n, 0, cache.n_seq_max());
        for i in 0..n {
            b.add(Token(i as i32), from + i as Pos, &[seq], false).unwrap();
        }
        let slot = cache.find_slot(n).unwrap();
        let states = (0..n).map(|i| state(i as f32)).collect();
        cache.commit(slot, &b, states);
    }

    #[test]
    fn remove_is_half_open() {
        let mut c = KvCache::new(16, 1);
        fill(&mut c, 0, 0, 10);
        assert!(c.remove(0, 3, 6).unwrap());
        assert_eq!(c.seq_positions(0), vec![0, 1, 2, 6, 7, 8, 9]);
        assert_eq!(c.used_cells(), 7);
        // nothing left in the range: a no-op, not an error
        assert!(!c.remove(0, 3, 6).unwrap());
    }

    #[test]
    fn remove_to_end_and_max_position() {
        let mut c = KvCache::new(16, 1);
        fill(&mut c, 0, 0, 10);
        c.remove(0, 4, -1).unwrap();
        assert_eq!(c.max_position(0).unwrap(), 3);
        c.remove(0, -5, -1).unwrap();
        assert_eq!(c.max_position(0).unwrap(), POS_NULL);
        assert_eq!(c.used_cells(), 0);
    }

    #[test]
    fn remove_with_negative_seq_matches_all() {
        let mut c = KvCache::new(16, 2);
        fill(&mut c, 0, 0, 4);
        fill(&mut c, 1, 0, 4);
        c.remove(-1, 2, -1).unwrap();
        assert_eq!(c.seq_positions(0), vec![0, 1]);
        assert_eq!(c.seq_positions(1), vec![0, 1]);
    }

    #[test]
    fn invalid_sequence_is_a_hard_error() {
        let mut c = KvCache::new(8, 2);
        assert!(matches!(c.remove(2, 0, -1), Err(Error::InvalidArgument(_))));
        assert!(matches!(c.copy(0, 5, 0, -1), Err(Error::InvalidArgument(_))));
        assert!(matches!(c.keep(-1), Err(Error::InvalidArgument(_))));
        assert!(matches!(c.shift(9, 0, -1, 1), Err(Error::InvalidArgument(_))));
        assert!(matches!(c.max_position(2), Err(Error::InvalidArgument(_))));
        assert!(matches!(c.divide(0, 0, -1, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn copy_aliases_without_new_cells() {
        let mut c = KvCache::new(16, 2);
        fill(&mut c, 0, 0, 5);
        c.copy(0, 1, 0, -1).unwrap();
        assert_eq!(c.used_cells(), 5);
        assert_eq!(c.token_count(), 10);
        assert_eq!(c.seq_positions(1), c.seq_positions(0));

        c.keep(1).unwrap();
        assert_eq!(c.seq_cell_count(0), 0);
        assert_eq!(c.seq_positions(1), vec![0, 1, 2, 3, 4]);
        assert_eq!(c.token_count(), 5);
    }

    #[test]
    fn copy_adds_to_destination_cells() {
        let mut c = KvCache::new(16, 2);
        fill(&mut c, 0, 0, 3);
        fill(&mut c, 1, 0, 6);
        c.copy(0, 1, 0, 3).unwrap();
        // dst keeps its own cells and also owns src's
        assert_eq!(c.seq_positions(1), vec![0, 0, 1, 1, 2, 2, 3, 4, 5]);
        assert_eq!(c.seq_positions(0), vec![0, 1, 2]);
        assert_eq!(c.used_cells(), 9);
        assert_eq!(c.max_position(1).unwrap(), 5);
    }

    #[test]
    fn shift_compacts_after_remove() {
        let mut c = KvCache::new(16, 1);
        fill(&mut c, 0, 0, 10);
        c.remove(0, 0, 4).unwrap();
        c.shift(0, 4, -1, -4).unwrap();
        assert_eq!(c.seq_positions(0), vec![0, 1, 2, 3, 4, 5]);
        assert!(c.shift_pending());
        assert!(c.cells().iter().filter(|x| !x.is_empty()).all(|x| x.delta() == -4));
    }

    #[test]
    fn shift_below_zero_drops_cells() {
        let mut c = KvCache::new(8, 1);
        fill(&mut c, 0, 0, 4);
        c.shift(0, 0, -1, -2).unwrap();
        assert_eq!(c.seq_positions(0), vec![0, 1]);
        assert_eq!(c.used_cells(), 2);
    }

    #[test]
    fn shift_splits_shared_cells() {
        let mut c = KvCache::new(8, 2);
        fill(&mut c, 0, 0, 3);
        c.copy(0, 1, 0, -1).unwrap();
        c.shift(1, 0, -1, 10).unwrap();
        assert_eq!(c.seq_positions(0), vec![0, 1, 2]);
        assert_eq!(c.seq_positions(1), vec![10, 11, 12]);
        assert_eq!(c.used_cells(), 6);
        // the split cell carries the original state
        let moved = c.cells().iter().find(|x| x.pos() == 11).unwrap();
        assert_eq!(moved.state(), &[1.0]);
    }

    #[test]
    fn divide_rescales_positions() {
        let mut c = KvCache::new(8, 1);
        fill(&mut c, 0, 0, 6);
        c.divide(0, 2, -1, 2).unwrap();
        assert_eq!(c.seq_positions(0), vec![0, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn defrag_packs_and_preserves_identity() {
        let mut c = KvCache::new(8, 2);
        fill(&mut c, 0, 0, 4);
        fill(&mut c, 1, 0, 4);
        c.remove(0, 0, 2).unwrap();
        c.remove(1, 2, 4).unwrap();
        assert!(c.fragmentation() > 0.0);
        let before0 = c.seq_positions(0);
        let before1 = c.seq_positions(1);

        c.defragment();
        assert!(c.defrag_pending());
        let moved = c.run_defrag();
        assert!(moved > 0);
        assert_eq!(c.fragmentation(), 0.0);
        assert!(c.cells()[..4].iter().all(|x| !x.is_empty()));
        assert_eq!(c.seq_positions(0), before0);
        assert_eq!(c.seq_positions(1), before1);
    }

    #[test]
    fn find_slot_needs_contiguous_space() {
        let mut c = KvCache::new(6, 1);
        fill(&mut c, 0, 0, 6);
        c.remove(0, 1, 2).unwrap();
        c.remove(0, 3, 5).unwrap();
        assert_eq!(c.free_cells(), 3);
        assert_eq!(c.find_slot(2), Some(3));
        assert_eq!(c.find_slot(3), None);
        c.run_defrag();
        assert_eq!(c.find_slot(3), Some(3));
    }

    #[test]
    fn auto_defrag_respects_threshold() {
        let mut c = KvCache::new(8, 1).with_defrag_threshold(0.3);
        fill(&mut c, 0, 0, 8);
        c.remove(0, 0, 4).unwrap();
        c.schedule_defrag_if_fragmented();
        assert!(c.defrag_pending());
    }
}
