use std::fmt::{self, Debug, Formatter};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Result, StreamError};
use crate::pieces::{Piece, PieceState, PieceStates};

/// An ordered run of pieces with contiguous absolute piece indices.
///
/// Geometry (sizes and offsets) is fixed at construction. Piece states live alongside it
/// and are shared by every [`slice`](PieceList::slice) of the same list, as is the absolute
/// piece index space: piece 51 of a slice is piece 51 of the parent.
#[derive(Clone)]
pub struct PieceList {
    inner: Arc<Inner>,
    /// Window into `inner`, as list positions
    start: usize,
    end: usize,
}

struct Inner {
    initial_piece_index: usize,
    sizes: Box<[u64]>,
    /// Prefix sums of `sizes` shifted by the initial data offset
    offsets: Box<[u64]>,
    states: PieceStates,
}

impl PieceList {
    pub fn empty() -> Self {
        Self::create(0, 0, 0, |_| 0)
    }

    /// Builds a list of `count` pieces starting at absolute byte `initial_data_offset`.
    pub fn create(
        count: usize,
        initial_data_offset: u64,
        initial_piece_index: usize,
        get_piece_size: impl FnMut(usize) -> u64,
    ) -> Self {
        let sizes: Box<[u64]> = (0..count).map(get_piece_size).collect();
        let mut offsets = Vec::with_capacity(count);
        let mut offset = initial_data_offset;
        for size in sizes.iter() {
            offsets.push(offset);
            offset += size;
        }
        let inner = Inner {
            initial_piece_index,
            sizes,
            offsets: offsets.into_boxed_slice(),
            states: PieceStates::new(count),
        };
        Self {
            inner: Arc::new(inner),
            start: 0,
            end: count,
        }
    }

    /// Splits `total_size` bytes into pieces of `piece_size`, the last one truncated.
    pub fn create_with_piece_size(
        total_size: u64,
        piece_size: u64,
        initial_data_offset: u64,
    ) -> Result<Self> {
        if piece_size == 0 {
            return Err(StreamError::InvalidArgument(
                "piece size must be positive".to_string(),
            ));
        }
        let count = total_size.div_ceil(piece_size) as usize;
        let last_piece_size = total_size - (count.saturating_sub(1) as u64) * piece_size;
        Ok(Self::create(count, initial_data_offset, 0, |index| {
            if index + 1 == count {
                last_piece_size
            } else {
                piece_size
            }
        }))
    }

    /// Absolute index of the first piece of this list.
    pub fn initial_piece_index(&self) -> usize {
        self.inner.initial_piece_index + self.start
    }

    /// Exclusive.
    pub fn end_piece_index(&self) -> usize {
        self.inner.initial_piece_index + self.end
    }

    pub fn piece_index_range(&self) -> Range<usize> {
        self.initial_piece_index()..self.end_piece_index()
    }

    pub fn count(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn total_size(&self) -> u64 {
        self.sizes().iter().sum()
    }

    pub fn contains_absolute_piece_index(&self, index: usize) -> bool {
        self.piece_index_range().contains(&index)
    }

    pub fn get_by_piece_index(&self, index: usize) -> Result<Piece> {
        self.get(index)
            .ok_or_else(|| StreamError::PieceIndexOutOfRange {
                index,
                start: self.initial_piece_index(),
                end: self.end_piece_index(),
            })
    }

    pub fn get(&self, index: usize) -> Option<Piece> {
        if !self.contains_absolute_piece_index(index) {
            return None;
        }
        Some(self.piece_at(index - self.inner.initial_piece_index))
    }

    pub fn first(&self) -> Option<Piece> {
        (!self.is_empty()).then(|| self.piece_at(self.start))
    }

    pub fn last(&self) -> Option<Piece> {
        (!self.is_empty()).then(|| self.piece_at(self.end - 1))
    }

    pub fn iter(&self) -> impl Iterator<Item = Piece> + '_ {
        (self.start..self.end).map(|position| self.piece_at(position))
    }

    /// Resolves the piece owning the absolute byte `offset` by binary search over the
    /// cumulative offsets, so irregular piece sizes cost the same as uniform ones.
    pub fn find_by_offset(&self, offset: u64) -> Option<Piece> {
        let offsets = self.offsets();
        let after = offsets.partition_point(|&start| start <= offset);
        let position = after.checked_sub(1)?;
        let piece = self.piece_at(self.start + position);
        piece.contains_offset(offset).then_some(piece)
    }

    /// Sub-list over positions `start..end` of this list, sharing states with it.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.count() {
            return Err(StreamError::InvalidArgument(format!(
                "invalid slice {}..{} of {} pieces",
                start,
                end,
                self.count()
            )));
        }
        Ok(Self {
            inner: Arc::clone(&self.inner),
            start: self.start + start,
            end: self.start + end,
        })
    }

    /// Pieces holding at least one byte of the absolute range `offset..offset + length`.
    pub fn pieces_for_file(&self, offset: u64, length: u64) -> Self {
        let end_offset = offset + length;
        let offsets = self.offsets();
        let sizes = self.sizes();
        let mut first = offsets
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        if first < offsets.len() && offsets[first] + sizes[first] <= offset {
            first += 1;
        }
        let last = offsets.partition_point(|&start| start < end_offset);
        let last = if length == 0 { first } else { last.max(first) };
        Self {
            inner: Arc::clone(&self.inner),
            start: self.start + first,
            end: self.start + last,
        }
    }

    pub fn state(&self, piece: &Piece) -> PieceState {
        self.inner.states.get(self.position(piece))
    }

    pub fn is_finished(&self, piece: &Piece) -> bool {
        self.state(piece) == PieceState::Finished
    }

    /// Returns `true` if the state changed.
    pub fn set_state(&self, piece: &Piece, state: PieceState) -> bool {
        self.inner.states.set(self.position(piece), state)
    }

    pub fn compare_and_set_state(
        &self,
        piece: &Piece,
        expect: PieceState,
        update: PieceState,
    ) -> bool {
        self.inner
            .states
            .compare_and_set(self.position(piece), expect, update)
    }

    /// Suspends until the piece is finished. Cancel-safe.
    pub async fn await_finished(&self, piece: &Piece) -> Result<()> {
        self.inner.states.wait_finished(self.position(piece)).await
    }

    pub fn finished_count(&self) -> usize {
        self.inner.states.finished_count(self.start..self.end)
    }

    /// Resets every piece of the underlying list, not only this slice.
    pub fn reset_states(&self) {
        self.inner.states.reset();
    }

    /// Changes whenever [`reset_states`](PieceList::reset_states) runs.
    pub fn epoch(&self) -> u64 {
        self.inner.states.epoch()
    }

    /// Releases all waiters of the underlying list.
    pub fn close(&self) {
        self.inner.states.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.states.is_closed()
    }

    fn sizes(&self) -> &[u64] {
        &self.inner.sizes[self.start..self.end]
    }

    fn offsets(&self) -> &[u64] {
        &self.inner.offsets[self.start..self.end]
    }

    fn piece_at(&self, position: usize) -> Piece {
        Piece {
            index: self.inner.initial_piece_index + position,
            data_offset: self.inner.offsets[position],
            size: self.inner.sizes[position],
        }
    }

    fn position(&self, piece: &Piece) -> usize {
        assert!(
            self.contains_absolute_piece_index(piece.index),
            "piece {} does not belong to list {:?}",
            piece.index,
            self
        );
        piece.index - self.inner.initial_piece_index
    }
}

impl Debug for PieceList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PieceList(pieces: {:?}, bytes: {})",
            self.piece_index_range(),
            self.total_size()
        )
    }
}
