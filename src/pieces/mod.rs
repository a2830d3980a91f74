mod list;
mod state;

use std::ops::Range;

pub use list::PieceList;
pub use state::{PieceState, PieceStates};

/// Geometry of one piece: its absolute index and where its bytes live in the torrent payload.
///
/// A `Piece` is a plain value; its state is looked up through the [`PieceList`] it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    pub index: usize,
    /// Absolute offset of the first byte
    pub data_offset: u64,
    pub size: u64,
}

impl Piece {
    pub fn data_start_offset(&self) -> u64 {
        self.data_offset
    }

    /// Inclusive
    pub fn data_last_offset(&self) -> u64 {
        self.data_end_offset().saturating_sub(1)
    }

    /// Exclusive
    pub fn data_end_offset(&self) -> u64 {
        self.data_offset + self.size
    }

    pub fn data_range(&self) -> Range<u64> {
        self.data_offset..self.data_end_offset()
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.data_range().contains(&offset)
    }

    /// Number of bytes this piece shares with the absolute range.
    pub fn overlap(&self, range: &Range<u64>) -> u64 {
        let start = self.data_offset.max(range.start);
        let end = self.data_end_offset().min(range.end);
        end.saturating_sub(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        let piece = Piece {
            index: 3,
            data_offset: 100,
            size: 50,
        };

        assert_eq!(piece.data_start_offset(), 100);
        assert_eq!(piece.data_last_offset(), 149);
        assert_eq!(piece.data_end_offset(), 150);
        assert!(piece.contains_offset(100));
        assert!(piece.contains_offset(149));
        assert!(!piece.contains_offset(150));
    }

    #[test]
    fn overlap_with_file_range() {
        let piece = Piece {
            index: 0,
            data_offset: 100,
            size: 100,
        };

        assert_eq!(piece.overlap(&(0..1000)), 100);
        assert_eq!(piece.overlap(&(150..1000)), 50);
        assert_eq!(piece.overlap(&(0..120)), 20);
        assert_eq!(piece.overlap(&(120..130)), 10);
        assert_eq!(piece.overlap(&(200..300)), 0);
        assert_eq!(piece.overlap(&(0..100)), 0);
    }
}
