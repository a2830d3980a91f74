use std::io;

/// Errors surfaced by the streaming layer.
///
/// A piece that has not been downloaded yet is never an error here: readers simply
/// suspend until it is. Events from the engine that refer to another torrent are
/// logged and dropped by the session, so they never show up either.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("offset {offset} is not covered by any piece")]
    OffsetOutOfRange { offset: u64 },

    #[error("piece index {index} out of bounds {start}..{end}")]
    PieceIndexOutOfRange {
        index: usize,
        start: usize,
        end: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed reading from save file")]
    Io(#[from] io::Error),

    #[error("input is unusable after a previous read failure")]
    Poisoned,

    #[error("closed while waiting")]
    Closed,

    #[error("torrent metadata is not available yet")]
    MetadataUnavailable,
}

impl StreamError {
    /// Local programming errors: bad offsets, bad indices, bad arguments.
    /// These are never worth retrying.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StreamError::OffsetOutOfRange { .. }
                | StreamError::PieceIndexOutOfRange { .. }
                | StreamError::InvalidArgument(_)
        )
    }

    /// The stream can no longer be used and the caller has to re-resolve the source.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::Io(_) | StreamError::Poisoned)
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_errors() {
        assert!(StreamError::OffsetOutOfRange { offset: 1 }.is_contract_violation());
        assert!(StreamError::InvalidArgument("cap".to_string()).is_contract_violation());
        assert!(!StreamError::Closed.is_contract_violation());

        let io = StreamError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(io.is_terminal());
        assert!(!io.is_contract_violation());
        assert!(StreamError::Poisoned.is_terminal());
    }

    #[test]
    fn piece_index_message() {
        let err = StreamError::PieceIndexOutOfRange {
            index: 7,
            start: 2,
            end: 5,
        };
        assert_eq!(err.to_string(), "piece index 7 out of bounds 2..5");
    }
}
