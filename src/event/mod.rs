use std::path::PathBuf;

use crate::session::SessionStats;

/// Events reported by the torrent engine for one session
#[derive(Debug, Clone)]
pub enum Event {
    /// Torrent metadata became available
    TorrentAdded(TorrentDescriptor),
    /// The engine started fetching a piece
    PieceDownloading { torrent_name: String, piece: usize },
    /// A piece was downloaded, verified and written to the save files
    PieceFinished { torrent_name: String, piece: usize },
    /// Every piece went back to not available: the engine restarted or is rechecking the
    /// save files after a resume
    PiecesReset { torrent_name: String },
    /// Periodic transfer statistics
    StatsUpdate(SessionStats),
    /// Opaque snapshot to persist for a later resume
    SaveResumeData(ResumeData),
    /// Every wanted piece is on disk
    TorrentFinished,
    /// The torrent was removed from the engine, nothing more will be downloaded
    TorrentRemoved,
}

/// Metadata of a torrent whose files are laid out back to back in piece space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Path inside the torrent, relative to the save directory
    pub path: PathBuf,
    pub size: u64,
}

impl TorrentDescriptor {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// Engine resume blob, passed through verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeData(pub Vec<u8>);

impl std::fmt::Debug for ResumeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResumeData({} bytes)", self.0.len())
    }
}
