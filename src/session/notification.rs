use crate::event::ResumeData;
use crate::session::SessionStats;

/// Updates published to the application owning a session
#[derive(Debug, Clone)]
pub enum Notification {
    Stats(SessionStats),
    /// Persist this blob to resume the torrent later
    ResumeData(ResumeData),
    TorrentFinished,
    Closed,
}
