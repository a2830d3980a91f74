mod local;

use std::time::Duration;

use url::Url;

use crate::file::FilePriority;

pub use local::LocalEngine;

/// Control surface of a torrent engine.
///
/// The engine downloads pieces on its own schedule and reports progress through
/// [`Event`](crate::event::Event)s; these calls only bias that schedule.
pub trait TorrentEngine: Send + 'static {
    /// `deadline` is relative to now. Earlier deadlines are fetched first.
    fn set_piece_deadline(&mut self, piece: usize, deadline: Duration) -> anyhow::Result<()>;

    fn clear_piece_deadlines(&mut self) -> anyhow::Result<()>;

    fn resume(&mut self) -> anyhow::Result<()>;

    fn pause(&mut self) -> anyhow::Result<()>;

    fn add_tracker(&mut self, url: &Url, tier: u8, fail_limit: u8) -> anyhow::Result<()>;

    fn set_file_priority(&mut self, file: usize, priority: FilePriority) -> anyhow::Result<()>;
}
