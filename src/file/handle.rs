use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::error::{Result, StreamError};
use crate::file::TorrentFileEntry;
use crate::input::TorrentInput;

/// Download priority of a file, as understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilePriority {
    /// Not downloaded at all
    Ignore,
    Low,
    Normal,
    High,
}

/// A consumer's claim on a file.
///
/// A file downloads while at least one handle has resumed it. Closing (or dropping) the
/// handle withdraws its priority request; the entry then falls back to the highest request
/// of the remaining handles.
pub struct TorrentFileHandle {
    id: usize,
    entry: Arc<TorrentFileEntry>,
    closed: AtomicBool,
}

impl TorrentFileHandle {
    pub(crate) fn new(id: usize, entry: Arc<TorrentFileEntry>) -> Self {
        Self {
            id,
            entry,
            closed: AtomicBool::new(false),
        }
    }

    pub fn entry(&self) -> &Arc<TorrentFileEntry> {
        &self.entry
    }

    /// Starts downloading the file, header and footer pieces first.
    pub fn resume(&self, priority: FilePriority) -> Result<()> {
        self.check_open()?;
        self.entry.prioritize_header_and_footer();
        self.entry.request_priority(self.id, Some(priority));
        self.entry.engine().resume();
        Ok(())
    }

    /// Withdraws this handle's priority request without closing it.
    pub fn pause(&self) -> Result<()> {
        self.check_open()?;
        self.entry.request_priority(self.id, None);
        Ok(())
    }

    /// Puts the piece holding `file_offset` and the pieces after it under deadline.
    pub fn set_deadline_at(&self, file_offset: u64) -> Result<()> {
        self.check_open()?;
        let piece = self.entry.piece_at(file_offset)?;
        self.entry.window().on_seek(&piece);
        Ok(())
    }

    /// Reverts to the engine's default scheduling.
    pub fn clear_deadlines(&self) -> Result<()> {
        self.check_open()?;
        self.entry.window().clear();
        Ok(())
    }

    pub async fn create_input(&self) -> Result<TorrentInput> {
        self.check_open()?;
        self.entry.create_input().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "[{}] close handle {} of {}, remove priority request",
            self.entry.torrent_name(),
            self.id,
            self.entry.path_in_torrent().display()
        );
        self.entry.remove_handle(self.id);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }
}

impl Drop for TorrentFileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for TorrentFileHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TorrentFileHandle(index: {}, path: {:?})",
            self.entry.index(),
            self.entry.path_in_torrent()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::command::Command;
    use crate::file::tests::{drain, entry_with};
    use crate::pieces::PieceList;

    fn priority(priority: FilePriority) -> Command {
        Command::SetFilePriority { file: 0, priority }
    }

    #[test]
    fn highest_request_wins() {
        let pieces = PieceList::create(4, 0, 0, |_| 100);
        let (entry, mut rx) = entry_with(&pieces, 0, 400, Path::new("/tmp"));
        let first = entry.create_handle();
        let second = entry.create_handle();
        assert_eq!(entry.requested_priority(), FilePriority::Ignore);

        first.resume(FilePriority::Low).unwrap();
        second.resume(FilePriority::High).unwrap();
        assert_eq!(entry.requested_priority(), FilePriority::High);

        second.pause().unwrap();
        assert_eq!(entry.requested_priority(), FilePriority::Low);

        drop(first);
        assert_eq!(entry.requested_priority(), FilePriority::Ignore);
        assert!(entry.has_open_handles());
        second.close();
        assert!(!entry.has_open_handles());

        let priorities: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|command| matches!(command, Command::SetFilePriority { .. }))
            .collect();
        assert_eq!(
            priorities,
            vec![
                priority(FilePriority::Low),
                priority(FilePriority::High),
                priority(FilePriority::Low),
                priority(FilePriority::Ignore),
                priority(FilePriority::Ignore),
            ]
        );
    }

    #[test]
    fn resume_prioritizes_header_then_resumes_engine() {
        let pieces = PieceList::create(4, 0, 0, |_| 100);
        let (entry, mut rx) = entry_with(&pieces, 0, 400, Path::new("/tmp"));
        let handle = entry.create_handle();

        handle.resume(FilePriority::Normal).unwrap();
        let commands = drain(&mut rx);
        assert_eq!(commands.len(), 6);
        assert!(matches!(commands[0], Command::SetPieceDeadline { piece: 0, .. }));
        assert!(matches!(commands[1], Command::SetPieceDeadline { piece: 3, .. }));
        assert_eq!(commands[4], priority(FilePriority::Normal));
        assert_eq!(commands[5], Command::Resume);
    }

    #[test]
    fn closed_handle_rejects_calls() {
        let pieces = PieceList::create(4, 0, 0, |_| 100);
        let (entry, _rx) = entry_with(&pieces, 0, 400, Path::new("/tmp"));
        let handle = entry.create_handle();

        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.resume(FilePriority::High),
            Err(StreamError::Closed)
        ));
        assert!(matches!(handle.pause(), Err(StreamError::Closed)));
        assert!(matches!(handle.set_deadline_at(0), Err(StreamError::Closed)));
    }

    #[test]
    fn deadline_at_file_offset() {
        let pieces = PieceList::create(6, 0, 0, |_| 100);
        let (entry, mut rx) = entry_with(&pieces, 150, 300, Path::new("/tmp"));
        let handle = entry.create_handle();

        // File byte 100 is absolute byte 250, inside piece 2
        handle.set_deadline_at(100).unwrap();
        assert_eq!(entry.window().current(), Some(2..5));
        assert_eq!(drain(&mut rx).first(), Some(&Command::ClearPieceDeadlines));

        assert!(matches!(
            handle.set_deadline_at(300),
            Err(StreamError::OffsetOutOfRange { offset: 450 })
        ));

        handle.clear_deadlines().unwrap();
        assert_eq!(entry.window().current(), None);
    }
}
