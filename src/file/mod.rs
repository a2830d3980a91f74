mod handle;
mod prioritizer;

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bit_set::BitSet;
use log::{debug, info};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::command::EngineClient;
use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::input::TorrentInput;
use crate::pieces::{Piece, PieceList};

pub use handle::{FilePriority, TorrentFileHandle};
pub use prioritizer::DeadlineWindow;

/// Download progress of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStats {
    pub total_bytes: u64,
    /// Bytes of finished pieces that fall inside the file
    pub downloaded_bytes: u64,
}

impl FileStats {
    /// `0.0..=1.0`, `0.0` for an empty file.
    pub fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f32 / self.total_bytes as f32).clamp(0.0, 1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.downloaded_bytes == self.total_bytes
    }
}

/// One file of a torrent, located in piece space at `offset..offset + length`.
///
/// Files are not downloaded until a [`TorrentFileHandle`] resumes them.
pub struct TorrentFileEntry {
    index: usize,
    torrent_name: String,
    path_in_torrent: PathBuf,
    save_path: PathBuf,
    offset: u64,
    length: u64,
    /// Every piece holding at least one byte of the file
    pieces: PieceList,
    /// Absolute indices of pieces already added to the stats
    counted: Mutex<BitSet>,
    stats: watch::Sender<FileStats>,
    /// Open handles and their priority requests
    handles: Mutex<HashMap<usize, Option<FilePriority>>>,
    next_handle_id: AtomicUsize,
    window: DeadlineWindow,
    engine: EngineClient,
    buffer_size: u64,
    file_poll_interval: Duration,
}

impl TorrentFileEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        torrent_name: &str,
        relative_path: &Path,
        save_directory: &Path,
        offset: u64,
        length: u64,
        torrent_pieces: &PieceList,
        engine: EngineClient,
        config: &Config,
    ) -> Self {
        let pieces = torrent_pieces.pieces_for_file(offset, length);
        let piece_size = pieces.first().map_or(1, |piece| piece.size);
        let window = DeadlineWindow::new(
            torrent_name.to_string(),
            pieces.clone(),
            engine.clone(),
            config.window_pieces(piece_size),
            config.deadline_step,
        );
        let entry = Self {
            index,
            torrent_name: torrent_name.to_string(),
            path_in_torrent: strip_torrent_directory(relative_path),
            save_path: save_directory.join(relative_path),
            offset,
            length,
            pieces,
            counted: Mutex::new(BitSet::new()),
            stats: watch::Sender::new(FileStats {
                total_bytes: length,
                downloaded_bytes: 0,
            }),
            handles: Mutex::new(HashMap::new()),
            next_handle_id: AtomicUsize::new(0),
            window,
            engine,
            buffer_size: config.buffer_size_bytes(),
            file_poll_interval: config.file_poll_interval,
        };
        entry.recompute();
        entry
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn torrent_name(&self) -> &str {
        &self.torrent_name
    }

    /// Path relative to the torrent's top-level directory, e.g. `TV/01.mp4`.
    pub fn path_in_torrent(&self) -> &Path {
        &self.path_in_torrent
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Absolute offset of the first byte in piece space.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn data_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }

    pub fn pieces(&self) -> &PieceList {
        &self.pieces
    }

    pub fn stats(&self) -> FileStats {
        *self.stats.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FileStats> {
        self.stats.subscribe()
    }

    pub fn stats_stream(&self) -> WatchStream<FileStats> {
        WatchStream::new(self.stats.subscribe())
    }

    pub fn is_finished(&self) -> bool {
        self.stats().is_finished()
    }

    /// Suspends until every byte of the file is downloaded.
    pub async fn await_finished(&self) -> Result<()> {
        let mut rx = self.stats.subscribe();
        rx.wait_for(FileStats::is_finished)
            .await
            .map(|_| ())
            .map_err(|_| StreamError::Closed)
    }

    pub fn create_handle(self: &Arc<Self>) -> TorrentFileHandle {
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        self.lock_handles().insert(id, None);
        debug!(
            "[{}] handle {} created for {}",
            self.torrent_name,
            id,
            self.path_in_torrent.display()
        );
        TorrentFileHandle::new(id, Arc::clone(self))
    }

    pub fn has_open_handles(&self) -> bool {
        !self.lock_handles().is_empty()
    }

    /// Highest priority requested by any open handle.
    pub fn requested_priority(&self) -> FilePriority {
        Self::highest(&self.lock_handles())
    }

    /// Counts the piece's overlap with this file. Returns `true` if the stats changed.
    ///
    /// Duplicate deliveries of the same piece are counted once.
    pub fn on_piece_finished(&self, piece: &Piece) -> bool {
        if !self.pieces.contains_absolute_piece_index(piece.index) {
            return false;
        }
        if !self
            .counted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(piece.index)
        {
            return false;
        }
        let overlap = piece.overlap(&self.data_range());
        self.stats.send_if_modified(|stats| {
            stats.downloaded_bytes = (stats.downloaded_bytes + overlap).min(stats.total_bytes);
            overlap > 0
        })
    }

    /// Rebuilds the stats from the current piece states.
    pub fn recompute(&self) {
        let range = self.data_range();
        let mut counted = self.counted.lock().unwrap_or_else(PoisonError::into_inner);
        counted.clear();
        let mut downloaded = 0;
        for piece in self.pieces.iter().filter(|piece| self.pieces.is_finished(piece)) {
            counted.insert(piece.index);
            downloaded += piece.overlap(&range);
        }
        self.stats.send_if_modified(|stats| {
            let changed = stats.downloaded_bytes != downloaded;
            stats.downloaded_bytes = downloaded;
            changed
        });
    }

    /// The engine reported the torrent complete, trust it over our own piece accounting.
    pub fn mark_finished(&self) {
        self.stats.send_if_modified(|stats| {
            let changed = stats.downloaded_bytes != stats.total_bytes;
            stats.downloaded_bytes = stats.total_bytes;
            changed
        });
    }

    /// Waits until the engine has created the save file, then opens it.
    ///
    /// The returned input asks the engine for read-ahead deadlines whenever it blocks.
    pub async fn create_input(self: &Arc<Self>) -> Result<TorrentInput> {
        let path = self.resolve_file().await?;
        let entry = Arc::clone(self);
        let input = TorrentInput::open(
            path,
            self.pieces.clone(),
            self.offset,
            self.length,
            self.buffer_size,
        )
        .await?
        .with_on_wait(move |piece| {
            debug!(
                "[{}] waiting for piece {} of {}",
                entry.torrent_name,
                piece.index,
                entry.path_in_torrent.display()
            );
            entry.window.on_seek(piece);
        });
        Ok(input)
    }

    /// Absolute save path, once the engine has written something to it.
    pub async fn resolve_file(&self) -> Result<PathBuf> {
        loop {
            match tokio::fs::metadata(&self.save_path).await {
                Ok(metadata) if metadata.is_file() && (metadata.len() > 0 || self.length == 0) => {
                    info!(
                        "[{}] got save file {}",
                        self.torrent_name,
                        self.save_path.display()
                    );
                    return Ok(self.save_path.clone());
                }
                Ok(_) => info!(
                    "[{}] save file {} is still empty, waiting",
                    self.torrent_name,
                    self.save_path.display()
                ),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => info!(
                    "[{}] still waiting for save file {}",
                    self.torrent_name,
                    self.save_path.display()
                ),
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(self.file_poll_interval).await;
        }
    }

    pub(crate) fn engine(&self) -> &EngineClient {
        &self.engine
    }

    pub(crate) fn window(&self) -> &DeadlineWindow {
        &self.window
    }

    /// Piece holding the byte at `file_offset`.
    pub(crate) fn piece_at(&self, file_offset: u64) -> Result<Piece> {
        let offset = self.offset + file_offset;
        if file_offset >= self.length {
            return Err(StreamError::OffsetOutOfRange { offset });
        }
        self.pieces
            .find_by_offset(offset)
            .ok_or(StreamError::OffsetOutOfRange { offset })
    }

    /// First piece, last piece, then the two after the first: players read the container
    /// header and index before anything else.
    pub(crate) fn prioritize_header_and_footer(&self) {
        let (Some(first), Some(last)) = (self.pieces.first(), self.pieces.last()) else {
            return;
        };
        let order = [first.index, last.index, first.index + 1, first.index + 2];
        let mut issued: Vec<usize> = Vec::with_capacity(order.len());
        for (k, index) in order.into_iter().enumerate() {
            if issued.contains(&index) {
                continue;
            }
            let Some(piece) = self.pieces.get(index) else {
                continue;
            };
            issued.push(index);
            if !self.pieces.is_finished(&piece) {
                self.engine
                    .set_piece_deadline(index, Duration::from_millis(k as u64));
            }
        }
    }

    pub(crate) fn request_priority(&self, handle: usize, priority: Option<FilePriority>) {
        let requested = {
            let mut handles = self.lock_handles();
            handles.insert(handle, priority);
            Self::highest(&handles)
        };
        self.engine.set_file_priority(self.index, requested);
    }

    pub(crate) fn remove_handle(&self, handle: usize) {
        let (requested, last) = {
            let mut handles = self.lock_handles();
            handles.remove(&handle);
            (Self::highest(&handles), handles.is_empty())
        };
        if last {
            self.window.clear();
        }
        self.engine.set_file_priority(self.index, requested);
    }

    fn highest(handles: &HashMap<usize, Option<FilePriority>>) -> FilePriority {
        handles
            .values()
            .copied()
            .max()
            .flatten()
            .unwrap_or(FilePriority::Ignore)
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Option<FilePriority>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TorrentFileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentFileEntry")
            .field("index", &self.index)
            .field("path", &self.path_in_torrent)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("pieces", &self.pieces)
            .finish()
    }
}

/// `Show/TV/01.mp4` becomes `TV/01.mp4`; single-component paths stay as they are.
fn strip_torrent_directory(path: &Path) -> PathBuf {
    let mut components = path.components();
    if path.components().count() > 1 {
        components.next();
    }
    components.as_path().to_path_buf()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use futures::{FutureExt, StreamExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::command::Command;
    use crate::pieces::PieceState;

    pub(crate) fn entry_with(
        pieces: &PieceList,
        offset: u64,
        length: u64,
        save_directory: &Path,
    ) -> (Arc<TorrentFileEntry>, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(64);
        let config = Config::new().with_file_poll_interval(Duration::from_millis(10));
        let entry = TorrentFileEntry::new(
            0,
            "test",
            Path::new("Show/TV/01.mp4"),
            save_directory,
            offset,
            length,
            pieces,
            EngineClient::new(tx),
            &config,
        );
        (Arc::new(entry), rx)
    }

    pub(crate) fn drain(rx: &mut mpsc::Receiver<Command>) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn finish(pieces: &PieceList, index: usize) -> Piece {
        let piece = pieces.get_by_piece_index(index).unwrap();
        pieces.set_state(&piece, PieceState::Finished);
        piece
    }

    #[test]
    fn stats_count_partial_overlap() {
        // File spans 150..330 of 100-byte pieces: 50 bytes of piece 1, all of 2, 30 of 3
        let pieces = PieceList::create(5, 0, 0, |_| 100);
        let (entry, _rx) = entry_with(&pieces, 150, 180, Path::new("/tmp"));
        assert_eq!(entry.pieces().piece_index_range(), 1..4);

        let piece = finish(&pieces, 1);
        assert!(entry.on_piece_finished(&piece));
        assert_eq!(entry.stats().downloaded_bytes, 50);

        let piece = finish(&pieces, 3);
        entry.on_piece_finished(&piece);
        assert_eq!(entry.stats().downloaded_bytes, 80);
        assert!(!entry.is_finished());

        let piece = finish(&pieces, 2);
        entry.on_piece_finished(&piece);
        assert_eq!(entry.stats().downloaded_bytes, 180);
        assert!(entry.is_finished());
        assert_eq!(entry.stats().progress(), 1.0);
    }

    #[test]
    fn duplicate_and_foreign_pieces_are_ignored() {
        let pieces = PieceList::create(5, 0, 0, |_| 100);
        let (entry, _rx) = entry_with(&pieces, 150, 180, Path::new("/tmp"));

        let piece = finish(&pieces, 2);
        assert!(entry.on_piece_finished(&piece));
        assert!(!entry.on_piece_finished(&piece));
        assert_eq!(entry.stats().downloaded_bytes, 100);

        let foreign = finish(&pieces, 4);
        assert!(!entry.on_piece_finished(&foreign));
        assert_eq!(entry.stats().downloaded_bytes, 100);
    }

    #[test]
    fn recompute_from_piece_states() {
        let pieces = PieceList::create(5, 0, 0, |_| 100);
        finish(&pieces, 1);
        finish(&pieces, 2);
        let (entry, _rx) = entry_with(&pieces, 150, 180, Path::new("/tmp"));
        assert_eq!(entry.stats().downloaded_bytes, 150);

        pieces.reset_states();
        entry.recompute();
        assert_eq!(entry.stats().downloaded_bytes, 0);

        entry.mark_finished();
        assert!(entry.is_finished());
    }

    #[test]
    fn progress_of_empty_file() {
        let stats = FileStats::default();
        assert_eq!(stats.progress(), 0.0);
        assert!(stats.is_finished());
    }

    #[test]
    fn path_in_torrent_drops_top_directory() {
        assert_eq!(
            strip_torrent_directory(Path::new("Show/TV/01.mp4")),
            PathBuf::from("TV/01.mp4")
        );
        assert_eq!(
            strip_torrent_directory(Path::new("01.mp4")),
            PathBuf::from("01.mp4")
        );
    }

    #[tokio::test]
    async fn stats_stream_follows_downloads() {
        let pieces = PieceList::create(2, 0, 0, |_| 100);
        let (entry, _rx) = entry_with(&pieces, 0, 200, Path::new("/tmp"));
        let mut stream = entry.stats_stream();
        assert_eq!(stream.next().await.unwrap().downloaded_bytes, 0);

        let waiter = entry.await_finished();
        tokio::pin!(waiter);
        assert!((&mut waiter).now_or_never().is_none());

        let piece = finish(&pieces, 0);
        entry.on_piece_finished(&piece);
        assert_eq!(stream.next().await.unwrap().downloaded_bytes, 100);

        let piece = finish(&pieces, 1);
        entry.on_piece_finished(&piece);
        assert!(waiter.await.is_ok());
    }

    #[test]
    fn header_and_footer_go_first() {
        let pieces = PieceList::create(10, 0, 0, |_| 100);
        let (entry, mut rx) = entry_with(&pieces, 250, 500, Path::new("/tmp"));
        finish(&pieces, 7);

        entry.prioritize_header_and_footer();
        assert_eq!(
            drain(&mut rx),
            vec![
                Command::SetPieceDeadline {
                    piece: 2,
                    deadline: Duration::ZERO
                },
                Command::SetPieceDeadline {
                    piece: 3,
                    deadline: Duration::from_millis(2)
                },
                Command::SetPieceDeadline {
                    piece: 4,
                    deadline: Duration::from_millis(3)
                },
            ]
        );
    }

    #[tokio::test]
    async fn input_reads_file_through_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("Show/TV/01.mp4");
        let pieces = PieceList::create(4, 0, 0, |_| 8);
        let (entry, mut rx) = entry_with(&pieces, 4, 20, dir.path());
        let handle = entry.create_handle();

        let opening = {
            let handle_entry = Arc::clone(&entry);
            tokio::spawn(async move { handle_entry.create_input().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!opening.is_finished());

        std::fs::create_dir_all(save_path.parent().unwrap()).unwrap();
        std::fs::write(&save_path, b"abcdefghijklmnopqrst").unwrap();
        let mut input = opening.await.unwrap().unwrap();

        // Blocking on piece 1 moves the deadline window there
        finish(&pieces, 0);
        let mut buf = [0; 8];
        assert_eq!(input.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert!(input.read(&mut buf).now_or_never().is_none());
        assert!(drain(&mut rx).contains(&Command::ClearPieceDeadlines));
        assert_eq!(entry.window().current(), Some(1..3));

        for index in 1..3 {
            finish(&pieces, index);
        }
        let rest = input.read_to_end().await.unwrap();
        assert_eq!(rest, b"efghijklmnopqrst");
        handle.close();
    }
}
