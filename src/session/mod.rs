mod notification;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::EngineClient;
use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::event::{Event, ResumeData, TorrentDescriptor};
use crate::file::TorrentFileEntry;
use crate::pieces::{Piece, PieceList, PieceState};

pub use notification::Notification;

/// Transfer statistics of a whole torrent, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionStats {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    /// Bytes per second
    pub download_rate: u64,
    /// Bytes per second
    pub upload_rate: u64,
    /// `0.0..=1.0`
    pub progress: f32,
}

/// Metadata of the torrent currently tracked by a session.
#[derive(Debug)]
pub struct TorrentInfo {
    pub name: String,
    pub pieces: PieceList,
    pub entries: Vec<Arc<TorrentFileEntry>>,
}

/// One torrent as seen by the streaming layer.
///
/// The session is the only writer of piece states: it applies engine [`Event`]s to the
/// piece list and the file entries, and forwards control calls to the engine through an
/// [`EngineClient`]. Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct DownloadSession {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    save_directory: PathBuf,
    config: Arc<Config>,
    engine: EngineClient,
    info: watch::Sender<Option<Arc<TorrentInfo>>>,
    stats: watch::Sender<SessionStats>,
    resume_data: Mutex<Option<ResumeData>>,
    notifications: Sender<Notification>,
    closed: CancellationToken,
}

impl DownloadSession {
    pub fn new(
        name: impl Into<String>,
        save_directory: impl AsRef<Path>,
        config: Arc<Config>,
        engine: EngineClient,
        notifications: Sender<Notification>,
    ) -> Self {
        let shared = Shared {
            name: name.into(),
            save_directory: save_directory.as_ref().to_path_buf(),
            config,
            engine,
            info: watch::Sender::new(None),
            stats: watch::Sender::new(SessionStats::default()),
            resume_data: Mutex::new(None),
            notifications,
            closed: CancellationToken::new(),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Applies engine events until the queue closes or the session is closed.
    pub fn spawn(&self, mut events: Receiver<Event>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = session.shared.closed.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => session.handle(event),
                        None => break,
                    },
                }
            }
            debug!("[{}] event loop stopped", session.name());
        })
    }

    pub fn handle(&self, event: Event) {
        match event {
            Event::TorrentAdded(descriptor) => self.on_torrent_added(descriptor),

            Event::PieceDownloading { torrent_name, piece } => {
                if !self.is_current(&torrent_name) {
                    return;
                }
                if let Some((info, piece)) = self.tracked_piece(piece) {
                    info.pieces.compare_and_set_state(
                        &piece,
                        PieceState::NotAvailable,
                        PieceState::Downloading,
                    );
                }
            }

            Event::PieceFinished { torrent_name, piece } => {
                if !self.is_current(&torrent_name) {
                    return;
                }
                let Some((info, piece)) = self.tracked_piece(piece) else {
                    return;
                };
                if !info.pieces.set_state(&piece, PieceState::Finished) {
                    return;
                }
                debug!("[{}] piece {} finished", self.name(), piece.index);
                for entry in &info.entries {
                    entry.on_piece_finished(&piece);
                    if entry.has_open_handles() {
                        entry.window().on_piece_finished(piece.index);
                    }
                }
            }

            Event::PiecesReset { torrent_name } => {
                if !self.is_current(&torrent_name) {
                    return;
                }
                let Some(info) = self.torrent_info() else {
                    return;
                };
                info!("[{}] piece states reset", self.name());
                info.pieces.reset_states();
                for entry in &info.entries {
                    entry.window().clear();
                    entry.recompute();
                }
            }

            Event::StatsUpdate(stats) => {
                self.shared.stats.send_replace(stats);
                self.notify(Notification::Stats(stats));
            }

            Event::SaveResumeData(data) => {
                info!("[{}] received resume data: {:?}", self.name(), data);
                *self.lock_resume_data() = Some(data.clone());
                self.notify(Notification::ResumeData(data));
            }

            Event::TorrentFinished => {
                info!("[{}] torrent finished", self.name());
                if let Some(info) = self.torrent_info() {
                    info.entries
                        .iter()
                        .filter(|entry| entry.has_open_handles())
                        .for_each(|entry| entry.mark_finished());
                }
                self.notify(Notification::TorrentFinished);
            }

            Event::TorrentRemoved => {
                info!("[{}] torrent removed", self.name());
                if let Some(info) = self.torrent_info() {
                    info.pieces.close();
                }
            }
        }
    }

    pub fn torrent_info(&self) -> Option<Arc<TorrentInfo>> {
        self.shared.info.borrow().clone()
    }

    /// File entries, waiting for the torrent metadata if needed.
    pub async fn files(&self) -> Result<Vec<Arc<TorrentFileEntry>>> {
        let mut rx = self.shared.info.subscribe();
        let info = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => return Err(StreamError::Closed),
            info = rx.wait_for(Option::is_some) => info.map_err(|_| StreamError::Closed)?.clone(),
        };
        info.map(|info| info.entries.clone())
            .ok_or(StreamError::MetadataUnavailable)
    }

    pub fn stats(&self) -> SessionStats {
        *self.shared.stats.borrow()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<SessionStats> {
        self.shared.stats.subscribe()
    }

    pub fn latest_resume_data(&self) -> Option<ResumeData> {
        self.lock_resume_data().clone()
    }

    pub fn resume(&self) {
        self.shared.engine.resume();
    }

    pub fn pause(&self) {
        self.shared.engine.pause();
    }

    /// Pauses the engine and releases every reader still waiting for a piece. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        info!("[{}] closing session", self.name());
        self.shared.closed.cancel();
        self.shared.engine.pause();
        if let Some(info) = self.torrent_info() {
            info.pieces.close();
        }
        self.notify(Notification::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn on_torrent_added(&self, descriptor: TorrentDescriptor) {
        if !self.is_current(&descriptor.name) {
            return;
        }
        let config = &self.shared.config;
        let total_size = descriptor.total_size();
        let pieces = match PieceList::create_with_piece_size(total_size, descriptor.piece_length, 0)
        {
            Ok(pieces) => pieces,
            Err(err) => {
                warn!("[{}] invalid torrent metadata: {}", self.name(), err);
                return;
            }
        };
        info!(
            "[{}] torrent added: {} files, {:?}",
            self.name(),
            descriptor.files.len(),
            pieces
        );

        let mut offset = 0;
        let mut entries = Vec::with_capacity(descriptor.files.len());
        for (index, file) in descriptor.files.iter().enumerate() {
            let entry = TorrentFileEntry::new(
                index,
                &self.shared.name,
                &file.path,
                &self.shared.save_directory,
                offset,
                file.size,
                &pieces,
                self.shared.engine.clone(),
                config,
            );
            info!(
                "[{}] file {} initialized, pieces {:?}",
                self.name(),
                entry.path_in_torrent().display(),
                entry.pieces().piece_index_range()
            );
            entries.push(Arc::new(entry));
            offset += file.size;
        }

        for url in &config.trackers {
            self.shared
                .engine
                .add_tracker(url.clone(), config.tracker_tier, config.tracker_fail_limit);
        }

        let info = TorrentInfo {
            name: descriptor.name,
            pieces,
            entries,
        };
        if let Some(previous) = self.shared.info.send_replace(Some(Arc::new(info))) {
            previous.pieces.close();
        }
    }

    fn is_current(&self, torrent_name: &str) -> bool {
        if torrent_name == self.shared.name {
            return true;
        }
        warn!(
            "[{}] ignoring event for stale torrent {}",
            self.name(),
            torrent_name
        );
        false
    }

    fn tracked_piece(&self, index: usize) -> Option<(Arc<TorrentInfo>, Piece)> {
        let Some(info) = self.torrent_info() else {
            debug!("[{}] piece {} before metadata, ignored", self.name(), index);
            return None;
        };
        match info.pieces.get(index) {
            Some(piece) => Some((info, piece)),
            None => {
                debug!(
                    "[{}] piece {} outside {:?}, ignored",
                    self.name(),
                    index,
                    info.pieces
                );
                None
            }
        }
    }

    fn notify(&self, notification: Notification) {
        if let Err(err) = self.shared.notifications.try_send(notification) {
            warn!("[{}] failed sending notification: {:?}", self.name(), err);
        }
    }

    fn lock_resume_data(&self) -> std::sync::MutexGuard<'_, Option<ResumeData>> {
        self.shared
            .resume_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
