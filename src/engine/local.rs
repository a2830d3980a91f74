use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use bit_set::BitSet;
use log::{debug, info, warn};
use priority_queue::PriorityQueue;
use tokio::sync::Notify;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use url::Url;

use crate::engine::TorrentEngine;
use crate::event::{Event, ResumeData, TorrentDescriptor};
use crate::file::FilePriority;
use crate::session::SessionStats;

/// Deadline first, random tie-breaker
type Priority = Reverse<(Duration, u64)>;

/// In-process engine that "downloads" a payload already on disk.
///
/// Pieces complete one at a time after a fixed delay. Pieces under a deadline go first, in
/// deadline order; the rest follow in random order, the way a swarm would deliver them.
/// The engine starts paused.
pub struct LocalEngine {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    wakeup: Notify,
    events: Sender<Event>,
}

struct State {
    pending: PriorityQueue<usize, Priority>,
    /// Piece currently being "downloaded"
    in_flight: Option<usize>,
    finished: BitSet,
    paused: bool,
    downloaded_bytes: u64,
}

impl LocalEngine {
    /// Reports the torrent as added, then serves pieces until all are finished.
    pub fn spawn(
        descriptor: TorrentDescriptor,
        events: Sender<Event>,
        piece_delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        let count = descriptor.total_size().div_ceil(descriptor.piece_length.max(1)) as usize;
        let mut pending = PriorityQueue::with_capacity(count);
        for piece in 0..count {
            pending.push(piece, random_priority());
        }
        let shared = Arc::new(Shared {
            name: descriptor.name.clone(),
            state: Mutex::new(State {
                pending,
                in_flight: None,
                finished: BitSet::with_capacity(count),
                paused: true,
                downloaded_bytes: 0,
            }),
            wakeup: Notify::new(),
            events,
        });
        let handle = tokio::spawn(Shared::run(Arc::clone(&shared), descriptor, piece_delay));
        (Self { shared }, handle)
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, State>> {
        self.shared.state()
    }
}

impl TorrentEngine for LocalEngine {
    fn set_piece_deadline(&mut self, piece: usize, deadline: Duration) -> anyhow::Result<()> {
        let mut state = self.state()?;
        if state.finished.contains(piece) || state.in_flight == Some(piece) {
            return Ok(());
        }
        state
            .pending
            .change_priority(&piece, Reverse((deadline, piece as u64)))
            .ok_or_else(|| anyhow!("unknown piece {}", piece))?;
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn clear_piece_deadlines(&mut self) -> anyhow::Result<()> {
        let mut state = self.state()?;
        let pieces: Vec<usize> = state.pending.iter().map(|(piece, _)| *piece).collect();
        for piece in pieces {
            state.pending.change_priority(&piece, random_priority());
        }
        Ok(())
    }

    fn resume(&mut self) -> anyhow::Result<()> {
        self.state()?.paused = false;
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn pause(&mut self) -> anyhow::Result<()> {
        let resume_data = {
            let mut state = self.state()?;
            state.paused = true;
            ResumeData(state.finished.get_ref().to_bytes())
        };
        self.shared.emit(Event::SaveResumeData(resume_data));
        Ok(())
    }

    fn add_tracker(&mut self, url: &Url, tier: u8, fail_limit: u8) -> anyhow::Result<()> {
        info!(
            "[{}] tracker {} added (tier {}, fail limit {})",
            self.shared.name, url, tier, fail_limit
        );
        Ok(())
    }

    fn set_file_priority(&mut self, file: usize, priority: FilePriority) -> anyhow::Result<()> {
        debug!("[{}] file {} priority {:?}", self.shared.name, file, priority);
        Ok(())
    }
}

impl Shared {
    async fn run(self: Arc<Self>, descriptor: TorrentDescriptor, piece_delay: Duration) {
        let total_size = descriptor.total_size();
        let piece_length = descriptor.piece_length;
        if self.events.send(Event::TorrentAdded(descriptor)).await.is_err() {
            return;
        }
        loop {
            let next = {
                let mut state = match self.state() {
                    Ok(state) => state,
                    Err(err) => {
                        warn!("[{}] {:?}", self.name, err);
                        return;
                    }
                };
                if state.paused {
                    None
                } else {
                    let piece = state.pending.pop().map(|(piece, _)| piece);
                    state.in_flight = piece;
                    Some(piece)
                }
            };
            let Some(next) = next else {
                self.wakeup.notified().await;
                continue;
            };
            let Some(piece) = next else {
                info!("[{}] all pieces downloaded", self.name);
                let _ = self.events.send(Event::TorrentFinished).await;
                return;
            };

            let downloading = Event::PieceDownloading {
                torrent_name: self.name.clone(),
                piece,
            };
            if self.events.send(downloading).await.is_err() {
                return;
            }
            tokio::time::sleep(piece_delay).await;

            let size = piece_length.min(total_size - piece as u64 * piece_length);
            let stats = match self.state() {
                Ok(mut state) => {
                    state.in_flight = None;
                    state.finished.insert(piece);
                    state.downloaded_bytes += size;
                    SessionStats {
                        total_bytes: total_size,
                        downloaded_bytes: state.downloaded_bytes,
                        uploaded_bytes: 0,
                        download_rate: (size as f64 / piece_delay.as_secs_f64().max(0.001)) as u64,
                        upload_rate: 0,
                        progress: state.downloaded_bytes as f32 / total_size.max(1) as f32,
                    }
                }
                Err(_) => return,
            };
            let finished = Event::PieceFinished {
                torrent_name: self.name.clone(),
                piece,
            };
            if self.events.send(finished).await.is_err() {
                return;
            }
            self.emit(Event::StatsUpdate(stats));
        }
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.events.try_send(event) {
            warn!("[{}] failed sending event: {:?}", self.name, err);
        }
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("local engine state poisoned"))
    }
}

fn random_priority() -> Priority {
    Reverse((Duration::MAX, rand::random()))
}
