mod executor;

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::Sender;
use url::Url;

use crate::file::FilePriority;

pub use executor::CommandExecutor;

/// Calls forwarded to the torrent engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the engine to fetch a piece before `deadline` elapses
    SetPieceDeadline { piece: usize, deadline: Duration },
    /// Revert every piece to the engine's default scheduling
    ClearPieceDeadlines,
    Resume,
    Pause,
    AddTracker { url: Url, tier: u8, fail_limit: u8 },
    SetFilePriority { file: usize, priority: FilePriority },
}

/// Cheap, clonable sender of engine commands.
///
/// Commands never block the caller: when the queue is full the command is dropped with a
/// warning, the same way a lost notification is.
#[derive(Debug, Clone)]
pub struct EngineClient {
    tx: Sender<Command>,
}

impl EngineClient {
    pub fn new(tx: Sender<Command>) -> Self {
        Self { tx }
    }

    pub fn set_piece_deadline(&self, piece: usize, deadline: Duration) {
        debug!("deadline {:?} for piece {}", deadline, piece);
        self.send(Command::SetPieceDeadline { piece, deadline });
    }

    pub fn clear_piece_deadlines(&self) {
        self.send(Command::ClearPieceDeadlines);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn add_tracker(&self, url: Url, tier: u8, fail_limit: u8) {
        self.send(Command::AddTracker {
            url,
            tier,
            fail_limit,
        });
    }

    pub fn set_file_priority(&self, file: usize, priority: FilePriority) {
        self.send(Command::SetFilePriority { file, priority });
    }

    fn send(&self, command: Command) {
        if let Err(err) = self.tx.try_send(command) {
            warn!("failed sending engine command: {:?}", err);
        }
    }
}
