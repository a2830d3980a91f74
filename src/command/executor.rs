use log::{debug, warn};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::engine::TorrentEngine;

/// Applies queued commands to the torrent engine, one at a time.
pub struct CommandExecutor<E> {
    engine: E,
}

impl<E: TorrentEngine> CommandExecutor<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Runs until every [`EngineClient`](crate::command::EngineClient) is dropped.
    pub fn spawn(mut self, mut commands: Receiver<Command>) -> JoinHandle<E> {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                self.execute(command);
            }
            debug!("command queue closed");
            self.engine
        })
    }

    pub fn execute(&mut self, command: Command) {
        let result = match &command {
            Command::SetPieceDeadline { piece, deadline } => {
                self.engine.set_piece_deadline(*piece, *deadline)
            }
            Command::ClearPieceDeadlines => self.engine.clear_piece_deadlines(),
            Command::Resume => self.engine.resume(),
            Command::Pause => self.engine.pause(),
            Command::AddTracker {
                url,
                tier,
                fail_limit,
            } => self.engine.add_tracker(url, *tier, *fail_limit),
            Command::SetFilePriority { file, priority } => {
                self.engine.set_file_priority(*file, *priority)
            }
        };
        if let Err(err) = result {
            warn!("engine rejected {:?}: {:?}", command, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::tests::RecordingEngine;
    use crate::file::FilePriority;

    #[tokio::test]
    async fn forwards_commands_to_engine() {
        let (tx, rx) = mpsc::channel(8);
        let handle = CommandExecutor::new(RecordingEngine::default()).spawn(rx);

        tx.send(Command::Resume).await.unwrap();
        tx.send(Command::SetPieceDeadline {
            piece: 4,
            deadline: Duration::ZERO,
        })
        .await
        .unwrap();
        tx.send(Command::SetFilePriority {
            file: 0,
            priority: FilePriority::Low,
        })
        .await
        .unwrap();
        drop(tx);

        let engine = handle.await.unwrap();
        assert_eq!(
            engine.calls,
            vec![
                Command::Resume,
                Command::SetPieceDeadline {
                    piece: 4,
                    deadline: Duration::ZERO
                },
                Command::SetFilePriority {
                    file: 0,
                    priority: FilePriority::Low
                },
            ]
        );
    }

    #[test]
    fn engine_errors_do_not_stop_execution() {
        let mut executor = CommandExecutor::new(RecordingEngine::failing());

        executor.execute(Command::Pause);
        executor.execute(Command::Resume);

        assert_eq!(executor.engine.calls, vec![Command::Pause, Command::Resume]);
    }
}
