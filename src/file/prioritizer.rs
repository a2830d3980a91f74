use std::ops::Range;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::debug;

use crate::command::EngineClient;
use crate::pieces::{Piece, PieceList};

/// Read-ahead deadlines for one file.
///
/// When a reader blocks on a piece, the pieces from there on are put under increasing
/// deadlines so the engine fetches them in playback order. A reader blocking again inside
/// the current window does not reissue anything. As pieces at the front of the window
/// finish, the window slides forward and the pieces entering it get deadlines too.
pub struct DeadlineWindow {
    torrent_name: String,
    pieces: PieceList,
    engine: EngineClient,
    /// Absolute piece indices currently under deadline
    window: Mutex<Option<Range<usize>>>,
    window_size: usize,
    step: Duration,
}

impl DeadlineWindow {
    pub fn new(
        torrent_name: String,
        pieces: PieceList,
        engine: EngineClient,
        window_size: usize,
        step: Duration,
    ) -> Self {
        Self {
            torrent_name,
            pieces,
            engine,
            window: Mutex::new(None),
            window_size: window_size.max(1),
            step,
        }
    }

    pub fn on_seek(&self, piece: &Piece) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = window.as_ref() {
            if current.contains(&piece.index) {
                debug!(
                    "[{}] piece {} already inside deadline window {:?}",
                    self.torrent_name, piece.index, current
                );
                return;
            }
        }

        self.engine.clear_piece_deadlines();
        let end = (piece.index + self.window_size).min(self.pieces.end_piece_index());
        let unfinished = (piece.index..end)
            .filter_map(|index| self.pieces.get(index))
            .filter(|piece| !self.pieces.is_finished(piece));
        for (k, piece) in unfinished.enumerate() {
            self.engine.set_piece_deadline(piece.index, self.step * k as u32);
        }
        debug!(
            "[{}] deadline window moved to {:?}",
            self.torrent_name,
            piece.index..end
        );
        *window = Some(piece.index..end);
    }

    /// Slides the window past finished pieces at its front.
    pub fn on_piece_finished(&self, index: usize) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = window.clone() else {
            return;
        };
        if !current.contains(&index) {
            return;
        }

        let file_end = self.pieces.end_piece_index();
        let start = (current.start..file_end)
            .find(|&index| !self.is_finished(index))
            .unwrap_or(file_end);
        let end = (start + self.window_size).min(file_end).max(current.end);
        let entering = (current.end..end)
            .filter_map(|index| self.pieces.get(index))
            .filter(|piece| !self.pieces.is_finished(piece));
        for piece in entering {
            let distance = (piece.index - start) as u32;
            self.engine.set_piece_deadline(piece.index, self.step * distance);
        }
        if start != current.start {
            debug!("[{}] deadline window slid to {:?}", self.torrent_name, start..end);
        }
        *window = Some(start..end);
    }

    pub fn current(&self) -> Option<Range<usize>> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.take().is_some() {
            self.engine.clear_piece_deadlines();
        }
    }

    fn is_finished(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .is_some_and(|piece| self.pieces.is_finished(&piece))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::command::Command;
    use crate::pieces::PieceState;

    fn drain(rx: &mut mpsc::Receiver<Command>) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn deadline(piece: usize, millis: u64) -> Command {
        Command::SetPieceDeadline {
            piece,
            deadline: Duration::from_millis(millis),
        }
    }

    #[test]
    fn window_skips_finished_pieces_and_stops_at_file_end() {
        let pieces = PieceList::create(10, 0, 0, |_| 100);
        let file_pieces = pieces.slice(2, 8).unwrap();
        let (tx, mut rx) = mpsc::channel(32);
        let window = DeadlineWindow::new(
            "test".to_string(),
            file_pieces.clone(),
            EngineClient::new(tx),
            4,
            Duration::from_millis(700),
        );
        let finished = file_pieces.get_by_piece_index(5).unwrap();
        file_pieces.set_state(&finished, PieceState::Finished);

        window.on_seek(&file_pieces.get_by_piece_index(4).unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                Command::ClearPieceDeadlines,
                deadline(4, 0),
                deadline(6, 700),
                deadline(7, 1400),
            ]
        );
        assert_eq!(window.current(), Some(4..8));

        window.on_seek(&file_pieces.get_by_piece_index(6).unwrap());
        assert!(drain(&mut rx).is_empty());

        window.on_seek(&file_pieces.get_by_piece_index(2).unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                Command::ClearPieceDeadlines,
                deadline(2, 0),
                deadline(3, 700),
                deadline(4, 1400),
            ]
        );
    }

    #[test]
    fn clear_resets_window() {
        let pieces = PieceList::create(4, 0, 0, |_| 100);
        let (tx, mut rx) = mpsc::channel(32);
        let window = DeadlineWindow::new(
            "test".to_string(),
            pieces.clone(),
            EngineClient::new(tx),
            2,
            Duration::ZERO,
        );

        window.clear();
        assert!(drain(&mut rx).is_empty());

        window.on_seek(&pieces.get_by_piece_index(0).unwrap());
        window.clear();
        assert_eq!(window.current(), None);
        assert_eq!(drain(&mut rx).last(), Some(&Command::ClearPieceDeadlines));
    }

    #[test]
    fn window_slides_as_front_pieces_finish() {
        let pieces = PieceList::create(6, 0, 0, |_| 100);
        let (tx, mut rx) = mpsc::channel(32);
        let window = DeadlineWindow::new(
            "test".to_string(),
            pieces.clone(),
            EngineClient::new(tx),
            2,
            Duration::from_millis(700),
        );
        window.on_seek(&pieces.get_by_piece_index(0).unwrap());
        drain(&mut rx);

        for index in [0, 1] {
            pieces.set_state(&pieces.get_by_piece_index(index).unwrap(), PieceState::Finished);
            window.on_piece_finished(index);
        }
        assert_eq!(drain(&mut rx), vec![deadline(2, 700), deadline(3, 700)]);
        assert_eq!(window.current(), Some(2..4));

        // Finishing out of order moves nothing until the front catches up
        pieces.set_state(&pieces.get_by_piece_index(3).unwrap(), PieceState::Finished);
        window.on_piece_finished(3);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(window.current(), Some(2..4));

        pieces.set_state(&pieces.get_by_piece_index(2).unwrap(), PieceState::Finished);
        window.on_piece_finished(2);
        assert_eq!(drain(&mut rx), vec![deadline(4, 0), deadline(5, 700)]);
        assert_eq!(window.current(), Some(4..6));

        // Pieces outside the window are ignored
        window.on_piece_finished(0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn finished_pieces_without_window_issue_nothing() {
        let pieces = PieceList::create(4, 0, 0, |_| 100);
        let (tx, mut rx) = mpsc::channel(32);
        let window = DeadlineWindow::new(
            "test".to_string(),
            pieces.clone(),
            EngineClient::new(tx),
            2,
            Duration::ZERO,
        );

        window.on_piece_finished(0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(window.current(), None);
    }
}
