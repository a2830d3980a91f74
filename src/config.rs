use std::time::Duration;

use size::Size;
use url::Url;

/// Settings shared by every download session
#[derive(Clone, Debug)]
pub struct Config {
    // Input Settings
    /// Maximum bytes a torrent input buffers on each side of the cursor
    pub buffer_size: Size,
    /// Interval between checks for a save file that the engine has not created yet
    pub file_poll_interval: Duration,

    // Deadline Settings
    /// Bytes of pieces placed under deadline ahead of a waiting reader
    pub read_ahead: Size,
    /// Lower bound of the read-ahead window, in pieces
    pub min_window_pieces: usize,
    /// Upper bound of the read-ahead window, in pieces
    pub max_window_pieces: usize,
    /// Spacing between successive read-ahead deadlines
    pub deadline_step: Duration,

    // Tracker Settings
    /// Trackers added to every torrent once its metadata is known
    pub trackers: Vec<Url>,
    pub tracker_tier: u8,
    pub tracker_fail_limit: u8,

    // Channel Settings
    /// Size of the engine command queue
    pub commands_buffer: usize,
    /// Size of the engine event queue
    pub events_buffer: usize,
    /// Size of the notification queue
    pub notifications_buffer: usize,
}

impl Config {
    pub fn with_buffer_size(mut self, size: Size) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_file_poll_interval(mut self, interval: Duration) -> Self {
        self.file_poll_interval = interval;
        self
    }

    pub fn with_read_ahead(mut self, size: Size) -> Self {
        self.read_ahead = size;
        self
    }

    pub fn with_window_pieces(mut self, min: usize, max: usize) -> Self {
        self.min_window_pieces = min;
        self.max_window_pieces = max.max(min);
        self
    }

    pub fn with_deadline_step(mut self, step: Duration) -> Self {
        self.deadline_step = step;
        self
    }

    pub fn with_tracker(mut self, url: Url) -> Self {
        self.trackers.push(url);
        self
    }

    pub fn with_events_buffer(mut self, n: usize) -> Self {
        self.events_buffer = n;
        self
    }

    /// Number of pieces the read-ahead window spans for the given piece size.
    pub fn window_pieces(&self, piece_size: u64) -> usize {
        let read_ahead = self.read_ahead.bytes().max(0) as u64;
        let pieces = read_ahead / piece_size.max(1);
        (pieces as usize).clamp(self.min_window_pieces, self.max_window_pieces)
    }

    pub(crate) fn buffer_size_bytes(&self) -> u64 {
        self.buffer_size.bytes().max(1) as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            buffer_size: Size::from_mebibytes(4),
            file_poll_interval: Duration::from_secs(1),
            read_ahead: Size::from_mebibytes(8),
            min_window_pieces: 2,
            max_window_pieces: 64,
            deadline_step: Duration::from_millis(700),
            trackers: Vec::new(),
            tracker_tier: 0,
            tracker_fail_limit: 0,
            commands_buffer: 64,
            events_buffer: 128,
            notifications_buffer: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_clamped() {
        let config = Config::new();
        assert_eq!(config.window_pieces(1024 * 1024), 8);
        assert_eq!(config.window_pieces(16 * 1024 * 1024), 2);
        assert_eq!(config.window_pieces(16 * 1024), 64);

        let config = config.with_window_pieces(4, 1);
        assert_eq!(config.min_window_pieces, 4);
        assert_eq!(config.max_window_pieces, 4);
        assert_eq!(config.window_pieces(16 * 1024), 4);
    }

    #[test]
    fn buffer_size_in_bytes() {
        let config = Config::new().with_buffer_size(Size::from_kibibytes(20));
        assert_eq!(config.buffer_size_bytes(), 20 * 1024);
    }
}
