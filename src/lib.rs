//! Random-access streaming over a torrent that is still downloading.
//!
//! The engine completes pieces in any order; a [`TorrentInput`](input::TorrentInput) turns
//! the save file into a seekable byte stream that waits for exactly the pieces a reader
//! touches, while [`TorrentFileHandle`](file::TorrentFileHandle)s steer the engine towards
//! the bytes a player needs next.

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod file;
pub mod input;
pub mod pieces;
pub mod session;

pub use config::Config;
pub use error::{Result, StreamError};
