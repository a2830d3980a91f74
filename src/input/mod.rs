mod buffer;
mod file;

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};
use crate::pieces::{Piece, PieceList};

use buffer::ReadBuffer;
pub use file::RandomAccessFile;

/// Invoked with the piece a read is about to wait for.
pub type OnWait = Box<dyn Fn(&Piece) + Send + Sync>;

/// Seekable byte stream over a save file whose bytes become readable piece by piece.
///
/// Positions are logical: position 0 is absolute byte `logical_start_offset` of the piece
/// list, which need not sit on a piece boundary. The save file itself is addressed with
/// logical positions.
///
/// A read never returns bytes of a piece that is not finished. When the buffer runs dry the
/// input waits for the piece under the cursor, then pulls in every adjacent finished piece
/// (up to `buffer_size` bytes in each direction) with a single file read.
pub struct TorrentInput<F: RandomAccessFile = std::fs::File> {
    file: Arc<Mutex<F>>,
    pieces: PieceList,
    logical_start_offset: u64,
    len: u64,
    /// Per direction
    buffer_size: u64,
    on_wait: OnWait,
    position: u64,
    buffer: ReadBuffer,
    /// Piece list epoch the buffer was filled under
    buffer_epoch: u64,
    closer: CancellationToken,
    poisoned: bool,
}

/// Aborts pending and future reads of a [`TorrentInput`] from another task.
#[derive(Debug, Clone)]
pub struct InputCloser(CancellationToken);

impl InputCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl TorrentInput<std::fs::File> {
    /// Opens the save file at `path` on the blocking pool.
    pub async fn open(
        path: impl AsRef<Path>,
        pieces: PieceList,
        logical_start_offset: u64,
        len: u64,
        buffer_size: u64,
    ) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = tokio::task::spawn_blocking(move || std::fs::File::open(path))
            .await
            .map_err(io::Error::other)??;
        Self::new(file, pieces, logical_start_offset, len, buffer_size)
    }
}

impl<F: RandomAccessFile> TorrentInput<F> {
    pub fn new(
        file: F,
        pieces: PieceList,
        logical_start_offset: u64,
        len: u64,
        buffer_size: u64,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(StreamError::InvalidArgument(
                "buffer size must be positive".to_string(),
            ));
        }
        if len > 0 {
            let logical_last_offset = logical_start_offset + len - 1;
            for offset in [logical_start_offset, logical_last_offset] {
                if pieces.find_by_offset(offset).is_none() {
                    return Err(StreamError::OffsetOutOfRange { offset });
                }
            }
        }
        let buffer_epoch = pieces.epoch();
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            pieces,
            logical_start_offset,
            len,
            buffer_size,
            on_wait: Box::new(|_| ()),
            position: 0,
            buffer: ReadBuffer::default(),
            buffer_epoch,
            closer: CancellationToken::new(),
            poisoned: false,
        })
    }

    pub fn with_on_wait(mut self, on_wait: impl Fn(&Piece) + Send + Sync + 'static) -> Self {
        self.on_wait = Box::new(on_wait);
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.position
    }

    /// Logical range currently held in memory.
    pub fn buffered_range(&self) -> Range<u64> {
        self.buffer.range()
    }

    pub fn closer(&self) -> InputCloser {
        InputCloser(self.closer.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Moves the cursor. Never waits and never touches the file.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.check_usable()?;
        if position > self.len {
            return Err(StreamError::OffsetOutOfRange {
                offset: self.logical_start_offset + position,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, waiting for the piece under the cursor if needed.
    ///
    /// Returns `0` at the end of the stream or when `buf` is empty. May return fewer bytes
    /// than available in the file: only the current buffer is drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_usable()?;
        if buf.is_empty() || self.position >= self.len {
            return Ok(0);
        }
        if self.buffer_epoch != self.pieces.epoch() {
            debug!("pieces were reset, dropping buffered {:?}", self.buffer.range());
            self.buffer.clear();
        }
        if !self.buffer.contains(self.position) {
            self.fill_buffer().await?;
        }
        let copied = self.buffer.copy_to(self.position, buf);
        self.position += copied as u64;
        Ok(copied)
    }

    /// Fails with [`StreamError::OffsetOutOfRange`] if the stream ends before `buf` is full.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => {
                    return Err(StreamError::OffsetOutOfRange {
                        offset: self.logical_start_offset + self.position,
                    });
                }
                n => filled += n,
            }
        }
        Ok(())
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.remaining() as usize);
        let mut chunk = vec![0; self.buffer_size.min(64 * 1024) as usize];
        loop {
            match self.read(&mut chunk).await? {
                0 => return Ok(data),
                n => data.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Closes the file. Outstanding piece waits tied to this input are released.
    pub fn close(self) {
        self.closer.cancel();
        debug!("closed input over {:?}", self.pieces);
    }

    /// Bytes readable from `view_offset` onwards (inclusive) without touching an unfinished
    /// piece, capped at `cap`.
    pub fn compute_max_buffer_size_forward(&self, view_offset: u64, cap: u64) -> Result<u64> {
        Self::check_cap(cap)?;
        if view_offset >= self.len {
            return Ok(0);
        }
        let logical_last_offset = self.logical_last_offset();
        let mut current = self.logical_start_offset + view_offset;
        let mut piece = self.piece_at(view_offset)?;
        let mut total = 0;
        while self.pieces.is_finished(&piece) {
            let last = piece.data_last_offset().min(logical_last_offset);
            total += last - current + 1;
            if total >= cap {
                return Ok(cap);
            }
            if last == logical_last_offset {
                break;
            }
            match self.pieces.get(piece.index + 1) {
                Some(next) => piece = next,
                None => break,
            }
            current = last + 1;
        }
        Ok(total)
    }

    /// Bytes readable before `view_offset` (exclusive) without touching an unfinished piece,
    /// capped at `cap`.
    pub fn compute_max_buffer_size_backward(&self, view_offset: u64, cap: u64) -> Result<u64> {
        Self::check_cap(cap)?;
        if view_offset == 0 || view_offset >= self.len {
            return Ok(0);
        }
        let mut current = self.logical_start_offset + view_offset;
        let mut piece = self.piece_at(view_offset)?;
        let mut total = 0;
        while self.pieces.is_finished(&piece) {
            let floor = piece.data_start_offset().max(self.logical_start_offset);
            total += current - floor;
            if total >= cap {
                return Ok(cap);
            }
            if floor == self.logical_start_offset {
                break;
            }
            match piece.index.checked_sub(1).and_then(|i| self.pieces.get(i)) {
                Some(previous) => piece = previous,
                None => break,
            }
            current = floor;
        }
        Ok(total)
    }

    /// Piece owning the logical `view_offset`.
    pub fn find_piece(&self, view_offset: u64) -> Option<Piece> {
        self.pieces
            .find_by_offset(self.logical_start_offset + view_offset)
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        let position = self.position;
        let (epoch, backward, forward) = loop {
            let epoch = self.pieces.epoch();
            let piece = self.piece_at(position)?;
            if !self.pieces.is_finished(&piece) {
                (self.on_wait)(&piece);
                tokio::select! {
                    biased;
                    _ = self.closer.cancelled() => return Err(StreamError::Closed),
                    result = self.pieces.await_finished(&piece) => result?,
                }
            }
            let forward = self.compute_max_buffer_size_forward(position, self.buffer_size)?;
            if forward == 0 {
                debug!("piece {} was reset while waiting for it", piece.index);
                continue;
            }
            let backward = self.compute_max_buffer_size_backward(position, self.buffer_size)?;
            break (epoch, backward, forward);
        };

        let read_start = position - backward;
        let read_end = (position + forward).min(self.len);
        let mut data = self.buffer.take_storage((read_end - read_start) as usize);
        let file = Arc::clone(&self.file);
        let result = tokio::task::spawn_blocking(move || {
            let mut file = file
                .lock()
                .map_err(|_| io::Error::other("save file lock poisoned"))?;
            file.read_exact_at(read_start, &mut data)?;
            Ok::<_, io::Error>(data)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|result| result);

        match result {
            Ok(data) => {
                self.buffer.replace(read_start, data);
                self.buffer_epoch = epoch;
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                self.buffer.clear();
                Err(StreamError::Io(err))
            }
        }
    }

    fn piece_at(&self, view_offset: u64) -> Result<Piece> {
        self.find_piece(view_offset)
            .ok_or(StreamError::OffsetOutOfRange {
                offset: self.logical_start_offset + view_offset,
            })
    }

    fn logical_last_offset(&self) -> u64 {
        self.logical_start_offset + self.len - 1
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(StreamError::Poisoned)
        } else if self.closer.is_cancelled() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_cap(cap: u64) -> Result<()> {
        if cap == 0 {
            return Err(StreamError::InvalidArgument(
                "cap must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl<F: RandomAccessFile> Debug for TorrentInput<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentInput")
            .field("pieces", &self.pieces)
            .field("logical_start_offset", &self.logical_start_offset)
            .field("len", &self.len)
            .field("position", &self.position)
            .field("buffered", &self.buffer.range())
            .finish()
    }
}
