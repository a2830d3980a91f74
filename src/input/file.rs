use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// Blocking positional access to a save file.
///
/// Calls run on the blocking worker pool, never on the scheduler threads.
pub trait RandomAccessFile: Send + 'static {
    /// Fills `buf` with the bytes starting at `offset`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn length(&self) -> io::Result<u64>;
}

impl RandomAccessFile for File {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn length(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}
