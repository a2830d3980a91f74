use std::ops::Range;

/// Window of already-read bytes, addressed in view offsets.
#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    data: Vec<u8>,
    start: u64,
}

impl ReadBuffer {
    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.data.len() as u64
    }

    pub fn contains(&self, position: u64) -> bool {
        self.range().contains(&position)
    }

    /// Copies from `position` into `dst`, returning the number of bytes copied.
    pub fn copy_to(&self, position: u64, dst: &mut [u8]) -> usize {
        if !self.contains(position) {
            return 0;
        }
        let from = (position - self.start) as usize;
        let available = &self.data[from..];
        let length = available.len().min(dst.len());
        dst[..length].copy_from_slice(&available[..length]);
        length
    }

    /// Hands out the backing storage, sized for `length` bytes, leaving the buffer empty.
    pub fn take_storage(&mut self, length: usize) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.data);
        data.resize(length, 0);
        data
    }

    pub fn replace(&mut self, start: u64, data: Vec<u8>) {
        self.start = start;
        self.data = data;
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
