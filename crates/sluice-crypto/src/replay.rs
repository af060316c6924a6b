//! Sliding window over packet indices.
//!
//! A packet index is checked before authentication and recorded only after
//! the tag verified, so forged packets cannot move the window.

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest authenticated index, `None` until the first packet.
    highest: Option<u64>,
    /// Bit n set means `highest - n` was seen.
    bitmap: u128,
    size: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIZE)
    }
}

impl ReplayWindow {
    pub const DEFAULT_SIZE: u64 = 128;

    /// Window covering `size` indices, clamped to 1..=128.
    pub fn new(size: u64) -> Self {
        Self {
            highest: None,
            bitmap: 0,
            size: size.clamp(1, 128),
        }
    }

    /// True when `index` has not been seen and is not too old.
    pub fn check(&self, index: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if index > highest {
            return true;
        }
        let offset = highest - index;
        offset < self.size && self.bitmap & (1u128 << offset) == 0
    }

    /// Record an authenticated index.
    pub fn accept(&mut self, index: u64) {
        let Some(highest) = self.highest else {
            self.highest = Some(index);
            self.bitmap = 1;
            return;
        };
        if index > highest {
            let shift = index - highest;
            self.bitmap = if shift >= 128 { 1 } else { (self.bitmap << shift) | 1 };
            self.highest = Some(index);
        } else {
            let offset = highest - index;
            if offset < self.size {
                self.bitmap |= 1u128 << offset;
            }
        }
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn reset(&mut self) {
        self.highest = None;
        self.bitmap = 0;
    }
}
