//! Replay window for received transport nonces.
//!
//! Tracks the highest nonce accepted so far plus a bitmap of the `size - 1`
//! nonces below it. A window of size 1 is strict in-order delivery: only
//! nonces above the highest are accepted. Larger windows tolerate bounded
//! reordering on transports that may deliver out of order.
//!
//! Checking and recording are separate so that a nonce is only recorded
//! after the frame carrying it has authenticated.
//!
//! Not thread-safe; the session keeps it under its receive lock.

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: Option<u64>,
    /// Bit i set means `highest - i` has been accepted.
    bitmap: u128,
    size: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::strict()
    }
}

impl ReplayWindow {
    /// Largest supported window.
    pub const MAX_SIZE: u64 = 128;

    /// Strict in-order policy.
    pub const DEFAULT_SIZE: u64 = 1;

    pub fn strict() -> Self {
        Self::with_size(Self::DEFAULT_SIZE)
    }

    /// Window tolerating up to `size - 1` positions of reordering.
    /// `size` is clamped to `1..=128`.
    pub fn with_size(size: u64) -> Self {
        Self {
            highest: None,
            bitmap: 0,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `nonce` would be accepted. Does not record it.
    pub fn check(&self, nonce: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if nonce > highest {
            return true;
        }
        let offset = highest - nonce;
        if offset >= self.size {
            return false;
        }
        self.bitmap & (1u128 << offset) == 0
    }

    /// Record `nonce` as seen. Call only after `check` passed and the frame
    /// authenticated.
    pub fn accept(&mut self, nonce: u64) {
        let Some(highest) = self.highest else {
            self.highest = Some(nonce);
            self.bitmap = 1;
            return;
        };

        if nonce > highest {
            let shift = nonce - highest;
            self.bitmap = if shift >= Self::MAX_SIZE {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = Some(nonce);
        } else {
            let offset = highest - nonce;
            if offset < self.size {
                self.bitmap |= 1u128 << offset;
            }
        }
    }

    /// Highest nonce accepted, if any.
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn reset(&mut self) {
        self.highest = None;
        self.bitmap = 0;
    }
}
