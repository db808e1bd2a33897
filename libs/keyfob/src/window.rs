//! Anti-replay window.
//!
//! In order to tolerate reordering without accepting replays we keep a
//! bitmap of recently accepted counters below the high watermark. Bit `i`
//! set means counter `high − i − 1` was already accepted. Rejection never
//! mutates the window.

/// The window spans the high watermark and the 31 counters before it.
const WINDOW_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    high: u32,
    bitmap: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    Duplicate,
    TooOld,
}

impl ReplayWindow {
    /// The highest counter accepted so far.
    pub fn high_watermark(&self) -> u32 {
        self.high
    }

    /// Accepts `counter` and marks it used, or rejects it leaving the
    /// window untouched.
    pub fn update(&mut self, counter: u32) -> Result<(), CounterError> {
        if counter == self.high {
            return Err(CounterError::Duplicate);
        }

        if counter < self.high {
            let age = self.high - counter;
            if age >= WINDOW_SIZE {
                return Err(CounterError::TooOld);
            }

            let bit = 1u64 << (age - 1);
            if self.bitmap & bit != 0 {
                return Err(CounterError::Duplicate);
            }

            self.bitmap |= bit;
            return Ok(());
        }

        let shift = counter - self.high;
        self.bitmap = if shift < 64 {
            // The previous watermark becomes an ordinary accepted counter.
            (self.bitmap << shift) | (1u64 << (shift - 1))
        } else {
            0
        };
        self.high = counter;

        Ok(())
    }
}
