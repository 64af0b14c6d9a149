/// Logical clock ordering edits across replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    /// Start a clock at `value`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self { value }
    }

    /// Last time handed out or witnessed.
    #[must_use]
    pub const fn time(&self) -> u64 {
        self.value
    }

    /// Advance the clock and return the new time.
    pub const fn increment(&mut self) -> u64 {
        self.value = self.value.saturating_add(1);
        self.value
    }

    /// Move the clock forward to `time` if it is ahead of us.
    ///
    /// Returns `true` when the clock changed.
    pub const fn witness(&mut self, time: u64) -> bool {
        if time > self.value {
            self.value = time;
            true
        } else {
            false
        }
    }
}
