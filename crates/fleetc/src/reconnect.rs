use std::time::Duration;

/// Fixed-interval reconnection schedule with an attempt cap.
///
/// Each call to [`next_delay`](Self::next_delay) consumes one attempt.
/// Once the cap is reached no further delays are handed out until
/// [`reset`](Self::reset) is called after a successful connection.
#[derive(Debug)]
pub struct ReconnectSchedule {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectSchedule {
    /// Creates a new `ReconnectSchedule`.
    ///
    /// # Examples
    ///
    /// ```
    /// use fleetc::reconnect::ReconnectSchedule;
    /// use std::time::Duration;
    /// let mut schedule = ReconnectSchedule::new(Duration::from_secs(5), 2);
    /// assert_eq!(schedule.next_delay(), Some(Duration::from_secs(5)));
    /// assert_eq!(schedule.next_delay(), Some(Duration::from_secs(5)));
    /// assert_eq!(schedule.next_delay(), None);
    /// ```
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 0,
        }
    }

    /// Returns the delay before the next attempt and records the attempt,
    /// or `None` once the cap has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.interval)
    }

    /// Number of reconnection attempts handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured attempt cap.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Clears the attempt counter.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
