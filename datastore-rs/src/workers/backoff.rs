use std::time::Duration;

/// Computes a delay which doubles on every call, up to a given maximum.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use datastore::workers::Backoff;
/// let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(2));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(3));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(3));
///
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a new backoff which starts at **min** and never exceeds **max**.
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to apply now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (delay * 2).min(self.max).max(self.min);

        delay
    }

    /// Updates the bounds (e.g. after a config change) without resetting the progress.
    pub fn set_bounds(&mut self, min: Duration, max: Duration) {
        self.min = min;
        self.max = max;
        self.current = self.current.clamp(min, max.max(min));
    }

    /// Starts over with the minimal delay.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
