use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// A trait for a clock that can provide the current time
/// as a UNIX timestamp.
pub trait Clock {
    /// The current time as a UNIX timestamp in seconds.
    fn now(&self) -> u64;

    /// The current time as a UNIX timestamp in milliseconds.
    fn now_millis(&self) -> u64;
}

/// A default implementation of a clock that uses the system time.
pub struct DefaultClock {}

impl DefaultClock {
    /// Creates a new instance of the default clock
    /// that uses system time.
    pub fn new() -> Self {
        DefaultClock {}
    }
}

impl Default for DefaultClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for DefaultClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_secs()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }
}

/// Calculates the remaining wait time for a polling loop iteration,
/// subtracting the time already spent receiving and processing from
/// the configured wait time between polls.
pub fn calculate_polling_wait_time(start_time: Instant, polling_wait_time_ms: u64) -> u64 {
    let elapsed_ms = start_time.elapsed().as_millis() as u64;
    polling_wait_time_ms.saturating_sub(elapsed_ms)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_polling_wait_time_subtracts_elapsed_time() {
        let start_time = Instant::now() - Duration::from_millis(400);
        let wait_time = calculate_polling_wait_time(start_time, 1000);
        assert!(wait_time <= 600);
    }

    #[test]
    fn test_polling_wait_time_saturates_at_zero() {
        let start_time = Instant::now() - Duration::from_millis(1500);
        let wait_time = calculate_polling_wait_time(start_time, 1000);
        assert_eq!(wait_time, 0);
    }
}
