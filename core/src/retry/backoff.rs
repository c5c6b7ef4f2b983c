use std::time::Duration;

/// The backoff policy applied between delivery attempts.
///
/// `duration` is a pure function of the attempt number, attempt 0 is
/// the first retry.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// The same delay for every retry.
    Constant { interval: Duration },
    /// `interval * base^attempt`.
    Exponential { interval: Duration, base: f64 },
    /// An explicit table of per-attempt delays. Attempts beyond the end
    /// of the table clamp to the last entry, an empty table yields zero.
    Scheduled { schedule: Vec<Duration> },
}

impl Backoff {
    pub fn duration(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { interval } => *interval,
            Backoff::Exponential { interval, base } => {
                interval.mul_f64(base.powi(attempt as i32))
            }
            Backoff::Scheduled { schedule } => match schedule.len() {
                0 => Duration::ZERO,
                len => schedule[(attempt as usize).min(len - 1)],
            },
        }
    }
}
