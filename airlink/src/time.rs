use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, truncated to 32 bits.
///
/// The header field wraps every ~49.7 days; consumers must compare
/// timestamps with wrapping arithmetic.
pub fn unix_millis() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_millis() as u32).unwrap_or(0)
}

/// Monotonic interval gate for periodic sends. The first call to `due`
/// fires immediately.
pub struct Ticker {
    period: Duration,
    last: Option<Instant>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: None,
        }
    }

    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_fires_immediately() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        let now = Instant::now();
        assert!(ticker.due(now));
        assert!(!ticker.due(now));
    }

    #[test]
    fn fires_once_per_period() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(ticker.due(start));
        assert!(!ticker.due(start + Duration::from_millis(50)));
        assert!(ticker.due(start + Duration::from_millis(150)));
        assert!(!ticker.due(start + Duration::from_millis(200)));
        assert!(ticker.due(start + Duration::from_millis(260)));
    }
}
