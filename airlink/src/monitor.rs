use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkTransition {
    Established,
    Lost,
}

struct MonitorState {
    last_heartbeat: Instant,
    reported_connected: bool,
}

/// Liveness tracker for the paired peer.
///
/// The last-heartbeat timestamp starts at construction time, so a fresh
/// monitor counts as connected for one timeout window; without traffic
/// it then flips to disconnected. Any valid heartbeat, telemetry or
/// control packet from the peer refreshes it.
pub struct LinkMonitor {
    timeout: Duration,
    state: Mutex<MonitorState>,
}

impl LinkMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(MonitorState {
                last_heartbeat: Instant::now(),
                reported_connected: true,
            }),
        }
    }

    pub fn mark_alive(&self) {
        self.lock().last_heartbeat = Instant::now();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().last_heartbeat.elapsed() <= self.timeout
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.lock().last_heartbeat
    }

    /// Reports a connectivity flip exactly once. Polled by the loop
    /// that owns reporting; `is_connected` stays side-effect free.
    pub fn poll_transition(&self) -> Option<LinkTransition> {
        let mut state = self.lock();
        let connected = state.last_heartbeat.elapsed() <= self.timeout;
        if connected == state.reported_connected {
            return None;
        }
        state.reported_connected = connected;
        if connected {
            Some(LinkTransition::Established)
        } else {
            Some(LinkTransition::Lost)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn times_out_and_recovers() {
        let monitor = LinkMonitor::new(Duration::from_millis(50));
        assert!(monitor.is_connected());

        thread::sleep(Duration::from_millis(80));
        assert!(!monitor.is_connected());

        monitor.mark_alive();
        assert!(monitor.is_connected());
    }

    #[test]
    fn transition_reported_once_per_flip() {
        let monitor = LinkMonitor::new(Duration::from_millis(50));
        assert_eq!(monitor.poll_transition(), None);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(monitor.poll_transition(), Some(LinkTransition::Lost));
        assert_eq!(monitor.poll_transition(), None);

        monitor.mark_alive();
        assert_eq!(monitor.poll_transition(), Some(LinkTransition::Established));
        assert_eq!(monitor.poll_transition(), None);
    }

    #[test]
    fn last_heartbeat_tracks_latest_mark() {
        let monitor = LinkMonitor::new(Duration::from_millis(500));
        let before = monitor.last_heartbeat();
        thread::sleep(Duration::from_millis(10));
        monitor.mark_alive();
        assert!(monitor.last_heartbeat() > before);
    }
}
