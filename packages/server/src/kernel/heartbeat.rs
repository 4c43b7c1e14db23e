//! In-process liveness tracking for running crawls.
//!
//! Each named unit of work touches the monitor as it makes progress. A unit
//! that stops touching without completing is *stalled* and gets picked up by
//! the stall sweep in [`crate::kernel::crawler`]. This is a local-only
//! safety net layered on top of the distributed lock, not a replacement for
//! it: each instance only observes its own in-flight crawls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct HeartbeatMonitor {
    timeout: Duration,
    beats: Mutex<HashMap<String, Instant>>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            beats: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record progress for `name`.
    pub fn touch(&self, name: &str) {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Instant::now());
    }

    /// Stop tracking `name` (clean completion or force-stop).
    pub fn clear(&self, name: &str) {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Whether `name` is tracked and has not beaten within the timeout.
    pub fn is_stalled(&self, name: &str) -> bool {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .is_some_and(|last| last.elapsed() > self.timeout)
    }

    /// Every tracked name past the timeout.
    pub fn stalled(&self) -> Vec<String> {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, last)| last.elapsed() > self.timeout)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_beat_is_not_stalled() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(50));
        monitor.touch("governance-forum");
        assert!(!monitor.is_stalled("governance-forum"));
        assert!(monitor.stalled().is_empty());
    }

    #[test]
    fn silent_unit_becomes_stalled() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10));
        monitor.touch("governance-forum");
        monitor.touch("dev-forum");

        std::thread::sleep(Duration::from_millis(30));
        monitor.touch("dev-forum");

        assert!(monitor.is_stalled("governance-forum"));
        assert_eq!(monitor.stalled(), vec!["governance-forum".to_string()]);
    }

    #[test]
    fn cleared_unit_is_forgotten() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(10));
        monitor.touch("governance-forum");
        monitor.clear("governance-forum");

        std::thread::sleep(Duration::from_millis(30));
        assert!(!monitor.is_stalled("governance-forum"));
        assert!(monitor.stalled().is_empty());
    }
}
