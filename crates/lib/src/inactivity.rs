//! Session-wide idle timer. The engine rearms it on every mutation and checks it against the clock.

#[derive(Debug, Clone)]
pub struct InactivityMonitor {
    threshold_ms: i64,
    deadline: Option<i64>,
}

impl InactivityMonitor {
    pub fn new(threshold_ms: i64) -> Self {
        Self {
            threshold_ms,
            deadline: None,
        }
    }

    pub fn threshold_ms(&self) -> i64 {
        self.threshold_ms
    }

    /// Replace any pending deadline with `now + threshold`. A session with no messages and no
    /// pending input needs no timer, so it is disarmed instead.
    pub fn rearm(&mut self, now_ms: i64, session_empty: bool) {
        self.deadline = if session_empty {
            None
        } else {
            Some(now_ms.saturating_add(self.threshold_ms))
        };
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn expired(&self, now_ms: i64) -> bool {
        self.deadline.is_some_and(|d| now_ms >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_is_not_armed() {
        let mut m = InactivityMonitor::new(300_000);
        m.rearm(0, true);
        assert!(!m.is_armed());
        assert!(!m.expired(10_000_000));
    }

    #[test]
    fn rearm_pushes_deadline_forward() {
        let mut m = InactivityMonitor::new(300_000);
        m.rearm(0, false);
        m.rearm(100_000, false);
        assert!(!m.expired(300_000));
        assert!(m.expired(400_000));
        m.cancel();
        assert!(!m.expired(400_000));
    }

    #[test]
    fn far_future_activity_does_not_wrap() {
        let mut m = InactivityMonitor::new(300_000);
        m.rearm(i64::MAX, false);
        assert_eq!(m.deadline(), Some(i64::MAX));
        assert!(!m.expired(1_700_000_000_000));
    }
}
