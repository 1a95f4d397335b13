//! Sliding-window call budget for a remote service.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use leadflow_shared::{LeadflowError, Result};

/// Enforces "at most `capacity` calls in any trailing `window`".
///
/// Callers queue on a fair mutex, so admission follows arrival order. The
/// lock is held while a caller sleeps for budget: computing the wait and
/// recording the call is one atomic section.
#[derive(Debug)]
pub struct RateGovernor {
    capacity: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateGovernor {
    pub fn new(capacity: usize, window: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(LeadflowError::config("rate limit capacity must be at least 1"));
        }
        if window.is_zero() {
            return Err(LeadflowError::config("rate limit window must be non-zero"));
        }
        Ok(Self {
            capacity,
            window,
            calls: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until one more call fits in the window, then reserve it.
    ///
    /// The reserved slot is consumed whether or not the caller's request
    /// succeeds.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            while calls
                .front()
                .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
            {
                calls.pop_front();
            }

            if calls.len() < self.capacity {
                break;
            }

            if let Some(&oldest) = calls.front() {
                let wait = (oldest + self.window).saturating_duration_since(now);
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    capacity = self.capacity,
                    "rate budget exhausted, waiting"
                );
                tokio::time::sleep(wait).await;
            }
        }
        calls.push_back(Instant::now());
    }

    /// Number of calls still counted against the current window.
    pub async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_capacity_is_rejected() {
        let err = RateGovernor::new(0, Duration::from_secs(60)).unwrap_err();
        assert!(!err.is_recoverable());
        assert!(RateGovernor::new(1, Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn under_capacity_does_not_wait() {
        let governor = RateGovernor::new(3, Duration::from_secs(60)).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            governor.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(governor.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn over_capacity_waits_for_oldest_to_expire() {
        let governor = RateGovernor::new(3, Duration::from_secs(60)).unwrap();
        governor.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        governor.acquire().await;
        governor.acquire().await;

        let start = Instant::now();
        governor.acquire().await;

        // Oldest call was 10s ago, so it leaves the window 50s from now.
        assert!(start.elapsed() >= Duration::from_secs(50));
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(governor.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_budget() {
        let capacity = 4;
        let window = Duration::from_secs(30);
        let governor = Arc::new(RateGovernor::new(capacity, window).unwrap());
        let admitted = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..13 {
            let governor = Arc::clone(&governor);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                governor.acquire().await;
                admitted.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut times = admitted.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 13);
        for (i, &t) in times.iter().enumerate() {
            let in_slice = times[i..]
                .iter()
                .take_while(|&&u| u.duration_since(t) < window)
                .count();
            assert!(in_slice <= capacity, "{in_slice} calls within one window");
        }
        // 13 calls at 4 per window need at least three full windows.
        assert!(times[12].duration_since(times[0]) >= window * 3);
    }
}
