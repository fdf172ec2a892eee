use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Transfer rate over the last `window` samples. Fed once per second by the
/// swarm loop with the running byte total; readers never block on the feeder.
pub struct SpeedEstimator {
    samples: Mutex<VecDeque<(Instant, u64)>>,
    window: usize,
    bps: AtomicU64,
    // 0 means unknown.
    eta_millis: AtomicU64,
}

impl SpeedEstimator {
    pub fn new(window_seconds: usize) -> Self {
        // Two samples are needed for a rate.
        let window = window_seconds.max(2);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(window)),
            window,
            bps: AtomicU64::new(0),
            eta_millis: AtomicU64::new(0),
        }
    }

    pub fn bps(&self) -> u64 {
        self.bps.load(Ordering::Relaxed)
    }

    /// Time until `remaining_bytes` of the last sample are transferred at the
    /// current rate.
    pub fn time_remaining(&self) -> Option<Duration> {
        match self.eta_millis.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn add_snapshot(&self, total_bytes: u64, remaining_bytes: Option<u64>, now: Instant) {
        let (oldest_at, oldest_bytes) = {
            let mut samples = self.samples.lock();
            if samples.len() >= self.window {
                samples.pop_front();
            }
            let oldest = samples.front().copied();
            samples.push_back((now, total_bytes));
            match oldest {
                Some(o) => o,
                None => return,
            }
        };

        let elapsed = now.saturating_duration_since(oldest_at).as_secs_f64();
        if elapsed <= 0. {
            return;
        }
        let transferred = total_bytes.saturating_sub(oldest_bytes);
        let bps = transferred as f64 / elapsed;
        self.bps.store(bps as u64, Ordering::Relaxed);

        let eta_millis = match remaining_bytes {
            Some(left) if transferred > 0 => (left as f64 / bps * 1000.) as u64,
            _ => 0,
        };
        self.eta_millis.store(eta_millis, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_and_eta() {
        let e = SpeedEstimator::new(5);
        let start = Instant::now();
        e.add_snapshot(0, Some(10000), start);
        assert_eq!(e.bps(), 0);
        assert_eq!(e.time_remaining(), None);

        e.add_snapshot(1000, Some(9000), start + Duration::from_secs(1));
        assert_eq!(e.bps(), 1000);
        assert_eq!(e.time_remaining(), Some(Duration::from_secs(9)));

        e.add_snapshot(3000, Some(7000), start + Duration::from_secs(2));
        assert_eq!(e.bps(), 1500);
    }

    #[test]
    fn test_old_samples_fall_out() {
        let e = SpeedEstimator::new(2);
        let start = Instant::now();
        let at = |s| start + Duration::from_secs(s);
        e.add_snapshot(0, None, at(0));
        e.add_snapshot(1000, None, at(1));
        assert_eq!(e.bps(), 1000);

        // Window is [1s, 2s] now.
        e.add_snapshot(1000, None, at(2));
        assert_eq!(e.bps(), 0);
        e.add_snapshot(1500, None, at(3));
        assert_eq!(e.bps(), 500);
        assert_eq!(e.time_remaining(), None);
    }
}
