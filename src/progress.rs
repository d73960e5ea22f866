use std::time::{Duration, Instant};

/// Byte progress of one transfer direction.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    size: usize,
    total: usize,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Progress {
    pub fn reset(&mut self) {
        *self = Progress::default();
    }

    /// Declared length of the transfer, 0 when unbounded.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Bytes moved so far.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn begin(&mut self, time: Instant) {
        self.start = Some(time);
        self.end = Some(time);
    }

    pub fn event(&mut self, bytes: usize, time: Instant) {
        self.total += bytes;
        self.end = Some(time);
        if self.start.is_none() {
            self.start = Some(time);
        }
    }

    /// Completed fraction in `[0, 1]`, or 0 when the size is unknown.
    pub fn fraction(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.total as f64 / self.size as f64
        }
    }

    /// Average rate in bytes per second over the whole transfer.
    pub fn rate(&self) -> f64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end > start => {
                self.total as f64 / (end - start).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// Instantaneous byte rate over a sliding window of one-second buckets.
#[derive(Debug, Clone)]
pub struct RateTracker {
    buckets: Vec<usize>,
    head: usize,
    head_sec: u64,
    origin: Instant,
}

impl RateTracker {
    /// `window` is the averaging period; it is rounded up to whole seconds.
    pub fn new(window: Duration) -> RateTracker {
        let secs = window.as_secs().max(1) as usize;
        RateTracker {
            buckets: vec![0; secs],
            head: 0,
            head_sec: 0,
            origin: Instant::now(),
        }
    }

    fn advance(&mut self, now: Instant) {
        let sec = now.saturating_duration_since(self.origin).as_secs();
        let skip = sec.saturating_sub(self.head_sec);
        if skip == 0 {
            return;
        }

        if skip as usize >= self.buckets.len() {
            self.buckets.iter_mut().for_each(|b| *b = 0);
        } else {
            for _ in 0..skip {
                self.head = (self.head + 1) % self.buckets.len();
                self.buckets[self.head] = 0;
            }
        }
        self.head = (sec % self.buckets.len() as u64) as usize;
        self.head_sec = sec;
    }

    pub fn event(&mut self, bytes: usize, time: Instant) {
        self.advance(time);
        self.buckets[self.head] += bytes;
    }

    /// Average bytes per second over the window.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.advance(now);
        let total: usize = self.buckets.iter().sum();
        total as f64 / self.buckets.len() as f64
    }
}

impl Default for RateTracker {
    fn default() -> RateTracker {
        RateTracker::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_totals() {
        let start = Instant::now();
        let mut p = Progress::default();
        p.set_size(10);
        p.begin(start);
        p.event(4, start + Duration::from_secs(1));
        p.event(6, start + Duration::from_secs(2));

        assert_eq!(p.total(), 10);
        assert!((p.fraction() - 1.0).abs() < f64::EPSILON);
        assert!((p.rate() - 5.0).abs() < 0.01);
    }

    #[test]
    fn rate_tracker_windows() {
        let mut r = RateTracker::new(Duration::from_secs(4));
        let t0 = r.origin;
        r.event(100, t0);
        r.event(100, t0 + Duration::from_secs(1));
        assert!((r.rate(t0 + Duration::from_secs(1)) - 50.0).abs() < 0.01);

        // Old buckets age out of the window.
        assert_eq!(r.rate(t0 + Duration::from_secs(60)), 0.0);
    }
}
