use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::Relaxed).saturating_add(delta)
    }

    pub fn sub(&self, delta: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    /// Raises the gauge to `value` if it is currently lower.
    pub fn max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct DurationAgg {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl DurationAgg {
    pub fn record(&self, dur: Duration) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);

        let mut prev = self.max_ns.load(Ordering::Relaxed);
        while ns > prev {
            match self
                .max_ns
                .compare_exchange_weak(prev, ns, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn snapshot(&self) -> DurationAggSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let max_ns = self.max_ns.load(Ordering::Relaxed);
        DurationAggSnapshot {
            count,
            total_ns,
            max_ns,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DurationAggSnapshot {
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
}

impl DurationAggSnapshot {
    pub fn avg_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }
}

/// Records the time between construction and [`stop`](Self::stop) (or drop).
pub struct ScopedTimer<'a> {
    start: Instant,
    agg: Option<&'a DurationAgg>,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(agg: &'a DurationAgg) -> Self {
        Self {
            start: Instant::now(),
            agg: Some(agg),
        }
    }

    /// Records now and returns the measured span.
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(agg) = self.agg.take() {
            agg.record(elapsed);
        }
        elapsed
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        if let Some(agg) = self.agg.take() {
            agg.record(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_high_water() {
        let inflight = Gauge::default();
        let high_water = Gauge::default();
        high_water.max(inflight.add(3));
        high_water.max(inflight.add(2));
        inflight.sub(4);
        high_water.max(inflight.add(1));
        assert_eq!(inflight.get(), 2);
        assert_eq!(high_water.get(), 5);
    }

    #[test]
    fn gauge_sub_saturates() {
        let g = Gauge::default();
        g.sub(10);
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn duration_agg_averages() {
        let agg = DurationAgg::default();
        agg.record(Duration::from_nanos(10));
        agg.record(Duration::from_nanos(30));
        let snap = agg.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.avg_ns(), 20);
        assert_eq!(snap.max_ns, 30);
    }

    #[test]
    fn scoped_timer_records_on_drop() {
        let agg = DurationAgg::default();
        {
            let _t = ScopedTimer::new(&agg);
        }
        assert_eq!(agg.snapshot().count, 1);
    }

    #[test]
    fn scoped_timer_stop_records_once() {
        let agg = DurationAgg::default();
        let timer = ScopedTimer::new(&agg);
        std::thread::sleep(Duration::from_millis(2));
        let elapsed = timer.stop();
        let snap = agg.snapshot();
        assert_eq!(snap.count, 1);
        assert!(elapsed >= Duration::from_millis(2));
        assert_eq!(snap.max_ns, elapsed.as_nanos() as u64);
    }
}
