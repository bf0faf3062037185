use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const GATE_POLL: Duration = Duration::from_millis(10);

/// Cooperative stop flag shared by the owner and every worker.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One-shot latch that holds readers back until the owner starts them.
#[derive(Debug, Default)]
pub struct StartGate {
    released: Mutex<bool>,
    cv: Condvar,
}

impl StartGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate. Returns true only for the call that actually opened it.
    pub fn release(&self) -> bool {
        let mut released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        if *released {
            return false;
        }
        *released = true;
        self.cv.notify_all();
        true
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until the gate opens (true) or `stop` is requested (false).
    pub fn wait(&self, stop: &StopSignal) -> bool {
        let mut released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        while !*released {
            if stop.is_requested() {
                return false;
            }
            released = match self.cv.wait_timeout(released, GATE_POLL) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_releases_once() {
        let gate = StartGate::new();
        assert!(!gate.is_released());
        assert!(gate.release());
        assert!(!gate.release());
        assert!(gate.is_released());
    }

    #[test]
    fn wait_after_release_returns_immediately() {
        let gate = StartGate::new();
        gate.release();
        assert!(gate.wait(&StopSignal::new()));
        assert!(gate.wait(&StopSignal::new()));
    }

    #[test]
    fn waiters_wake_on_release() {
        let gate = Arc::new(StartGate::new());
        let stop = StopSignal::new();
        let waiter = {
            let gate = gate.clone();
            let stop = stop.clone();
            std::thread::spawn(move || gate.wait(&stop))
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn stop_interrupts_a_closed_gate() {
        let gate = Arc::new(StartGate::new());
        let stop = StopSignal::new();
        let waiter = {
            let gate = gate.clone();
            let stop = stop.clone();
            std::thread::spawn(move || gate.wait(&stop))
        };
        stop.request();
        assert!(!waiter.join().unwrap());
    }
}
