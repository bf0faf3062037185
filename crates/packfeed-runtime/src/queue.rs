use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;

use crate::buffer::PackedBuffer;
use crate::signal::StopSignal;

/// Fixed-capacity MPMC queue. Neither side ever blocks.
///
/// A rejected push hands the item back so ownership is never lost on a full queue.
#[derive(Debug)]
pub struct BoundedHandoffQueue<T> {
    slots: ArrayQueue<T>,
}

/// The consumer to producer direction: buffers coming back for refilling.
pub type RecycleChannel = BoundedHandoffQueue<PackedBuffer>;

impl<T> BoundedHandoffQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.slots.push(item)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.slots.pop()
    }

    /// Retries `try_push` with a `retry` sleep between attempts until it lands or
    /// `stop` is requested, in which case the item is handed back.
    ///
    /// `on_retry` sees the running count of rejected attempts.
    pub fn push_with_backoff(
        &self,
        mut item: T,
        stop: &StopSignal,
        retry: Duration,
        mut on_retry: impl FnMut(u64),
    ) -> Result<(), T> {
        let mut rejected: u64 = 0;
        loop {
            match self.slots.push(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
            if stop.is_requested() {
                return Err(item);
            }
            rejected = rejected.saturating_add(1);
            on_retry(rejected);
            std::thread::sleep(retry);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

/// A solver's handoff queue plus the turn counter that keeps it in sequence order.
///
/// Buffer `sequence` lands on lane `sequence % lanes` at local position
/// `sequence / lanes`; a producer may only publish once `next_turn` reaches its
/// local position, so concurrent producers cannot reorder a lane.
#[derive(Debug)]
pub(crate) struct Lane {
    pub(crate) queue: BoundedHandoffQueue<PackedBuffer>,
    next_turn: AtomicU64,
}

impl Lane {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: BoundedHandoffQueue::new(capacity),
            next_turn: AtomicU64::new(0),
        }
    }

    /// Waits until `turn` is up. Returns false if stopped first.
    pub(crate) fn wait_turn(&self, turn: u64, stop: &StopSignal, retry: Duration) -> bool {
        loop {
            if self.next_turn.load(Ordering::Acquire) == turn {
                return true;
            }
            if stop.is_requested() {
                return false;
            }
            std::thread::sleep(retry);
        }
    }

    pub(crate) fn finish_turn(&self) {
        self.next_turn.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_is_rejected_when_full() {
        let q = BoundedHandoffQueue::new(2);
        assert_eq!(q.try_push(1), Ok(()));
        assert_eq!(q.try_push(2), Ok(()));
        assert_eq!(q.try_push(3), Err(3));
        assert!(q.is_full());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_is_rejected_when_empty() {
        let q: BoundedHandoffQueue<u32> = BoundedHandoffQueue::new(1);
        assert_eq!(q.try_pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn single_producer_order_is_kept() {
        let q = BoundedHandoffQueue::new(8);
        for i in 0..8 {
            q.try_push(i).unwrap();
        }
        let drained: Vec<i32> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(drained, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn length_stays_within_bounds_under_mixed_ops() {
        let q = BoundedHandoffQueue::new(5);
        let mut model: usize = 0;
        // Deterministic op pattern: pushes outnumber pops, then the reverse.
        for step in 0u32..200 {
            let push = if step < 100 { step % 3 != 0 } else { step % 3 == 0 };
            if push {
                if q.try_push(step).is_ok() {
                    model += 1;
                }
            } else if q.try_pop().is_some() {
                model -= 1;
            }
            assert!(q.len() <= q.capacity());
            assert_eq!(q.len(), model);
        }
    }

    #[test]
    fn push_with_backoff_returns_item_on_stop() {
        let q = BoundedHandoffQueue::new(1);
        q.try_push(0u8).unwrap();
        let stop = StopSignal::new();
        let mut retries = 0;
        let s = stop.clone();
        let res = q.push_with_backoff(9u8, &stop, Duration::from_millis(1), |n| {
            retries = n;
            if n == 3 {
                s.request();
            }
        });
        assert_eq!(res, Err(9));
        assert_eq!(retries, 3);
    }

    #[test]
    fn lane_turns_advance_in_order() {
        let lane = Lane::new(4);
        let stop = StopSignal::new();
        assert!(lane.wait_turn(0, &stop, Duration::from_millis(1)));
        lane.finish_turn();
        assert!(lane.wait_turn(1, &stop, Duration::from_millis(1)));
        stop.request();
        assert!(!lane.wait_turn(5, &stop, Duration::from_millis(1)));
    }
}
