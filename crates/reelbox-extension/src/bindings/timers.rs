//! Timer queue behind `setTimeout`/`setInterval`.
//!
//! The queue only tracks ids and due times; callbacks stay in the script
//! and are fired by id from the sandbox pump.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Floor for interval periods so a zero-delay interval cannot spin.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Live timers; `Some(period)` for intervals.
    live: HashMap<u64, Option<Duration>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, delay: Duration, repeat: bool, now: Instant) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let period = repeat.then(|| delay.max(MIN_INTERVAL));
        self.live.insert(id, period);
        self.heap.push(Reverse((now + delay, id)));
        id
    }

    /// Cancels a timer. Unknown ids are ignored.
    pub fn clear(&mut self, id: u64) {
        self.live.remove(&id);
    }

    pub fn clear_all(&mut self) {
        self.live.clear();
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Whether any one-shot timer is still waiting to fire.
    pub fn has_pending_timeouts(&self) -> bool {
        self.live.values().any(Option::is_none)
    }

    /// Due time of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if self.live.contains_key(&id) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every timer due at `now`, in due order.
    /// Intervals are rescheduled one period after `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            match self.live.get(&id).copied() {
                Some(Some(period)) => {
                    self.heap.push(Reverse((now + period, id)));
                    due.push(id);
                }
                Some(None) => {
                    self.live.remove(&id);
                    due.push(id);
                }
                None => {}
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_fire_in_due_order() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        let late = q.set(Duration::from_millis(50), false, now);
        let early = q.set(Duration::from_millis(10), false, now);
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(q.pop_due(now).is_empty());
        assert_eq!(q.pop_due(now + Duration::from_millis(60)), vec![early, late]);
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn test_cleared_timer_never_fires() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        let id = q.set(Duration::ZERO, false, now);
        q.clear(id);
        assert!(q.pop_due(now + Duration::from_secs(1)).is_empty());
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn test_interval_reschedules() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        let id = q.set(Duration::from_millis(5), true, now);
        assert!(!q.has_pending_timeouts());
        let t1 = now + Duration::from_millis(5);
        assert_eq!(q.pop_due(t1), vec![id]);
        assert_eq!(q.next_deadline(), Some(t1 + Duration::from_millis(5)));
        q.clear(id);
        assert!(q.pop_due(t1 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_zero_interval_has_floor() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        let id = q.set(Duration::ZERO, true, now);
        assert_eq!(q.pop_due(now), vec![id]);
        assert_eq!(q.next_deadline(), Some(now + MIN_INTERVAL));
    }
}
