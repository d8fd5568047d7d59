use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

/// Time-ordered set of per-key deadlines.
///
/// Rescheduling or cancelling a key does not touch the heap; each entry
/// carries a generation and stale generations are skipped when drained. A key
/// therefore fires at most once per `schedule` call.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, K)>>,
    live: HashMap<K, u64>,
    next_generation: u64,
}

impl<K> DeadlineQueue<K>
where
    K: Ord + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm (or re-arm) the deadline for `key`, replacing any earlier one.
    pub fn schedule(&mut self, key: K, at: DateTime<Utc>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(key.clone(), generation);
        self.heap.push(Reverse((at, generation, key)));
    }

    /// Disarm `key`. Returns whether a deadline was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// Remove and return every key whose live deadline is at or before `now`.
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = self.heap.pop() else {
                break;
            };
            if self.live.get(&key) == Some(&generation) {
                self.live.remove(&key);
                expired.push(key);
            }
        }
        expired
    }

    /// Earliest live deadline, skipping stale heap entries.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, generation, key))) = self.heap.peek() {
            if self.live.get(key) == Some(generation) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    /// Number of armed keys.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<K> Default for DeadlineQueue<K>
where
    K: Ord + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_drains_in_deadline_order() {
        let now = Utc::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("b".to_string(), now + Duration::seconds(2));
        queue.schedule("a".to_string(), now + Duration::seconds(1));
        queue.schedule("c".to_string(), now + Duration::seconds(10));

        assert!(queue.drain_expired(now).is_empty());
        let fired = queue.drain_expired(now + Duration::seconds(5));
        assert_eq!(fired, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reschedule_replaces_earlier_deadline() {
        let now = Utc::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("a1", now + Duration::seconds(1));
        queue.schedule("a1", now + Duration::seconds(60));

        assert!(queue.drain_expired(now + Duration::seconds(30)).is_empty());
        assert!(queue.is_armed(&"a1"));
        assert_eq!(queue.drain_expired(now + Duration::seconds(61)), vec!["a1"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_disarms() {
        let now = Utc::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("a1", now);
        assert!(queue.cancel(&"a1"));
        assert!(!queue.cancel(&"a1"));
        assert!(queue.drain_expired(now + Duration::seconds(1)).is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_fires_once() {
        let now = Utc::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("a1", now);
        assert_eq!(queue.drain_expired(now), vec!["a1"]);
        assert!(queue.drain_expired(now + Duration::seconds(1)).is_empty());
    }

    #[test]
    fn test_next_deadline_skips_stale() {
        let now = Utc::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule("a1", now + Duration::seconds(1));
        queue.schedule("a2", now + Duration::seconds(5));
        queue.cancel(&"a1");
        assert_eq!(queue.next_deadline(), Some(now + Duration::seconds(5)));
    }
}
