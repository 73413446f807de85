//! Deadline-scheduled callbacks. A timer completion is delivered exactly
//! like any other sub-request completion: the engine drains expired
//! entries from the queue and routes each token back to its owner.

use crate::clock::{ticks_since, Ticks};
use log::debug;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Destination of a timer expiry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerToken {
    /// A unified in-flight command (stop polling, start settle delay).
    Unified(u64),
    /// An asynchronous operation awaiting a delay.
    AsyncOp(u32),
    /// A foreground waiter spinning on the poll loop.
    Foreground(u32),
}

struct Entry {
    timeout: Ticks,
    seq: u64,
    token: TimerToken,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline (and,
// for equal deadlines, the earliest submission) is the greatest.
impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        ticks_since(other.timeout, self.timeout)
            .cmp(&0)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.timeout == other.timeout && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// The pending timer queue.
pub struct TimerQueue {
    active: bool,
    pending: BinaryHeap<Entry>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            active: false,
            pending: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Start the timer layer.
    pub fn start(&mut self) {
        if !self.active {
            debug!("starting timer layer");
            self.active = true;
        }
    }

    /// End the timer layer. Any pending timers expire on the next poll.
    pub fn end(&mut self) {
        if self.active {
            debug!("ending timer layer");
            self.active = false;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Schedule a timer. Control returns immediately; the token is
    /// delivered by `expire` once the deadline passes.
    pub fn schedule(&mut self, timeout: Ticks, token: TimerToken) {
        self.seq += 1;
        self.pending.push(Entry {
            timeout,
            seq: self.seq,
            token,
        });
    }

    /// Pop every due entry. While the layer is inactive all pending
    /// entries are due.
    pub fn expire(&mut self, now: Ticks) -> Vec<TimerToken> {
        let mut fired = Vec::new();
        while let Some(head) = self.pending.peek() {
            if self.active && ticks_since(head.timeout, now) >= 0 {
                break;
            }
            if let Some(entry) = self.pending.pop() {
                fired.push(entry.token);
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> TimerQueue {
        TimerQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.start();
        q.schedule(30, TimerToken::Foreground(3));
        q.schedule(10, TimerToken::Foreground(1));
        q.schedule(20, TimerToken::Foreground(2));

        assert!(q.expire(5).is_empty());
        assert_eq!(
            q.expire(25),
            vec![TimerToken::Foreground(1), TimerToken::Foreground(2)]
        );
        assert_eq!(q.expire(100), vec![TimerToken::Foreground(3)]);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_deadlines_fire_in_submission_order() {
        let mut q = TimerQueue::new();
        q.start();
        q.schedule(10, TimerToken::Foreground(1));
        q.schedule(10, TimerToken::Foreground(2));
        assert_eq!(
            q.expire(11),
            vec![TimerToken::Foreground(1), TimerToken::Foreground(2)]
        );
    }

    #[test]
    fn ending_the_layer_flushes_pending_timers() {
        let mut q = TimerQueue::new();
        q.start();
        q.schedule(1000, TimerToken::AsyncOp(7));
        q.end();
        assert_eq!(q.expire(0), vec![TimerToken::AsyncOp(7)]);
    }
}
