//! Cooperative deadline queue shared by all backend sessions.
//!
//! A session asks to be woken in N milliseconds and the host services expired
//! entries on its own tick; no session gets a thread. Every entry carries an
//! insertion stamp, and one tick only services entries that existed when it
//! started, so a session re-arming a zero-delay timer cannot starve the rest
//! of the host.

use std::time::{Duration, Instant};

use crate::session::SessionId;

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    owner: SessionId,
    tag: u32,
    /// Insertion sequence; entries stamped during a tick wait for the next.
    stamp: u64,
}

/// Deadline-ordered timer queue.
#[derive(Debug, Default)]
pub struct TimerQueue {
    /// Sorted ascending by deadline, insertion order within equal deadlines.
    entries: Vec<TimerEntry>,
    stamp_counter: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `owner`, firing `delay` after `now`. Absurd delays are
    /// clamped a year out instead of overflowing the clock.
    pub fn add(&mut self, now: Instant, owner: SessionId, delay: Duration, tag: u32) {
        const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + MAX_DELAY);
        let stamp = self.stamp_counter;
        self.stamp_counter += 1;

        // Insert after every entry with an earlier-or-equal deadline so equal
        // deadlines fire in insertion order.
        let pos = self.entries.partition_point(|e| e.deadline <= deadline);
        self.entries.insert(
            pos,
            TimerEntry {
                deadline,
                owner,
                tag,
                stamp,
            },
        );
        log::trace!("timer armed: session {} tag {} in {:?}", owner, tag, delay);
    }

    /// Remove `owner`'s timers; all of them when `tag` is `None`. Returns how
    /// many were removed. Guarantees no dangling callback after close.
    pub fn kill(&mut self, owner: SessionId, tag: Option<u32>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.owner != owner || tag.is_some_and(|t| e.tag != t));
        before - self.entries.len()
    }

    /// Earliest pending deadline, for the host loop's sleep computation.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Start a tick: everything inserted from now on is eligible only on the
    /// next tick. Returns the cutoff to pass to [`TimerQueue::pop_due`].
    pub fn begin_tick(&mut self) -> u64 {
        self.stamp_counter
    }

    /// Pop the next entry that is due at `now` and was inserted before the
    /// tick's `cutoff`. Entries re-armed during the current tick stay queued.
    pub fn pop_due(&mut self, now: Instant, cutoff: u64) -> Option<(SessionId, u32)> {
        let idx = self
            .entries
            .iter()
            .take_while(|e| e.deadline <= now)
            .position(|e| e.stamp < cutoff)?;
        let entry = self.entries.remove(idx);
        Some((entry.owner, entry.tag))
    }
}
