// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use priority_queue::double_priority_queue::DoublePriorityQueue;
use slab::Slab;

/// Store scheduled events in a binary queue, sorted by which deadline comes
/// first. Events sharing a deadline pop in the order they were added.
pub struct EventQueue<T> {
    /// Event payloads, keyed by slot.
    slots: Slab<T>,

    /// Slots ordered by (deadline, admission sequence).
    order: DoublePriorityQueue<usize, (Duration, u64)>,

    /// Monotonic admission sequence used as the deadline tie-break.
    seq: u64,
}

impl<T> EventQueue<T> {
    /// Create a new EventQueue.
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            order: DoublePriorityQueue::new(),
            seq: 0,
        }
    }

    /// Return the number of events in the queue.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Return if the event queue is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Add an event due at the given deadline.
    pub fn add(&mut self, deadline: Duration, event: T) {
        let key = self.slots.insert(event);
        self.seq += 1;
        _ = self.order.push(key, (deadline, self.seq));
    }

    /// Return the deadline of the event expiring first, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.order.peek_min().map(|(_, (deadline, _))| *deadline)
    }

    /// Return the amount of time remaining for the earliest expiring event.
    pub fn time_remaining(&self, now: Duration) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
    }

    /// Return the next expired event if any.
    pub fn next_expire(&mut self, now: Duration) -> Option<(Duration, T)> {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => self.pop(),
            _ => None,
        }
    }

    /// Pop the earliest event regardless of its deadline.
    pub fn pop(&mut self) -> Option<(Duration, T)> {
        let (key, (deadline, _)) = self.order.pop_min()?;
        Some((deadline, self.slots.remove(key)))
    }

    /// Clear all the events.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
