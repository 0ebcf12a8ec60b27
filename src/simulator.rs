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

//! Single-threaded cooperative discrete-event scheduler.
//!
//! Handlers run to completion and may schedule future events. A zero delay
//! means "run after the current handler returns, before simulated time
//! advances"; events sharing a deadline run in scheduling order.

use std::time::Duration;

use crate::cocoa::flow::FlowId;
use crate::cocoa::reno::CcPhase;
use crate::packet::Packet;
use crate::timer_queue::EventQueue;

/// Index of a device on its link.
pub type DeviceId = usize;

/// A deferred callback dispatched by the event loop to its owning device.
#[derive(Debug)]
pub enum Event {
    /// Run an admission scheduler pass.
    Sched {
        /// Device to run the pass on.
        dev: DeviceId,
    },

    /// Apply a congestion-engine decision to a flow.
    Control {
        /// Device owning the flow.
        dev: DeviceId,
        /// The flow the decision belongs to.
        fid: FlowId,
        /// The phase decided when the event was scheduled.
        phase: CcPhase,
    },

    /// A retransmission timer reached its deadline.
    RtoExpire {
        /// Device owning the flow.
        dev: DeviceId,
        /// The flow whose timer was armed.
        fid: FlowId,
        /// Generation the timer was armed with.
        cnt: u32,
    },

    /// The physical transmit of the in-flight packet finished.
    TransmitComplete {
        /// Device whose transmitter went idle.
        dev: DeviceId,
    },

    /// The channel delivers a packet at the remote device.
    Deliver {
        /// Receiving device.
        dev: DeviceId,
        /// The delivered packet, still PPP-framed.
        packet: Packet,
    },
}

impl Event {
    /// The device this event is addressed to.
    pub fn device(&self) -> DeviceId {
        match self {
            Event::Sched { dev } => *dev,
            Event::Control { dev, .. } => *dev,
            Event::RtoExpire { dev, .. } => *dev,
            Event::TransmitComplete { dev } => *dev,
            Event::Deliver { dev, .. } => *dev,
        }
    }
}

/// The virtual clock and its pending events.
pub struct Simulator {
    events: EventQueue<Event>,
    now: Duration,
}

impl Simulator {
    /// Create a simulator with the clock at zero.
    pub fn new() -> Self {
        Simulator {
            events: EventQueue::new(),
            now: Duration::ZERO,
        }
    }

    /// Current simulated time since the start of the run.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule an event `delay` from now.
    pub fn schedule(&mut self, delay: Duration, event: Event) {
        self.events.add(self.now + delay, event);
    }

    /// Schedule an event at the current simulated time.
    pub fn schedule_now(&mut self, event: Event) {
        self.schedule(Duration::ZERO, event);
    }

    /// Pop the next event, advancing the clock to its deadline.
    pub fn pop_next(&mut self) -> Option<(Duration, Event)> {
        let (deadline, event) = self.events.pop()?;
        self.now = deadline;
        Some((deadline, event))
    }

    /// Deadline of the next pending event.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.events.next_deadline()
    }

    /// Move the clock forward without running anything.
    pub fn advance_to(&mut self, when: Duration) {
        if when > self.now {
            self.now = when;
        }
    }

    /// Return if no events are pending.
    pub fn is_idle(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}
