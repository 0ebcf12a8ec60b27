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

//! CoCoA is a point-to-point network-device model for discrete-event
//! simulation with an embedded, TCP-Reno-style congestion-management core.
//!
//! The device intercepts outbound and inbound packets on a simulated link
//! and enforces a per-flow congestion window, independently of the
//! transport stack that generated the packets:
//!
//! * **Per-flow tracking**: flows are discovered by inspecting IPv4/TCP
//!   headers; the three-way handshake and teardown bound when congestion
//!   management is active.
//! * **Window-gated admission**: data segments wait in per-flow queues and
//!   enter the device FIFO only when they fit the flow's sliding window.
//! * **Reno engine**: new ACKs, duplicate ACKs and retransmission timeouts
//!   drive slow start, additive increase, multiplicative decrease and fast
//!   recovery.
//! * **Generation-counted timers**: retransmission timers are invalidated
//!   by bumping a per-flow counter, never by cancellation.
//!
//! Devices are driven entirely by the [`Simulator`] event loop; wiring two
//! of them into a [`Link`] gives a complete simulated topology.

use std::time::Duration;

/// Maximum segment size assumed by the admission window, in bytes.
pub const MSS: usize = 1460;

/// Default MAC-level maximum transmission unit.
pub const DEFAULT_MTU: u16 = 1500;

/// Default capacity of the device transmit queue in packets.
pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 100;

/// A specialized [`Result`](std::result::Result) type for device
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configurable attributes of a point-to-point device.
#[derive(Clone, Debug)]
pub struct Config {
    /// The MAC-level maximum transmission unit.
    pub(crate) mtu: u16,

    /// The MAC address of the device.
    pub(crate) address: MacAddr,

    /// The data rate for the point-to-point link.
    pub(crate) data_rate: DataRate,

    /// The time to wait between packet (frame) transmissions.
    pub(crate) interframe_gap: Duration,

    /// The latency of the control loop in microseconds.
    pub(crate) cc_latency: u16,

    /// Capacity of the device transmit queue in packets.
    pub(crate) tx_queue_capacity: usize,

    /// Predicate deciding whether the owning node runs congestion
    /// management.
    pub(crate) cc_gate: fn(NodeId) -> bool,
}

impl Config {
    /// Create a config with the default attribute values.
    pub fn new() -> Self {
        Config {
            mtu: DEFAULT_MTU,
            address: MacAddr::BROADCAST,
            data_rate: DataRate::default(),
            interframe_gap: Duration::ZERO,
            cc_latency: 0,
            tx_queue_capacity: DEFAULT_TX_QUEUE_CAPACITY,
            cc_gate: endpoint_node_gate,
        }
    }

    /// Set the MAC-level maximum transmission unit.
    pub fn set_mtu(&mut self, v: u16) {
        self.mtu = v;
    }

    /// Set the MAC address of the device.
    pub fn set_address(&mut self, v: MacAddr) {
        self.address = v;
    }

    /// Set the data rate for the point-to-point link.
    pub fn set_data_rate(&mut self, v: DataRate) {
        self.data_rate = v;
    }

    /// Set the time to wait between packet (frame) transmissions.
    pub fn set_interframe_gap(&mut self, v: Duration) {
        self.interframe_gap = v;
    }

    /// Set the latency of the control loop in microseconds.
    pub fn set_cc_latency(&mut self, v: u16) {
        self.cc_latency = v;
    }

    /// Set the capacity of the device transmit queue in packets.
    pub fn set_tx_queue_capacity(&mut self, v: usize) {
        self.tx_queue_capacity = v;
    }

    /// Set the predicate deciding whether the owning node runs congestion
    /// management.
    pub fn set_cc_gate(&mut self, v: fn(NodeId) -> bool) {
        self.cc_gate = v;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}


#[path = "cocoa/cocoa.rs"]
pub(crate) mod cocoa;

mod codec;
pub mod device;
pub mod error;
pub mod link;
pub mod packet;
pub mod simulator;
pub mod timer_queue;

pub use crate::cocoa::flow::FlowId;
pub use crate::cocoa::flow::FlowState;
pub use crate::cocoa::flow::HandshakePhase;
pub use crate::cocoa::flow::TcpPhase;
pub use crate::cocoa::reno::CcPhase;
pub use crate::device::endpoint_node_gate;
pub use crate::device::DataRate;
pub use crate::device::Device;
pub use crate::device::DeviceStats;
pub use crate::device::ErrorModel;
pub use crate::device::NodeId;
pub use crate::device::RateErrorModel;
pub use crate::error::Error;
pub use crate::link::Link;
pub use crate::packet::MacAddr;
pub use crate::packet::Packet;
pub use crate::simulator::Event;
pub use crate::simulator::Simulator;
