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

//! Per-flow connection tracking derived from packet inspection, without any
//! cooperation from the transport stack that generated the packets.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::cocoa::reno::CcPhase;
use crate::packet::Ipv4Header;
use crate::packet::Packet;
use crate::packet::TcpHeader;

/// Initial slow-start threshold in bytes.
pub const INITIAL_SS_THRESHOLD: f64 = 131072.0;

/// Default retransmission-timer delay.
pub const DEFAULT_RTO_DELAY: Duration = Duration::from_millis(500);

/// Canonical 5-tuple identifying a transport connection from the device's
/// viewpoint. The local side always comes first; inbound packets swap their
/// addresses so both directions share one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Address of the local endpoint.
    pub local_addr: Ipv4Addr,

    /// Port of the local endpoint.
    pub local_port: u16,

    /// Address of the remote endpoint.
    pub remote_addr: Ipv4Addr,

    /// Port of the remote endpoint.
    pub remote_port: u16,

    /// IP protocol number.
    pub protocol: u8,
}

impl FlowId {
    /// Key for a packet leaving the device: the local side is the source.
    pub fn outbound(ipv4: &Ipv4Header, tcp: &TcpHeader) -> Self {
        FlowId {
            local_addr: ipv4.src,
            local_port: tcp.src_port,
            remote_addr: ipv4.dst,
            remote_port: tcp.dst_port,
            protocol: ipv4.protocol,
        }
    }

    /// Key for a packet arriving at the device, swapped so the local side
    /// still comes first.
    pub fn inbound(ipv4: &Ipv4Header, tcp: &TcpHeader) -> Self {
        FlowId {
            local_addr: ipv4.dst,
            local_port: tcp.dst_port,
            remote_addr: ipv4.src,
            remote_port: tcp.src_port,
            protocol: ipv4.protocol,
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.local_addr, self.local_port, self.remote_addr, self.remote_port, self.protocol
        )
    }
}

/// Connection lifetime phase derived from packet inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpPhase {
    /// Three-way handshake in progress.
    Setup,

    /// Established; data segments are window-gated.
    Data,

    /// Connection shutdown observed.
    TearDown,
}

/// Progress of the three-way handshake as observed by this device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing observed yet.
    None,

    /// A SYN passed through.
    Syn,

    /// A SYN-ACK passed through.
    SynAck,

    /// The final handshake ACK passed through.
    Ack,
}

/// Per-flow record: handshake progress, congestion window, acknowledgment
/// bookkeeping and the queue of data segments awaiting admission.
#[derive(Debug)]
pub struct FlowState {
    /// Connection lifetime phase.
    pub tcp_phase: TcpPhase,

    /// Handshake progress.
    pub handshake_phase: HandshakePhase,

    /// Whether this side sent the first SYN.
    pub initiator: bool,

    /// Initial sequence number observed for this side.
    pub init_seq: u32,

    /// Left edge of the admission window: the lowest un-acked sequence
    /// number. Never decreases.
    pub cm_start: u32,

    /// Admission window size in MSS units; fractional during additive
    /// increase.
    pub cm_window: f64,

    /// Congestion-control phase.
    pub cc_phase: CcPhase,

    /// Slow-start threshold. Starts in bytes and holds window units after
    /// the first multiplicative decrease writes it back.
    pub cc_ss_threshold: f64,

    /// Shadow of the window carried across phase edges.
    pub cc_tmp_win: f64,

    /// Snapshot of `max_sent` at entry to loss recovery; triple duplicate
    /// ACKs at or below it do not count as fresh losses.
    pub cc_recovery_seq: u32,

    /// Highest cumulative acknowledgment seen.
    pub max_ack: u32,

    /// Whether the last acknowledgment advanced `max_ack` strictly.
    pub new_ack_val: bool,

    /// Highest acknowledgment that counted as new.
    pub new_ack_ack_num: u32,

    /// Consecutive repeats of the same acknowledgment number after the
    /// first.
    pub dup_acks_val: u32,

    /// The acknowledgment number being repeated.
    pub dup_acks_last_ack: u32,

    /// True until the first acknowledgment is observed.
    pub dup_acks_first_ack: bool,

    /// Highest sequence plus payload transmitted.
    pub max_sent: u32,

    /// The retransmission timer fired and has not been handled yet.
    pub rto_val: bool,

    /// A retransmission timer is armed.
    pub rto_armed: bool,

    /// Generation counter validating which scheduled timer callback is
    /// live.
    pub rto_count: u32,

    /// Retransmission-timer delay.
    pub rto_delay: Duration,

    /// Data segments awaiting admission, lowest sequence first.
    pub pending: PendingQueue,
}

impl FlowState {
    /// Fresh flow record in the SETUP phase.
    pub fn new() -> Self {
        FlowState {
            tcp_phase: TcpPhase::Setup,
            handshake_phase: HandshakePhase::None,
            initiator: false,
            init_seq: 0,
            cm_start: 0,
            cm_window: 1.0,
            cc_phase: CcPhase::Start,
            cc_ss_threshold: INITIAL_SS_THRESHOLD,
            cc_tmp_win: 0.0,
            cc_recovery_seq: 0,
            max_ack: 0,
            new_ack_val: false,
            new_ack_ack_num: 0,
            dup_acks_val: 0,
            dup_acks_last_ack: 0,
            dup_acks_first_ack: true,
            max_sent: 0,
            rto_val: false,
            rto_armed: false,
            rto_count: 0,
            rto_delay: DEFAULT_RTO_DELAY,
            pending: PendingQueue::new(),
        }
    }
}

impl Default for FlowState {
    fn default() -> Self {
        Self::new()
    }
}

/// Min-queue of deferred data segments, lowest sequence number first.
///
/// Entries are keyed on `(sequence, insertion order)` so duplicate sequence
/// numbers stay totally ordered and the queue is stable.
#[derive(Debug, Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Reverse<PendingEntry>>,
    next_order: u64,
}

#[derive(Debug)]
struct PendingEntry {
    seq: u32,
    order: u64,
    packet: Packet,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.order == other.order
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seq, self.order).cmp(&(other.seq, other.order))
    }
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued segments.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Return if no segments are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queue a segment under its sequence number.
    pub fn push(&mut self, seq: u32, packet: Packet) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Reverse(PendingEntry { seq, order, packet }));
    }

    /// The segment with the lowest sequence number, if any.
    pub fn peek(&self) -> Option<&Packet> {
        self.heap.peek().map(|entry| &entry.0.packet)
    }

    /// Remove and return the segment with the lowest sequence number.
    pub fn pop(&mut self) -> Option<Packet> {
        self.heap.pop().map(|entry| entry.0.packet)
    }
}
