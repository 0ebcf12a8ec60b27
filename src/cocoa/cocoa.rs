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

//! The congestion-management core embedded in the point-to-point device.
//!
//! The core intercepts outbound and inbound packets, tracks per-flow state
//! without any cooperation from the sender, and reshapes the transmit
//! pipeline from a single FIFO into a per-flow admission stage gated by a
//! sliding window. Four callbacks drive the Reno engine: a data segment
//! queued for admission, a segment leaving its queue, a physical transmit
//! completing, and an acknowledgment arriving.

use std::time::Duration;

use log::*;
use rustc_hash::FxHashMap;

use crate::cocoa::flow::FlowId;
use crate::cocoa::flow::FlowState;
use crate::cocoa::flow::HandshakePhase;
use crate::cocoa::flow::TcpPhase;
use crate::cocoa::reno::CcPhase;
use crate::device::DropTailQueue;
use crate::packet::tcp_payload_len;
use crate::packet::Ipv4Header;
use crate::packet::Packet;
use crate::packet::TcpHeader;
use crate::simulator::DeviceId;
use crate::simulator::Event;
use crate::simulator::Simulator;
use crate::MSS;

/// Verdict of the send-side classifier.
#[derive(Debug)]
pub(crate) enum SendVerdict {
    /// The packet was absorbed into its flow's admission queue.
    Held,

    /// The packet bypasses admission and goes straight to the device FIFO.
    Direct(Packet),
}

/// Per-device congestion-management state: the flow table, the queue
/// occupancy flag and the control-plane latency knob.
pub(crate) struct CocoaCore {
    /// Unique trace id for debug logging.
    trace_id: String,

    /// Per-flow state, keyed by the send-direction 5-tuple.
    flows: FxHashMap<FlowId, FlowState>,

    /// True iff every per-flow admission queue is empty.
    queues_empty: bool,

    /// Delay in microseconds before applying engine decisions, emulating a
    /// control-plane round trip.
    cc_latency: u16,
}

impl CocoaCore {
    pub(crate) fn new(trace_id: String, cc_latency: u16) -> Self {
        CocoaCore {
            trace_id,
            flows: FxHashMap::default(),
            queues_empty: true,
            cc_latency,
        }
    }

    pub(crate) fn set_cc_latency(&mut self, v: u16) {
        self.cc_latency = v;
    }

    pub(crate) fn cc_latency(&self) -> u16 {
        self.cc_latency
    }

    pub(crate) fn flow(&self, fid: &FlowId) -> Option<&FlowState> {
        self.flows.get(fid)
    }

    pub(crate) fn queues_empty(&self) -> bool {
        self.queues_empty
    }

    /// Total number of segments held across all admission queues.
    pub(crate) fn pending_total(&self) -> usize {
        self.flows.values().map(|st| st.pending.len()).sum()
    }

    /// Classify an outbound packet, already PPP-framed by the device.
    ///
    /// Handshake and teardown packets pass through to the device FIFO; data
    /// segments of established flows are absorbed into their flow's
    /// admission queue.
    pub(crate) fn classify_send(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        ipv4: &Ipv4Header,
        tcp: &TcpHeader,
        packet: Packet,
    ) -> SendVerdict {
        let fid = FlowId::outbound(ipv4, tcp);
        let trace_id = &self.trace_id;
        let defer = {
            let st = self.flows.entry(fid).or_insert_with(|| {
                debug!("{} send: new flow {}", trace_id, fid);
                FlowState::new()
            });
            match st.tcp_phase {
                TcpPhase::Setup => {
                    match st.handshake_phase {
                        HandshakePhase::None if tcp.is_pure_syn() => {
                            debug!("{} send: SYN {} seq={}", trace_id, fid, tcp.seq);
                            st.initiator = true;
                            st.handshake_phase = HandshakePhase::Syn;
                            st.init_seq = tcp.seq;
                            st.cm_start = tcp.seq;
                        }
                        HandshakePhase::Syn if !st.initiator && tcp.is_syn_ack() => {
                            debug!("{} send: SYN-ACK {} seq={}", trace_id, fid, tcp.seq);
                            st.handshake_phase = HandshakePhase::SynAck;
                            st.init_seq = tcp.seq;
                            st.cm_start = tcp.seq;
                        }
                        HandshakePhase::SynAck if st.initiator && tcp.is_pure_ack() => {
                            debug!(
                                "{} send: handshake ACK {} init_seq={}",
                                trace_id, fid, st.init_seq
                            );
                            st.handshake_phase = HandshakePhase::Ack;
                            st.tcp_phase = TcpPhase::Data;
                        }
                        // Non-conforming handshake packets cause no
                        // transition and flow through the FIFO untouched.
                        _ => {}
                    }
                    false
                }
                TcpPhase::Data => {
                    if tcp_payload_len(ipv4, tcp) > 0 {
                        true
                    } else if tcp.has_fin() {
                        debug!("{} send: FIN {}", trace_id, fid);
                        false
                    } else {
                        debug!("{} send: tear down {}", trace_id, fid);
                        st.tcp_phase = TcpPhase::TearDown;
                        false
                    }
                }
                TcpPhase::TearDown => {
                    trace!("{} send: {} already in tear down", trace_id, fid);
                    false
                }
            }
        };

        if defer {
            self.on_data_segment(sim, dev, fid, tcp.seq, packet);
            return SendVerdict::Held;
        }
        SendVerdict::Direct(packet)
    }

    /// Classify an inbound packet, PPP framing already stripped. The flow is
    /// looked up under the send-direction key, so the addresses swap.
    pub(crate) fn on_inbound(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        ipv4: &Ipv4Header,
        tcp: &TcpHeader,
    ) {
        let fid = FlowId::inbound(ipv4, tcp);
        let trace_id = &self.trace_id;
        let ack_event = {
            let st = self.flows.entry(fid).or_insert_with(|| {
                debug!("{} receive: new flow {}", trace_id, fid);
                FlowState::new()
            });
            match st.tcp_phase {
                TcpPhase::Setup => match st.handshake_phase {
                    HandshakePhase::None if tcp.is_pure_syn() => {
                        debug!("{} receive: SYN {} seq={}", trace_id, fid, tcp.seq);
                        st.handshake_phase = HandshakePhase::Syn;
                        st.initiator = false;
                        None
                    }
                    HandshakePhase::Syn if st.initiator && tcp.is_syn_ack() => {
                        debug!("{} receive: SYN-ACK {} ack={}", trace_id, fid, tcp.ack);
                        st.handshake_phase = HandshakePhase::SynAck;
                        Some(true)
                    }
                    HandshakePhase::SynAck if !st.initiator && tcp.is_pure_ack() => {
                        debug!("{} receive: handshake ACK {} ack={}", trace_id, fid, tcp.ack);
                        st.handshake_phase = HandshakePhase::Ack;
                        st.tcp_phase = TcpPhase::Data;
                        Some(true)
                    }
                    _ => None,
                },
                TcpPhase::Data => {
                    if tcp.has_ack() {
                        Some(false)
                    } else {
                        trace!("{} receive: data {} seq={}", trace_id, fid, tcp.seq);
                        None
                    }
                }
                TcpPhase::TearDown => {
                    trace!("{} receive: {} in tear down", trace_id, fid);
                    None
                }
            }
        };

        if let Some(in_handshake) = ack_event {
            self.on_ack(sim, dev, fid, tcp.ack, in_handshake);
        }
    }

    /// A data segment was deferred into its flow's admission queue.
    fn on_data_segment(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        fid: FlowId,
        seq: u32,
        packet: Packet,
    ) {
        if let Some(st) = self.flows.get_mut(&fid) {
            st.pending.push(seq, packet);
            debug!(
                "{} pkt enq: {} seq={} pending={}",
                self.trace_id,
                fid,
                seq,
                st.pending.len()
            );
        }
        if self.queues_empty {
            self.queues_empty = false;
            sim.schedule_now(Event::Sched { dev });
        }
    }

    /// The physical layer finished clocking out a packet of this flow.
    /// Updates the high-water mark of transmitted data and arms the
    /// retransmission timer when unacknowledged data is outstanding.
    pub(crate) fn on_transmitted(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        ipv4: &Ipv4Header,
        tcp: &TcpHeader,
    ) {
        let fid = FlowId::outbound(ipv4, tcp);
        let Some(st) = self.flows.get_mut(&fid) else {
            debug!(
                "{} pkt sent without flow state for {}",
                self.trace_id, fid
            );
            return;
        };

        let payload = tcp_payload_len(ipv4, tcp);
        let sent = tcp.seq.wrapping_add(payload as u32);
        if sent > st.max_sent {
            st.max_sent = sent;
        }
        debug!(
            "{} pkt sent: {} seq={} payload={} max_sent={}",
            self.trace_id, fid, tcp.seq, payload, st.max_sent
        );

        if !st.rto_armed && st.max_sent > st.max_ack {
            Self::arm_rto(&self.trace_id, sim, dev, fid, st);
        }
    }

    /// Fold an acknowledgment into the flow counters, advance the window
    /// edge, and decide the congestion-control transition.
    ///
    /// Acknowledgments fired by the handshake sub-machine update the
    /// bookkeeping but never run a transition; the flow stays in START with
    /// a one-segment window until the first data ACK.
    fn on_ack(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        fid: FlowId,
        ack: u32,
        in_handshake: bool,
    ) {
        let transition = {
            let Some(st) = self.flows.get_mut(&fid) else {
                debug!("{} ack rcvd without flow state for {}", self.trace_id, fid);
                return;
            };
            debug!("{} ack rcvd: {} ack={}", self.trace_id, fid, ack);

            if ack > st.cm_start {
                st.cm_start = ack;
                debug!("{} window: {} left edge advances to {}", self.trace_id, fid, ack);
            }
            if ack > st.max_ack {
                st.max_ack = ack;
            }
            if ack == st.max_ack && st.max_ack > st.new_ack_ack_num {
                st.new_ack_ack_num = ack;
                st.new_ack_val = true;
            } else {
                st.new_ack_val = false;
            }

            if st.dup_acks_first_ack {
                st.dup_acks_first_ack = false;
                st.dup_acks_last_ack = ack;
            } else if st.dup_acks_last_ack == ack {
                st.dup_acks_val += 1;
            } else {
                st.dup_acks_last_ack = ack;
                st.dup_acks_val = 0;
            }

            if st.new_ack_val || st.dup_acks_val == 3 {
                Self::arm_rto(&self.trace_id, sim, dev, fid, st);
            }

            if in_handshake {
                None
            } else {
                match reno::reno_transition(st) {
                    Some(phase) => {
                        st.cc_phase = phase;
                        Some(phase)
                    }
                    None => None,
                }
            }
        };

        if let Some(phase) = transition {
            self.dispatch_control(sim, dev, fid, phase);
        }
    }

    /// A retransmission timer reached its deadline. Only the callback whose
    /// generation matches the flow's live counter is honored.
    pub(crate) fn on_rto_expire(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        fid: FlowId,
        cnt: u32,
    ) {
        let start_over = {
            let Some(st) = self.flows.get_mut(&fid) else {
                return;
            };
            if st.rto_count != cnt {
                trace!(
                    "{} rto {}: stale for {}, live generation is {}",
                    self.trace_id,
                    cnt,
                    fid,
                    st.rto_count
                );
                return;
            }
            debug!("{} rto {}: fired for {}", self.trace_id, cnt, fid);

            let already_fired = st.rto_val;
            st.rto_armed = false;
            st.rto_val = true;
            if !already_fired && st.cc_phase != CcPhase::Start {
                st.cc_phase = CcPhase::Start;
                true
            } else {
                false
            }
        };

        if start_over {
            self.dispatch_control(sim, dev, fid, CcPhase::Start);
        }
    }

    /// Run the engine for the decided phase, after the configured
    /// control-plane latency when one is set.
    fn dispatch_control(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        fid: FlowId,
        phase: CcPhase,
    ) {
        if self.cc_latency > 0 {
            sim.schedule(
                Duration::from_micros(self.cc_latency as u64),
                Event::Control { dev, fid, phase },
            );
        } else {
            self.apply_control(sim, dev, fid, phase);
        }
    }

    /// Apply a congestion-engine decision to a flow and kick the admission
    /// scheduler if any segment is waiting.
    pub(crate) fn apply_control(
        &mut self,
        sim: &mut Simulator,
        dev: DeviceId,
        fid: FlowId,
        phase: CcPhase,
    ) {
        let Some(st) = self.flows.get_mut(&fid) else {
            debug!(
                "{} control loop without flow state for {}",
                self.trace_id, fid
            );
            return;
        };
        reno::reno_control(st, phase);
        debug!(
            "{} reno: {} {} window={:.3}",
            self.trace_id, fid, phase, st.cm_window
        );

        if !self.queues_empty {
            sim.schedule_now(Event::Sched { dev });
        }
    }

    /// Drain eligible segments from the admission queues into the device
    /// FIFO under the window rule.
    ///
    /// Passes repeat over all flows while the FIFO keeps advancing. Per
    /// flow and pass, head segments fallen behind the window edge are
    /// discarded and at most one in-window segment is admitted.
    pub(crate) fn run_sched(&mut self, fifo: &mut DropTailQueue) {
        let mut fifo_full = false;
        loop {
            let prev_qlen = fifo.len();
            for (fid, st) in self.flows.iter_mut() {
                loop {
                    let Some(head) = st.pending.peek() else {
                        break;
                    };
                    let (_, ipv4, tcp) = match head.peek_framed() {
                        Ok(headers) => headers,
                        Err(_) => {
                            warn!(
                                "{} sched: dropping unparsable segment of {}",
                                self.trace_id, fid
                            );
                            st.pending.pop();
                            continue;
                        }
                    };
                    let payload = tcp_payload_len(&ipv4, &tcp);

                    if tcp.seq < st.cm_start {
                        // Fell behind the left edge, will never be admitted.
                        st.pending.pop();
                        debug!(
                            "{} pkt deq: {} seq={} behind edge {}, dropped",
                            self.trace_id, fid, tcp.seq, st.cm_start
                        );
                        continue;
                    }

                    let window_end =
                        st.cm_start as u64 + (st.cm_window * MSS as f64) as u64;
                    if tcp.seq as u64 + payload as u64 <= window_end {
                        if fifo.is_full() {
                            fifo_full = true;
                            break;
                        }
                        if let Some(admitted) = st.pending.pop() {
                            fifo.enqueue(admitted);
                            debug!(
                                "{} pkt deq: {} seq={} admitted, pending={}",
                                self.trace_id,
                                fid,
                                tcp.seq,
                                st.pending.len()
                            );
                        }
                    }
                    // One admission per flow and pass; segments beyond the
                    // window stay queued.
                    break;
                }
                if fifo_full {
                    break;
                }
            }
            if fifo_full || fifo.len() == prev_qlen {
                break;
            }
        }

        self.queues_empty = self.flows.values().all(|st| st.pending.is_empty());
    }

    /// (Re-)arm the retransmission timer. Bumping the generation counter is
    /// the only cancellation mechanism: callbacks already in flight observe
    /// a mismatch and no-op.
    fn arm_rto(
        trace_id: &str,
        sim: &mut Simulator,
        dev: DeviceId,
        fid: FlowId,
        st: &mut FlowState,
    ) {
        st.rto_val = false;
        st.rto_armed = true;
        st.rto_count += 1;
        sim.schedule(
            st.rto_delay,
            Event::RtoExpire {
                dev,
                fid,
                cnt: st.rto_count,
            },
        );
        debug!("{} rto {}: armed for {}", trace_id, st.rto_count, fid);
    }
}


pub mod flow;
pub mod reno;
