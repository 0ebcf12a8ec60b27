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

//! The point-to-point network device: transmit state machine, bounded
//! device FIFO, receive path, and the glue that feeds the congestion core.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use log::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::cocoa::flow::FlowId;
use crate::cocoa::flow::FlowState;
use crate::cocoa::CocoaCore;
use crate::cocoa::SendVerdict;
use crate::error::Error;
use crate::packet::ether_to_ppp;
use crate::packet::ppp_to_ether;
use crate::packet::MacAddr;
use crate::packet::Packet;
use crate::packet::PppHeader;
use crate::simulator::DeviceId;
use crate::simulator::Event;
use crate::simulator::Simulator;
use crate::Config;
use crate::Result;

/// Identifier of a node in the surrounding simulation.
pub type NodeId = u32;

/// Default congestion gate: the simulation convention that nodes with an
/// identifier above 1 are endpoints and everything below is plumbing.
pub fn endpoint_node_gate(node: NodeId) -> bool {
    node > 1
}

/// Transmit rate of a device in bits per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRate(u64);

impl DataRate {
    /// Create a rate from a raw bits-per-second value.
    pub fn from_bps(bps: u64) -> Self {
        DataRate(bps)
    }

    /// The rate in bits per second.
    pub fn bps(&self) -> u64 {
        self.0
    }

    /// Time needed to clock the given number of bytes onto the wire. A zero
    /// rate transmits instantaneously.
    pub fn bytes_tx_time(&self, bytes: usize) -> Duration {
        if self.0 == 0 {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * 8 * 1_000_000_000 / self.0 as u128;
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for DataRate {
    fn default() -> Self {
        DataRate(32768)
    }
}

impl FromStr for DataRate {
    type Err = Error;

    fn from_str(rate: &str) -> Result<DataRate> {
        let units = [
            ("Gb/s", 1_000_000_000u64),
            ("Mb/s", 1_000_000),
            ("kb/s", 1_000),
            ("b/s", 1),
        ];
        for (suffix, scale) in units {
            if let Some(value) = rate.strip_suffix(suffix) {
                let value: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidConfig(rate.to_string()))?;
                return Ok(DataRate(value * scale));
            }
        }
        Err(Error::InvalidConfig(rate.to_string()))
    }
}

impl std::fmt::Display for DataRate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}b/s", self.0)
    }
}

/// Receive-path error model deciding whether a delivered packet is lost.
pub trait ErrorModel {
    /// Return true if the packet must be treated as corrupted and dropped.
    fn is_corrupt(&mut self, packet: &Packet) -> bool;
}

/// Drops packets uniformly at a configured rate.
pub struct RateErrorModel {
    rate: f64,
    rng: StdRng,
}

impl RateErrorModel {
    /// Create a model dropping the given fraction of packets.
    pub fn new(rate: f64) -> Self {
        Self::with_seed(rate, rand::random())
    }

    /// Create a model with a fixed seed for reproducible runs.
    pub fn with_seed(rate: f64, seed: u64) -> Self {
        RateErrorModel {
            rate,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ErrorModel for RateErrorModel {
    fn is_corrupt(&mut self, _packet: &Packet) -> bool {
        self.rng.gen::<f64>() < self.rate
    }
}

/// Bounded drop-tail FIFO used as the device transmit queue.
#[derive(Debug)]
pub struct DropTailQueue {
    packets: VecDeque<Packet>,
    capacity: usize,
    dropped: u64,
}

impl DropTailQueue {
    /// Create a queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        DropTailQueue {
            packets: VecDeque::with_capacity(capacity.min(128)),
            capacity,
            dropped: 0,
        }
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Return if no packets are queued.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Return if the queue reached its capacity.
    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    /// Append a packet. A full queue drops it and returns false.
    pub fn enqueue(&mut self, packet: Packet) -> bool {
        if self.is_full() {
            self.dropped += 1;
            return false;
        }
        self.packets.push_back(packet);
        true
    }

    /// Remove and return the packet at the head of the queue.
    pub fn dequeue(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Number of packets dropped on overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Device counters.
#[derive(Debug, Default, Clone)]
pub struct DeviceStats {
    /// Packets fully clocked onto the wire.
    pub tx_packets: u64,

    /// Bytes fully clocked onto the wire.
    pub tx_bytes: u64,

    /// Outbound packets dropped before transmission.
    pub tx_dropped: u64,

    /// Packets delivered by the channel and accepted.
    pub rx_packets: u64,

    /// Bytes delivered by the channel and accepted.
    pub rx_bytes: u64,

    /// Delivered packets dropped by the error model or framing checks.
    pub rx_dropped: u64,
}

/// Physical transmit machine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxState {
    Ready,
    Busy,
}

/// A point-to-point network device with the embedded congestion core.
pub struct Device {
    /// Identifier of the owning node, fed to the congestion gate.
    node_id: NodeId,

    /// Index of this device on its link; set at attach time.
    id: DeviceId,

    /// Unique trace id for debug logging.
    trace_id: String,

    mtu: u16,
    address: MacAddr,
    data_rate: DataRate,
    interframe_gap: Duration,
    cc_gate: fn(NodeId) -> bool,

    tx_state: TxState,
    link_up: bool,
    peer: DeviceId,
    channel_delay: Duration,

    /// Packet currently being clocked onto the wire.
    current: Option<Packet>,

    /// The device transmit FIFO.
    queue: DropTailQueue,

    receive_error_model: Option<Box<dyn ErrorModel>>,

    /// Received packets (PPP stripped) awaiting the upper layer.
    rx_ready: VecDeque<(Packet, u16)>,

    cocoa: CocoaCore,
    stats: DeviceStats,
}

impl Device {
    /// Create a detached device owned by the given node.
    pub fn new(node_id: NodeId, config: &Config) -> Self {
        let trace_id = format!("cocoa-dev-{}", node_id);
        Device {
            node_id,
            id: 0,
            cocoa: CocoaCore::new(trace_id.clone(), config.cc_latency),
            trace_id,
            mtu: config.mtu,
            address: config.address,
            data_rate: config.data_rate,
            interframe_gap: config.interframe_gap,
            cc_gate: config.cc_gate,
            tx_state: TxState::Ready,
            link_up: false,
            peer: 0,
            channel_delay: Duration::ZERO,
            current: None,
            queue: DropTailQueue::new(config.tx_queue_capacity),
            receive_error_model: None,
            rx_ready: VecDeque::new(),
            stats: DeviceStats::default(),
        }
    }

    /// Wire the device to one end of a link. The device is up from here on.
    pub(crate) fn attach(&mut self, id: DeviceId, peer: DeviceId, channel_delay: Duration) {
        self.id = id;
        self.peer = peer;
        self.channel_delay = channel_delay;
        self.link_up = true;
    }

    /// Identifier of the owning node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// MAC address of the device.
    pub fn address(&self) -> MacAddr {
        self.address
    }

    /// Set the MAC address of the device.
    pub fn set_address(&mut self, address: MacAddr) {
        self.address = address;
    }

    /// MAC-level maximum transmission unit.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Set the MAC-level maximum transmission unit.
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// Control-plane latency applied to engine decisions, in microseconds.
    pub fn cc_latency(&self) -> u16 {
        self.cocoa.cc_latency()
    }

    /// Set the control-plane latency in microseconds.
    pub fn set_cc_latency(&mut self, micros: u16) {
        self.cocoa.set_cc_latency(micros);
    }

    /// Attach a receive-path error model.
    pub fn set_receive_error_model(&mut self, model: Box<dyn ErrorModel>) {
        self.receive_error_model = Some(model);
    }

    /// Return if the device is attached to a link.
    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Device counters.
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Number of packets sitting in the device transmit FIFO.
    pub fn tx_queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Look up the tracked state of a flow.
    pub fn flow(&self, fid: &FlowId) -> Option<&FlowState> {
        self.cocoa.flow(fid)
    }

    /// Total number of segments held back by the admission stage.
    pub fn pending_segments(&self) -> usize {
        self.cocoa.pending_total()
    }

    /// Return if every per-flow admission queue is empty.
    pub fn admission_idle(&self) -> bool {
        self.cocoa.queues_empty()
    }

    /// Pop the next packet delivered to the upper layer, with its
    /// EtherType.
    pub fn poll_received(&mut self) -> Option<(Packet, u16)> {
        self.rx_ready.pop_front()
    }

    /// Transmit a packet from the upper layer.
    ///
    /// Data segments of established flows are held back by the admission
    /// stage and drained under the congestion window; everything else goes
    /// straight to the device FIFO. Returns false when the link is down or
    /// a straight-through packet overflows the FIFO.
    pub fn send(
        &mut self,
        sim: &mut Simulator,
        mut packet: Packet,
        dest: MacAddr,
        protocol: u16,
    ) -> bool {
        trace!(
            "{} send: {} bytes to {} proto={:#06x}",
            self.trace_id,
            packet.len(),
            dest,
            protocol
        );
        if !self.link_up {
            debug!("{} send: link down, packet dropped", self.trace_id);
            self.stats.tx_dropped += 1;
            return false;
        }

        let ppp_proto = match ether_to_ppp(protocol) {
            Ok(proto) => proto,
            Err(_) => {
                debug!(
                    "{} send: no PPP mapping for proto {:#06x}",
                    self.trace_id, protocol
                );
                self.stats.tx_dropped += 1;
                return false;
            }
        };

        // Grab the transport view before the framing hides it.
        let headers = packet.peek_ipv4_tcp();
        if packet.add_header(&PppHeader::new(ppp_proto)).is_err() {
            self.stats.tx_dropped += 1;
            return false;
        }

        match headers {
            Ok((ipv4, tcp)) if (self.cc_gate)(self.node_id) => {
                match self
                    .cocoa
                    .classify_send(sim, self.id, &ipv4, &tcp, packet)
                {
                    SendVerdict::Held => true,
                    SendVerdict::Direct(direct) => self.enqueue_transmit(sim, direct),
                }
            }
            _ => self.enqueue_transmit(sim, packet),
        }
    }

    /// Deliver a packet from the channel.
    pub(crate) fn receive(&mut self, sim: &mut Simulator, mut packet: Packet) {
        trace!("{} receive: {} bytes", self.trace_id, packet.len());
        if let Some(model) = self.receive_error_model.as_mut() {
            if model.is_corrupt(&packet) {
                debug!("{} receive: error model dropped a packet", self.trace_id);
                self.stats.rx_dropped += 1;
                return;
            }
        }

        let ppp = match packet.remove_header::<PppHeader>() {
            Ok(ppp) => ppp,
            Err(_) => {
                debug!("{} receive: unframed packet dropped", self.trace_id);
                self.stats.rx_dropped += 1;
                return;
            }
        };
        let protocol = match ppp_to_ether(ppp.protocol) {
            Ok(proto) => proto,
            Err(_) => {
                debug!(
                    "{} receive: unknown PPP proto {:#06x}",
                    self.trace_id, ppp.protocol
                );
                self.stats.rx_dropped += 1;
                return;
            }
        };
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += packet.len() as u64;

        match packet.peek_ipv4_tcp() {
            Ok((ipv4, tcp)) if (self.cc_gate)(self.node_id) => {
                self.cocoa.on_inbound(sim, self.id, &ipv4, &tcp);
            }
            Ok((ipv4, tcp)) => {
                trace!(
                    "{} received: {}:{}->{}:{} seq={} ack={}",
                    self.trace_id,
                    ipv4.src,
                    tcp.src_port,
                    ipv4.dst,
                    tcp.dst_port,
                    tcp.seq,
                    tcp.ack
                );
            }
            Err(_) => trace!("{} received: non-TCP payload", self.trace_id),
        }

        self.rx_ready.push_back((packet, protocol));
    }

    /// Dispatch an event addressed to this device.
    pub(crate) fn handle_event(&mut self, sim: &mut Simulator, event: Event) {
        match event {
            Event::Sched { .. } => {
                self.cocoa.run_sched(&mut self.queue);
                self.try_transmit(sim);
            }
            Event::Control { fid, phase, .. } => {
                self.cocoa.apply_control(sim, self.id, fid, phase)
            }
            Event::RtoExpire { fid, cnt, .. } => {
                self.cocoa.on_rto_expire(sim, self.id, fid, cnt)
            }
            Event::TransmitComplete { .. } => self.transmit_complete(sim),
            Event::Deliver { packet, .. } => self.receive(sim, packet),
        }
    }

    /// Push a packet into the device FIFO and start transmitting right away
    /// when the channel is idle.
    fn enqueue_transmit(&mut self, sim: &mut Simulator, packet: Packet) -> bool {
        if !self.queue.enqueue(packet) {
            debug!("{} transmit queue overflow", self.trace_id);
            self.stats.tx_dropped += 1;
            return false;
        }
        if self.tx_state == TxState::Ready {
            if let Some(next) = self.queue.dequeue() {
                return self.transmit_start(sim, next);
            }
        }
        true
    }

    /// Start clocking a packet onto the wire.
    fn transmit_start(&mut self, sim: &mut Simulator, packet: Packet) -> bool {
        trace!(
            "{} transmit start: {} bytes",
            self.trace_id,
            packet.len()
        );
        if self.tx_state != TxState::Ready {
            warn!("{} transmit start while busy", self.trace_id);
            self.stats.tx_dropped += 1;
            return false;
        }
        self.tx_state = TxState::Busy;

        let tx_time = self.data_rate.bytes_tx_time(packet.len());
        sim.schedule(
            tx_time + self.interframe_gap,
            Event::TransmitComplete { dev: self.id },
        );
        sim.schedule(
            tx_time + self.channel_delay,
            Event::Deliver {
                dev: self.peer,
                packet: packet.clone(),
            },
        );
        self.current = Some(packet);
        true
    }

    /// The wire finished with the in-flight packet: account it, feed the
    /// congestion core, and pull the next packet off the FIFO.
    fn transmit_complete(&mut self, sim: &mut Simulator) {
        if self.tx_state != TxState::Busy {
            warn!("{} transmit complete while idle", self.trace_id);
            return;
        }
        self.tx_state = TxState::Ready;

        let Some(packet) = self.current.take() else {
            warn!(
                "{} transmit complete without an in-flight packet",
                self.trace_id
            );
            return;
        };
        self.stats.tx_packets += 1;
        self.stats.tx_bytes += packet.len() as u64;

        match packet.peek_framed() {
            Ok((_, ipv4, tcp)) if (self.cc_gate)(self.node_id) => {
                self.cocoa.on_transmitted(sim, self.id, &ipv4, &tcp);
            }
            Ok((_, ipv4, tcp)) => {
                trace!(
                    "{} sent: {}:{}->{}:{} seq={}",
                    self.trace_id,
                    ipv4.src,
                    tcp.src_port,
                    ipv4.dst,
                    tcp.dst_port,
                    tcp.seq
                );
            }
            Err(_) => trace!("{} sent: unparsable frame", self.trace_id),
        }

        self.try_transmit(sim);
    }

    /// Start the next FIFO packet if the transmitter is idle.
    fn try_transmit(&mut self, sim: &mut Simulator) {
        if self.tx_state == TxState::Ready {
            if let Some(packet) = self.queue.dequeue() {
                self.transmit_start(sim, packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::tcp_segment;
    use crate::packet::TcpFlag;
    use crate::packet::ETHER_PROTO_IPV4;
    use std::net::Ipv4Addr;

    #[test]
    fn data_rate_parsing() {
        let cases = [
            ("32768b/s", 32768u64),
            ("1000kb/s", 1_000_000),
            ("10Mb/s", 10_000_000),
            ("1Gb/s", 1_000_000_000),
        ];
        for (text, expected) in cases {
            assert_eq!(DataRate::from_str(text).map(|r| r.bps()), Ok(expected));
        }

        assert!(matches!(
            DataRate::from_str("fast"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            DataRate::from_str("tenMb/s"),
            Err(Error::InvalidConfig(_))
        ));

        assert_eq!(format!("{}", DataRate::default()), "32768b/s");
    }

    #[test]
    fn data_rate_tx_time() {
        let rate = DataRate::from_bps(8_000_000);
        assert_eq!(rate.bytes_tx_time(1000), Duration::from_millis(1));
        assert_eq!(DataRate::from_bps(0).bytes_tx_time(1000), Duration::ZERO);
    }

    #[test]
    fn drop_tail_queue_bounds() {
        let mut queue = DropTailQueue::new(2);
        assert!(queue.is_empty());
        assert!(queue.enqueue(Packet::new(1)));
        assert!(queue.enqueue(Packet::new(2)));
        assert!(queue.is_full());

        assert!(!queue.enqueue(Packet::new(3)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().map(|p| p.len()), Some(1));
        assert_eq!(queue.dequeue().map(|p| p.len()), Some(2));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn rate_error_model_extremes() {
        let mut never = RateErrorModel::with_seed(0.0, 7);
        let mut always = RateErrorModel::with_seed(1.0, 7);
        let packet = Packet::new(100);
        for _ in 0..100 {
            assert!(!never.is_corrupt(&packet));
            assert!(always.is_corrupt(&packet));
        }
    }

    #[test]
    fn send_fails_when_link_down() {
        let mut sim = Simulator::new();
        let mut device = Device::new(2, &Config::new());
        let packet = tcp_segment(
            Ipv4Addr::new(10, 1, 1, 1),
            49153,
            Ipv4Addr::new(10, 1, 1, 2),
            80,
            1000,
            0,
            TcpFlag::Syn.into(),
            0,
        );

        assert!(!device.send(&mut sim, packet, MacAddr::BROADCAST, ETHER_PROTO_IPV4));
        assert_eq!(device.stats().tx_dropped, 1);
        assert!(sim.is_idle());
    }

    #[test]
    fn unknown_protocol_is_refused() {
        let mut sim = Simulator::new();
        let mut device = Device::new(2, &Config::new());
        device.attach(0, 1, Duration::ZERO);

        assert!(!device.send(
            &mut sim,
            Packet::new(64),
            MacAddr::BROADCAST,
            0x0806
        ));
        assert_eq!(device.stats().tx_dropped, 1);
    }

    #[test]
    fn gated_off_devices_bypass_the_core() {
        let mut sim = Simulator::new();
        // Node 1 fails the endpoint gate: data flows straight through.
        let mut device = Device::new(1, &Config::new());
        device.attach(0, 1, Duration::ZERO);

        let data = tcp_segment(
            Ipv4Addr::new(10, 1, 1, 1),
            49153,
            Ipv4Addr::new(10, 1, 1, 2),
            80,
            1001,
            2001,
            TcpFlag::Ack.into(),
            1460,
        );
        assert!(device.send(&mut sim, data, MacAddr::BROADCAST, ETHER_PROTO_IPV4));

        // No flow state was created and the packet went to the wire.
        assert_eq!(device.pending_segments(), 0);
        assert!(device.current.is_some());
        assert!(!sim.is_idle());
    }

    #[test]
    fn receive_strips_framing() {
        let mut sim = Simulator::new();
        let mut device = Device::new(2, &Config::new());
        device.attach(0, 1, Duration::ZERO);

        let mut framed = tcp_segment(
            Ipv4Addr::new(10, 1, 1, 2),
            80,
            Ipv4Addr::new(10, 1, 1, 1),
            49153,
            2000,
            1001,
            TcpFlag::Syn | TcpFlag::Ack,
            0,
        );
        framed
            .add_header(&PppHeader::new(crate::packet::PPP_PROTO_IPV4))
            .unwrap();

        device.receive(&mut sim, framed);
        let (packet, protocol) = device.poll_received().unwrap();
        assert_eq!(protocol, ETHER_PROTO_IPV4);
        assert!(packet.peek_ipv4_tcp().is_ok());
        assert_eq!(device.stats().rx_packets, 1);
    }

    #[test]
    fn error_model_drops_on_receive() {
        let mut sim = Simulator::new();
        let mut device = Device::new(2, &Config::new());
        device.attach(0, 1, Duration::ZERO);
        device.set_receive_error_model(Box::new(RateErrorModel::with_seed(1.0, 11)));

        let mut framed = Packet::new(40);
        framed
            .add_header(&PppHeader::new(crate::packet::PPP_PROTO_IPV4))
            .unwrap();
        device.receive(&mut sim, framed);

        assert!(device.poll_received().is_none());
        assert_eq!(device.stats().rx_dropped, 1);
        assert_eq!(device.stats().rx_packets, 0);
    }
}
