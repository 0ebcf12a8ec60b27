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

//! The point-to-point link: two attached devices, a propagation delay, and
//! the event loop driving the virtual clock.

use std::time::Duration;

use log::*;

use crate::device::Device;
use crate::packet::MacAddr;
use crate::packet::Packet;
use crate::simulator::DeviceId;
use crate::simulator::Event;
use crate::simulator::Simulator;

/// Two devices wired back to back through a delayed channel.
pub struct Link {
    sim: Simulator,
    devices: [Device; 2],
}

impl Link {
    /// Attach two devices to the ends of a link with the given propagation
    /// delay. Both devices come up immediately.
    pub fn new(mut first: Device, mut second: Device, delay: Duration) -> Self {
        first.attach(0, 1, delay);
        second.attach(1, 0, delay);
        Link {
            sim: Simulator::new(),
            devices: [first, second],
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.sim.now()
    }

    /// One end of the link.
    pub fn device(&self, dev: DeviceId) -> &Device {
        &self.devices[dev]
    }

    /// Mutable access to one end of the link.
    pub fn device_mut(&mut self, dev: DeviceId) -> &mut Device {
        &mut self.devices[dev]
    }

    /// Hand an upper-layer packet to one end for transmission.
    pub fn send(&mut self, dev: DeviceId, packet: Packet, dest: MacAddr, protocol: u16) -> bool {
        let Link { sim, devices } = self;
        match devices.get_mut(dev) {
            Some(device) => device.send(sim, packet, dest, protocol),
            None => {
                warn!("link: send for unknown device {}", dev);
                false
            }
        }
    }

    /// Run until no events remain.
    pub fn run(&mut self) {
        while let Some((_, event)) = self.sim.pop_next() {
            self.dispatch(event);
        }
    }

    /// Run every event due up to `until` and leave the clock there.
    pub fn run_until(&mut self, until: Duration) {
        while self.sim.next_deadline().is_some_and(|d| d <= until) {
            if let Some((_, event)) = self.sim.pop_next() {
                self.dispatch(event);
            }
        }
        self.sim.advance_to(until);
    }

    fn dispatch(&mut self, event: Event) {
        let dev = event.device();
        if dev >= self.devices.len() {
            warn!("link: event for unknown device {}", dev);
            return;
        }
        let Link { sim, devices } = self;
        devices[dev].handle_event(sim, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cocoa::flow::FlowId;
    use crate::cocoa::flow::HandshakePhase;
    use crate::cocoa::flow::TcpPhase;
    use crate::cocoa::reno::CcPhase;
    use crate::device::DataRate;
    use crate::packet::tcp_payload_len;
    use crate::packet::tests::tcp_segment;
    use crate::packet::TcpFlag;
    use crate::packet::ETHER_PROTO_IPV4;
    use crate::packet::IP_PROTO_TCP;
    use crate::Config;
    use enumflags2::BitFlags;
    use std::net::Ipv4Addr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 2);
    const CLIENT_PORT: u16 = 49153;
    const SERVER_PORT: u16 = 80;

    fn endpoint_link() -> Link {
        let mut config = Config::new();
        config.set_data_rate(DataRate::from_bps(10_000_000));
        let client = Device::new(2, &config);
        let server = Device::new(3, &config);
        Link::new(client, server, Duration::from_micros(500))
    }

    fn client_flow() -> FlowId {
        FlowId {
            local_addr: CLIENT,
            local_port: CLIENT_PORT,
            remote_addr: SERVER,
            remote_port: SERVER_PORT,
            protocol: IP_PROTO_TCP,
        }
    }

    fn server_flow() -> FlowId {
        FlowId {
            local_addr: SERVER,
            local_port: SERVER_PORT,
            remote_addr: CLIENT,
            remote_port: CLIENT_PORT,
            protocol: IP_PROTO_TCP,
        }
    }

    fn seg_to_server(seq: u32, ack: u32, flags: BitFlags<TcpFlag>, payload: u16) -> Packet {
        tcp_segment(CLIENT, CLIENT_PORT, SERVER, SERVER_PORT, seq, ack, flags, payload)
    }

    fn seg_to_client(seq: u32, ack: u32, flags: BitFlags<TcpFlag>, payload: u16) -> Packet {
        tcp_segment(SERVER, SERVER_PORT, CLIENT, CLIENT_PORT, seq, ack, flags, payload)
    }

    fn send(link: &mut Link, dev: DeviceId, packet: Packet) -> bool {
        link.send(dev, packet, MacAddr::BROADCAST, ETHER_PROTO_IPV4)
    }

    /// Let in-flight transmissions and deliveries finish without reaching
    /// the retransmission timers, which sit hundreds of milliseconds out.
    fn settle(link: &mut Link) {
        let horizon = link.now() + Duration::from_millis(50);
        link.run_until(horizon);
    }

    /// Drive the three-way handshake to completion on both ends.
    fn handshake(link: &mut Link) {
        assert!(send(link, 0, seg_to_server(1000, 0, TcpFlag::Syn.into(), 0)));
        settle(link);
        assert!(send(link, 1, seg_to_client(2000, 1001, TcpFlag::Syn | TcpFlag::Ack, 0)));
        settle(link);
        assert!(send(link, 0, seg_to_server(1001, 2001, TcpFlag::Ack.into(), 0)));
        settle(link);
    }

    /// Count delivered packets carrying TCP payload.
    fn drain_data_packets(device: &mut Device) -> usize {
        let mut count = 0;
        while let Some((packet, _)) = device.poll_received() {
            if let Ok((ipv4, tcp)) = packet.peek_ipv4_tcp() {
                if tcp_payload_len(&ipv4, &tcp) > 0 {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn clean_handshake_brings_both_sides_to_data() {
        let mut link = endpoint_link();
        handshake(&mut link);

        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.tcp_phase, TcpPhase::Data);
        assert_eq!(client.handshake_phase, HandshakePhase::Ack);
        assert!(client.initiator);
        assert_eq!(client.init_seq, 1000);
        assert_eq!(client.cm_start, 1001);
        assert_eq!(client.cm_window, 1.0);
        assert_eq!(client.cc_phase, CcPhase::Start);

        let server = link.device(1).flow(&server_flow()).unwrap();
        assert_eq!(server.tcp_phase, TcpPhase::Data);
        assert_eq!(server.handshake_phase, HandshakePhase::Ack);
        assert!(!server.initiator);
        assert_eq!(server.init_seq, 2000);
        assert_eq!(server.cm_start, 2001);
        assert_eq!(server.cm_window, 1.0);
        assert_eq!(server.cc_phase, CcPhase::Start);

        // Handshake packets bypassed the admission stage on both ends.
        assert_eq!(link.device(0).pending_segments(), 0);
        assert_eq!(link.device(1).pending_segments(), 0);
    }

    #[test]
    fn slow_start_ramp_admits_one_segment_per_new_ack() {
        let mut link = endpoint_link();
        handshake(&mut link);

        // Four back-to-back data segments; a one-segment window admits only
        // the first.
        for seq in [1001u32, 2461, 3921, 5381] {
            assert!(send(&mut link, 0, seg_to_server(seq, 2001, TcpFlag::Ack.into(), 1460)));
        }
        settle(&mut link);

        assert_eq!(link.device(0).pending_segments(), 3);
        assert!(!link.device(0).admission_idle());
        assert_eq!(drain_data_packets(link.device_mut(1)), 1);

        // The cumulative ACK for the first segment doubles the window and
        // releases the next two.
        assert!(send(&mut link, 1, seg_to_client(2001, 2461, TcpFlag::Ack.into(), 0)));
        settle(&mut link);

        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.cc_phase, CcPhase::SlowStart);
        assert_eq!(client.cm_window, 2.0);
        assert_eq!(client.cm_start, 2461);
        assert_eq!(link.device(0).pending_segments(), 1);
        assert_eq!(drain_data_packets(link.device_mut(1)), 2);

        // Next ACK: window three, the tail segment drains.
        assert!(send(&mut link, 1, seg_to_client(2001, 3921, TcpFlag::Ack.into(), 0)));
        settle(&mut link);

        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.cm_window, 3.0);
        assert_eq!(link.device(0).pending_segments(), 0);
        assert!(link.device(0).admission_idle());
        assert_eq!(drain_data_packets(link.device_mut(1)), 1);
    }

    #[test]
    fn receiver_acks_flip_its_own_flow_to_tear_down() {
        let mut link = endpoint_link();
        handshake(&mut link);

        assert!(send(&mut link, 0, seg_to_server(1001, 2001, TcpFlag::Ack.into(), 1460)));
        settle(&mut link);
        assert!(send(&mut link, 1, seg_to_client(2001, 2461, TcpFlag::Ack.into(), 0)));
        settle(&mut link);

        // A payload-less non-FIN packet in the data phase reads as the
        // start of connection shutdown on the sender's own flow.
        let server = link.device(1).flow(&server_flow()).unwrap();
        assert_eq!(server.tcp_phase, TcpPhase::TearDown);

        // The client side keeps exchanging data regardless.
        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.tcp_phase, TcpPhase::Data);
        assert_eq!(client.cm_start, 2461);
    }

    #[test]
    fn fin_passes_straight_through() {
        let mut link = endpoint_link();
        handshake(&mut link);

        assert!(send(
            &mut link,
            0,
            seg_to_server(1001, 2001, TcpFlag::Fin | TcpFlag::Ack, 0)
        ));
        settle(&mut link);

        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.tcp_phase, TcpPhase::Data);
        assert_eq!(link.device(0).pending_segments(), 0);
        assert_eq!(link.device(1).stats().rx_packets, 3);
    }

    #[test]
    fn stale_rto_is_skipped_and_live_one_resets() {
        let mut link = endpoint_link();
        handshake(&mut link);
        let handshake_done = link.now();

        // One data segment; the timer armed during the handshake is still
        // pending.
        link.run_until(handshake_done + Duration::from_millis(100));
        assert!(send(&mut link, 0, seg_to_server(1001, 2001, TcpFlag::Ack.into(), 1460)));
        link.run_until(handshake_done + Duration::from_millis(200));

        // The ACK rearms the timer with a fresh generation.
        assert!(send(&mut link, 1, seg_to_client(2001, 2461, TcpFlag::Ack.into(), 0)));
        link.run_until(handshake_done + Duration::from_millis(300));

        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.cc_phase, CcPhase::SlowStart);
        assert_eq!(client.cm_window, 2.0);
        let live_generation = client.rto_count;
        assert!(client.rto_armed);

        // The stale generation fires first and must change nothing.
        link.run_until(handshake_done + Duration::from_millis(600));
        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.cc_phase, CcPhase::SlowStart);
        assert_eq!(client.cm_window, 2.0);
        assert!(client.rto_armed);
        assert_eq!(client.rto_count, live_generation);

        // The live generation fires with no ACK in sight: back to START.
        link.run_until(handshake_done + Duration::from_millis(900));
        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.cc_phase, CcPhase::Start);
        assert_eq!(client.cm_window, 1.0);
        assert_eq!(client.cc_ss_threshold, 65536.0);
        assert!(!client.rto_armed);
        assert!(client.rto_val);
        assert_eq!(client.cc_recovery_seq, 2461);
    }

    #[test]
    fn two_flows_share_the_device() {
        let mut link = endpoint_link();
        handshake(&mut link);

        // A second connection from another client port.
        assert!(send(
            &mut link,
            0,
            tcp_segment(CLIENT, 49154, SERVER, SERVER_PORT, 7000, 0, TcpFlag::Syn.into(), 0)
        ));
        settle(&mut link);
        assert!(send(
            &mut link,
            1,
            tcp_segment(SERVER, SERVER_PORT, CLIENT, 49154, 9000, 7001, TcpFlag::Syn | TcpFlag::Ack, 0)
        ));
        settle(&mut link);
        assert!(send(
            &mut link,
            0,
            tcp_segment(CLIENT, 49154, SERVER, SERVER_PORT, 7001, 9001, TcpFlag::Ack.into(), 0)
        ));
        settle(&mut link);

        // One in-window segment per flow; both drain through the FIFO.
        assert!(send(&mut link, 0, seg_to_server(1001, 2001, TcpFlag::Ack.into(), 1460)));
        assert!(send(
            &mut link,
            0,
            tcp_segment(CLIENT, 49154, SERVER, SERVER_PORT, 7001, 9001, TcpFlag::Ack.into(), 1460)
        ));
        settle(&mut link);

        assert_eq!(link.device(0).pending_segments(), 0);
        assert_eq!(drain_data_packets(link.device_mut(1)), 2);

        let second = FlowId {
            local_addr: CLIENT,
            local_port: 49154,
            remote_addr: SERVER,
            remote_port: SERVER_PORT,
            protocol: IP_PROTO_TCP,
        };
        assert_eq!(
            link.device(0).flow(&second).unwrap().cm_start,
            7001
        );
    }

    #[test]
    fn non_endpoint_nodes_forward_without_tracking() {
        let mut config = Config::new();
        config.set_data_rate(DataRate::from_bps(10_000_000));
        let left = Device::new(0, &config);
        let right = Device::new(1, &config);
        let mut link = Link::new(left, right, Duration::from_micros(500));

        assert!(send(&mut link, 0, seg_to_server(1001, 0, TcpFlag::Ack.into(), 1460)));
        settle(&mut link);

        // No flow state on either side; the data arrived anyway.
        assert!(link.device(0).flow(&client_flow()).is_none());
        assert!(link.device(1).flow(&server_flow()).is_none());
        assert_eq!(drain_data_packets(link.device_mut(1)), 1);
    }

    #[test]
    fn control_latency_is_configurable_per_device() {
        let mut link = endpoint_link();
        link.device_mut(0).set_cc_latency(250);
        assert_eq!(link.device(0).cc_latency(), 250);
        handshake(&mut link);

        assert!(send(&mut link, 0, seg_to_server(1001, 2001, TcpFlag::Ack.into(), 1460)));
        settle(&mut link);
        assert!(send(&mut link, 1, seg_to_client(2001, 2461, TcpFlag::Ack.into(), 0)));
        settle(&mut link);

        // The deferred engine still lands: window grew after the latency.
        let client = link.device(0).flow(&client_flow()).unwrap();
        assert_eq!(client.cc_phase, CcPhase::SlowStart);
        assert_eq!(client.cm_window, 2.0);
    }
}
