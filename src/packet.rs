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

//! Packet buffer and the PPP/IPv4/TCP header codecs used by the device
//! model. Checksums are carried but never validated; the simulated channel
//! does not corrupt bytes, it drops whole packets.

use std::fmt;
use std::net::Ipv4Addr;

use enumflags2::bitflags;
use enumflags2::BitFlags;

use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::error::Error;
use crate::Result;

/// PPP protocol number for IPv4 payloads.
pub const PPP_PROTO_IPV4: u16 = 0x0021;

/// PPP protocol number for IPv6 payloads.
pub const PPP_PROTO_IPV6: u16 = 0x0057;

/// EtherType for IPv4.
pub const ETHER_PROTO_IPV4: u16 = 0x0800;

/// EtherType for IPv6.
pub const ETHER_PROTO_IPV6: u16 = 0x86DD;

/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;

/// Map an EtherType to the PPP protocol number used on the link.
pub fn ether_to_ppp(proto: u16) -> Result<u16> {
    match proto {
        ETHER_PROTO_IPV4 => Ok(PPP_PROTO_IPV4),
        ETHER_PROTO_IPV6 => Ok(PPP_PROTO_IPV6),
        _ => Err(Error::UnknownProtocol(proto)),
    }
}

/// Map a PPP protocol number back to its EtherType.
pub fn ppp_to_ether(proto: u16) -> Result<u16> {
    match proto {
        PPP_PROTO_IPV4 => Ok(ETHER_PROTO_IPV4),
        PPP_PROTO_IPV6 => Ok(ETHER_PROTO_IPV6),
        _ => Err(Error::UnknownProtocol(proto)),
    }
}

/// A header that can be pushed onto or parsed off the front of a packet.
pub trait Header: Sized {
    /// Encoded size of the header on the wire.
    fn wire_len(&self) -> usize;

    /// Encode the header into the given buffer.
    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize>;

    /// Decode a header from the front of the given buffer, returning the
    /// header and the number of bytes it occupies.
    fn from_bytes(buf: &[u8]) -> Result<(Self, usize)>;
}

/// An owned packet buffer.
///
/// Headers are stacked at the front in layer order, innermost last, exactly
/// as they travel on the wire. `clone` yields the snapshot copy handed to
/// the channel while the device keeps the in-flight reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Create a packet with a zero-filled payload of the given size.
    pub fn new(payload_size: usize) -> Self {
        Packet {
            buf: vec![0; payload_size],
        }
    }

    /// Total size of the packet in bytes, headers included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Return true if the packet carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Raw wire bytes of the packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Prepend a header to the packet.
    pub fn add_header<H: Header>(&mut self, header: &H) -> Result<()> {
        let mut hdr = vec![0; header.wire_len()];
        header.to_bytes(&mut hdr)?;
        self.buf.splice(0..0, hdr);
        Ok(())
    }

    /// Parse and strip the header at the front of the packet.
    pub fn remove_header<H: Header>(&mut self) -> Result<H> {
        let (header, len) = H::from_bytes(&self.buf)?;
        self.buf.drain(0..len);
        Ok(header)
    }

    /// Parse the header at the front of the packet without consuming it.
    pub fn peek_header<H: Header>(&self) -> Result<H> {
        H::from_bytes(&self.buf).map(|(header, _)| header)
    }

    /// Parse the PPP, IPv4 and TCP headers at the front of a framed packet
    /// without consuming them.
    pub fn peek_framed(&self) -> Result<(PppHeader, Ipv4Header, TcpHeader)> {
        let buf = self.buf.as_slice();
        let (ppp, n) = PppHeader::from_bytes(buf)?;
        let (ipv4, m) = Ipv4Header::from_bytes(&buf[n..])?;
        let (tcp, _) = TcpHeader::from_bytes(&buf[n + m..])?;
        Ok((ppp, ipv4, tcp))
    }

    /// Parse the IPv4 and TCP headers at the front of an unframed packet
    /// without consuming them.
    pub fn peek_ipv4_tcp(&self) -> Result<(Ipv4Header, TcpHeader)> {
        let buf = self.buf.as_slice();
        let (ipv4, n) = Ipv4Header::from_bytes(buf)?;
        let (tcp, _) = TcpHeader::from_bytes(&buf[n..])?;
        Ok((ipv4, tcp))
    }
}

/// Point-to-point framing header.
///
/// PPP Frame {
///   Protocol (16),
///   Information (..),
/// }
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PppHeader {
    /// The PPP protocol number of the encapsulated payload.
    pub protocol: u16,
}

impl PppHeader {
    /// Create a PPP header for the given PPP protocol number.
    pub fn new(protocol: u16) -> Self {
        PppHeader { protocol }
    }
}

impl Header for PppHeader {
    fn wire_len(&self) -> usize {
        2
    }

    fn to_bytes(&self, mut buf: &mut [u8]) -> Result<usize> {
        buf.write_u16(self.protocol)
    }

    fn from_bytes(mut buf: &[u8]) -> Result<(Self, usize)> {
        let protocol = buf.read_u16()?;
        Ok((PppHeader { protocol }, 2))
    }
}

/// IPv4 header.
///
/// Internet Header {
///   Version (4) = 4,
///   IHL (4),
///   Type of Service (8),
///   Total Length (16),
///   Identification (16),
///   Flags (3) / Fragment Offset (13),
///   Time to Live (8),
///   Protocol (8),
///   Header Checksum (16),
///   Source Address (32),
///   Destination Address (32),
///   Options (..),
/// }
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Identification field, used only for flow tracing.
    pub identification: u16,

    /// Time to live.
    pub ttl: u8,

    /// Protocol number of the payload (6 for TCP).
    pub protocol: u8,

    /// Length of the payload behind this header in bytes.
    pub payload_len: u16,

    /// Source address.
    pub src: Ipv4Addr,

    /// Destination address.
    pub dst: Ipv4Addr,
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Ipv4Header {
            identification: 0,
            ttl: 64,
            protocol: IP_PROTO_TCP,
            payload_len: 0,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Header for Ipv4Header {
    fn wire_len(&self) -> usize {
        20
    }

    fn to_bytes(&self, mut buf: &mut [u8]) -> Result<usize> {
        // Version 4, IHL 5, no options.
        buf.write_u8(0x45)?;
        // Type of service.
        buf.write_u8(0)?;
        buf.write_u16(self.payload_len.wrapping_add(20))?;
        buf.write_u16(self.identification)?;
        // Flags and fragment offset.
        buf.write_u16(0)?;
        buf.write_u8(self.ttl)?;
        buf.write_u8(self.protocol)?;
        // Checksum, not computed in simulation.
        buf.write_u16(0)?;
        buf.write_ipv4_addr(&self.src)?;
        buf.write_ipv4_addr(&self.dst)?;
        Ok(20)
    }

    fn from_bytes(mut buf: &[u8]) -> Result<(Self, usize)> {
        let ver_ihl = buf.read_u8()?;
        if ver_ihl >> 4 != 4 {
            return Err(Error::InvalidPacket);
        }
        let header_len = ((ver_ihl & 0x0f) as usize) * 4;
        if header_len < 20 {
            return Err(Error::InvalidPacket);
        }
        buf.skip(1)?;
        let total_len = buf.read_u16()?;
        if (total_len as usize) < header_len {
            return Err(Error::InvalidPacket);
        }
        let identification = buf.read_u16()?;
        buf.skip(2)?;
        let ttl = buf.read_u8()?;
        let protocol = buf.read_u8()?;
        buf.skip(2)?;
        let src = buf.read_ipv4_addr()?;
        let dst = buf.read_ipv4_addr()?;
        buf.skip(header_len - 20)?;

        Ok((
            Ipv4Header {
                identification,
                ttl,
                protocol,
                payload_len: total_len - header_len as u16,
                src,
                dst,
            },
            header_len,
        ))
    }
}

/// TCP control bits.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpFlag {
    /// No more data from sender.
    Fin = 0x01,

    /// Synchronize sequence numbers.
    Syn = 0x02,

    /// Reset the connection.
    Rst = 0x04,

    /// Push function.
    Psh = 0x08,

    /// Acknowledgment field is significant.
    Ack = 0x10,

    /// Urgent pointer field is significant.
    Urg = 0x20,
}

/// TCP header.
///
/// TCP Header {
///   Source Port (16),
///   Destination Port (16),
///   Sequence Number (32),
///   Acknowledgment Number (32),
///   Data Offset (4),
///   Reserved (4),
///   Control Bits (8),
///   Window (16),
///   Checksum (16),
///   Urgent Pointer (16),
///   Options (..),
/// }
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,

    /// Destination port.
    pub dst_port: u16,

    /// Sequence number.
    pub seq: u32,

    /// Acknowledgment number.
    pub ack: u32,

    /// Header length in 32-bit words.
    pub data_offset: u8,

    /// Control bits.
    pub flags: BitFlags<TcpFlag>,

    /// Receive window.
    pub window: u16,
}

impl Default for TcpHeader {
    fn default() -> Self {
        TcpHeader {
            src_port: 0,
            dst_port: 0,
            seq: 0,
            ack: 0,
            data_offset: 5,
            flags: BitFlags::empty(),
            window: 65535,
        }
    }
}

impl TcpHeader {
    /// Header length in bytes.
    pub fn header_len(&self) -> u16 {
        self.data_offset as u16 * 4
    }

    /// True when the control bits are exactly a SYN.
    pub fn is_pure_syn(&self) -> bool {
        self.flags == BitFlags::from(TcpFlag::Syn)
    }

    /// True when the control bits are exactly SYN plus ACK.
    pub fn is_syn_ack(&self) -> bool {
        self.flags == TcpFlag::Syn | TcpFlag::Ack
    }

    /// True when the control bits are exactly an ACK.
    pub fn is_pure_ack(&self) -> bool {
        self.flags == BitFlags::from(TcpFlag::Ack)
    }

    /// True when the ACK bit is set, whatever else is.
    pub fn has_ack(&self) -> bool {
        self.flags.contains(TcpFlag::Ack)
    }

    /// True when the FIN bit is set, whatever else is.
    pub fn has_fin(&self) -> bool {
        self.flags.contains(TcpFlag::Fin)
    }
}

impl Header for TcpHeader {
    fn wire_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    fn to_bytes(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.data_offset < 5 {
            return Err(Error::InvalidPacket);
        }
        buf.write_u16(self.src_port)?;
        buf.write_u16(self.dst_port)?;
        buf.write_u32(self.seq)?;
        buf.write_u32(self.ack)?;
        buf.write_u8(self.data_offset << 4)?;
        buf.write_u8(self.flags.bits())?;
        buf.write_u16(self.window)?;
        // Checksum and urgent pointer, not computed in simulation.
        buf.write_u16(0)?;
        buf.write_u16(0)?;
        // Options are carried as zero padding.
        buf.write(&vec![0; (self.data_offset as usize - 5) * 4])?;
        Ok(self.data_offset as usize * 4)
    }

    fn from_bytes(mut buf: &[u8]) -> Result<(Self, usize)> {
        let src_port = buf.read_u16()?;
        let dst_port = buf.read_u16()?;
        let seq = buf.read_u32()?;
        let ack = buf.read_u32()?;
        let data_offset = buf.read_u8()? >> 4;
        if data_offset < 5 {
            return Err(Error::InvalidPacket);
        }
        let flags = BitFlags::from_bits_truncate(buf.read_u8()?);
        let window = buf.read_u16()?;
        buf.skip(4)?;
        buf.skip((data_offset as usize - 5) * 4)?;

        Ok((
            TcpHeader {
                src_port,
                dst_port,
                seq,
                ack,
                data_offset,
                flags,
                window,
            },
            data_offset as usize * 4,
        ))
    }
}

/// TCP payload length carried by a segment: the IPv4 payload minus the TCP
/// header itself.
pub fn tcp_payload_len(ipv4: &Ipv4Header, tcp: &TcpHeader) -> u16 {
    ipv4.payload_len.saturating_sub(tcp.header_len())
}

/// 48-bit MAC address of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

impl Default for MacAddr {
    fn default() -> Self {
        MacAddr::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tcp_segment(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: BitFlags<TcpFlag>,
        payload: u16,
    ) -> Packet {
        let tcp = TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            ..TcpHeader::default()
        };
        let ipv4 = Ipv4Header {
            payload_len: payload + tcp.header_len(),
            src,
            dst,
            ..Ipv4Header::default()
        };
        let mut packet = Packet::new(payload as usize);
        packet.add_header(&tcp).unwrap();
        packet.add_header(&ipv4).unwrap();
        packet
    }

    #[test]
    fn ppp_protocol_mapping() {
        let cases = [
            (ETHER_PROTO_IPV4, Ok(PPP_PROTO_IPV4)),
            (ETHER_PROTO_IPV6, Ok(PPP_PROTO_IPV6)),
            (0x0806, Err(Error::UnknownProtocol(0x0806))),
        ];
        for (ether, ppp) in cases {
            assert_eq!(ether_to_ppp(ether), ppp);
            if let Ok(p) = ppp {
                assert_eq!(ppp_to_ether(p), Ok(ether));
            }
        }
        assert_eq!(ppp_to_ether(0x0042), Err(Error::UnknownProtocol(0x0042)));
    }

    #[test]
    fn header_stack_roundtrip() -> crate::Result<()> {
        let src = Ipv4Addr::new(10, 1, 1, 1);
        let dst = Ipv4Addr::new(10, 1, 1, 2);
        let mut packet = tcp_segment(src, 49153, dst, 80, 1001, 0, TcpFlag::Syn.into(), 0);
        packet.add_header(&PppHeader::new(PPP_PROTO_IPV4))?;

        assert_eq!(packet.len(), 2 + 20 + 20);

        let (ppp, ipv4, tcp) = packet.peek_framed()?;
        assert_eq!(ppp.protocol, PPP_PROTO_IPV4);
        assert_eq!(ipv4.src, src);
        assert_eq!(ipv4.dst, dst);
        assert_eq!(ipv4.protocol, IP_PROTO_TCP);
        assert_eq!(tcp.seq, 1001);
        assert!(tcp.is_pure_syn());
        assert_eq!(tcp_payload_len(&ipv4, &tcp), 0);

        // Stripping the framing exposes the same IPv4/TCP view.
        let ppp = packet.remove_header::<PppHeader>()?;
        assert_eq!(ppp.protocol, PPP_PROTO_IPV4);
        let (ipv4, tcp) = packet.peek_ipv4_tcp()?;
        assert_eq!(ipv4.dst, dst);
        assert_eq!(tcp.src_port, 49153);
        Ok(())
    }

    #[test]
    fn data_segment_payload() -> crate::Result<()> {
        let src = Ipv4Addr::new(10, 1, 1, 1);
        let dst = Ipv4Addr::new(10, 1, 1, 2);
        let packet = tcp_segment(src, 49153, dst, 80, 2461, 1, TcpFlag::Ack.into(), 1460);

        let (ipv4, tcp) = packet.peek_ipv4_tcp()?;
        assert_eq!(ipv4.payload_len, 1480);
        assert_eq!(tcp_payload_len(&ipv4, &tcp), 1460);
        assert_eq!(packet.len(), 20 + 20 + 1460);
        Ok(())
    }

    #[test]
    fn malformed_headers() {
        // Truncated buffer: a valid version nibble but nothing behind it.
        assert_eq!(
            Ipv4Header::from_bytes(&[0x45, 0, 0]).unwrap_err(),
            Error::BufferTooShort
        );

        // Wrong IP version.
        let mut packet = Packet::new(1460);
        packet.add_header(&TcpHeader::default()).unwrap();
        packet.add_header(&Ipv4Header::default()).unwrap();
        let mut raw = packet.as_bytes().to_vec();
        raw[0] = 0x65;
        let bad = Packet { buf: raw };
        assert_eq!(
            bad.peek_header::<Ipv4Header>().unwrap_err(),
            Error::InvalidPacket
        );

        // Bogus TCP data offset.
        let mut raw = vec![0u8; 20];
        raw[12] = 0x20;
        assert_eq!(
            TcpHeader::from_bytes(&raw).unwrap_err(),
            Error::InvalidPacket
        );
    }

    #[test]
    fn exact_flag_masks() {
        let mut tcp = TcpHeader {
            flags: TcpFlag::Syn.into(),
            ..TcpHeader::default()
        };
        assert!(tcp.is_pure_syn());
        assert!(!tcp.is_syn_ack());
        assert!(!tcp.has_ack());

        tcp.flags = TcpFlag::Syn | TcpFlag::Ack;
        assert!(!tcp.is_pure_syn());
        assert!(tcp.is_syn_ack());
        assert!(tcp.has_ack());
        assert!(!tcp.is_pure_ack());

        tcp.flags = TcpFlag::Ack.into();
        assert!(tcp.is_pure_ack());

        // A stray bit defeats the exact masks but not the bit tests.
        tcp.flags = TcpFlag::Ack | TcpFlag::Fin;
        assert!(!tcp.is_pure_ack());
        assert!(tcp.has_ack());
        assert!(tcp.has_fin());

        // Reserved bits are ignored on parse.
        let flags = BitFlags::<TcpFlag>::from_bits_truncate(0xc2u8);
        assert_eq!(flags, BitFlags::from(TcpFlag::Syn));
    }

    #[test]
    fn mac_addr_display() {
        assert_eq!(format!("{}", MacAddr::default()), "ff:ff:ff:ff:ff:ff");
        let addr = MacAddr([0, 1, 2, 3, 4, 5]);
        assert_eq!(format!("{}", addr), "00:01:02:03:04:05");
    }
}
