//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Wire codecs: the VRRPv3 advertisement (RFC 5798 §5.1), and the ARP
//! request/reply and bare Ethernet header used by the ARP impersonator (C6).
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-------+-------+---------------+-------------------------------+
//! |Ver=3|T=1|     VRID      |   Priority    |  Address Count      |
//! +-------+-------+---------------+-------------------------------+
//! |  rsvd(4)  |  Max Adv Interval (12 bits, centiseconds)  |
//! +-------------------------------+-------------------------------+
//! |         Checksum (one's complement, pseudo-header + payload)  |
//! +---------------------------------------------------------------+
//! |  IPvX Address 1 ... IPvX Address N                            |
//! +---------------------------------------------------------------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::consts::VRRP_MIN_PKT_LENGTH;
use crate::ip::AddressFamily;
use crate::mac_addr::MacAddr;

pub type DecodeResult<T> = Result<T, DecodeError>;

/// A decoded VRRPv3 advertisement.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct VrrpPacket {
    pub version: u8,
    pub hdr_type: u8,
    pub vrid: u8,
    pub priority: u8,
    pub count_ip: u8,
    pub max_adv_interval: u16,
    pub checksum: u16,
    pub addresses: Vec<IpAddr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    /// Total VRRP payload length was below the 8-byte fixed header.
    PacketTooShort(usize),
    /// The embedded address count did not match the payload's actual
    /// trailing byte count for the given family.
    AddressCountMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::PacketTooShort(len) => {
                write!(f, "VRRP packet too short ({len} bytes)")
            }
            DecodeError::AddressCountMismatch { expected, actual } => {
                write!(
                    f,
                    "VRRP address count mismatch (expected {expected} bytes of addresses, got {actual})"
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl VrrpPacket {
    /// Builds an advertisement for sending. `checksum` is left at zero; the
    /// caller (network.rs) fills it in once the pseudo-header's source
    /// address is known.
    pub fn new(
        vrid: u8,
        priority: u8,
        max_adv_interval: u16,
        addresses: Vec<IpAddr>,
    ) -> Self {
        VrrpPacket {
            version: 3,
            hdr_type: 1,
            vrid,
            priority,
            count_ip: addresses.len() as u8,
            max_adv_interval,
            checksum: 0,
            addresses,
        }
    }

    /// Encodes the packet into a byte buffer, network byte order throughout.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            VRRP_MIN_PKT_LENGTH + self.addresses.len() * 16,
        );
        buf.put_u8((self.version << 4) | (self.hdr_type & 0x0f));
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_ip);
        buf.put_u16(self.max_adv_interval & 0x0fff);
        buf.put_u16(self.checksum);
        for addr in &self.addresses {
            match addr {
                IpAddr::V4(a) => buf.put_slice(&a.octets()),
                IpAddr::V6(a) => buf.put_slice(&a.octets()),
            }
        }
        buf
    }

    /// Decodes a VRRPv3 advertisement. The caller is responsible for having
    /// already validated the checksum against the raw bytes (spec.md §4.3
    /// step 5 happens before this structural parse).
    pub fn decode(family: AddressFamily, data: &[u8]) -> DecodeResult<Self> {
        if data.len() < VRRP_MIN_PKT_LENGTH {
            return Err(DecodeError::PacketTooShort(data.len()));
        }

        let version = data[0] >> 4;
        let hdr_type = data[0] & 0x0f;
        let vrid = data[1];
        let priority = data[2];
        let count_ip = data[3];
        let max_adv_interval = u16::from_be_bytes([data[4], data[5]]) & 0x0fff;
        let checksum = u16::from_be_bytes([data[6], data[7]]);

        let addr_len = family.addr_len();
        let expected = count_ip as usize * addr_len;
        let actual = data.len() - VRRP_MIN_PKT_LENGTH;
        if actual < expected {
            return Err(DecodeError::AddressCountMismatch { expected, actual });
        }

        let mut addresses = Vec::with_capacity(count_ip as usize);
        let mut offset = VRRP_MIN_PKT_LENGTH;
        for _ in 0..count_ip {
            let addr = match family {
                AddressFamily::Ipv4 => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&data[offset..offset + 4]);
                    IpAddr::V4(Ipv4Addr::from(octets))
                }
                AddressFamily::Ipv6 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&data[offset..offset + 16]);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
            };
            addresses.push(addr);
            offset += addr_len;
        }

        Ok(VrrpPacket {
            version,
            hdr_type,
            vrid,
            priority,
            count_ip,
            max_adv_interval,
            checksum,
            addresses,
        })
    }
}

// ===== ARP (C6) =====

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ArpPacket {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_length: u8,
    pub proto_length: u8,
    pub operation: u16,
    pub sender_hw_address: [u8; 6],
    pub sender_proto_address: Ipv4Addr,
    pub target_hw_address: [u8; 6],
    pub target_proto_address: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ArpDecodeError {
    PacketTooShort(usize),
}

impl std::fmt::Display for ArpDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArpDecodeError::PacketTooShort(len) => {
                write!(f, "ARP packet too short ({len} bytes)")
            }
        }
    }
}

impl std::error::Error for ArpDecodeError {}

const ARP_PKT_LENGTH: usize = 28;

impl ArpPacket {
    pub fn reply(
        sender_hw_address: [u8; 6],
        sender_proto_address: Ipv4Addr,
        target_hw_address: [u8; 6],
        target_proto_address: Ipv4Addr,
    ) -> Self {
        ArpPacket {
            hw_type: crate::consts::ARP_HW_ETHER,
            proto_type: crate::consts::ARP_PROTO_IPV4,
            hw_length: 6,
            proto_length: 4,
            operation: crate::consts::ARP_OP_REPLY,
            sender_hw_address,
            sender_proto_address,
            target_hw_address,
            target_proto_address,
        }
    }

    /// Builds the gratuitous ARP announcement emitted at Master entry for an
    /// address `addr` owned by virtual MAC `mac` (RFC 5798 §7.3).
    pub fn gratuitous(mac: MacAddr, addr: Ipv4Addr) -> Self {
        ArpPacket::reply(mac.as_bytes(), addr, [0xff; 6], addr)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ARP_PKT_LENGTH);
        buf.put_u16(self.hw_type);
        buf.put_u16(self.proto_type);
        buf.put_u8(self.hw_length);
        buf.put_u8(self.proto_length);
        buf.put_u16(self.operation);
        buf.put_slice(&self.sender_hw_address);
        buf.put_slice(&self.sender_proto_address.octets());
        buf.put_slice(&self.target_hw_address);
        buf.put_slice(&self.target_proto_address.octets());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ArpDecodeError> {
        if data.len() < ARP_PKT_LENGTH {
            return Err(ArpDecodeError::PacketTooShort(data.len()));
        }
        let mut sender_hw = [0u8; 6];
        sender_hw.copy_from_slice(&data[8..14]);
        let mut sender_pa = [0u8; 4];
        sender_pa.copy_from_slice(&data[14..18]);
        let mut target_hw = [0u8; 6];
        target_hw.copy_from_slice(&data[18..24]);
        let mut target_pa = [0u8; 4];
        target_pa.copy_from_slice(&data[24..28]);

        Ok(ArpPacket {
            hw_type: u16::from_be_bytes([data[0], data[1]]),
            proto_type: u16::from_be_bytes([data[2], data[3]]),
            hw_length: data[4],
            proto_length: data[5],
            operation: u16::from_be_bytes([data[6], data[7]]),
            sender_hw_address: sender_hw,
            sender_proto_address: Ipv4Addr::from(sender_pa),
            target_hw_address: target_hw,
            target_proto_address: Ipv4Addr::from(target_pa),
        })
    }
}

/// Bare Ethernet header prepended to outgoing ARP frames on an
/// `AF_PACKET`/`SOCK_DGRAM` socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EthernetHdr {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ethertype: u16,
}

impl EthernetHdr {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(14);
        buf.put_slice(&self.dst_mac);
        buf.put_slice(&self.src_mac);
        buf.put_u16(self.ethertype);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_pkt_data() -> [u8; 12] {
        [
            0x31, 0x33, 0x65, 0x01, 0x00, 0x64, 0x54, 0xbd, 0xc0, 0xa8, 0x64,
            0x64,
        ]
    }

    #[test]
    fn test_valid_decoding() {
        let pkt = VrrpPacket::decode(AddressFamily::Ipv4, &valid_pkt_data());
        assert!(pkt.is_ok());
        let pkt = pkt.unwrap();
        assert_eq!(pkt.version, 3);
        assert_eq!(pkt.hdr_type, 1);
        assert_eq!(pkt.vrid, 0x33);
        assert_eq!(pkt.priority, 0x65);
        assert_eq!(pkt.count_ip, 1);
        assert_eq!(
            pkt.addresses,
            vec![IpAddr::V4(Ipv4Addr::new(192, 168, 100, 100))]
        );
    }

    #[test]
    fn test_pkt_too_short() {
        let pkt = VrrpPacket::decode(AddressFamily::Ipv4, &[0x00; 4]);
        assert_eq!(pkt, Err(DecodeError::PacketTooShort(4)));
    }

    #[test]
    fn test_boundary_zero_addresses() {
        // B3: exactly 8 bytes with address-count 0 passes.
        let data = [0x31, 0x01, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00];
        assert!(VrrpPacket::decode(AddressFamily::Ipv4, &data).is_ok());
    }

    #[test]
    fn test_count_ip_corrupted() {
        let mut data = valid_pkt_data();
        data[3] = 3;
        let pkt = VrrpPacket::decode(AddressFamily::Ipv4, &data);
        assert_eq!(
            pkt,
            Err(DecodeError::AddressCountMismatch {
                expected: 12,
                actual: 4
            })
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let original = VrrpPacket::new(
            7,
            255,
            100,
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10))],
        );
        let encoded = original.encode();
        let decoded =
            VrrpPacket::decode(AddressFamily::Ipv4, &encoded).unwrap();
        assert_eq!(decoded.vrid, original.vrid);
        assert_eq!(decoded.priority, original.priority);
        assert_eq!(decoded.max_adv_interval, original.max_adv_interval);
        assert_eq!(decoded.addresses, original.addresses);
    }

    #[test]
    fn encode_decode_round_trip_v6() {
        let addr: IpAddr = "fe80::1".parse().unwrap();
        let original = VrrpPacket::new(9, 100, 4095, vec![addr]);
        let encoded = original.encode();
        let decoded =
            VrrpPacket::decode(AddressFamily::Ipv6, &encoded).unwrap();
        assert_eq!(decoded.addresses, original.addresses);
    }

    #[test]
    fn arp_round_trip() {
        let pkt = ArpPacket::gratuitous(
            [0x00, 0x00, 0x5e, 0x00, 0x01, 0x07].into(),
            Ipv4Addr::new(10, 0, 0, 10),
        );
        let encoded = pkt.encode();
        let decoded = ArpPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn arp_too_short() {
        let decoded = ArpPacket::decode(&[0x00; 4]);
        assert_eq!(decoded, Err(ArpDecodeError::PacketTooShort(4)));
    }
}
