//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};

/// IP protocol number assigned to VRRP (RFC 5798 §5.1).
pub const VRRP_PROTO_NUMBER: u8 = 112;

/// Minimum length of a VRRPv3 advertisement: the 8-byte fixed header with a
/// zero-length address list.
pub const VRRP_MIN_PKT_LENGTH: usize = 8;

/// Largest address count the 8-bit `Count IPvX Addr` field can express.
pub const VRRP_MAX_ADDR_COUNT: usize = 255;

/// IPv4 pseudo-header length used for the VRRP checksum.
pub const IPV4_PSEUDO_HDR_LENGTH: usize = 12;

/// IPv6 pseudo-header length used for the VRRP checksum.
pub const IPV6_PSEUDO_HDR_LENGTH: usize = 40;

/// VRRP IPv4 multicast group (`224.0.0.18`).
pub const VRRP_MULTICAST_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// VRRP IPv6 multicast group (`ff02::12`).
pub const VRRP_MULTICAST_ADDR_V6: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12);

/// Required TTL/Hop Limit on any received VRRP packet.
pub const VRRP_IP_TTL: u8 = 255;

/// Valid range for the Virtual Router ID.
pub const VRID_MIN: u8 = 1;
pub const VRID_MAX: u8 = 255;

/// Valid range for priority; 255 designates the address owner.
pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 255;
pub const PRIORITY_OWNER: u8 = 255;
pub const PRIORITY_DEFAULT: u8 = 100;

/// Advertisement interval range, in centiseconds (10 ms units).
pub const ADVER_INT_MIN_CS: u16 = 1;
pub const ADVER_INT_MAX_CS: u16 = 4095;
pub const ADVER_INT_DEFAULT_CS: u16 = 100;

/// Default control-session bind address.
pub const DEFAULT_CLI_BIND: &str = "127.0.0.1:7777";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "configuration.dat";

/// Prefix used for leftover macvlan sub-interfaces from a crashed instance.
pub const VRRP_IFACE_PREFIX: &str = "vrrp.";

pub const ETH_ALEN: usize = 6;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ARP_HW_ETHER: u16 = 1;
pub const ARP_PROTO_IPV4: u16 = 0x0800;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;
