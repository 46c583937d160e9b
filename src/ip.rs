//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Address types shared across the daemon: an address-family union, a
//! subnet (address + prefix length), and small ergonomic extensions mirrored
//! after `holo-utils::ip`.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

/// Address Family identifier (IANA address-family-numbers 1/2).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

impl AddressFamily {
    pub fn addr_len(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 16,
        }
    }

    pub fn pseudo_header_len(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => crate::consts::IPV4_PSEUDO_HDR_LENGTH,
            AddressFamily::Ipv6 => crate::consts::IPV6_PSEUDO_HDR_LENGTH,
        }
    }

    pub fn multicast_group(&self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => {
                IpAddr::V4(crate::consts::VRRP_MULTICAST_ADDR_V4)
            }
            AddressFamily::Ipv6 => {
                IpAddr::V6(crate::consts::VRRP_MULTICAST_ADDR_V6)
            }
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Extension methods for [`IpAddr`].
pub trait IpAddrExt {
    /// Returns true for an address usable as a VRRP primary/virtual address
    /// (not loopback, multicast or unspecified).
    fn is_usable(&self) -> bool;

    /// Bytewise bijective ordering used by the VRRP master tie-break
    /// (spec.md §4.6: "sender > ownPrimaryIP bytewise").
    fn bytewise_cmp(&self, other: &IpAddr) -> Ordering;
}

impl IpAddrExt for IpAddr {
    fn is_usable(&self) -> bool {
        match self {
            IpAddr::V4(a) => {
                !(a.is_loopback()
                    || a.is_broadcast()
                    || a.is_multicast()
                    || a.is_unspecified())
            }
            IpAddr::V6(a) => {
                !(a.is_loopback() || a.is_multicast() || a.is_unspecified())
            }
        }
    }

    fn bytewise_cmp(&self, other: &IpAddr) -> Ordering {
        match (self, other) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
            (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
            // Mismatched families never legitimately reach this comparison;
            // order by family as a defensive default.
            (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Less,
            (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Greater,
        }
    }
}

/// An address plus prefix length of a single family (`IpSubnet` in
/// spec.md §3). Thin wrapper around [`IpNetwork`] that is always
/// constructed with the mask applied, like `holo_utils::ip::IpNetworkExt`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct IpSubnet(IpNetwork);

impl IpSubnet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ipnetwork::IpNetworkError> {
        IpNetwork::new(addr, prefix).map(IpSubnet)
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.ip())
    }

    pub fn network(&self) -> IpNetwork {
        self.0
    }
}

impl fmt::Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for IpSubnet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip()
            .bytewise_cmp(&other.ip())
            .then_with(|| self.prefix().cmp(&other.prefix()))
    }
}

impl PartialOrd for IpSubnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for IpSubnet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip().hash(state);
        self.prefix().hash(state);
    }
}

impl From<Ipv4Network> for IpSubnet {
    fn from(net: Ipv4Network) -> Self {
        IpSubnet(IpNetwork::V4(net))
    }
}

impl From<Ipv6Network> for IpSubnet {
    fn from(net: Ipv6Network) -> Self {
        IpSubnet(IpNetwork::V6(net))
    }
}

impl From<IpSubnet> for IpNetwork {
    fn from(subnet: IpSubnet) -> Self {
        subnet.0
    }
}

/// Returns the virtual MAC address for a given family and VRID
/// (`00:00:5E:00:0{1,2}:VRID`, RFC 5798 §7.3).
pub fn virtual_mac(family: AddressFamily, vrid: u8) -> crate::mac_addr::MacAddr {
    let kind: u8 = match family {
        AddressFamily::Ipv4 => 0x01,
        AddressFamily::Ipv6 => 0x02,
    };
    [0x00, 0x00, 0x5e, 0x00, kind, vrid].into()
}

/// Returns the unspecified address for the given address family.
pub fn unspecified(af: AddressFamily) -> IpAddr {
    match af {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_mac_v4() {
        assert_eq!(
            virtual_mac(AddressFamily::Ipv4, 7).as_bytes(),
            [0x00, 0x00, 0x5e, 0x00, 0x01, 7]
        );
    }

    #[test]
    fn virtual_mac_v6() {
        assert_eq!(
            virtual_mac(AddressFamily::Ipv6, 200).as_bytes(),
            [0x00, 0x00, 0x5e, 0x00, 0x02, 200]
        );
    }

    #[test]
    fn bytewise_cmp_v4() {
        let a: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let b: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        assert_eq!(a.bytewise_cmp(&b), Ordering::Less);
    }
}
