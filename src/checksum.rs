//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! RFC 1071 internet checksum over a v4/v6 pseudo-header plus payload,
//! as used by the VRRPv3 advertisement (spec.md §4.2).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use internet_checksum::Checksum;

use crate::consts::VRRP_PROTO_NUMBER;

/// Computes the VRRP checksum over `payload`, given the source/destination
/// address pair of the IP datagram that will carry it. The embedded checksum
/// field in `payload` is assumed to already be set to whatever value the
/// caller wants included in the sum (zero when encoding, the received value
/// when verifying — a valid frame sums to zero either way).
pub fn compute(src: IpAddr, dst: IpAddr, payload: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum.add_bytes(&pseudo_header_v4(src, dst, payload.len()));
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            sum.add_bytes(&pseudo_header_v6(src, dst, payload.len()));
        }
        _ => unreachable!("checksum requires matching address families"),
    }
    sum.add_bytes(payload);
    u16::from_be_bytes(sum.checksum())
}

/// Returns true if `payload`'s embedded checksum (assumed left in place)
/// makes the one's-complement sum over pseudo-header + payload equal to
/// zero — the definition of a valid frame (spec.md §4.2).
pub fn verify(src: IpAddr, dst: IpAddr, payload: &[u8]) -> bool {
    compute(src, dst, payload) == 0
}

fn pseudo_header_v4(src: Ipv4Addr, dst: Ipv4Addr, len: usize) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&src.octets());
    buf[4..8].copy_from_slice(&dst.octets());
    buf[8] = 0;
    buf[9] = VRRP_PROTO_NUMBER;
    buf[10..12].copy_from_slice(&(len as u16).to_be_bytes());
    buf
}

fn pseudo_header_v6(src: Ipv6Addr, dst: Ipv6Addr, len: usize) -> [u8; 40] {
    let mut buf = [0u8; 40];
    buf[0..16].copy_from_slice(&src.octets());
    buf[16..32].copy_from_slice(&dst.octets());
    buf[32..36].copy_from_slice(&(len as u32).to_be_bytes());
    buf[36] = 0;
    buf[37] = 0;
    buf[38] = 0;
    buf[39] = VRRP_PROTO_NUMBER;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(224, 0, 0, 18));
        let mut payload = vec![0x31, 0x01, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00];
        let checksum = compute(src, dst, &payload);
        payload[6..8].copy_from_slice(&checksum.to_be_bytes());
        assert!(verify(src, dst, &payload));
    }

    #[test]
    fn v6_round_trip() {
        let src = IpAddr::V6(Ipv6Addr::new(
            0xfe80, 0, 0, 0, 0, 0, 0, 1,
        ));
        let dst = IpAddr::V6(crate::consts::VRRP_MULTICAST_ADDR_V6);
        let mut payload = vec![0x31, 0x01, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00];
        let checksum = compute(src, dst, &payload);
        payload[6..8].copy_from_slice(&checksum.to_be_bytes());
        assert!(verify(src, dst, &payload));
    }

    #[test]
    fn odd_length_payload_is_padded() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(224, 0, 0, 18));
        let mut payload =
            vec![0x31, 0x01, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00, 0x01];
        let checksum = compute(src, dst, &payload);
        payload[6..8].copy_from_slice(&checksum.to_be_bytes());
        assert!(verify(src, dst, &payload));
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(224, 0, 0, 18));
        let mut payload = vec![0x31, 0x01, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00];
        let checksum = compute(src, dst, &payload);
        payload[6..8].copy_from_slice(&checksum.to_be_bytes());
        payload[2] ^= 0xff;
        assert!(!verify(src, dst, &payload));
    }
}
