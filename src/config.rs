//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Binary configuration file codec (spec.md §6). The format is tolerant by
//! design: a corrupt or forward-incompatible record is skipped with a
//! warning rather than aborting the whole load, since the daemon must still
//! come up with whatever routers did parse.

use std::io;
use std::net::IpAddr;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::consts::{ADVER_INT_MAX_CS, ADVER_INT_MIN_CS, PRIORITY_MIN, VRID_MAX, VRID_MIN};
use crate::ip::{AddressFamily, IpSubnet};

const FILE_VERSION: u32 = 1;

/// One router record as read from disk, already range-checked but not yet
/// resolved against live interfaces (that happens in `daemon::load_config`,
/// which is the only place that knows the interface name -> ifindex map).
#[derive(Clone, Debug)]
pub struct RouterRecord {
    pub ifname: String,
    pub vrid: u8,
    pub family: AddressFamily,
    pub priority: u8,
    pub interval_cs: u16,
    pub accept: bool,
    pub preempt: bool,
    pub enabled: bool,
    pub primary_ip: Option<IpAddr>,
    pub addresses: Vec<IpSubnet>,
}

/// Loads and range-validates every record in `path`. Invalid records are
/// dropped with a `warn!` and do not abort the load (spec.md §6).
pub fn load(path: &Path) -> io::Result<Vec<RouterRecord>> {
    let data = std::fs::read(path)?;
    let mut buf = Bytes::from(data);

    if buf.remaining() < 8 {
        warn!(?path, "configuration file truncated, starting with no routers");
        return Ok(Vec::new());
    }
    let version = buf.get_u32();
    if version != FILE_VERSION {
        warn!(?path, version, "unsupported configuration file version");
        return Ok(Vec::new());
    }
    let count = buf.get_u32();

    let mut routers = Vec::new();
    for index in 0..count {
        match decode_router(&mut buf) {
            Some(record) if validate(&record) => routers.push(record),
            Some(record) => {
                warn!(index, vrid = record.vrid, "skipping invalid router record");
            }
            None => {
                warn!(index, "configuration file truncated while decoding router, stopping");
                break;
            }
        }
    }
    Ok(routers)
}

/// Writes every known router back to `path` (spec.md §6 "save").
pub fn save(path: &Path, routers: &[RouterRecord]) -> io::Result<()> {
    let mut buf = BytesMut::new();
    buf.put_u32(FILE_VERSION);
    buf.put_u32(routers.len() as u32);
    for router in routers {
        encode_router(&mut buf, router);
    }
    std::fs::write(path, buf)
}

fn validate(record: &RouterRecord) -> bool {
    (VRID_MIN..=VRID_MAX).contains(&record.vrid)
        && record.priority >= PRIORITY_MIN
        && (ADVER_INT_MIN_CS..=ADVER_INT_MAX_CS).contains(&record.interval_cs)
}

fn decode_string(buf: &mut Bytes) -> Option<String> {
    if buf.remaining() < 1 {
        return None;
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).ok()
}

fn encode_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

fn decode_ip(buf: &mut Bytes) -> Option<IpAddr> {
    if buf.remaining() < 4 {
        return None;
    }
    let family = buf.get_u32();
    match family {
        1 => {
            if buf.remaining() < 4 {
                return None;
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Some(IpAddr::from(octets))
        }
        2 => {
            if buf.remaining() < 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn encode_ip(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(addr) => {
            buf.put_u32(1);
            buf.put_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            buf.put_u32(2);
            buf.put_slice(&addr.octets());
        }
    }
}

fn decode_subnet(buf: &mut Bytes) -> Option<IpSubnet> {
    let addr = decode_ip(buf)?;
    if buf.remaining() < 4 {
        return None;
    }
    let cidr = buf.get_u32();
    IpSubnet::new(addr, cidr as u8).ok()
}

fn encode_subnet(buf: &mut BytesMut, subnet: &IpSubnet) {
    encode_ip(buf, &subnet.ip());
    buf.put_u32(subnet.prefix() as u32);
}

fn decode_bool(buf: &mut Bytes) -> Option<bool> {
    if buf.remaining() < 1 {
        return None;
    }
    Some(buf.get_u8() != 0)
}

fn encode_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 0xFF } else { 0x00 });
}

fn decode_router(buf: &mut Bytes) -> Option<RouterRecord> {
    let ifname = decode_string(buf)?;
    if buf.remaining() < 4 {
        return None;
    }
    let vrid = buf.get_u32() as u8;
    if buf.remaining() < 4 {
        return None;
    }
    let family = match buf.get_u32() {
        1 => AddressFamily::Ipv4,
        2 => AddressFamily::Ipv6,
        _ => return None,
    };
    if buf.remaining() < 4 {
        return None;
    }
    let priority = buf.get_u32() as u8;
    if buf.remaining() < 4 {
        return None;
    }
    let interval_cs = buf.get_u32() as u16;
    let accept = decode_bool(buf)?;
    let preempt = decode_bool(buf)?;
    let enabled = decode_bool(buf)?;
    if buf.remaining() < 4 {
        return None;
    }
    let flags = buf.get_u32();
    let primary_ip = if flags & 1 != 0 {
        Some(decode_ip(buf)?)
    } else {
        None
    };
    if buf.remaining() < 4 {
        return None;
    }
    let addr_count = buf.get_u32();
    let mut addresses = Vec::with_capacity(addr_count as usize);
    for _ in 0..addr_count {
        addresses.push(decode_subnet(buf)?);
    }

    Some(RouterRecord {
        ifname,
        vrid,
        family,
        priority,
        interval_cs,
        accept,
        preempt,
        enabled,
        primary_ip,
        addresses,
    })
}

fn encode_router(buf: &mut BytesMut, record: &RouterRecord) {
    encode_string(buf, &record.ifname);
    buf.put_u32(record.vrid as u32);
    buf.put_u32(record.family as u32);
    buf.put_u32(record.priority as u32);
    buf.put_u32(record.interval_cs as u32);
    encode_bool(buf, record.accept);
    encode_bool(buf, record.preempt);
    encode_bool(buf, record.enabled);
    let flags: u32 = if record.primary_ip.is_some() { 1 } else { 0 };
    buf.put_u32(flags);
    if let Some(ip) = &record.primary_ip {
        encode_ip(buf, ip);
    }
    buf.put_u32(record.addresses.len() as u32);
    for subnet in &record.addresses {
        encode_subnet(buf, subnet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RouterRecord {
        RouterRecord {
            ifname: "eth0".to_string(),
            vrid: 7,
            family: AddressFamily::Ipv4,
            priority: 100,
            interval_cs: 100,
            accept: false,
            preempt: true,
            enabled: true,
            primary_ip: Some("10.0.0.1".parse().unwrap()),
            addresses: vec![IpSubnet::new("10.0.0.10".parse().unwrap(), 24).unwrap()],
        }
    }

    #[test]
    fn round_trip_single_router() {
        let mut buf = BytesMut::new();
        encode_router(&mut buf, &sample());
        let mut bytes = buf.freeze();
        let decoded = decode_router(&mut bytes).unwrap();
        assert_eq!(decoded.ifname, "eth0");
        assert_eq!(decoded.vrid, 7);
        assert_eq!(decoded.addresses.len(), 1);
    }

    #[test]
    fn invalid_vrid_is_rejected_by_validate() {
        let mut record = sample();
        record.vrid = 0;
        assert!(!validate(&record));
    }

    #[test]
    fn invalid_interval_is_rejected_by_validate() {
        let mut record = sample();
        record.interval_cs = 0;
        assert!(!validate(&record));
        record.interval_cs = 4096;
        assert!(!validate(&record));
    }

    #[test]
    fn save_then_load_round_trips(
    ) {
        let dir = std::env::temp_dir().join(format!("vrrpd-config-test-{}", std::process::id()));
        let path = dir.with_extension("dat");
        save(&path, &[sample()]).unwrap();
        let loaded = load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].ifname, "eth0");
    }
}
