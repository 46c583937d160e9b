//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Shared VRRP socket (C7): one raw IP-protocol-112 socket per address
//! family, process-wide, with refcounted per-interface multicast
//! membership. Implements the ingress validation pipeline and the egress
//! encoder described in spec.md §4.3.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrIn, SockaddrIn6,
};
use nix::sys::uio::IoSlice;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::{error, warn};

use crate::checksum;
use crate::consts::{VRRP_IP_TTL, VRRP_PROTO_NUMBER};
use crate::ip::AddressFamily;
use crate::packet::{DecodeError, VrrpPacket};

/// Outcome of validating one ingress datagram (spec.md §4.3 steps 3-10).
/// `network.rs` does not know about individual services; the caller (the
/// registry) maps a `NotifyService`/`NotifyAllOnInterface` outcome onto the
/// right statistics counters.
#[derive(Debug)]
pub enum IngressOutcome {
    /// Silently dropped (unknown, non-advertisement frame).
    Drop,
    /// Every service bound to the arrival interface should be notified.
    NotifyAllOnInterface { ifindex: u32, error: IngressError },
    /// Only the service for the given VRID should be notified.
    NotifyService { ifindex: u32, vrid: u8, error: IngressError },
    /// A valid advertisement, ready for the addressed service's ingress
    /// hook.
    Advertisement {
        ifindex: u32,
        src: IpAddr,
        vrid: u8,
        priority: u8,
        max_adv_interval: u16,
        addresses: Vec<IpAddr>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngressError {
    PacketTooShort,
    VersionError,
    ChecksumError,
    InvalidType,
    VridError,
    TtlError,
    PacketLengthError,
}

/// One shared raw socket for a whole address family.
pub struct SharedSocket {
    family: AddressFamily,
    socket: AsyncFd<Socket>,
    /// Per-interface multicast join refcount.
    memberships: HashMap<u32, usize>,
}

impl SharedSocket {
    pub fn new(family: AddressFamily) -> io::Result<Self> {
        let (domain, socket) = match family {
            AddressFamily::Ipv4 => {
                let socket = Socket::new(
                    Domain::IPV4,
                    Type::RAW,
                    Some(Protocol::from(VRRP_PROTO_NUMBER as i32)),
                )?;
                socket.set_multicast_loop_v4(false)?;
                socket.set_multicast_ttl_v4(VRRP_IP_TTL as u32)?;
                set_ip_pktinfo(&socket)?;
                (Domain::IPV4, socket)
            }
            AddressFamily::Ipv6 => {
                let socket = Socket::new(
                    Domain::IPV6,
                    Type::RAW,
                    Some(Protocol::from(VRRP_PROTO_NUMBER as i32)),
                )?;
                socket.set_only_v6(true)?;
                socket.set_multicast_loop_v6(false)?;
                socket.set_multicast_hops_v6(VRRP_IP_TTL as u32)?;
                set_ipv6_recvpktinfo(&socket)?;
                set_ipv6_recvhoplimit(&socket)?;
                (Domain::IPV6, socket)
            }
        };
        let _ = domain;
        socket.set_nonblocking(true)?;
        Ok(SharedSocket {
            family,
            socket: AsyncFd::new(socket)?,
            memberships: HashMap::new(),
        })
    }

    /// Joins the family's multicast group on `ifindex`; refcounted, so the
    /// first caller actually issues the join.
    pub fn join(&mut self, ifindex: u32) -> io::Result<()> {
        let count = self.memberships.entry(ifindex).or_insert(0);
        if *count == 0 {
            join_multicast(self.socket.get_ref(), self.family, ifindex)?;
        }
        *count += 1;
        Ok(())
    }

    /// Releases one reference; the last release actually leaves the group.
    pub fn leave(&mut self, ifindex: u32) {
        if let Some(count) = self.memberships.get_mut(&ifindex) {
            *count -= 1;
            if *count == 0 {
                self.memberships.remove(&ifindex);
                if let Err(error) =
                    leave_multicast(self.socket.get_ref(), self.family, ifindex)
                {
                    warn!(%ifindex, %error, "failed to leave VRRP multicast group");
                }
            }
        }
    }

    /// Reads and validates exactly one ingress datagram (spec.md §4.3).
    pub async fn recv(&self) -> io::Result<IngressOutcome> {
        let mut guard = self.socket.readable().await?;
        let mut buf = [0u8; 2048];
        let mut cmsg_buf = nix::cmsg_space!(
            libc::in_pktinfo,
            libc::in6_pktinfo,
            libc::c_int
        );

        let result = guard.try_io(|inner| {
            let fd = inner.get_ref().as_raw_fd();
            let mut iov = [IoSlice::new(&mut buf)];
            recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
        });

        let msg = match result {
            Ok(Ok(msg)) => msg,
            Ok(Err(error)) => return Err(error),
            Err(_would_block) => {
                return Ok(IngressOutcome::Drop);
            }
        };

        let n = msg.bytes;
        let mut arrival_ifindex = 0u32;
        let mut dst = None;
        let mut ttl_or_hoplimit = None;
        for cmsg in msg.cmsgs().into_iter().flatten() {
            match cmsg {
                ControlMessageOwned::Ipv4PacketInfo(info) => {
                    arrival_ifindex = info.ipi_ifindex as u32;
                    dst = Some(IpAddr::V4(Ipv4Addr::from(
                        info.ipi_addr.s_addr.to_ne_bytes(),
                    )));
                }
                ControlMessageOwned::Ipv6PacketInfo(info) => {
                    arrival_ifindex = info.ipi6_ifindex;
                    dst = Some(IpAddr::V6(Ipv6Addr::from(
                        info.ipi6_addr.s6_addr,
                    )));
                }
                ControlMessageOwned::Ipv6HopLimit(hl) => {
                    ttl_or_hoplimit = Some(hl as u8);
                }
                _ => {}
            }
        }

        let src = match self.family {
            AddressFamily::Ipv4 => msg
                .address
                .and_then(|a: nix::sys::socket::SockaddrStorage| {
                    a.as_sockaddr_in().map(|a| IpAddr::V4(Ipv4Addr::from(a.ip())))
                })
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            AddressFamily::Ipv6 => msg
                .address
                .and_then(|a: nix::sys::socket::SockaddrStorage| {
                    a.as_sockaddr_in6().map(|a| IpAddr::V6(a.ip()))
                })
                .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };

        let (payload, ttl) = match self.family {
            AddressFamily::Ipv4 => {
                // Raw IPv4 sockets always deliver the IP header (step 2).
                if n < 20 {
                    return Ok(IngressOutcome::NotifyAllOnInterface {
                        ifindex: arrival_ifindex,
                        error: IngressError::PacketTooShort,
                    });
                }
                let ihl = (buf[0] & 0x0f) as usize * 4;
                let ttl = buf[8];
                (buf[ihl..n].to_vec(), ttl)
            }
            AddressFamily::Ipv6 => {
                // The kernel strips the fixed IPv6 header; walk any
                // extension headers to find protocol 112 (step 2, B4).
                let offset = skip_ipv6_ext_headers(&buf[..n]);
                (
                    buf[offset..n].to_vec(),
                    ttl_or_hoplimit.unwrap_or(0),
                )
            }
        };

        let dst = dst.unwrap_or(crate::ip::unspecified(self.family));
        Ok(validate_ingress(
            self.family,
            arrival_ifindex,
            src,
            dst,
            ttl,
            &payload,
        ))
    }

    /// Encodes and sends an advertisement (spec.md §4.3 "Egress").
    pub fn send(
        &self,
        ifindex: u32,
        src: IpAddr,
        packet: &VrrpPacket,
    ) -> io::Result<()> {
        let dst = self.family.multicast_group();
        let mut encoded = packet.clone();
        encoded.checksum = 0;
        let mut buf = encoded.encode();
        let sum = checksum::compute(src, dst, &buf);
        buf[6..8].copy_from_slice(&sum.to_be_bytes());

        let fd = self.socket.get_ref().as_raw_fd();
        send_with_pktinfo(fd, self.family, ifindex, src, dst, &buf)
    }
}

/// VRRPv3's ingress validation pipeline, spec.md §4.3 steps 3-10.
fn validate_ingress(
    family: AddressFamily,
    ifindex: u32,
    src: IpAddr,
    dst: IpAddr,
    ttl: u8,
    payload: &[u8],
) -> IngressOutcome {
    // Step 3: total length.
    if payload.len() < 8 {
        return IngressOutcome::NotifyAllOnInterface {
            ifindex,
            error: IngressError::PacketTooShort,
        };
    }

    // Step 4: version/type check on the first byte.
    let first = payload[0];
    let vrid = payload[1];
    if first == 0x21 {
        return IngressOutcome::NotifyService {
            ifindex,
            vrid,
            error: IngressError::VersionError,
        };
    }
    if first >> 4 != 3 {
        return IngressOutcome::Drop;
    }

    // Step 5: checksum.
    if !checksum::verify(src, dst, payload) {
        return IngressOutcome::NotifyAllOnInterface {
            ifindex,
            error: IngressError::ChecksumError,
        };
    }

    // Step 6: type nibble.
    if first & 0x0f != 1 {
        return IngressOutcome::NotifyAllOnInterface {
            ifindex,
            error: IngressError::InvalidType,
        };
    }

    // Step 7 (service lookup) happens in the caller; this layer only
    // reports a structurally valid candidate and lets the registry decide
    // whether a matching service exists.

    // Step 8: TTL/Hop Limit.
    if ttl != VRRP_IP_TTL {
        return IngressOutcome::NotifyService {
            ifindex,
            vrid,
            error: IngressError::TtlError,
        };
    }

    // Steps 9-10: structural decode.
    match VrrpPacket::decode(family, payload) {
        Ok(pkt) => IngressOutcome::Advertisement {
            ifindex,
            src,
            vrid: pkt.vrid,
            priority: pkt.priority,
            max_adv_interval: pkt.max_adv_interval,
            addresses: pkt.addresses,
        },
        Err(DecodeError::PacketTooShort(_))
        | Err(DecodeError::AddressCountMismatch { .. }) => {
            IngressOutcome::NotifyService {
                ifindex,
                vrid,
                error: IngressError::PacketLengthError,
            }
        }
    }
}

/// Walks the IPv6 next-header chain to find protocol 112 (spec.md B4).
fn skip_ipv6_ext_headers(buf: &[u8]) -> usize {
    // The kernel hands us the payload without the fixed header; if it
    // already begins with VRRP (no extension headers present) this is a
    // no-op. Only the common, length-prefixed extension header types are
    // walked: hop-by-hop(0), routing(43), destination options(60), whose
    // second byte holds their length in 8-octet units (excluding the first
    // 8 octets). Fragment headers (44, fixed 8 bytes) are also handled.
    // This is sufficient for the vast majority of deployments; an
    // unrecognized leading byte is treated as already-VRRP.
    let mut offset = 0;
    loop {
        if buf.len() < offset + 8 {
            return offset;
        }
        let next_header = if offset == 0 {
            // We no longer have the original next-header value once inside
            // the chain without the IPv6 base header; heuristically detect
            // a VRRP frame (version nibble 3) and stop.
            if buf[offset] >> 4 == 3 {
                return offset;
            }
            buf[offset]
        } else {
            buf[offset]
        };
        match next_header {
            0 | 43 | 60 => {
                let len = (buf[offset + 1] as usize + 1) * 8;
                offset += len;
            }
            44 => offset += 8,
            _ => return offset,
        }
    }
}

fn set_ip_pktinfo(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_ipv6_recvpktinfo(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_ipv6_recvhoplimit(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn join_multicast(
    socket: &Socket,
    family: AddressFamily,
    ifindex: u32,
) -> io::Result<()> {
    match family {
        AddressFamily::Ipv4 => {
            let mreq = libc::ip_mreqn {
                imr_multiaddr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(
                        crate::consts::VRRP_MULTICAST_ADDR_V4.octets(),
                    ),
                },
                imr_address: libc::in_addr { s_addr: 0 },
                imr_ifindex: ifindex as i32,
            };
            setsockopt_struct(
                socket,
                libc::IPPROTO_IP,
                libc::IP_ADD_MEMBERSHIP,
                &mreq,
            )
        }
        AddressFamily::Ipv6 => {
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr {
                    s6_addr: crate::consts::VRRP_MULTICAST_ADDR_V6.octets(),
                },
                ipv6mr_interface: ifindex,
            };
            setsockopt_struct(
                socket,
                libc::IPPROTO_IPV6,
                libc::IPV6_ADD_MEMBERSHIP,
                &mreq,
            )
        }
    }
}

fn leave_multicast(
    socket: &Socket,
    family: AddressFamily,
    ifindex: u32,
) -> io::Result<()> {
    match family {
        AddressFamily::Ipv4 => {
            let mreq = libc::ip_mreqn {
                imr_multiaddr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(
                        crate::consts::VRRP_MULTICAST_ADDR_V4.octets(),
                    ),
                },
                imr_address: libc::in_addr { s_addr: 0 },
                imr_ifindex: ifindex as i32,
            };
            setsockopt_struct(
                socket,
                libc::IPPROTO_IP,
                libc::IP_DROP_MEMBERSHIP,
                &mreq,
            )
        }
        AddressFamily::Ipv6 => {
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr {
                    s6_addr: crate::consts::VRRP_MULTICAST_ADDR_V6.octets(),
                },
                ipv6mr_interface: ifindex,
            };
            setsockopt_struct(
                socket,
                libc::IPPROTO_IPV6,
                libc::IPV6_DROP_MEMBERSHIP,
                &mreq,
            )
        }
    }
}

fn setsockopt_struct<T>(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (value as *const T).cast(),
            std::mem::size_of::<T>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_with_pktinfo(
    fd: RawFd,
    family: AddressFamily,
    ifindex: u32,
    src: IpAddr,
    dst: IpAddr,
    payload: &[u8],
) -> io::Result<()> {
    let iov = [IoSlice::new(payload)];
    let result = match (family, src, dst) {
        (AddressFamily::Ipv4, IpAddr::V4(src), IpAddr::V4(dst)) => {
            let info = libc::in_pktinfo {
                ipi_ifindex: ifindex as i32,
                ipi_spec_dst: libc::in_addr {
                    s_addr: u32::from_ne_bytes(src.octets()),
                },
                ipi_addr: libc::in_addr { s_addr: 0 },
            };
            let cmsg = [ControlMessage::Ipv4PacketInfo(&info)];
            let addr = SockaddrIn::from(std::net::SocketAddrV4::new(dst, 0));
            sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), Some(&addr))
        }
        (AddressFamily::Ipv6, IpAddr::V6(src), IpAddr::V6(dst)) => {
            let info = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: src.octets(),
                },
                ipi6_ifindex: ifindex,
            };
            let cmsg = [ControlMessage::Ipv6PacketInfo(&info)];
            let addr =
                SockaddrIn6::from(std::net::SocketAddrV6::new(dst, 0, 0, 0));
            sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), Some(&addr))
        }
        _ => unreachable!("family/address mismatch"),
    };
    result
        .map(|_| ())
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ingress_too_short() {
        let outcome = validate_ingress(
            AddressFamily::Ipv4,
            1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(crate::consts::VRRP_MULTICAST_ADDR_V4),
            255,
            &[0u8; 4],
        );
        assert!(matches!(
            outcome,
            IngressOutcome::NotifyAllOnInterface {
                error: IngressError::PacketTooShort,
                ..
            }
        ));
    }

    #[test]
    fn validate_ingress_v2_notifies_version_error() {
        let payload = [0x21, 0x05, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00];
        let outcome = validate_ingress(
            AddressFamily::Ipv4,
            1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(crate::consts::VRRP_MULTICAST_ADDR_V4),
            255,
            &payload,
        );
        assert!(matches!(
            outcome,
            IngressOutcome::NotifyService {
                vrid: 5,
                error: IngressError::VersionError,
                ..
            }
        ));
    }

    #[test]
    fn validate_ingress_bad_ttl() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(crate::consts::VRRP_MULTICAST_ADDR_V4);
        let mut payload = vec![0x31, 0x05, 0x64, 0x00, 0x00, 0x64, 0x00, 0x00];
        let sum = checksum::compute(src, dst, &payload);
        payload[6..8].copy_from_slice(&sum.to_be_bytes());
        let outcome = validate_ingress(AddressFamily::Ipv4, 1, src, dst, 64, &payload);
        assert!(matches!(
            outcome,
            IngressOutcome::NotifyService {
                vrid: 5,
                error: IngressError::TtlError,
                ..
            }
        ));
    }

    #[test]
    fn validate_ingress_valid_advertisement() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(crate::consts::VRRP_MULTICAST_ADDR_V4);
        let pkt = VrrpPacket::new(5, 100, 100, vec![]);
        let mut encoded = pkt.encode();
        let sum = checksum::compute(src, dst, &encoded);
        encoded[6..8].copy_from_slice(&sum.to_be_bytes());
        let outcome =
            validate_ingress(AddressFamily::Ipv4, 1, src, dst, 255, &encoded);
        assert!(matches!(
            outcome,
            IngressOutcome::Advertisement { vrid: 5, priority: 100, .. }
        ));
    }
}
