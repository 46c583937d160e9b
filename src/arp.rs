//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! ARP impersonator (C6): one raw `AF_PACKET` socket per interface, shared
//! by every virtual router on that interface running in non-accept mode.
//! Replies to ARP requests for registered virtual IPv4 addresses with the
//! matching virtual MAC, and can emit a gratuitous announcement at Master
//! entry.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::{error, warn};

use crate::consts::{ARP_OP_REQUEST, ETH_ALEN, ETH_P_ARP};
use crate::mac_addr::MacAddr;
use crate::packet::{ArpPacket, EthernetHdr};

/// Per-interface ARP responder. Shared (refcounted by the owner) across all
/// virtual routers on `ifindex` that are Master in non-accept mode.
pub struct ArpService {
    socket: AsyncFd<Socket>,
    ifindex: i32,
    iface_mac: MacAddr,
    mappings: HashMap<Ipv4Addr, MacAddr>,
}

impl ArpService {
    /// Opens a raw `AF_PACKET` socket bound to `ifindex`, filtering for
    /// ARP EtherType frames only.
    pub fn new(ifindex: i32, iface_mac: MacAddr) -> io::Result<Self> {
        let socket = bind_arp_socket(ifindex)?;
        socket.set_nonblocking(true)?;
        let socket = AsyncFd::new(socket)?;
        Ok(ArpService {
            socket,
            ifindex,
            iface_mac,
            mappings: HashMap::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Registers `addr` to reply with `mac` (spec.md §4.4).
    pub fn register(&mut self, addr: Ipv4Addr, mac: MacAddr) {
        self.mappings.insert(addr, mac);
    }

    /// Removes a previously registered mapping.
    pub fn unregister(&mut self, addr: Ipv4Addr) {
        self.mappings.remove(&addr);
    }

    /// Reads one frame and, if it is an ARP request for a registered
    /// address, returns the reply frame ready to send along with the
    /// destination MAC the caller should hand to [`Self::send`].
    pub async fn poll_request(&self) -> io::Result<Option<(Vec<u8>, [u8; ETH_ALEN])>> {
        let mut guard = self.socket.readable().await?;
        let mut buf = [0u8; 128];
        let result = guard.try_io(|inner| inner.get_ref().recv(unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len())
        }));
        let n = match result {
            Ok(Ok(n)) => n,
            Ok(Err(error)) => return Err(error),
            Err(_would_block) => return Ok(None),
        };

        if n < 14 {
            return Ok(None);
        }
        let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
        if ethertype != ETH_P_ARP {
            return Ok(None);
        }

        let arp = match ArpPacket::decode(&buf[14..n]) {
            Ok(pkt) => pkt,
            Err(_) => return Ok(None),
        };
        if arp.operation != ARP_OP_REQUEST {
            return Ok(None);
        }

        let Some(mac) = self.mappings.get(&arp.target_proto_address) else {
            return Ok(None);
        };

        let reply = ArpPacket::reply(
            mac.as_bytes(),
            arp.target_proto_address,
            arp.sender_hw_address,
            arp.sender_proto_address,
        );
        Ok(Some((self.frame(reply, arp.sender_hw_address), arp.sender_hw_address)))
    }

    /// Builds the gratuitous ARP frame announced at Master entry
    /// (spec.md §4.4, §4.6 "emit a gratuitous ARP burst").
    pub fn gratuitous_frame(&self, mac: MacAddr, addr: Ipv4Addr) -> Vec<u8> {
        self.frame(ArpPacket::gratuitous(mac, addr), [0xff; ETH_ALEN])
    }

    fn frame(&self, arp: ArpPacket, dst_mac: [u8; ETH_ALEN]) -> Vec<u8> {
        build_frame(self.iface_mac, dst_mac, arp)
    }

    /// Sends a pre-built frame (as returned by [`Self::poll_request`] or
    /// [`Self::gratuitous_frame`]) to `dst_mac`.
    pub fn send(&self, frame: &[u8], dst_mac: [u8; ETH_ALEN]) -> io::Result<()> {
        let addr = sockaddr_ll(self.ifindex, ETH_P_ARP, dst_mac);
        let ret = unsafe {
            libc::sendto(
                self.socket.get_ref().as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                (&addr as *const libc::sockaddr_ll).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Opens and binds a raw `AF_PACKET`/`SOCK_RAW` socket filtering `ETH_P_ARP`
/// on `ifindex`. Uses raw FFI for the `sockaddr_ll` bind address, the one
/// place in the daemon that genuinely needs `unsafe`: `socket2`/`nix` have
/// no `AF_PACKET` link-layer-address constructor.
fn bind_arp_socket(ifindex: i32) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::from(libc::AF_PACKET),
        Type::RAW,
        Some(Protocol::from((ETH_P_ARP as i32).to_be())),
    )?;

    let addr = sockaddr_ll(ifindex, ETH_P_ARP, [0u8; ETH_ALEN]);
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            (&addr as *const libc::sockaddr_ll).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as u32,
        )
    };
    if ret < 0 {
        let error = io::Error::last_os_error();
        error!(%ifindex, %error, "failed to bind ARP socket");
        return Err(error);
    }
    Ok(socket)
}

fn build_frame(
    src_mac: MacAddr,
    dst_mac: [u8; ETH_ALEN],
    arp: ArpPacket,
) -> Vec<u8> {
    let eth = EthernetHdr {
        dst_mac,
        src_mac: src_mac.as_bytes(),
        ethertype: ETH_P_ARP,
    };
    let mut frame = eth.encode();
    frame.extend_from_slice(&arp.encode());
    frame.to_vec()
}

fn sockaddr_ll(ifindex: i32, ethertype: u16, addr: [u8; ETH_ALEN]) -> libc::sockaddr_ll {
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = ethertype.to_be();
    sll.sll_ifindex = ifindex;
    sll.sll_halen = ETH_ALEN as u8;
    sll.sll_addr[..ETH_ALEN].copy_from_slice(&addr);
    sll
}

impl std::fmt::Debug for ArpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArpService")
            .field("ifindex", &self.ifindex)
            .field("mappings", &self.mappings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let mac: MacAddr = [0, 0, 0x5e, 0, 1, 7].into();
        let addr = Ipv4Addr::new(10, 0, 0, 10);
        let frame = build_frame(mac, [0xff; ETH_ALEN], ArpPacket::gratuitous(mac, addr));
        assert_eq!(frame.len(), 14 + 28);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETH_P_ARP);
    }
}
