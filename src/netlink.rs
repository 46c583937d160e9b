//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Kernel control (C5): a thin synchronous-looking wrapper over rtnetlink
//! for MAC-VLAN lifecycle, address plumbing, link state and sysctl knobs.
//! All operations are request/reply; failures are logged and returned to
//! the caller rather than panicking the daemon (spec.md §4.8).

use std::collections::HashMap;
use std::net::IpAddr;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::constants::{
    AF_INET, AF_INET6, RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV6_IFADDR, RTNLGRP_LINK,
};
use netlink_packet_route::rtnl::RtnlMessage;
use netlink_packet_route::{AddressMessage, LinkMessage, MACVLAN_MODE_VEPA};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{new_connection, Handle};
use tracing::{error, trace, warn};

use crate::ip::AddressFamily;
use crate::mac_addr::MacAddr;

pub type LinkEvent = (u32, bool);
pub type NetlinkMonitor =
    futures::channel::mpsc::UnboundedReceiver<(NetlinkMessage<RtnlMessage>, SocketAddr)>;

/// Opens the two netlink connections the daemon needs: a request channel
/// (handle) and a monitor stream bound to the link/address multicast groups.
pub async fn init() -> (Handle, NetlinkMonitor) {
    let (conn, handle, _) =
        new_connection().expect("failed to create netlink socket");
    tokio::task::spawn_local(conn);

    let (mut conn, _, monitor) =
        new_connection().expect("failed to create netlink monitor socket");
    let groups = [RTNLGRP_LINK, RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV6_IFADDR]
        .iter()
        .map(|group| 1 << (group - 1))
        .fold(0, std::ops::BitOr::bitor);
    let addr = SocketAddr::new(0, groups);
    conn.socket_mut()
        .socket_mut()
        .bind(&addr)
        .expect("failed to bind netlink monitor socket");
    tokio::task::spawn_local(conn);

    (handle, monitor)
}

/// Enumerates all interfaces present at startup, `ifindex -> name`.
pub async fn enumerate_interfaces(handle: &Handle) -> HashMap<u32, String> {
    use netlink_packet_route::link::nlas::Nla;

    let mut result = HashMap::new();
    let mut links = handle.link().get().execute();
    loop {
        match links.try_next().await {
            Ok(Some(msg)) => {
                let ifindex = msg.header.index;
                for nla in msg.nlas {
                    if let Nla::IfName(name) = nla {
                        result.insert(ifindex, name);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                error!(%error, "failed to enumerate interfaces");
                break;
            }
        }
    }
    result
}

/// Returns the first non-link-local, non-loopback address of `family` on
/// `ifindex` (spec.md §4.5 `primary_address`).
pub async fn primary_address(
    handle: &Handle,
    ifindex: u32,
    family: AddressFamily,
) -> Option<IpAddr> {
    use crate::ip::IpAddrExt;

    let mut addresses = handle.address().get().set_link_index_filter(ifindex).execute();
    loop {
        match addresses.try_next().await {
            Ok(Some(msg)) => {
                if let Some(net) = address_message_network(&msg) {
                    if AddressFamily::of(&net.ip()) == family && net.ip().is_usable() {
                        return Some(net.ip());
                    }
                }
            }
            Ok(None) => return None,
            Err(error) => {
                error!(%ifindex, %error, "failed to query primary address");
                return None;
            }
        }
    }
}

fn address_message_network(msg: &AddressMessage) -> Option<IpNetwork> {
    use netlink_packet_route::address::nlas::Nla;

    for nla in &msg.nlas {
        if let Nla::Address(bytes) = nla {
            return parse_address(msg.header.family, msg.header.prefix_len, bytes);
        }
    }
    None
}

fn parse_address(family: u8, prefixlen: u8, bytes: &[u8]) -> Option<IpNetwork> {
    let addr: IpAddr = match family as u16 {
        AF_INET => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            std::net::Ipv4Addr::from(octets).into()
        }
        AF_INET6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).into()
        }
        _ => return None,
    };
    IpNetwork::new(addr, prefixlen).ok()
}

/// Adds `subnet` to `ifindex` with universe scope.
pub async fn add_address(handle: &Handle, ifindex: u32, subnet: IpNetwork) -> bool {
    let request = handle.address().add(ifindex, subnet.ip(), subnet.prefix());
    if let Err(error) = request.execute().await {
        error!(%ifindex, %subnet, %error, "failed to install address");
        return false;
    }
    true
}

/// Removes `subnet` from `ifindex`. Not fatal if the address is already
/// gone (spec.md §4.8).
pub async fn remove_address(handle: &Handle, ifindex: u32, subnet: IpNetwork) -> bool {
    let mut request = handle.address().add(ifindex, subnet.ip(), subnet.prefix());
    let request = handle.address().del(request.message_mut().clone());
    if let Err(error) = request.execute().await {
        warn!(%ifindex, %subnet, %error, "failed to remove address (possibly already gone)");
        return false;
    }
    true
}

/// Creates a MAC-VLAN sub-interface in VEPA mode (spec.md §4.5) and applies
/// the ARP sysctl knobs to both parent and child. The parent's own MAC is
/// never touched.
pub async fn add_macvlan(
    handle: &Handle,
    parent_ifindex: u32,
    parent_ifname: &str,
    mac: MacAddr,
    name: String,
) -> Option<u32> {
    let request = handle.link().add().macvlan(
        name.clone(),
        parent_ifindex,
        MACVLAN_MODE_VEPA,
    );
    if let Err(error) = request.execute().await {
        error!(%parent_ifindex, %name, %error, "failed to create macvlan interface");
        return None;
    }

    let ifindex = match resolve_ifindex(handle, &name).await {
        Some(ifindex) => ifindex,
        None => {
            error!(%name, "macvlan interface created but could not be resolved");
            return None;
        }
    };

    if let Err(error) = handle
        .link()
        .set(ifindex)
        .address(mac.as_bytes().to_vec())
        .execute()
        .await
    {
        error!(%ifindex, %error, "failed to set macvlan MAC address");
    }

    sysctl_set(parent_ifname, "arp_ignore", "1").await;
    sysctl_set(parent_ifname, "arp_announce", "1").await;
    sysctl_set(parent_ifname, "arp_filter", "1").await;
    sysctl_set(&name, "arp_ignore", "1").await;
    sysctl_set(&name, "arp_announce", "1").await;
    sysctl_set(&name, "arp_filter", "0").await;

    Some(ifindex)
}

async fn resolve_ifindex(handle: &Handle, name: &str) -> Option<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(msg)) => Some(msg.header.index),
        _ => None,
    }
}

/// Destroys an interface by index (used for a service's own macvlan).
pub async fn remove_interface(handle: &Handle, ifindex: u32) -> bool {
    if let Err(error) = handle.link().del(ifindex).execute().await {
        error!(%ifindex, %error, "failed to remove interface");
        return false;
    }
    true
}

pub async fn set_interface_up(handle: &Handle, ifindex: u32, up: bool) -> bool {
    let request = handle.link().set(ifindex);
    let request = if up { request.up() } else { request.down() };
    if let Err(error) = request.execute().await {
        error!(%ifindex, %up, %error, "failed to change interface admin status");
        return false;
    }
    true
}

/// Reads the link-layer (MAC) address of `ifindex`, used as the Ethernet
/// source address for ARP frames sent on its behalf (spec.md §4.4).
pub async fn link_mac_address(handle: &Handle, ifindex: u32) -> Option<MacAddr> {
    use netlink_packet_route::link::nlas::Nla;

    let mut links = handle.link().get().match_index(ifindex).execute();
    let msg = match links.try_next().await {
        Ok(Some(msg)) => msg,
        _ => return None,
    };
    for nla in msg.nlas {
        if let Nla::Address(bytes) = nla {
            if bytes.len() == 6 {
                let mut octets = [0u8; 6];
                octets.copy_from_slice(&bytes);
                return Some(MacAddr::from(octets));
            }
        }
    }
    None
}

pub async fn is_interface_up(handle: &Handle, ifindex: u32) -> bool {
    let mut links = handle.link().get().match_index(ifindex).execute();
    match links.try_next().await {
        Ok(Some(msg)) => link_message_up(&msg),
        _ => false,
    }
}

/// True if the link's operational state NLA reports carrier up
/// (`IF_OPER_UP`). The administrative `IFF_UP` header flag only says the
/// link was brought up by an operator; it stays set while the cable is
/// unplugged, which is exactly the case link-watch needs to detect.
fn link_message_up(msg: &LinkMessage) -> bool {
    use netlink_packet_route::link::nlas::{Nla, State};

    msg.nlas.iter().any(|nla| matches!(nla, Nla::OperState(State::Up)))
}

/// Writes `value` to `/proc/sys/net/ipv4/conf/<iface>/<knob>`. All failures
/// are logged; the caller proceeds regardless (spec.md §4.5).
pub async fn sysctl_set(iface: &str, knob: &str, value: &str) {
    let path = format!("/proc/sys/net/ipv4/conf/{iface}/{knob}");
    if let Err(error) = tokio::fs::write(&path, value).await {
        warn!(%path, %error, "failed to write sysctl knob");
    }
}

/// Dispatches one message from the netlink monitor stream. Returns a
/// `LinkEvent` (ifindex, up) when the message was a link state change the
/// daemon's watchers should see.
pub fn process_monitor_msg(
    msg: NetlinkMessage<RtnlMessage>,
) -> Option<LinkEvent> {
    if let NetlinkPayload::InnerMessage(inner) = msg.payload {
        match inner {
            RtnlMessage::NewLink(msg) => {
                trace!(?msg, "received RTM_NEWLINK message");
                return Some(link_message_event(&msg));
            }
            RtnlMessage::DelLink(msg) => {
                trace!(?msg, "received RTM_DELLINK message");
            }
            _ => {}
        }
    }
    None
}

fn link_message_event(msg: &LinkMessage) -> LinkEvent {
    (msg.header.index, link_message_up(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_v4() {
        let bytes = [10u8, 0, 0, 1];
        let net = parse_address(AF_INET as u8, 24, &bytes).unwrap();
        assert_eq!(net.ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(net.prefix(), 24);
    }
}
