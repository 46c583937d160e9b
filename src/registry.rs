//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Service registry (C9): the two-level index from interface to the
//! VRRP instances running on it, plus the startup/shutdown sweeps that
//! keep leftover macvlan sub-interfaces from surviving a crash
//! (spec.md §4.7, §9).

use std::collections::BTreeMap;

use rtnetlink::Handle;
use tracing::{info, warn};

use crate::consts::VRRP_IFACE_PREFIX;
use crate::interface::Interface;
use crate::ip::AddressFamily;
use crate::mac_addr::MacAddr;

#[derive(Debug, Default)]
pub struct Registry {
    pub interfaces: BTreeMap<u32, Interface>,
    by_name: BTreeMap<String, u32>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn get_or_create(
        &mut self,
        ifindex: u32,
        name: &str,
        mac_address: MacAddr,
    ) -> &mut Interface {
        self.by_name.insert(name.to_string(), ifindex);
        self.interfaces
            .entry(ifindex)
            .or_insert_with(|| Interface::new(name.to_string(), ifindex, mac_address))
    }

    pub fn get(&self, ifindex: u32) -> Option<&Interface> {
        self.interfaces.get(&ifindex)
    }

    pub fn get_mut(&mut self, ifindex: u32) -> Option<&mut Interface> {
        self.interfaces.get_mut(&ifindex)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Interface> {
        self.by_name.get(name).and_then(|ifindex| self.interfaces.get(ifindex))
    }

    pub fn ifindex_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Tears down every virtual router on `ifindex` (VRID, family) and, if
    /// the interface no longer carries any instance, drops its ARP service
    /// — used at both explicit `remove router` and at exit.
    pub fn remove(&mut self, ifindex: u32, vrid: u8, family: AddressFamily) {
        if let Some(iface) = self.interfaces.get_mut(&ifindex) {
            iface.instances.remove(&(vrid, family));
            iface.drop_arp_if_unused();
        }
    }

    pub fn iter_instances(
        &self,
    ) -> impl Iterator<Item = (u32, u8, AddressFamily)> + '_ {
        self.interfaces.iter().flat_map(|(ifindex, iface)| {
            iface
                .instances
                .keys()
                .map(move |(vrid, family)| (*ifindex, *vrid, *family))
        })
    }
}

/// Destroys any `vrrp.*` macvlan interface left behind by a previous,
/// uncleanly terminated run (spec.md §9 "startup cleanup").
pub async fn cleanup_leftover_interfaces(handle: &Handle) {
    let leftovers = crate::netlink::enumerate_interfaces(handle)
        .await
        .into_iter()
        .filter(|(_, name)| name.starts_with(VRRP_IFACE_PREFIX));

    for (ifindex, name) in leftovers {
        info!(ifindex, %name, "removing leftover macvlan interface from a previous run");
        if !crate::netlink::remove_interface(handle, ifindex).await {
            warn!(ifindex, %name, "failed to remove leftover interface");
        }
    }
}

/// Expected sub-interface name for a virtual router (spec.md §3).
pub fn macvlan_name(parent_ifindex: u32, vrid: u8, family: AddressFamily) -> String {
    format!("{VRRP_IFACE_PREFIX}{parent_ifindex}.{}.{vrid}", family as u8)
}
