//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-interface state: the instances running on it, its ARP responder
//! (C6, shared by every non-accept-mode Master on the interface) and the
//! cached netlink facts (ifindex, MAC, admin state) that drive link
//! reactivity (spec.md §4.6 "Link reactivity").

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use rtnetlink::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::arp::ArpService;
use crate::daemon::GlobalCounters;
use crate::instance::{transitions, Instance, MasterReason, ProtocolErrReason, State, VrrpTimer};
use crate::ip::AddressFamily;
use crate::mac_addr::MacAddr;
use crate::network::SharedSocket;
use crate::packet::VrrpPacket;
use crate::task::{IntervalTask, TimeoutTask};
use crate::{debug, netlink, registry, subprocess};

/// A timer firing for one instance, replayed into the event loop's select
/// arm so `Engine` never has to recurse into itself from within a spawned
/// task (spec.md §5 "single-threaded cooperative event loop").
#[derive(Clone, Copy, Debug)]
pub enum TimerKind {
    MasterDown,
    Advertise,
}

#[derive(Clone, Copy, Debug)]
pub struct TimerEvent {
    pub ifindex: u32,
    pub vrid: u8,
    pub family: AddressFamily,
    pub kind: TimerKind,
}

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub ifindex: u32,
    pub mac_address: MacAddr,
    pub admin_up: bool,
    /// Keyed by (vrid, family); spec.md §3 allows one instance per VRID per
    /// family on the same interface.
    pub instances: BTreeMap<(u8, AddressFamily), Instance>,
    /// Lazily created the first time a non-accept-mode instance goes
    /// Master; torn down once empty (spec.md §4.4).
    pub arp: Option<ArpService>,
}

impl Interface {
    pub fn new(name: String, ifindex: u32, mac_address: MacAddr) -> Self {
        Interface {
            name,
            ifindex,
            mac_address,
            admin_up: false,
            instances: BTreeMap::new(),
            arp: None,
        }
    }

    pub fn instance(&self, vrid: u8, family: AddressFamily) -> Option<&Instance> {
        self.instances.get(&(vrid, family))
    }

    pub fn instance_mut(
        &mut self,
        vrid: u8,
        family: AddressFamily,
    ) -> Option<&mut Instance> {
        self.instances.get_mut(&(vrid, family))
    }

    fn ensure_arp(&mut self) -> std::io::Result<&mut ArpService> {
        if self.arp.is_none() {
            let service = ArpService::new(self.ifindex as i32, self.mac_address)?;
            self.arp = Some(service);
        }
        Ok(self.arp.as_mut().unwrap())
    }

    pub fn drop_arp_if_unused(&mut self) {
        if matches!(&self.arp, Some(service) if service.is_empty()) {
            self.arp = None;
        }
    }
}

/// Drives one instance's side effects: the pieces `transitions` (pure
/// decisions) cannot express because they need the netlink handle, the
/// shared family sockets and the ARP service.
pub struct Engine<'a> {
    pub handle: &'a Handle,
    pub socket_v4: &'a mut SharedSocket,
    pub socket_v6: &'a mut SharedSocket,
    pub timer_tx: &'a UnboundedSender<TimerEvent>,
    pub counters: &'a mut GlobalCounters,
}

impl<'a> Engine<'a> {
    fn socket_for(&mut self, family: AddressFamily) -> &mut SharedSocket {
        match family {
            AddressFamily::Ipv4 => self.socket_v4,
            AddressFamily::Ipv6 => self.socket_v6,
        }
    }

    /// Enable (spec.md §4.6): Disabled -> Initialize (if the link is up) or
    /// LinkDown. Joins the VRRP multicast group and creates the instance's
    /// macvlan sub-interface (spec.md §3, §4.5 C5) so both exist for the
    /// whole time the instance is not Disabled.
    pub async fn enable(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        let Some(instance) = iface.instances.get(&(vrid, family)) else {
            return;
        };
        if !matches!(instance.state, State::Disabled) {
            return;
        }
        let next = if iface.admin_up {
            State::Initialize
        } else {
            State::LinkDown
        };

        if let Err(error) = self.socket_for(family).join(iface.ifindex) {
            warn!(%error, ifindex = iface.ifindex, "failed to join VRRP multicast group");
        }
        self.create_macvlan(iface, vrid, family).await;

        let instance = iface.instances.get_mut(&(vrid, family)).unwrap();
        instance.state = next;
        debug::Debug::InstanceCreate.log();
        if next == State::Initialize {
            self.startup(iface, vrid, family).await;
        }
    }

    /// Creates the instance's macvlan sub-interface the first time it is
    /// enabled; `output_ifindex` still pointing at the parent is the "not
    /// created yet" sentinel (spec.md §3), so this is a no-op on a later
    /// re-enable.
    async fn create_macvlan(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        let (mac, output_ifindex) = {
            let instance = iface.instances.get(&(vrid, family)).unwrap();
            (instance.virtual_mac, instance.output_ifindex)
        };
        if output_ifindex != iface.ifindex {
            return;
        }
        let name = registry::macvlan_name(iface.ifindex, vrid, family);
        if let Some(new_ifindex) =
            netlink::add_macvlan(self.handle, iface.ifindex, &iface.name, mac, name).await
        {
            let instance = iface.instances.get_mut(&(vrid, family)).unwrap();
            instance.output_ifindex = new_ifindex;
        }
    }

    /// Startup (spec.md §4.6): Initialize -> Master (if address owner or
    /// priority 255) or Backup.
    async fn startup(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        let primary_ip = {
            let instance = iface.instances.get(&(vrid, family)).unwrap();
            match instance.config.primary_ip {
                Some(ip) => Some(ip),
                None => netlink::primary_address(self.handle, iface.ifindex, family).await,
            }
        };

        let instance = iface.instances.get_mut(&(vrid, family)).unwrap();
        if primary_ip.is_none() {
            warn!(vrid, %family, "no primary address available, staying in Initialize");
            return;
        }
        instance.master_ip = primary_ip;

        if instance.is_owner() {
            self.transition_to_master(iface, vrid, family, MasterReason::Priority)
                .await;
        } else {
            let master_down_cs = instance.master_down_interval_cs();
            let master_adv_interval = instance.config.advertise_interval;
            self.arm_master_down(iface, vrid, family, master_down_cs, master_adv_interval);
        }
    }

    /// Shutdown (spec.md §4.6): Backup/Master -> Initialize.
    pub async fn shutdown(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        let was_master = iface
            .instances
            .get(&(vrid, family))
            .map(|instance| instance.state == State::Master)
            .unwrap_or(false);

        if was_master {
            self.send_advertisement(iface, vrid, family, 0).await;
            let instance = iface.instances.get_mut(&(vrid, family)).unwrap();
            instance.statistics.sent_pri_zero_packets += 1;
            self.leave_master(iface, vrid, family).await;
        }

        if let Some(instance) = iface.instances.get_mut(&(vrid, family)) {
            instance.cancel_timer();
            instance.state = State::Initialize;
        }
    }

    /// Full teardown of an instance (spec.md §3 Lifecycle): runs `shutdown`
    /// (priority-0 advertisement if Master, unplumb, cancel timer), then
    /// releases the resources `enable` acquired — the macvlan sub-interface
    /// and the multicast group membership — before the instance is disabled
    /// or removed. Used by `disable router` and by `remove router`, in place
    /// of dropping the registry entry directly.
    pub async fn teardown(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        self.shutdown(iface, vrid, family).await;

        let output_ifindex = iface.instances.get(&(vrid, family)).map(|i| i.output_ifindex);
        if let Some(output_ifindex) = output_ifindex {
            if output_ifindex != iface.ifindex {
                netlink::remove_interface(self.handle, output_ifindex).await;
                let ifindex = iface.ifindex;
                if let Some(instance) = iface.instances.get_mut(&(vrid, family)) {
                    instance.output_ifindex = ifindex;
                }
            }
        }
        self.socket_for(family).leave(iface.ifindex);

        if let Some(instance) = iface.instances.get_mut(&(vrid, family)) {
            instance.state = State::Disabled;
        }
    }

    pub async fn watch_link(&mut self, iface: &mut Interface, up: bool) {
        iface.admin_up = up;
        let keys: Vec<(u8, AddressFamily)> = iface.instances.keys().copied().collect();
        for (vrid, family) in keys {
            let state = iface.instances.get(&(vrid, family)).unwrap().state;
            match (up, state) {
                (true, State::LinkDown) => {
                    iface.instances.get_mut(&(vrid, family)).unwrap().state =
                        State::Initialize;
                    self.startup(iface, vrid, family).await;
                }
                (false, s) if s != State::Disabled && s != State::LinkDown => {
                    self.shutdown(iface, vrid, family).await;
                    iface.instances.get_mut(&(vrid, family)).unwrap().state =
                        State::LinkDown;
                }
                _ => {}
            }
        }
    }

    /// Dispatches a validated advertisement (from `network::IngressOutcome`)
    /// to the owning instance (spec.md §4.3 step 7 / §4.6).
    pub async fn on_advertisement(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
        src: IpAddr,
        priority: u8,
        max_adv_interval: u16,
        addresses: &[IpAddr],
    ) {
        let Some(instance) = iface.instances.get_mut(&(vrid, family)) else {
            warn!(vrid, %family, "advertisement for unknown virtual router id");
            self.counters.router_vrid_errors += 1;
            for instance in iface.instances.values_mut() {
                instance.statistics.protocol_err_reason = Some(ProtocolErrReason::VrIdError);
            }
            return;
        };
        instance.statistics.rcvd_advertisements += 1;
        if priority == 0 {
            instance.statistics.rcvd_pri_zero_packets += 1;
        }
        if !crate::instance::address_multiset_eq(addresses, &instance.config.addresses) {
            instance.statistics.address_list_errors += 1;
        }

        match instance.state {
            State::Backup => {
                let action = transitions::on_advertisement_as_backup(
                    instance.config.priority,
                    instance.config.preempt,
                    priority,
                    max_adv_interval,
                );
                if let transitions::Action::RearmMasterDown { master_down_cs } = action {
                    let own_interval = instance.config.advertise_interval;
                    instance.master_ip = Some(src);
                    if max_adv_interval != own_interval {
                        instance.statistics.adv_interval_errors += 1;
                    }
                    instance.statistics.protocol_err_reason = None;
                    self.arm_master_down(iface, vrid, family, master_down_cs, max_adv_interval);
                }
            }
            State::Master => {
                let instance = iface.instances.get(&(vrid, family)).unwrap();
                let own_primary = instance.master_ip.unwrap_or(src);
                let action = transitions::on_advertisement_as_master(
                    instance.config.priority,
                    own_primary,
                    priority,
                    src,
                    max_adv_interval,
                );
                match action {
                    transitions::Action::ReAdvertiseNow => {
                        self.send_advertisement(iface, vrid, family, instance.config.priority)
                            .await;
                        self.rearm_advertise(iface, vrid, family);
                    }
                    transitions::Action::YieldToBackup { master_down_cs } => {
                        self.leave_master(iface, vrid, family).await;
                        let instance = iface.instances.get_mut(&(vrid, family)).unwrap();
                        instance.state = State::Backup;
                        instance.statistics.master_transitions += 1;
                        instance.statistics.new_master_reason =
                            Some(MasterReason::MasterNotResponding);
                        instance.master_ip = Some(src);
                        self.arm_master_down(iface, vrid, family, master_down_cs, max_adv_interval);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Master-Down timer expiry (spec.md §4.6).
    pub async fn on_master_down_expiry(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
    ) {
        self.transition_to_master(iface, vrid, family, MasterReason::MasterNotResponding)
            .await;
    }

    /// Advertisement timer expiry: re-advertise and re-arm.
    pub async fn on_advertise_expiry(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
    ) {
        let priority = match iface.instances.get(&(vrid, family)) {
            Some(instance) => instance.config.priority,
            None => return,
        };
        self.send_advertisement(iface, vrid, family, priority).await;
        self.rearm_advertise(iface, vrid, family);
    }

    async fn transition_to_master(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
        reason: MasterReason,
    ) {
        {
            let instance = iface.instances.get_mut(&(vrid, family)).unwrap();
            instance.state = State::Master;
            instance.statistics.master_transitions += 1;
            instance.statistics.new_master_reason = Some(reason);
            instance.up_time = Some(chrono_now());
        }

        let output_ifindex = iface.instances.get(&(vrid, family)).unwrap().output_ifindex;
        if output_ifindex != iface.ifindex {
            netlink::set_interface_up(self.handle, output_ifindex, true).await;
        }

        self.plumb_virtual_addresses(iface, vrid, family).await;
        self.announce_master(iface, vrid, family).await;

        let priority = iface.instances.get(&(vrid, family)).unwrap().config.priority;
        self.send_advertisement(iface, vrid, family, priority).await;
        self.rearm_advertise(iface, vrid, family);
        self.run_command(iface, vrid, family, true);

        debug::Debug::InstanceStart.log();
    }

    async fn leave_master(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        self.unplumb_virtual_addresses(iface, vrid, family).await;

        let output_ifindex = iface.instances.get(&(vrid, family)).map(|i| i.output_ifindex);
        if let Some(output_ifindex) = output_ifindex {
            if output_ifindex != iface.ifindex {
                netlink::set_interface_up(self.handle, output_ifindex, false).await;
            }
        }

        self.run_command(iface, vrid, family, false);
    }

    async fn plumb_virtual_addresses(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
    ) {
        let (addresses, accept) = {
            let instance = iface.instances.get(&(vrid, family)).unwrap();
            (instance.config.addresses.clone(), instance.config.accept)
        };

        if accept || family == AddressFamily::Ipv6 {
            for subnet in &addresses {
                netlink::add_address(self.handle, iface.ifindex, subnet.network()).await;
            }
        } else {
            let mac = iface
                .instances
                .get(&(vrid, family))
                .unwrap()
                .virtual_mac;
            if let Ok(arp) = self.register_arp(iface, mac, &addresses) {
                let _ = arp;
            }
        }
    }

    async fn unplumb_virtual_addresses(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
    ) {
        let (addresses, accept) = {
            let instance = iface.instances.get(&(vrid, family)).unwrap();
            (instance.config.addresses.clone(), instance.config.accept)
        };

        if accept || family == AddressFamily::Ipv6 {
            for subnet in &addresses {
                netlink::remove_address(self.handle, iface.ifindex, subnet.network()).await;
            }
        } else if let Some(service) = iface.arp.as_mut() {
            for subnet in &addresses {
                if let IpAddr::V4(addr) = subnet.ip() {
                    service.unregister(addr);
                }
            }
            iface.drop_arp_if_unused();
        }
    }

    fn register_arp(
        &mut self,
        iface: &mut Interface,
        mac: MacAddr,
        addresses: &[crate::ip::IpSubnet],
    ) -> std::io::Result<()> {
        let service = iface.ensure_arp()?;
        for subnet in addresses {
            if let IpAddr::V4(addr) = subnet.ip() {
                service.register(addr, mac);
            }
        }
        Ok(())
    }

    async fn announce_master(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        if family != AddressFamily::Ipv4 {
            return;
        }
        let (mac, addresses, accept) = {
            let instance = iface.instances.get(&(vrid, family)).unwrap();
            (
                instance.virtual_mac,
                instance.config.addresses.clone(),
                instance.config.accept,
            )
        };
        if !accept {
            return;
        }
        if iface.arp.is_none() && iface.ensure_arp().is_err() {
            return;
        }
        let Some(service) = iface.arp.as_ref() else {
            return;
        };
        for subnet in &addresses {
            if let IpAddr::V4(addr) = subnet.ip() {
                let frame = service.gratuitous_frame(mac, addr);
                if let Err(error) = service.send(&frame, [0xff; 6]) {
                    warn!(%error, "failed to send gratuitous ARP");
                }
            }
        }
    }

    async fn send_advertisement(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
        priority: u8,
    ) {
        let Some(instance) = iface.instances.get(&(vrid, family)) else {
            return;
        };
        let addresses: Vec<IpAddr> =
            instance.config.addresses.iter().map(|s| s.ip()).collect();
        let src = instance.master_ip.unwrap_or_else(|| crate::ip::unspecified(family));
        let packet = VrrpPacket::new(
            vrid,
            priority,
            instance.config.advertise_interval,
            addresses,
        );
        if let Err(error) = self.socket_for(family).send(iface.ifindex, src, &packet) {
            warn!(%error, "failed to send advertisement");
        }
    }

    /// Arms (or re-arms) the Master-Down timer. On expiry the timer sends a
    /// [`TimerEvent`] rather than calling back into `Engine` directly, so
    /// nothing here needs a shared, re-entrant handle to the daemon state
    /// (spec.md §5 "single-threaded cooperative event loop").
    fn arm_master_down(
        &mut self,
        iface: &mut Interface,
        vrid: u8,
        family: AddressFamily,
        master_down_cs: u32,
        master_adv_interval: u16,
    ) {
        let Some(instance) = iface.instances.get_mut(&(vrid, family)) else {
            return;
        };
        instance.state = State::Backup;
        instance.master_adv_interval = master_adv_interval;

        match &mut instance.timer {
            VrrpTimer::MasterDownTimer(timer) => {
                timer.reset(Some(Duration::from_millis(master_down_cs as u64 * 10)));
            }
            _ => {
                let tx = self.timer_tx.clone();
                let ifindex = iface.ifindex;
                let timer = TimeoutTask::new(
                    Duration::from_millis(master_down_cs as u64 * 10),
                    move || {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(TimerEvent {
                                ifindex,
                                vrid,
                                family,
                                kind: TimerKind::MasterDown,
                            });
                        }
                    },
                );
                instance.timer = VrrpTimer::MasterDownTimer(timer);
            }
        }
    }

    /// Arms (or re-arms) the periodic advertisement timer after a Master
    /// transition or re-advertisement.
    fn rearm_advertise(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily) {
        let Some(instance) = iface.instances.get_mut(&(vrid, family)) else {
            return;
        };
        let interval = Duration::from_millis(instance.config.advertise_interval as u64 * 10);

        match &mut instance.timer {
            VrrpTimer::AdverTimer(timer) => {
                timer.reset(Some(interval));
            }
            _ => {
                let tx = self.timer_tx.clone();
                let ifindex = iface.ifindex;
                let timer = IntervalTask::new(interval, false, move || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(TimerEvent {
                            ifindex,
                            vrid,
                            family,
                            kind: TimerKind::Advertise,
                        });
                    }
                });
                instance.timer = VrrpTimer::AdverTimer(timer);
            }
        }
    }

    fn run_command(&mut self, iface: &mut Interface, vrid: u8, family: AddressFamily, master: bool) {
        let Some(instance) = iface.instances.get(&(vrid, family)) else {
            return;
        };
        let command = if master {
            &instance.config.master_command
        } else {
            &instance.config.backup_command
        };
        if let Some(command) = command {
            info!(vrid, iface = %iface.name, "running state-transition command");
            subprocess::run_detached(command);
        }
    }
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
