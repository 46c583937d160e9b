//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! The daemon aggregate: owns the service registry, the two shared
//! family sockets, the netlink handle/monitor and the control-plane
//! channels, and runs the single cooperative event loop that drives all
//! of them (spec.md §5, grounded on `holo-interface::Master::run`).

use std::path::PathBuf;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rtnetlink::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{info, warn};

use crate::cli::{self, Command, Response};
use crate::config::{self, RouterRecord};
use crate::instance::{Instance, State};
use crate::interface::{Engine, TimerEvent, TimerKind};
use crate::ip::{AddressFamily, IpSubnet};
use crate::netlink;
use crate::network::{IngressError, IngressOutcome, SharedSocket};
use crate::registry::Registry;

/// Process-wide counters that are not attributable to a single service
/// (spec.md §6 "routerChecksumErrors" et al.) because the VRID in the
/// packet could not be trusted yet when the error was detected.
#[derive(Debug, Default)]
pub struct GlobalCounters {
    pub router_checksum_errors: u64,
    pub router_version_errors: u64,
    pub router_vrid_errors: u64,
}

pub struct Daemon {
    pub registry: Registry,
    pub handle: Handle,
    pub socket_v4: SharedSocket,
    pub socket_v6: SharedSocket,
    pub counters: GlobalCounters,
    pub config_path: PathBuf,
    pub cli_bind: String,
}

impl Daemon {
    pub async fn new(config_path: PathBuf, cli_bind: String) -> (Self, netlink::NetlinkMonitor) {
        let (handle, monitor) = netlink::init().await;
        registry_startup_cleanup(&handle).await;

        let socket_v4 = SharedSocket::new(AddressFamily::Ipv4)
            .expect("failed to open shared IPv4 VRRP socket");
        let socket_v6 = SharedSocket::new(AddressFamily::Ipv6)
            .expect("failed to open shared IPv6 VRRP socket");

        let daemon = Daemon {
            registry: Registry::new(),
            handle,
            socket_v4,
            socket_v6,
            counters: GlobalCounters::default(),
            config_path,
            cli_bind,
        };
        (daemon, monitor)
    }

    /// Loads `self.config_path` and enables every router it describes
    /// (spec.md §6 "startup"). Interfaces named in the file but not present
    /// on the system are skipped with a warning. Must run after the timer
    /// channel exists so that a router loaded straight into Backup gets a
    /// working Master-Down timer.
    pub async fn load_config(&mut self, timer_tx: &UnboundedSender<TimerEvent>) {
        let records = match config::load(&self.config_path) {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, "failed to read configuration file, starting with no routers");
                return;
            }
        };

        let interfaces = netlink::enumerate_interfaces(&self.handle).await;
        let mut loaded = 0;
        for record in records {
            let Some((&ifindex, _)) =
                interfaces.iter().find(|(_, name)| **name == record.ifname)
            else {
                warn!(ifname = %record.ifname, "unknown interface in configuration, skipping");
                continue;
            };
            self.add_router_from_record(ifindex, &record, timer_tx).await;
            loaded += 1;
        }
        crate::debug::Debug::ConfigLoaded(loaded).log();
    }

    async fn add_router_from_record(
        &mut self,
        ifindex: u32,
        record: &RouterRecord,
        timer_tx: &UnboundedSender<TimerEvent>,
    ) {
        let mac = netlink::link_mac_address(&self.handle, ifindex)
            .await
            .unwrap_or_default();
        let name = self
            .registry
            .get(ifindex)
            .map(|iface| iface.name.clone())
            .unwrap_or_else(|| record.ifname.clone());
        let iface = self.registry.get_or_create(ifindex, &name, mac);

        let mut instance = Instance::new(record.vrid, record.family, ifindex);
        instance.config.priority = record.priority;
        instance.config.advertise_interval = record.interval_cs;
        instance.config.accept = record.accept;
        instance.config.preempt = record.preempt;
        instance.config.primary_ip = record.primary_ip;
        instance.config.addresses = record.addresses.clone();
        instance.master_adv_interval = record.interval_cs;
        iface.instances.insert((record.vrid, record.family), instance);

        if record.enabled {
            let mut engine = Engine {
                handle: &self.handle,
                socket_v4: &mut self.socket_v4,
                socket_v6: &mut self.socket_v6,
                timer_tx,
                counters: &mut self.counters,
            };
            let iface = self.registry.get_mut(ifindex).unwrap();
            iface.admin_up = netlink::is_interface_up(&self.handle, ifindex).await;
            engine.enable(iface, record.vrid, record.family).await;
        }
    }

    /// Serializes the live registry back into `RouterRecord`s and writes
    /// `self.config_path` (spec.md §6 "save").
    pub fn save_config(&self) -> std::io::Result<()> {
        let mut records = Vec::new();
        for (ifindex, vrid, family) in self.registry.iter_instances() {
            let iface = self.registry.get(ifindex).unwrap();
            let instance = iface.instance(vrid, family).unwrap();
            records.push(RouterRecord {
                ifname: iface.name.clone(),
                vrid,
                family,
                priority: instance.config.priority,
                interval_cs: instance.config.advertise_interval,
                accept: instance.config.accept,
                preempt: instance.config.preempt,
                enabled: !matches!(instance.state, State::Disabled),
                primary_ip: instance.config.primary_ip,
                addresses: instance.config.addresses.clone(),
            });
        }
        let count = records.len();
        config::save(&self.config_path, &records)?;
        crate::debug::Debug::ConfigSaved(count).log();
        Ok(())
    }

    /// The single cooperative event loop (spec.md §5): link events,
    /// ingress packets on both families, timer expiries and CLI commands
    /// are all handled from one `tokio::select!`, never from concurrently
    /// scheduled tasks mutating shared state.
    pub async fn run(mut self, mut monitor: netlink::NetlinkMonitor) {
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<TimerEvent>();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<(Command, cli::ReplyTx)>();

        self.load_config(&timer_tx).await;
        tokio::task::spawn_local(cli::serve(self.cli_bind.clone(), cmd_tx));

        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

        info!("vrrpd event loop starting");
        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sigquit.recv() => break,
                msg = monitor.next() => {
                    if let Some((msg, _addr)) = msg {
                        if let Some((ifindex, up)) = netlink::process_monitor_msg(msg) {
                            self.on_link_event(ifindex, up, &timer_tx).await;
                        }
                    }
                }
                result = self.socket_v4.recv() => {
                    self.on_ingress(result, &timer_tx).await;
                }
                result = self.socket_v6.recv() => {
                    self.on_ingress(result, &timer_tx).await;
                }
                result = self.poll_arp() => {
                    if let Some((ifindex, frame, dst_mac)) = result {
                        if let Some(iface) = self.registry.get(ifindex) {
                            if let Some(service) = iface.arp.as_ref() {
                                if let Err(error) = service.send(&frame, dst_mac) {
                                    warn!(%error, "failed to send ARP reply");
                                }
                            }
                        }
                    }
                }
                Some(event) = timer_rx.recv() => {
                    self.on_timer(event, &timer_tx).await;
                }
                Some((command, reply)) = cmd_rx.recv() => {
                    let response = self.on_command(command, &timer_tx).await;
                    let _ = reply.send(response);
                }
            }
        }

        info!("signal received, shutting down");
        self.shutdown_all(&timer_tx).await;
    }

    /// Polls every interface's ARP responder for one request frame
    /// (spec.md §4.4 C6). Rebuilt fresh on each call since the set of
    /// active `ArpService`s changes as instances enter/leave Master.
    async fn poll_arp(&self) -> Option<(u32, Vec<u8>, [u8; crate::consts::ETH_ALEN])> {
        let mut polls: FuturesUnordered<_> = self
            .registry
            .interfaces
            .values()
            .filter_map(|iface| {
                iface
                    .arp
                    .as_ref()
                    .map(|arp| async move { (iface.ifindex, arp.poll_request().await) })
            })
            .collect();

        if polls.is_empty() {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves");
        }

        while let Some((ifindex, result)) = polls.next().await {
            match result {
                Ok(Some((frame, dst_mac))) => return Some((ifindex, frame, dst_mac)),
                Ok(None) => continue,
                Err(error) => {
                    warn!(%error, %ifindex, "failed to poll ARP socket");
                    continue;
                }
            }
        }
        None
    }

    /// Tears down every instance at exit (spec.md §4.1, §9): a running
    /// Master sends a priority-0 advertisement before its sub-interface and
    /// multicast membership are released, mirroring `disable_router`.
    async fn shutdown_all(&mut self, timer_tx: &UnboundedSender<TimerEvent>) {
        let instances: Vec<(u32, u8, AddressFamily)> = self.registry.iter_instances().collect();
        for (ifindex, vrid, family) in instances {
            let mut engine = Engine {
                handle: &self.handle,
                socket_v4: &mut self.socket_v4,
                socket_v6: &mut self.socket_v6,
                timer_tx,
                counters: &mut self.counters,
            };
            if let Some(iface) = self.registry.get_mut(ifindex) {
                engine.teardown(iface, vrid, family).await;
            }
        }
    }

    async fn on_link_event(&mut self, ifindex: u32, up: bool, timer_tx: &UnboundedSender<TimerEvent>) {
        let Some(iface) = self.registry.get_mut(ifindex) else {
            return;
        };
        if iface.admin_up == up {
            return;
        }
        let mut engine = Engine {
            handle: &self.handle,
            socket_v4: &mut self.socket_v4,
            socket_v6: &mut self.socket_v6,
            timer_tx,
            counters: &mut self.counters,
        };
        engine.watch_link(iface, up).await;
    }

    async fn on_ingress(
        &mut self,
        result: std::io::Result<IngressOutcome>,
        timer_tx: &UnboundedSender<TimerEvent>,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%error, "failed to read from shared VRRP socket");
                return;
            }
        };

        match outcome {
            IngressOutcome::Drop => {}
            IngressOutcome::NotifyAllOnInterface { ifindex, error } => {
                self.record_global_error(error);
                if let Some(iface) = self.registry.get_mut(ifindex) {
                    for instance in iface.instances.values_mut() {
                        record_instance_error(instance, error);
                    }
                }
            }
            IngressOutcome::NotifyService { ifindex, vrid, error } => {
                self.record_global_error(error);
                if let Some(iface) = self.registry.get_mut(ifindex) {
                    for instance in iface
                        .instances
                        .iter_mut()
                        .filter(|((v, _), _)| *v == vrid)
                        .map(|(_, instance)| instance)
                    {
                        record_instance_error(instance, error);
                    }
                }
            }
            IngressOutcome::Advertisement {
                ifindex,
                src,
                vrid,
                priority,
                max_adv_interval,
                addresses,
            } => {
                let family = crate::ip::AddressFamily::of(&src);
                if self.registry.get(ifindex).is_none() {
                    self.counters.router_vrid_errors += 1;
                    return;
                }
                let mut engine = Engine {
                    handle: &self.handle,
                    socket_v4: &mut self.socket_v4,
                    socket_v6: &mut self.socket_v6,
                    timer_tx,
                    counters: &mut self.counters,
                };
                let iface = self.registry.get_mut(ifindex).unwrap();
                engine
                    .on_advertisement(
                        iface,
                        vrid,
                        family,
                        src,
                        priority,
                        max_adv_interval,
                        &addresses,
                    )
                    .await;
            }
        }
    }

    fn record_global_error(&mut self, error: IngressError) {
        match error {
            IngressError::ChecksumError => self.counters.router_checksum_errors += 1,
            IngressError::VersionError => self.counters.router_version_errors += 1,
            IngressError::VridError => self.counters.router_vrid_errors += 1,
            _ => {}
        }
    }

    async fn on_timer(&mut self, event: TimerEvent, timer_tx: &UnboundedSender<TimerEvent>) {
        let mut engine = Engine {
            handle: &self.handle,
            socket_v4: &mut self.socket_v4,
            socket_v6: &mut self.socket_v6,
            timer_tx,
            counters: &mut self.counters,
        };
        let Some(iface) = self.registry.get_mut(event.ifindex) else {
            return;
        };
        match event.kind {
            TimerKind::MasterDown => {
                engine.on_master_down_expiry(iface, event.vrid, event.family).await;
            }
            TimerKind::Advertise => {
                engine.on_advertise_expiry(iface, event.vrid, event.family).await;
            }
        }
    }

    async fn on_command(
        &mut self,
        command: Command,
        timer_tx: &UnboundedSender<TimerEvent>,
    ) -> Response {
        cli::dispatch(self, command, timer_tx).await
    }

    pub async fn add_router(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
    ) -> Result<(), crate::error::Error> {
        if !crate::instance::validate_vrid(vrid) {
            return Err(crate::error::Error::InvalidVrid(vrid));
        }
        let ifindex = netlink::enumerate_interfaces(&self.handle)
            .await
            .into_iter()
            .find(|(_, name)| name == ifname)
            .map(|(ifindex, _)| ifindex)
            .ok_or_else(|| crate::error::Error::UnknownInterface(ifname.to_string()))?;

        if self
            .registry
            .get(ifindex)
            .and_then(|iface| iface.instance(vrid, family))
            .is_some()
        {
            return Err(crate::error::Error::DuplicateRouter {
                ifname: ifname.to_string(),
                vrid,
            });
        }

        let mac = netlink::link_mac_address(&self.handle, ifindex)
            .await
            .unwrap_or_default();
        let iface = self.registry.get_or_create(ifindex, ifname, mac);
        iface
            .instances
            .insert((vrid, family), Instance::new(vrid, family, ifindex));
        Ok(())
    }

    /// Removes a router from the registry (spec.md §3 Lifecycle). Runs the
    /// same teardown as `disable router` first so a running Master is not
    /// silently abandoned on the wire: priority-0 advertisement, sub-
    /// interface and multicast group release.
    pub async fn remove_router(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        timer_tx: &UnboundedSender<TimerEvent>,
    ) {
        let Some(ifindex) = self.registry.ifindex_of(ifname) else {
            return;
        };
        let mut engine = Engine {
            handle: &self.handle,
            socket_v4: &mut self.socket_v4,
            socket_v6: &mut self.socket_v6,
            timer_tx,
            counters: &mut self.counters,
        };
        if let Some(iface) = self.registry.get_mut(ifindex) {
            engine.teardown(iface, vrid, family).await;
        }
        self.registry.remove(ifindex, vrid, family);
    }

    pub fn add_address(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        subnet: IpSubnet,
    ) -> Result<(), crate::error::Error> {
        let instance = self.lookup_instance_mut(ifname, vrid, family)?;
        instance.config.addresses.push(subnet);
        Ok(())
    }

    pub fn remove_address(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        subnet: IpSubnet,
    ) -> Result<(), crate::error::Error> {
        let instance = self.lookup_instance_mut(ifname, vrid, family)?;
        instance.config.addresses.retain(|s| *s != subnet);
        Ok(())
    }

    pub fn set_priority(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        priority: u8,
    ) -> Result<(), crate::error::Error> {
        if !crate::instance::validate_priority(priority) {
            return Err(crate::error::Error::InvalidPriority(priority));
        }
        self.lookup_instance_mut(ifname, vrid, family)?.config.priority = priority;
        Ok(())
    }

    pub fn set_interval(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        interval_cs: u16,
    ) -> Result<(), crate::error::Error> {
        if !crate::instance::validate_interval(interval_cs) {
            return Err(crate::error::Error::InvalidInterval(interval_cs));
        }
        self.lookup_instance_mut(ifname, vrid, family)?
            .config
            .advertise_interval = interval_cs;
        Ok(())
    }

    pub fn set_accept(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        accept: bool,
    ) -> Result<(), crate::error::Error> {
        self.lookup_instance_mut(ifname, vrid, family)?.config.accept = accept;
        Ok(())
    }

    pub fn set_preempt(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        preempt: bool,
    ) -> Result<(), crate::error::Error> {
        self.lookup_instance_mut(ifname, vrid, family)?.config.preempt = preempt;
        Ok(())
    }

    pub fn set_primary(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        primary: Option<std::net::IpAddr>,
    ) -> Result<(), crate::error::Error> {
        self.lookup_instance_mut(ifname, vrid, family)?.config.primary_ip = primary;
        Ok(())
    }

    pub fn set_master_command(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        command: Option<String>,
    ) -> Result<(), crate::error::Error> {
        self.lookup_instance_mut(ifname, vrid, family)?.config.master_command = command;
        Ok(())
    }

    pub fn set_backup_command(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        command: Option<String>,
    ) -> Result<(), crate::error::Error> {
        self.lookup_instance_mut(ifname, vrid, family)?.config.backup_command = command;
        Ok(())
    }

    pub async fn enable_router(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        timer_tx: &UnboundedSender<TimerEvent>,
    ) -> Result<(), crate::error::Error> {
        let ifindex = self
            .registry
            .ifindex_of(ifname)
            .ok_or_else(|| crate::error::Error::UnknownInterface(ifname.to_string()))?;
        let mut engine = Engine {
            handle: &self.handle,
            socket_v4: &mut self.socket_v4,
            socket_v6: &mut self.socket_v6,
            timer_tx,
            counters: &mut self.counters,
        };
        let iface = self.registry.get_mut(ifindex).unwrap();
        iface.admin_up = netlink::is_interface_up(engine.handle, ifindex).await;
        engine.enable(iface, vrid, family).await;
        Ok(())
    }

    pub async fn disable_router(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
        timer_tx: &UnboundedSender<TimerEvent>,
    ) -> Result<(), crate::error::Error> {
        let ifindex = self
            .registry
            .ifindex_of(ifname)
            .ok_or_else(|| crate::error::Error::UnknownInterface(ifname.to_string()))?;
        let mut engine = Engine {
            handle: &self.handle,
            socket_v4: &mut self.socket_v4,
            socket_v6: &mut self.socket_v6,
            timer_tx,
            counters: &mut self.counters,
        };
        let iface = self.registry.get_mut(ifindex).unwrap();
        engine.teardown(iface, vrid, family).await;
        Ok(())
    }

    fn lookup_instance_mut(
        &mut self,
        ifname: &str,
        vrid: u8,
        family: AddressFamily,
    ) -> Result<&mut Instance, crate::error::Error> {
        let ifindex = self
            .registry
            .ifindex_of(ifname)
            .ok_or_else(|| crate::error::Error::UnknownInterface(ifname.to_string()))?;
        self.registry
            .get_mut(ifindex)
            .and_then(|iface| iface.instance_mut(vrid, family))
            .ok_or_else(|| crate::error::Error::UnknownRouter {
                ifname: ifname.to_string(),
                vrid,
            })
    }
}

fn record_instance_error(instance: &mut Instance, error: IngressError) {
    use crate::instance::ProtocolErrReason;
    let reason = match error {
        IngressError::ChecksumError => Some(ProtocolErrReason::ChecksumError),
        IngressError::VersionError => Some(ProtocolErrReason::VersionError),
        IngressError::VridError => Some(ProtocolErrReason::VrIdError),
        IngressError::TtlError => {
            instance.statistics.ip_ttl_errors += 1;
            Some(ProtocolErrReason::IpTtlError)
        }
        IngressError::PacketLengthError => {
            instance.statistics.packet_length_errors += 1;
            None
        }
        IngressError::InvalidType => {
            instance.statistics.rcvd_invalid_type_packets += 1;
            None
        }
        IngressError::PacketTooShort => None,
    };
    if let Some(reason) = reason {
        instance.statistics.protocol_err_reason = Some(reason);
    }
}

async fn registry_startup_cleanup(handle: &Handle) {
    crate::registry::cleanup_leftover_interfaces(handle).await;
}
