//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! VRRP service (C8): the per-(interface, VRID, family) protocol state
//! machine (spec.md §4.6). Drives the timer (C2), netlink (C5), ARP (C6)
//! and shared-socket (C7) components, and exposes configuration and
//! statistics.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::{PRIORITY_OWNER, VRID_MAX, VRID_MIN};
use crate::ip::{AddressFamily, IpAddrExt, IpSubnet};
use crate::mac_addr::MacAddr;
use crate::task::{IntervalTask, TimeoutTask};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disabled,
    LinkDown,
    Initialize,
    Backup,
    Master,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MasterReason {
    NotMaster,
    Priority,
    Preempted,
    MasterNotResponding,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ProtocolErrReason {
    NoError,
    IpTtlError,
    VersionError,
    ChecksumError,
    VrIdError,
}

/// Operator-controlled configuration of one virtual router
/// (spec.md §3 "config:").
#[derive(Clone, Debug)]
pub struct InstanceConfig {
    pub priority: u8,
    /// Centiseconds, 1..=4095.
    pub advertise_interval: u16,
    pub preempt: bool,
    pub accept: bool,
    /// `None` ⇒ auto-derive from the kernel at enable time.
    pub primary_ip: Option<IpAddr>,
    pub master_command: Option<String>,
    pub backup_command: Option<String>,
    pub addresses: Vec<IpSubnet>,
}

impl InstanceConfig {
    pub fn new(family: AddressFamily) -> Self {
        InstanceConfig {
            priority: crate::consts::PRIORITY_DEFAULT,
            advertise_interval: crate::consts::ADVER_INT_DEFAULT_CS,
            preempt: true,
            accept: family == AddressFamily::Ipv6,
            primary_ip: None,
            master_command: None,
            backup_command: None,
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub master_transitions: u32,
    pub new_master_reason: Option<MasterReason>,
    pub rcvd_advertisements: u64,
    pub adv_interval_errors: u64,
    pub ip_ttl_errors: u64,
    pub protocol_err_reason: Option<ProtocolErrReason>,
    pub rcvd_pri_zero_packets: u64,
    pub sent_pri_zero_packets: u64,
    pub rcvd_invalid_type_packets: u64,
    pub address_list_errors: u64,
    pub packet_length_errors: u64,
    pub discontinuity_time: Option<DateTime<Utc>>,
}

pub enum VrrpTimer {
    Null,
    AdverTimer(IntervalTask),
    MasterDownTimer(TimeoutTask),
}

impl std::fmt::Debug for VrrpTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VrrpTimer::Null => write!(f, "Null"),
            VrrpTimer::AdverTimer(_) => write!(f, "AdverTimer"),
            VrrpTimer::MasterDownTimer(_) => write!(f, "MasterDownTimer"),
        }
    }
}

/// One (interface, VRID, family) service. This struct holds the protocol
/// state only; the sockets, netlink handle and ARP registries it drives
/// live in `Interface`/`Daemon` and are passed in by reference from the
/// caller (spec.md §9 "avoid lazy singletons").
#[derive(Debug)]
pub struct Instance {
    pub vrid: u8,
    pub family: AddressFamily,
    pub ifindex: u32,
    /// Output interface: the macvlan sub-interface if created, else the
    /// owning interface (spec.md §3).
    pub output_ifindex: u32,
    pub virtual_mac: MacAddr,

    pub config: InstanceConfig,

    pub state: State,
    pub master_adv_interval: u16,
    pub pending_reason: MasterReason,
    pub master_ip: Option<IpAddr>,
    pub up_time: Option<DateTime<Utc>>,

    pub timer: VrrpTimer,
    pub statistics: Statistics,
}

impl Instance {
    pub fn new(
        vrid: u8,
        family: AddressFamily,
        ifindex: u32,
    ) -> Self {
        Instance {
            vrid,
            family,
            ifindex,
            output_ifindex: ifindex,
            virtual_mac: crate::ip::virtual_mac(family, vrid),
            config: InstanceConfig::new(family),
            state: State::Disabled,
            master_adv_interval: crate::consts::ADVER_INT_DEFAULT_CS,
            pending_reason: MasterReason::NotMaster,
            master_ip: None,
            up_time: None,
            timer: VrrpTimer::Null,
            statistics: Statistics::default(),
        }
    }

    /// `skewTime = ⌊(256 − priority) × masterAdvInterval / 256⌋`, centiseconds
    /// (spec.md §3).
    pub fn skew_time_cs(&self) -> u32 {
        (256 - self.config.priority as u32) * self.master_adv_interval as u32
            / 256
    }

    /// `masterDownInterval = 3 × masterAdvInterval + skewTime`, centiseconds.
    pub fn master_down_interval_cs(&self) -> u32 {
        3 * self.master_adv_interval as u32 + self.skew_time_cs()
    }

    fn advertise_duration(&self) -> Duration {
        Duration::from_millis(self.config.advertise_interval as u64 * 10)
    }

    fn master_down_duration(&self) -> Duration {
        Duration::from_millis(self.master_down_interval_cs() as u64 * 10)
    }

    /// True iff this service is the address owner (spec.md §3).
    pub fn is_owner(&self) -> bool {
        self.config.priority == PRIORITY_OWNER
    }

    pub fn cancel_timer(&mut self) {
        self.timer = VrrpTimer::Null;
    }
}

/// Validates a configuration write before it is applied
/// (spec.md §4.6 "Configuration semantics").
pub fn validate_vrid(vrid: u8) -> bool {
    (VRID_MIN..=VRID_MAX).contains(&vrid)
}

pub fn validate_priority(priority: u8) -> bool {
    priority >= crate::consts::PRIORITY_MIN
}

pub fn validate_interval(interval_cs: u16) -> bool {
    (crate::consts::ADVER_INT_MIN_CS..=crate::consts::ADVER_INT_MAX_CS)
        .contains(&interval_cs)
}

/// Multiset equality of two address lists (spec.md §9 "Open questions":
/// the mismatch check is defined here as multiset equality, decided
/// explicitly rather than inherited from the source's asymmetric
/// comparison).
pub fn address_multiset_eq(a: &[IpAddr], b: &[IpSubnet]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<IpAddr> = a.to_vec();
    a_sorted.sort_by(|x, y| x.bytewise_cmp(y));
    let mut b_sorted: Vec<IpAddr> = b.iter().map(|s| s.ip()).collect();
    b_sorted.sort_by(|x, y| x.bytewise_cmp(y));
    a_sorted == b_sorted
}

pub mod transitions {
    //! Pure decision functions for the state machine (spec.md §4.6),
    //! separated from their side effects (timer arming, netlink/ARP
    //! plumbing, subprocess invocation) so they can be unit tested without
    //! a live event loop. `Engine` (in `interface.rs`) calls these and then
    //! performs the side effects they describe.

    use super::*;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Action {
        None,
        /// Transition to Master: arm advertisement timer, plumb, announce.
        BecomeMaster(MasterReason),
        /// Transition (or re-arm) as Backup at the given master-down
        /// interval (centiseconds).
        BecomeBackup { master_down_cs: u32, reason: MasterReason },
        /// Re-arm Master-Down without a state change.
        RearmMasterDown { master_down_cs: u32 },
        /// Yield mastership: unplumb, go to Backup.
        YieldToBackup { master_down_cs: u32 },
        /// Re-send an advertisement immediately and re-arm.
        ReAdvertiseNow,
    }

    /// spec.md §4.6 "Ingress advertisement", Backup branch.
    pub fn on_advertisement_as_backup(
        own_priority: u8,
        preempt: bool,
        rx_priority: u8,
        rx_max_adv_interval: u16,
    ) -> Action {
        if rx_priority == 0 {
            let skew = (256 - own_priority as u32) * rx_max_adv_interval as u32 / 256;
            return Action::RearmMasterDown { master_down_cs: skew };
        }
        if !preempt || rx_priority >= own_priority {
            let skew = (256 - own_priority as u32) * rx_max_adv_interval as u32 / 256;
            let master_down_cs = 3 * rx_max_adv_interval as u32 + skew;
            return Action::RearmMasterDown { master_down_cs };
        }
        // preempt && rx_priority < own_priority: stay put, note reason.
        Action::None
    }

    /// spec.md §4.6 "Ingress advertisement", Master branch.
    pub fn on_advertisement_as_master(
        own_priority: u8,
        own_primary_ip: IpAddr,
        rx_priority: u8,
        rx_sender: IpAddr,
        rx_max_adv_interval: u16,
    ) -> Action {
        if rx_priority == 0 {
            return Action::ReAdvertiseNow;
        }
        let yield_to_sender = rx_priority > own_priority
            || (rx_priority == own_priority
                && rx_sender.bytewise_cmp(&own_primary_ip) == std::cmp::Ordering::Greater);
        if yield_to_sender {
            let skew = (256 - own_priority as u32) * rx_max_adv_interval as u32 / 256;
            let master_down_cs = 3 * rx_max_adv_interval as u32 + skew;
            Action::YieldToBackup { master_down_cs }
        } else {
            Action::None
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn backup_accepts_equal_priority_when_not_preempting() {
            let action = on_advertisement_as_backup(100, true, 100, 100);
            assert!(matches!(action, Action::RearmMasterDown { .. }));
        }

        #[test]
        fn backup_ignores_lower_priority_when_preempting() {
            let action = on_advertisement_as_backup(150, true, 100, 100);
            assert_eq!(action, Action::None);
        }

        #[test]
        fn backup_ignores_lower_priority_when_preempting_is_none() {
            let action = on_advertisement_as_backup(150, true, 100, 100);
            assert!(matches!(action, Action::None));
        }

        #[test]
        fn master_yields_to_higher_priority() {
            let a: IpAddr = "10.0.0.1".parse().unwrap();
            let b: IpAddr = "10.0.0.2".parse().unwrap();
            let action = on_advertisement_as_master(100, a, 150, b, 100);
            assert!(matches!(action, Action::YieldToBackup { .. }));
        }

        #[test]
        fn master_holds_against_lower_priority() {
            let a: IpAddr = "10.0.0.1".parse().unwrap();
            let b: IpAddr = "10.0.0.2".parse().unwrap();
            let action = on_advertisement_as_master(150, a, 100, b, 100);
            assert_eq!(action, Action::None);
        }

        #[test]
        fn master_tie_break_uses_bytewise_sender_address() {
            let own: IpAddr = "10.0.0.5".parse().unwrap();
            let lower: IpAddr = "10.0.0.1".parse().unwrap();
            let higher: IpAddr = "10.0.0.9".parse().unwrap();
            assert_eq!(
                on_advertisement_as_master(100, own, 100, lower, 100),
                Action::None
            );
            assert!(matches!(
                on_advertisement_as_master(100, own, 100, higher, 100),
                Action::YieldToBackup { .. }
            ));
        }

        #[test]
        fn priority_zero_triggers_immediate_readvertise_from_master() {
            let a: IpAddr = "10.0.0.1".parse().unwrap();
            let b: IpAddr = "10.0.0.2".parse().unwrap();
            assert_eq!(
                on_advertisement_as_master(100, a, 0, b, 100),
                Action::ReAdvertiseNow
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skew_and_master_down_interval() {
        let mut instance = Instance::new(1, AddressFamily::Ipv4, 2);
        instance.config.priority = 1;
        instance.master_adv_interval = 4095;
        // B2: priority=1, interval=4095 must not overflow.
        assert!(instance.skew_time_cs() > 0);
        assert!(instance.master_down_interval_cs() > 3 * 4095);
    }

    #[test]
    fn priority_owner_detection() {
        let mut instance = Instance::new(1, AddressFamily::Ipv4, 2);
        instance.config.priority = 255;
        assert!(instance.is_owner());
    }

    #[test]
    fn address_multiset_eq_ignores_order() {
        let a: Vec<IpAddr> = vec![
            "10.0.0.11".parse().unwrap(),
            "10.0.0.10".parse().unwrap(),
        ];
        let b = vec![
            IpSubnet::new("10.0.0.10".parse().unwrap(), 24).unwrap(),
            IpSubnet::new("10.0.0.11".parse().unwrap(), 24).unwrap(),
        ];
        assert!(address_multiset_eq(&a, &b));
    }

    #[test]
    fn address_multiset_eq_detects_mismatch() {
        let a: Vec<IpAddr> = vec!["10.0.0.10".parse().unwrap()];
        let b = vec![
            IpSubnet::new("10.0.0.10".parse().unwrap(), 24).unwrap(),
            IpSubnet::new("10.0.0.11".parse().unwrap(), 24).unwrap(),
        ];
        assert!(!address_multiset_eq(&a, &b));
    }

    #[test]
    fn validate_vrid_range() {
        assert!(validate_vrid(1));
        assert!(validate_vrid(255));
        assert!(!validate_vrid(0));
    }

    #[test]
    fn validate_interval_range() {
        assert!(validate_interval(1));
        assert!(validate_interval(4095));
        assert!(!validate_interval(0));
        assert!(!validate_interval(4096));
    }
}
