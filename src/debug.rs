//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::{debug, debug_span};

use crate::packet::VrrpPacket;

// VRRP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceCreate,
    InstanceDelete,
    InstanceStart,
    InstanceStop(InstanceInactiveReason),
    // Network
    PacketRx(&'a IpAddr, &'a VrrpPacket),
    PacketTx(&'a IpAddr, &'a VrrpPacket),
    // Control plane
    ConfigLoaded(usize),
    ConfigSaved(usize),
    CliCommand(&'a str),
}

// Reason why a VRRP instance is inactive.
#[derive(Debug)]
pub enum InstanceInactiveReason {
    AdminDown,
    MissingRouterId,
}

// ===== impl Debug =====

impl<'a> Debug<'a> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceCreate | Debug::InstanceDelete | Debug::InstanceStart => {
                debug_span!("virtual_router").in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::InstanceStop(reason) => {
                debug_span!("virtual_router").in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::PacketRx(src, packet) => {
                debug_span!("network").in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(&packet).unwrap();
                        debug!(%src, %data, "{}", self);
                    })
                })
            }
            Debug::PacketTx(addr, packet) => {
                debug_span!("network").in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data = serde_json::to_string(&packet).unwrap();
                        debug!(%addr, %data, "{}", self);
                    })
                })
            }
            Debug::ConfigLoaded(count) | Debug::ConfigSaved(count) => {
                debug_span!("config").in_scope(|| {
                    debug!(count, "{}", self);
                });
            }
            Debug::CliCommand(line) => {
                debug_span!("cli").in_scope(|| {
                    debug!(%line, "{}", self);
                });
            }
        }
    }
}

impl<'a> std::fmt::Display for Debug<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceCreate => write!(f, "instance created"),
            Debug::InstanceDelete => write!(f, "instance deleted"),
            Debug::InstanceStart => write!(f, "starting instance"),
            Debug::InstanceStop(..) => write!(f, "stopping instance"),
            Debug::PacketRx(..) | Debug::PacketTx(..) => write!(f, "packet"),
            Debug::ConfigLoaded(..) => write!(f, "configuration loaded"),
            Debug::ConfigSaved(..) => write!(f, "configuration saved"),
            Debug::CliCommand(..) => write!(f, "command received"),
        }
    }
}

// ===== impl InstanceInactiveReason =====

impl std::fmt::Display for InstanceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InstanceInactiveReason::MissingRouterId => {
                write!(f, "missing router-id")
            }
        }
    }
}
