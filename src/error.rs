//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Operator-facing errors: configuration and control-plane requests that
//! are rejected before they reach the protocol state machine (spec.md §6).
//! Wire-level validation failures are `network::IngressError` instead —
//! those are per-packet counters, not rejections of an operator action.

use tracing::{warn, warn_span};

#[derive(Debug)]
pub enum Error {
    Io(IoError),
    UnknownInterface(String),
    UnknownRouter { ifname: String, vrid: u8 },
    DuplicateRouter { ifname: String, vrid: u8 },
    InvalidVrid(u8),
    InvalidPriority(u8),
    InvalidInterval(u16),
    FamilyMismatch,
}

#[derive(Debug)]
pub enum IoError {
    ConfigLoad(std::io::Error),
    ConfigSave(std::io::Error),
    SocketError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        warn_span!("control").in_scope(|| {
            warn!("{}", self);
        });
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(error) => error.fmt(f),
            Error::UnknownInterface(ifname) => {
                write!(f, "unknown interface '{ifname}'")
            }
            Error::UnknownRouter { ifname, vrid } => {
                write!(f, "no router with vrid {vrid} on '{ifname}'")
            }
            Error::DuplicateRouter { ifname, vrid } => {
                write!(f, "router with vrid {vrid} already exists on '{ifname}'")
            }
            Error::InvalidVrid(vrid) => {
                write!(f, "vrid {vrid} out of range (1-255)")
            }
            Error::InvalidPriority(priority) => {
                write!(f, "priority {priority} out of range (1-255)")
            }
            Error::InvalidInterval(interval) => {
                write!(f, "advertise interval {interval} out of range (1-4095 centiseconds)")
            }
            Error::FamilyMismatch => {
                write!(f, "address family does not match the router's configured family")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::Io(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        warn!(error = %with_source(self), "{}", self);
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::ConfigLoad(..) => write!(f, "failed to load configuration file"),
            IoError::ConfigSave(..) => write!(f, "failed to save configuration file"),
            IoError::SocketError(..) => write!(f, "socket operation failed"),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::ConfigLoad(error)
            | IoError::ConfigSave(error)
            | IoError::SocketError(error) => Some(error),
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
