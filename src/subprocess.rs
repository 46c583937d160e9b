//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Fire-and-forget execution of the operator-configured master/backup
//! commands (spec.md §4.6, grounded on the original `scriptrunner`'s
//! detached-process model).

use tokio::process::Command;
use tracing::warn;

/// Spawns `command` through `/bin/sh -c` and does not wait for it: a
/// misbehaving or long-running hook must never stall the event loop.
pub fn run_detached(command: &str) {
    let command = command.to_string();
    let mut child = match Command::new("/bin/sh").arg("-c").arg(&command).spawn() {
        Ok(child) => child,
        Err(error) => {
            warn!(%command, %error, "failed to spawn state-transition command");
            return;
        }
    };
    tokio::task::spawn_local(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%command, %status, "state-transition command exited with an error");
            }
            Err(error) => {
                warn!(%command, %error, "failed to wait on state-transition command");
            }
            _ => {}
        }
    });
}
