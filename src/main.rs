//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::PathBuf;

use clap::{App, Arg};
use nix::unistd::Uid;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use vrrpd::consts::{DEFAULT_CLI_BIND, DEFAULT_CONFIG_PATH};
use vrrpd::daemon::Daemon;

fn init_tracing(stdout_only: bool) {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("vrrpd=info".parse().unwrap())
        .from_env_lossy();

    let stdout = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(!stdout_only);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .init();
}

fn main() {
    let matches = App::new("vrrpd")
        .version(clap::crate_version!())
        .about("A user-space VRRPv3 (RFC 5798) daemon for Linux")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Path to the binary configuration file"),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("addr:port")
                .help("Control-session bind address"),
        )
        .arg(
            Arg::with_name("stdout")
                .short("s")
                .long("stdout")
                .help("Log without ANSI colors, for non-interactive stdout capture"),
        )
        .get_matches();

    let config_path = matches
        .value_of("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let cli_bind = matches
        .value_of("bind")
        .unwrap_or(DEFAULT_CLI_BIND)
        .to_string();

    init_tracing(matches.is_present("stdout"));

    if !Uid::effective().is_root() {
        eprintln!("vrrpd needs CAP_NET_ADMIN/CAP_NET_RAW, run as root");
        std::process::exit(1);
    }

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    info!("starting up");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(async {
            let local = tokio::task::LocalSet::new();
            local
                .run_until(async move {
                    let (daemon, monitor) = Daemon::new(config_path, cli_bind).await;
                    daemon.run(monitor).await;
                })
                .await;
        });

    info!("shutdown complete");
}

#[allow(dead_code)]
fn log_unreachable_error() {
    error!("unreachable");
}
