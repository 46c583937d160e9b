//
// Copyright (c) The vrrpd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Line-oriented TCP control plane (spec.md §6). Each connection gets its
//! own task that parses one command per line and forwards it to the event
//! loop over a channel; the event loop is the only place state is mutated,
//! so every command here is just parse + round-trip + format.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::daemon::Daemon;
use crate::interface::TimerEvent;
use crate::ip::{AddressFamily, IpSubnet};

pub type ReplyTx = oneshot::Sender<Response>;

#[derive(Debug)]
pub enum Response {
    Ok,
    Text(String),
    Error(String),
}

impl Response {
    fn render(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::Text(text) => text.clone(),
            Response::Error(message) => format!("ERROR: {message}"),
        }
    }
}

impl From<Result<(), crate::error::Error>> for Response {
    fn from(result: Result<(), crate::error::Error>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(error) => Response::Error(error.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Command {
    AddRouter { ifname: String, vrid: u8, family: AddressFamily },
    RemoveRouter { ifname: String, vrid: u8, family: AddressFamily },
    AddAddress { ifname: String, vrid: u8, family: AddressFamily, subnet: IpSubnet },
    RemoveAddress { ifname: String, vrid: u8, family: AddressFamily, subnet: IpSubnet },
    SetPriority { ifname: String, vrid: u8, family: AddressFamily, priority: u8 },
    SetInterval { ifname: String, vrid: u8, family: AddressFamily, interval_cs: u16 },
    SetAccept { ifname: String, vrid: u8, family: AddressFamily, accept: bool },
    SetPreempt { ifname: String, vrid: u8, family: AddressFamily, preempt: bool },
    SetPrimary { ifname: String, vrid: u8, family: AddressFamily, primary: Option<std::net::IpAddr> },
    SetMasterCommand { ifname: String, vrid: u8, family: AddressFamily, command: Option<String> },
    SetBackupCommand { ifname: String, vrid: u8, family: AddressFamily, command: Option<String> },
    Enable { ifname: String, vrid: u8, family: AddressFamily },
    Disable { ifname: String, vrid: u8, family: AddressFamily },
    ShowRouter { ifname: String, vrid: u8, family: AddressFamily },
    ShowStats { ifname: String, vrid: u8, family: AddressFamily },
    Save,
    Help,
}

/// Accepts connections on `bind` forever, one task per connection.
pub async fn serve(bind: String, commands: UnboundedSender<(Command, ReplyTx)>) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%bind, %error, "failed to bind control socket");
            return;
        }
    };
    info!(%bind, "control socket listening");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "failed to accept control connection");
                continue;
            }
        };
        let commands = commands.clone();
        tokio::task::spawn_local(async move {
            if let Err(error) = handle_connection(socket, &commands).await {
                warn!(%peer, %error, "control connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    commands: &UnboundedSender<(Command, ReplyTx)>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }

        let response = match parse(line) {
            Ok(Command::Help) => Response::Text(help_text()),
            Ok(command) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if commands.send((command, reply_tx)).is_err() {
                    Response::Error("daemon shutting down".to_string())
                } else {
                    reply_rx
                        .await
                        .unwrap_or_else(|_| Response::Error("no reply from daemon".to_string()))
                }
            }
            Err(message) => Response::Error(message),
        };

        writer.write_all(response.render().as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

/// Executes a command against live daemon state; called from the event
/// loop, never from a connection task directly (spec.md §5).
pub async fn dispatch(
    daemon: &mut Daemon,
    command: Command,
    timer_tx: &UnboundedSender<TimerEvent>,
) -> Response {
    match command {
        Command::AddRouter { ifname, vrid, family } => {
            daemon.add_router(&ifname, vrid, family).await.into()
        }
        Command::RemoveRouter { ifname, vrid, family } => {
            daemon.remove_router(&ifname, vrid, family, timer_tx).await;
            Response::Ok
        }
        Command::AddAddress { ifname, vrid, family, subnet } => {
            daemon.add_address(&ifname, vrid, family, subnet).into()
        }
        Command::RemoveAddress { ifname, vrid, family, subnet } => {
            daemon.remove_address(&ifname, vrid, family, subnet).into()
        }
        Command::SetPriority { ifname, vrid, family, priority } => {
            daemon.set_priority(&ifname, vrid, family, priority).into()
        }
        Command::SetInterval { ifname, vrid, family, interval_cs } => {
            daemon.set_interval(&ifname, vrid, family, interval_cs).into()
        }
        Command::SetAccept { ifname, vrid, family, accept } => {
            daemon.set_accept(&ifname, vrid, family, accept).into()
        }
        Command::SetPreempt { ifname, vrid, family, preempt } => {
            daemon.set_preempt(&ifname, vrid, family, preempt).into()
        }
        Command::SetPrimary { ifname, vrid, family, primary } => {
            daemon.set_primary(&ifname, vrid, family, primary).into()
        }
        Command::SetMasterCommand { ifname, vrid, family, command } => {
            daemon.set_master_command(&ifname, vrid, family, command).into()
        }
        Command::SetBackupCommand { ifname, vrid, family, command } => {
            daemon.set_backup_command(&ifname, vrid, family, command).into()
        }
        Command::Enable { ifname, vrid, family } => {
            daemon.enable_router(&ifname, vrid, family, timer_tx).await.into()
        }
        Command::Disable { ifname, vrid, family } => {
            daemon.disable_router(&ifname, vrid, family, timer_tx).await.into()
        }
        Command::ShowRouter { ifname, vrid, family } => show_router(daemon, &ifname, vrid, family),
        Command::ShowStats { ifname, vrid, family } => show_stats(daemon, &ifname, vrid, family),
        Command::Save => match daemon.save_config() {
            Ok(()) => Response::Ok,
            Err(error) => Response::Error(error.to_string()),
        },
        Command::Help => Response::Text(help_text()),
    }
}

fn show_router(daemon: &Daemon, ifname: &str, vrid: u8, family: AddressFamily) -> Response {
    let Some(iface) = daemon.registry.get_by_name(ifname) else {
        return Response::Error(crate::error::Error::UnknownInterface(ifname.to_string()).to_string());
    };
    let Some(instance) = iface.instance(vrid, family) else {
        return Response::Error(
            crate::error::Error::UnknownRouter { ifname: ifname.to_string(), vrid }.to_string(),
        );
    };
    Response::Text(format!(
        "vrid={} family={} state={:?} priority={} interval_cs={} accept={} preempt={} addresses={}",
        vrid,
        family,
        instance.state,
        instance.config.priority,
        instance.config.advertise_interval,
        instance.config.accept,
        instance.config.preempt,
        instance
            .config
            .addresses
            .iter()
            .map(|subnet| subnet.to_string())
            .collect::<Vec<_>>()
            .join(","),
    ))
}

fn show_stats(daemon: &Daemon, ifname: &str, vrid: u8, family: AddressFamily) -> Response {
    let Some(iface) = daemon.registry.get_by_name(ifname) else {
        return Response::Error(crate::error::Error::UnknownInterface(ifname.to_string()).to_string());
    };
    let Some(instance) = iface.instance(vrid, family) else {
        return Response::Error(
            crate::error::Error::UnknownRouter { ifname: ifname.to_string(), vrid }.to_string(),
        );
    };
    let stats = &instance.statistics;
    Response::Text(format!(
        "masterTransitions={} rcvdAdvertisements={} advIntervalErrors={} ipTtlErrors={} \
         rcvdPriZeroPackets={} sentPriZeroPackets={} rcvdInvalidTypePackets={} \
         addressListErrors={} packetLengthErrors={}",
        stats.master_transitions,
        stats.rcvd_advertisements,
        stats.adv_interval_errors,
        stats.ip_ttl_errors,
        stats.rcvd_pri_zero_packets,
        stats.sent_pri_zero_packets,
        stats.rcvd_invalid_type_packets,
        stats.address_list_errors,
        stats.packet_length_errors,
    ))
}

fn help_text() -> String {
    [
        "add router <ifname> <vrid> <v4|v6>",
        "remove router <ifname> <vrid> <v4|v6>",
        "add address <ifname> <vrid> <v4|v6> <ip>/<prefix>",
        "remove address <ifname> <vrid> <v4|v6> <ip>/<prefix>",
        "set priority <ifname> <vrid> <v4|v6> <1-255>",
        "set interval <ifname> <vrid> <v4|v6> <1-4095>",
        "set accept <ifname> <vrid> <v4|v6> <on|off>",
        "set preempt <ifname> <vrid> <v4|v6> <on|off>",
        "set primary <ifname> <vrid> <v4|v6> <ip|auto>",
        "set master-command <ifname> <vrid> <v4|v6> <command|none>",
        "set backup-command <ifname> <vrid> <v4|v6> <command|none>",
        "enable <ifname> <vrid> <v4|v6>",
        "disable <ifname> <vrid> <v4|v6>",
        "show router <ifname> <vrid> <v4|v6>",
        "show stats <ifname> <vrid> <v4|v6>",
        "save",
        "exit",
    ]
    .join("\n")
}

fn parse_family(token: &str) -> Result<AddressFamily, String> {
    match token {
        "v4" | "ipv4" => Ok(AddressFamily::Ipv4),
        "v6" | "ipv6" => Ok(AddressFamily::Ipv6),
        other => Err(format!("unknown address family '{other}'")),
    }
}

fn parse_bool(token: &str) -> Result<bool, String> {
    match token {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        other => Err(format!("expected on/off, got '{other}'")),
    }
}

fn parse_vrid(token: &str) -> Result<u8, String> {
    token.parse::<u8>().map_err(|_| format!("invalid vrid '{token}'"))
}

fn parse_subnet(token: &str) -> Result<IpSubnet, String> {
    let (addr, prefix) = token
        .split_once('/')
        .ok_or_else(|| format!("expected ip/prefix, got '{token}'"))?;
    let addr: std::net::IpAddr = addr.parse().map_err(|_| format!("invalid address '{addr}'"))?;
    let prefix: u8 = prefix.parse().map_err(|_| format!("invalid prefix '{prefix}'"))?;
    IpSubnet::new(addr, prefix).map_err(|_| format!("invalid subnet '{token}'"))
}

/// Parses one control-session line (spec.md §6's command grammar).
fn parse(line: &str) -> Result<Command, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["help"] => Ok(Command::Help),
        ["save"] => Ok(Command::Save),
        ["add", "router", ifname, vrid, family] => Ok(Command::AddRouter {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
        }),
        ["remove", "router", ifname, vrid, family] => Ok(Command::RemoveRouter {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
        }),
        ["add", "address", ifname, vrid, family, subnet] => Ok(Command::AddAddress {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            subnet: parse_subnet(subnet)?,
        }),
        ["remove", "address", ifname, vrid, family, subnet] => Ok(Command::RemoveAddress {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            subnet: parse_subnet(subnet)?,
        }),
        ["set", "priority", ifname, vrid, family, priority] => Ok(Command::SetPriority {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            priority: priority.parse().map_err(|_| format!("invalid priority '{priority}'"))?,
        }),
        ["set", "interval", ifname, vrid, family, interval] => Ok(Command::SetInterval {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            interval_cs: interval.parse().map_err(|_| format!("invalid interval '{interval}'"))?,
        }),
        ["set", "accept", ifname, vrid, family, value] => Ok(Command::SetAccept {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            accept: parse_bool(value)?,
        }),
        ["set", "preempt", ifname, vrid, family, value] => Ok(Command::SetPreempt {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            preempt: parse_bool(value)?,
        }),
        ["set", "primary", ifname, vrid, family, value] => Ok(Command::SetPrimary {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
            primary: if *value == "auto" {
                None
            } else {
                Some(value.parse().map_err(|_| format!("invalid address '{value}'"))?)
            },
        }),
        ["set", "master-command", ifname, vrid, family, rest @ ..] => {
            Ok(Command::SetMasterCommand {
                ifname: ifname.to_string(),
                vrid: parse_vrid(vrid)?,
                family: parse_family(family)?,
                command: optional_command(rest),
            })
        }
        ["set", "backup-command", ifname, vrid, family, rest @ ..] => {
            Ok(Command::SetBackupCommand {
                ifname: ifname.to_string(),
                vrid: parse_vrid(vrid)?,
                family: parse_family(family)?,
                command: optional_command(rest),
            })
        }
        ["enable", ifname, vrid, family] => Ok(Command::Enable {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
        }),
        ["disable", ifname, vrid, family] => Ok(Command::Disable {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
        }),
        ["show", "router", ifname, vrid, family] => Ok(Command::ShowRouter {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
        }),
        ["show", "stats", ifname, vrid, family] => Ok(Command::ShowStats {
            ifname: ifname.to_string(),
            vrid: parse_vrid(vrid)?,
            family: parse_family(family)?,
        }),
        _ => Err(format!("unrecognized command: '{line}' (try 'help')")),
    }
}

fn optional_command(rest: &[&str]) -> Option<String> {
    if rest.is_empty() || rest == ["none"] {
        None
    } else {
        Some(rest.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_router() {
        let command = parse("add router eth0 7 v4").unwrap();
        assert!(matches!(
            command,
            Command::AddRouter { vrid: 7, family: AddressFamily::Ipv4, .. }
        ));
    }

    #[test]
    fn parses_set_interval() {
        let command = parse("set interval eth0 7 v4 200").unwrap();
        assert!(matches!(command, Command::SetInterval { interval_cs: 200, .. }));
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse("frobnicate").is_err());
    }

    #[test]
    fn parses_master_command_with_spaces() {
        let command = parse("set master-command eth0 7 v4 logger -t vrrpd master").unwrap();
        match command {
            Command::SetMasterCommand { command: Some(command), .. } => {
                assert_eq!(command, "logger -t vrrpd master");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_clearing_master_command() {
        let command = parse("set master-command eth0 7 v4 none").unwrap();
        assert!(matches!(command, Command::SetMasterCommand { command: None, .. }));
    }
}
