// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Daemon entry point.
//!
//! Wires the host plumbing into the reactor: the node store socket,
//! the xen devices, signal handling and the syscall filter.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use log::info;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use superhidd::config::DaemonConfig;
use superhidd::reactor::Reactor;
use superhidd::seccomp_filters::get_seccomp_filter;
use superhidd::store::wire::SocketStore;
use superhidd::xen::{GrantDevice, XenBinder};

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let matches = Command::new("superhidd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("The SuperHID Authors")
        .about("Emulated USB HID devices for guest domains")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("xenstore-socket")
                .long("xenstore-socket")
                .value_name("PATH")
                .help("Socket of the xenstore daemon"),
        )
        .arg(
            Arg::new("input-socket")
                .long("input-socket")
                .value_name("PATH")
                .help("Socket of the input server"),
        )
        .arg(
            Arg::new("gntdev")
                .long("gntdev")
                .value_name("PATH")
                .help("Grant mapping device"),
        )
        .arg(
            Arg::new("evtchn")
                .long("evtchn")
                .value_name("PATH")
                .help("Event channel device"),
        )
        .arg(
            Arg::new("seccomp")
                .long("seccomp")
                .value_name("WHEN")
                .value_parser(["true", "false", "log"])
                .help("Enable or disable the syscall filter"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Raise the log level, repeat for more detail"),
        )
        .get_matches();

    let default_level = match matches.get_count("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            DaemonConfig::load(path).with_context(|| format!("Reading config {path}"))?
        }
        None => DaemonConfig::default(),
    };
    if let Some(path) = matches.get_one::<String>("xenstore-socket") {
        config.store_socket = path.into();
    }
    if let Some(path) = matches.get_one::<String>("input-socket") {
        config.input_socket = path.into();
    }
    if let Some(path) = matches.get_one::<String>("gntdev") {
        config.gntdev_device = path.into();
    }
    if let Some(path) = matches.get_one::<String>("evtchn") {
        config.evtchn_device = path.into();
    }
    if let Some(mode) = matches.get_one::<String>("seccomp") {
        config.seccomp = mode.parse().map_err(anyhow::Error::msg)?;
    }

    let exit = Arc::new(AtomicBool::new(false));
    for signal in TERM_SIGNALS {
        flag::register(*signal, Arc::clone(&exit))
            .with_context(|| format!("Registering handler for signal {signal}"))?;
    }

    let store = SocketStore::connect(&config.store_socket)
        .with_context(|| format!("Connecting to store at {}", config.store_socket.display()))?;
    let mapper = GrantDevice::open(&config.gntdev_device)
        .with_context(|| format!("Opening {}", config.gntdev_device.display()))?;
    let binder = XenBinder::new(config.evtchn_device.clone());

    let filter = get_seccomp_filter(config.seccomp).context("Building the seccomp filter")?;
    if !filter.is_empty() {
        seccompiler::apply_filter(&filter).context("Applying the seccomp filter")?;
    }

    info!("superhidd {} serving guest input devices", env!("CARGO_PKG_VERSION"));
    let mut reactor = Reactor::new(store, Box::new(mapper), Box::new(binder), &config, exit)?;
    reactor.run()?;
    Ok(())
}
