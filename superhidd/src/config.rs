// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! Everything has a baked-in default matching a stock host, so the
//! daemon runs with no file at all. A JSON config file can override
//! any subset of the fields, and the command line sits on top of both.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::xen::{EVTCHN_DEVICE, GNTDEV_DEVICE};

/// Socket the node store daemon listens on.
pub const DEFAULT_STORE_SOCKET: &str = "/var/run/xenstored/socket";

/// Socket the input server hands out events on.
pub const DEFAULT_INPUT_SOCKET: &str = "/var/run/input_socket";

/// Seconds a closing device gets to acknowledge before its nodes go.
pub const DEFAULT_SETTLE_SECONDS: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// What to do with syscalls outside the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeccompMode {
    /// Filter on, stray syscalls trap.
    On,
    /// No filter.
    Off,
    /// Filter on, stray syscalls only logged.
    Log,
}

impl FromStr for SeccompMode {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "true" | "on" => Ok(SeccompMode::On),
            "false" | "off" => Ok(SeccompMode::Off),
            "log" => Ok(SeccompMode::Log),
            _ => Err("Expected true, false or log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket of the node store.
    #[serde(default = "default_store_socket")]
    pub store_socket: PathBuf,
    /// Socket of the input server.
    #[serde(default = "default_input_socket")]
    pub input_socket: PathBuf,
    /// Event channel device node.
    #[serde(default = "default_evtchn_device")]
    pub evtchn_device: PathBuf,
    /// Grant mapping device node.
    #[serde(default = "default_gntdev_device")]
    pub gntdev_device: PathBuf,
    /// Seconds a closing device may take to go offline.
    #[serde(default = "default_settle_seconds")]
    pub settle_seconds: u64,
    /// Syscall filter behavior.
    #[serde(default = "default_seccomp")]
    pub seccomp: SeccompMode,
}

fn default_store_socket() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_SOCKET)
}

fn default_input_socket() -> PathBuf {
    PathBuf::from(DEFAULT_INPUT_SOCKET)
}

fn default_evtchn_device() -> PathBuf {
    PathBuf::from(EVTCHN_DEVICE)
}

fn default_gntdev_device() -> PathBuf {
    PathBuf::from(GNTDEV_DEVICE)
}

fn default_settle_seconds() -> u64 {
    DEFAULT_SETTLE_SECONDS
}

fn default_seccomp() -> SeccompMode {
    SeccompMode::On
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            store_socket: default_store_socket(),
            input_socket: default_input_socket(),
            evtchn_device: default_evtchn_device(),
            gntdev_device: default_gntdev_device(),
            settle_seconds: default_settle_seconds(),
            seccomp: default_seccomp(),
        }
    }
}

impl DaemonConfig {
    /// Read a config file. Missing fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DaemonConfig> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }
}
