// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! SuperHID backend daemon.
//!
//! The daemon watches the node store for guests coming up, offers each
//! one a paravirtualized USB HID device, and bridges two worlds once
//! the guest's frontend connects:
//!
//! ```text
//!   input server ──socket──> translator ──reports──> vusb ring ──> guest
//!   node store   ──watches─> discovery, handshake, teardown
//! ```
//!
//! Device modeling and the ring transport live in the `hid` and
//! `usbback` crates; this crate owns policy: which guest gets input,
//! when devices appear and disappear, and the event loop that drives
//! it all.

pub mod config;
pub mod input;
pub mod reactor;
pub mod registry;
pub mod seccomp_filters;
pub mod store;
pub mod xen;

pub use config::DaemonConfig;
pub use reactor::{ChannelBinder, GuestChannel, Reactor, ReactorError};
pub use registry::{Backend, Registry};
pub use store::{MemStore, Store};
