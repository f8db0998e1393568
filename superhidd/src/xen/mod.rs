// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hypervisor plumbing through the xen character devices.
//!
//! Two kernel devices carry everything the backend needs: evtchn for
//! interdomain event channels and gntdev for mapping pages a frontend
//! has granted. Both are wrapped here behind the seams the transport
//! engine already uses, so the rest of the daemon never sees an ioctl.

pub mod evtchn;
pub mod gntdev;

pub use evtchn::EventChannel;
pub use gntdev::GrantDevice;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use usbback::RingNotifier;

use crate::reactor::{ChannelBinder, GuestChannel};

/// Event channel device node.
pub const EVTCHN_DEVICE: &str = "/dev/xen/evtchn";

/// Grant mapping device node.
pub const GNTDEV_DEVICE: &str = "/dev/xen/gntdev";

/// Binds guest event channels through the evtchn device.
pub struct XenBinder {
    device: PathBuf,
}

impl XenBinder {
    pub fn new<P: Into<PathBuf>>(device: P) -> XenBinder {
        XenBinder {
            device: device.into(),
        }
    }
}

struct XenGuestChannel {
    chan: Arc<EventChannel>,
}

impl GuestChannel for XenGuestChannel {
    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.chan.as_raw_fd())
    }

    fn pending(&self) -> io::Result<Option<u32>> {
        self.chan.pending()
    }

    fn unmask(&self, port: u32) -> io::Result<()> {
        self.chan.unmask(port)
    }

    fn notifier(&self) -> Box<dyn RingNotifier> {
        Box::new(evtchn::ChannelNotifier(Arc::clone(&self.chan)))
    }
}

impl ChannelBinder for XenBinder {
    fn bind(&self, domid: u32, port: u32) -> io::Result<Arc<dyn GuestChannel>> {
        let chan = EventChannel::bind(&self.device, domid, port)?;
        Ok(Arc::new(XenGuestChannel {
            chan: Arc::new(chan),
        }))
    }
}
