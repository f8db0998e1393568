// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interdomain event channels through the evtchn character device.
//!
//! Binding to a port the frontend advertised yields a local port on a
//! fresh device fd. The kernel signals a firing by making the fd
//! readable with the port number; writing the port back unmasks it for
//! the next one. Kicks toward the frontend go out with an ioctl.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem::size_of;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use vmm_sys_util::ioctl::{_IOC_NONE, ioctl_with_ref};
use vmm_sys_util::ioctl_ioc_nr;

use usbback::RingNotifier;

/// ioctl type of the evtchn device.
const EVTCHN_MAGIC: u32 = b'E' as u32;

#[repr(C)]
struct BindInterdomain {
    remote_domain: u32,
    remote_port: u32,
}

#[repr(C)]
struct PortArg {
    port: u32,
}

ioctl_ioc_nr!(
    EVTCHN_BIND_INTERDOMAIN,
    _IOC_NONE,
    EVTCHN_MAGIC,
    1,
    size_of::<BindInterdomain>() as u32
);
ioctl_ioc_nr!(
    EVTCHN_UNBIND,
    _IOC_NONE,
    EVTCHN_MAGIC,
    3,
    size_of::<PortArg>() as u32
);
ioctl_ioc_nr!(
    EVTCHN_NOTIFY,
    _IOC_NONE,
    EVTCHN_MAGIC,
    4,
    size_of::<PortArg>() as u32
);

/// One bound interdomain channel on its own device fd.
pub struct EventChannel {
    file: File,
    port: u32,
}

impl EventChannel {
    /// Bind to the port a frontend published for its ring.
    pub fn bind<P: AsRef<Path>>(
        device: P,
        remote_domain: u32,
        remote_port: u32,
    ) -> io::Result<EventChannel> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(device)?;
        let bind = BindInterdomain {
            remote_domain,
            remote_port,
        };
        // SAFETY: the fd is the open evtchn device and the argument is
        // the bind structure this ioctl takes.
        let port = unsafe { ioctl_with_ref(&file, EVTCHN_BIND_INTERDOMAIN(), &bind) };
        if port < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("Bound local port {port} to {remote_domain}:{remote_port}");
        Ok(EventChannel {
            file,
            port: port as u32,
        })
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// The port of the next unhandled firing, if any.
    pub fn pending(&self) -> io::Result<Option<u32>> {
        let mut raw = [0u8; size_of::<u32>()];
        match (&self.file).read_exact(&mut raw) {
            Ok(()) => Ok(Some(u32::from_ne_bytes(raw))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Re-enable delivery after a firing has been handled.
    pub fn unmask(&self, port: u32) -> io::Result<()> {
        (&self.file).write_all(&port.to_ne_bytes())
    }

    /// Kick the remote end of the channel.
    pub fn notify(&self) -> io::Result<()> {
        let arg = PortArg { port: self.port };
        // SAFETY: the fd is the open evtchn device and the argument is
        // the port structure this ioctl takes.
        let ret = unsafe { ioctl_with_ref(&self.file, EVTCHN_NOTIFY(), &arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        let arg = PortArg { port: self.port };
        // SAFETY: the fd is the open evtchn device and the argument is
        // the port structure this ioctl takes.
        let ret = unsafe { ioctl_with_ref(&self.file, EVTCHN_UNBIND(), &arg) };
        if ret < 0 {
            warn!(
                "Failed to unbind port {}: {}",
                self.port,
                io::Error::last_os_error()
            );
        }
    }
}

/// Shares a bound channel with the ring as its response notifier.
pub(crate) struct ChannelNotifier(pub(crate) Arc<EventChannel>);

impl RingNotifier for ChannelNotifier {
    fn notify(&self) -> io::Result<()> {
        EventChannel::notify(&self.0)
    }
}
