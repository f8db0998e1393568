// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-guest backend bookkeeping.
//!
//! Every served guest gets one [`Backend`]: its subscription to the
//! input server, the translation state for that stream and up to
//! [`DEVICES_PER_BACKEND`] virtual devices. The [`Registry`] owns the
//! backends and finds them by domain id.
//!
//! Reports flow through a backend in one direction:
//!
//! ```text
//!   input socket -> RecordStream -> Translator -> ReportAssembler
//!                                                      |
//!                         first pending device that <--+
//!                         accepts the report id
//! ```

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::{debug, error, info, warn};
use thiserror::Error;
use uuid::Uuid;

use hid::reports::Report;
use hid::{DescriptorCatalog, DeviceType};
use usbback::{DeviceState, GrantMapper, VusbDevice};

use crate::input::ReportAssembler;
use crate::input::socket::{InputRecord, RECORD_SIZE, RecordStream};
use crate::input::translator::{Translated, Translator};

/// Most guests served at once.
pub const MAX_BACKENDS: usize = 32;

/// Device slots per guest.
pub const DEVICES_PER_BACKEND: usize = 16;

/// Reports pushed toward a guest per input wakeup. Matches the number
/// of interrupt transfers its driver usually keeps parked.
pub const SENDS_PER_WAKEUP: usize = 2;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Backend table is full")]
    Full,
    #[error("Domain {0} already has a backend")]
    BackendExists(u32),
    #[error("Device table of domain {0} is full")]
    DevicesFull(u32),
    #[error("Device {devid} of domain {domid} already exists")]
    DeviceExists { domid: u32, devid: u32 },
}

/// What a call to [`Backend::pump`] left behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Buffer drained, or the devices cannot take more reports yet.
    Idle,
    /// Send budget spent with at least one record still buffered. The
    /// caller owes this backend another pump without waiting for the
    /// socket to become readable again.
    Rearm,
    /// The input server closed its end of the socket.
    Disconnected,
}

// ============================================================================
// Backend
// ============================================================================

/// One guest's input subscription and device table.
pub struct Backend {
    domid: u32,
    uuid: Uuid,
    domain_path: String,
    devices: Vec<VusbDevice>,
    input: UnixStream,
    stream: RecordStream,
    translator: Translator,
    assembler: ReportAssembler,
}

impl Backend {
    pub fn new(domid: u32, uuid: Uuid, domain_path: String, input: UnixStream) -> Backend {
        Backend {
            domid,
            uuid,
            domain_path,
            devices: Vec::new(),
            input,
            stream: RecordStream::new(),
            translator: Translator::new(),
            assembler: ReportAssembler::new(),
        }
    }

    /// Connect to the input server and subscribe to one domain's events.
    ///
    /// The stream comes back nonblocking, ready for the event loop.
    pub fn open_input<P: AsRef<Path>>(path: P, domid: u32) -> io::Result<UnixStream> {
        let mut stream = UnixStream::connect(path)?;
        stream.write_all(&InputRecord::grab(domid).to_wire())?;
        stream.set_nonblocking(true)?;
        info!("Grabbed input events for domain {domid}");
        Ok(stream)
    }

    pub fn domid(&self) -> u32 {
        self.domid
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn domain_path(&self) -> &str {
        &self.domain_path
    }

    pub fn input(&self) -> &UnixStream {
        &self.input
    }

    pub fn add_device(&mut self, devid: u32, typ: DeviceType) -> Result<()> {
        if self.devices.len() == DEVICES_PER_BACKEND {
            return Err(RegistryError::DevicesFull(self.domid));
        }
        if self.device(devid).is_some() {
            return Err(RegistryError::DeviceExists {
                domid: self.domid,
                devid,
            });
        }
        debug!("Domain {}: adding device {devid} as {typ:?}", self.domid);
        self.devices.push(VusbDevice::new(self.domid, devid, typ));
        Ok(())
    }

    pub fn device(&self, devid: u32) -> Option<&VusbDevice> {
        self.devices.iter().find(|dev| dev.devid() == devid)
    }

    pub fn device_mut(&mut self, devid: u32) -> Option<&mut VusbDevice> {
        self.devices.iter_mut().find(|dev| dev.devid() == devid)
    }

    pub fn remove_device(&mut self, devid: u32) -> Option<VusbDevice> {
        let slot = self.devices.iter().position(|dev| dev.devid() == devid)?;
        Some(self.devices.remove(slot))
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.devices.iter().map(VusbDevice::devid).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// True when every device has an interrupt transfer parked and a
    /// report pushed now would land immediately. A backend with no
    /// devices is trivially ready.
    pub fn all_pending(&mut self) -> bool {
        self.devices.iter_mut().all(VusbDevice::has_pending)
    }

    /// Hand a report to the first pending device that accepts its id.
    ///
    /// Only one device gets it. Returns true when the report reached
    /// the guest.
    pub fn route_report(&mut self, mapper: &dyn GrantMapper, report: &Report) -> bool {
        let report_id = report.report_id;
        for dev in &mut self.devices {
            if !dev.has_pending() || !dev.typ().accepts_report(report_id) {
                continue;
            }
            return match dev.send_report(mapper, report) {
                Ok(sent) => sent,
                Err(e) => {
                    warn!(
                        "Report {report_id} failed on device {} of domain {}: {e}",
                        dev.devid(),
                        self.domid
                    );
                    false
                }
            };
        }
        error!(
            "Could not send report {report_id}, domain {} has no device pending for it",
            self.domid
        );
        false
    }

    /// Drain buffered input into reports and push them at the guest.
    ///
    /// At most [`SENDS_PER_WAKEUP`] reports go out per call, and only
    /// while every device stays ready to take one. A half-filled
    /// multitouch report is flushed at the end, outside the budget, so
    /// a lone finger never waits for a sibling that may not come.
    pub fn pump(&mut self, mapper: &dyn GrantMapper) -> io::Result<PumpOutcome> {
        let mut open = true;
        let mut sents = 0;
        while sents < SENDS_PER_WAKEUP && self.all_pending() {
            open &= self.stream.fill(&mut self.input)?;
            let Some(record) = self.stream.next_record() else {
                break;
            };
            match self.translator.push(record) {
                Translated::Nothing => {}
                Translated::Finger(finger) => {
                    if let Some(report) = self.assembler.push(finger) {
                        self.route_report(mapper, &report);
                        sents += 1;
                    }
                }
                Translated::Report(report) => {
                    self.route_report(mapper, &report);
                    sents += 1;
                }
            }
        }
        if let Some(partial) = self.assembler.take_partial() {
            self.route_report(mapper, &partial);
        }
        if !open {
            return Ok(PumpOutcome::Disconnected);
        }
        if sents == SENDS_PER_WAKEUP && self.stream.buffered() >= RECORD_SIZE {
            Ok(PumpOutcome::Rearm)
        } else {
            Ok(PumpOutcome::Idle)
        }
    }

    /// Serve whatever requests the frontends have published.
    pub fn process_requests(&mut self, mapper: &dyn GrantMapper, catalog: &DescriptorCatalog) {
        for dev in &mut self.devices {
            if dev.state() != DeviceState::Connected {
                continue;
            }
            if let Err(e) = dev.process_requests(mapper, catalog) {
                warn!(
                    "Request processing failed on device {} of domain {}: {e}",
                    dev.devid(),
                    self.domid
                );
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All live backends, at most one per domain.
#[derive(Default)]
pub struct Registry {
    backends: Vec<Backend>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn insert(&mut self, backend: Backend) -> Result<()> {
        if self.backends.len() == MAX_BACKENDS {
            return Err(RegistryError::Full);
        }
        if self.contains(backend.domid()) {
            return Err(RegistryError::BackendExists(backend.domid()));
        }
        self.backends.push(backend);
        Ok(())
    }

    pub fn contains(&self, domid: u32) -> bool {
        self.get(domid).is_some()
    }

    pub fn get(&self, domid: u32) -> Option<&Backend> {
        self.backends.iter().find(|back| back.domid() == domid)
    }

    pub fn get_mut(&mut self, domid: u32) -> Option<&mut Backend> {
        self.backends.iter_mut().find(|back| back.domid() == domid)
    }

    pub fn remove(&mut self, domid: u32) -> Option<Backend> {
        let slot = self
            .backends
            .iter()
            .position(|back| back.domid() == domid)?;
        Some(self.backends.remove(slot))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Backend> {
        self.backends.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn domids(&self) -> Vec<u32> {
        self.backends.iter().map(Backend::domid).collect()
    }
}
