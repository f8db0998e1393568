// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One emulated HID device behind a frontend ring.
//!
//! A device is created unbound, connected once the frontend has published
//! its ring grant and event channel, and then driven from two directions:
//! ring interrupts pull requests off the shared page, and the input side
//! pushes completed reports into parked interrupt transfers.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info, warn};
use thiserror::Error;
use vm_memory::{ByteValued, Bytes};

use hid::reports::Report;
use hid::{DescriptorCatalog, DeviceType, REPORT_LENGTH, SetupPacket, handle_setup};

use crate::mapper::{GrantMapper, GrantPages};
use crate::pending::{PendingEntry, PendingQueue};
use crate::protocol::{RING_PAGE_SIZE, RequestType, UrbRequest, UrbResponse, UrbStatus, UsbSpeed};
use crate::ring::{BackRing, RingError};

/// Kicks the frontend's event channel after a response is published.
pub trait RingNotifier {
    fn notify(&self) -> io::Result<()>;
}

/// Notifier that only counts kicks. Used by tests and loopback setups that
/// poll the ring instead of listening on an event channel.
#[derive(Clone, Default)]
pub struct CountingNotifier {
    count: Arc<AtomicUsize>,
}

impl CountingNotifier {
    pub fn new() -> Self {
        CountingNotifier::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl RingNotifier for CountingNotifier {
    fn notify(&self) -> io::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device is not connected")]
    NotConnected,
    #[error("Device already has a ring")]
    AlreadyConnected,
    #[error("Ring transfer failed: {0}")]
    Ring(#[from] RingError),
    #[error("Event channel notification failed: {0}")]
    Notify(#[source] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Created in the store, ring not mapped yet.
    Unbound,
    /// Ring mapped and event channel bound.
    Connected,
    /// Torn down. The device keeps its slot until removed.
    Closed,
}

pub struct VusbDevice {
    domid: u32,
    devid: u32,
    typ: DeviceType,
    state: DeviceState,
    ring: BackRing,
    ring_page: Option<Box<dyn GrantPages>>,
    notifier: Option<Box<dyn RingNotifier>>,
    pending: PendingQueue,
}

impl VusbDevice {
    pub fn new(domid: u32, devid: u32, typ: DeviceType) -> Self {
        VusbDevice {
            domid,
            devid,
            typ,
            state: DeviceState::Unbound,
            ring: BackRing::new(),
            ring_page: None,
            notifier: None,
            pending: PendingQueue::new(),
        }
    }

    pub fn domid(&self) -> u32 {
        self.domid
    }

    pub fn devid(&self) -> u32 {
        self.devid
    }

    pub fn typ(&self) -> DeviceType {
        self.typ
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Binds the mapped ring page and the response notifier. The device
    /// starts serving requests once this returns.
    pub fn connect(
        &mut self,
        ring_page: Box<dyn GrantPages>,
        notifier: Box<dyn RingNotifier>,
    ) -> Result<(), DeviceError> {
        if self.state != DeviceState::Unbound {
            return Err(DeviceError::AlreadyConnected);
        }
        let len = ring_page.pages().len();
        if len < RING_PAGE_SIZE {
            return Err(DeviceError::Ring(RingError::PageTooSmall(len)));
        }
        self.ring_page = Some(ring_page);
        self.notifier = Some(notifier);
        self.state = DeviceState::Connected;
        info!(
            "Device {}/{} connected as {:?}",
            self.domid, self.devid, self.typ
        );
        Ok(())
    }

    /// Unmaps the ring and drops outstanding work.
    pub fn disconnect(&mut self) {
        self.ring_page = None;
        self.notifier = None;
        self.pending = PendingQueue::new();
        self.state = DeviceState::Closed;
        info!("Device {}/{} disconnected", self.domid, self.devid);
    }

    /// True if at least one interrupt transfer is parked and waiting for a
    /// report.
    pub fn has_pending(&mut self) -> bool {
        self.state == DeviceState::Connected && self.pending.has_live()
    }

    pub fn pending_live(&self) -> usize {
        self.pending.live_count()
    }

    /// Drains every request the frontend has published and completes the
    /// ones that do not have to wait for input. Returns the number of
    /// requests consumed.
    pub fn process_requests(
        &mut self,
        mapper: &dyn GrantMapper,
        catalog: &DescriptorCatalog,
    ) -> Result<usize, DeviceError> {
        if self.state != DeviceState::Connected {
            return Err(DeviceError::NotConnected);
        }
        let mut handled = 0;
        loop {
            let req = {
                let pages = self.ring_page.as_ref().ok_or(DeviceError::NotConnected)?;
                self.ring.next_request(&pages.pages())?
            };
            let Some(req) = req else {
                break;
            };
            self.handle_request(mapper, catalog, &req)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Completes the oldest parked interrupt transfer with a report.
    ///
    /// Returns true once the report has reached the guest. A grant that
    /// cannot be mapped right now leaves the transfer parked; the report is
    /// dropped either way.
    pub fn send_report(
        &mut self,
        mapper: &dyn GrantMapper,
        report: &Report,
    ) -> Result<bool, DeviceError> {
        if self.state != DeviceState::Connected {
            return Err(DeviceError::NotConnected);
        }
        let Some(entry) = self.pending.front() else {
            return Ok(false);
        };
        let mapped = match mapper.map(self.domid, &[entry.gref], true) {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!("Report page map failed for request {}: {e}", entry.id);
                return Ok(false);
            }
        };
        let write = mapped
            .pages()
            .write_slice(report.as_slice(), usize::from(entry.offset));
        if let Err(e) = write {
            // The transfer points outside its own granted page. It can
            // never complete, so fail it instead of wedging the queue.
            warn!("Report write failed for request {}: {e}", entry.id);
            self.pending.pop_front();
            self.respond(UrbResponse::new(entry.id, -1, 0, UrbStatus::Error))?;
            return Ok(false);
        }
        self.pending.pop_front();
        self.respond(UrbResponse::new(
            entry.id,
            REPORT_LENGTH as i32,
            0,
            UrbStatus::Okay,
        ))?;
        Ok(true)
    }

    fn handle_request(
        &mut self,
        mapper: &dyn GrantMapper,
        catalog: &DescriptorCatalog,
        req: &UrbRequest,
    ) -> Result<(), DeviceError> {
        match RequestType::try_from(req.typ) {
            Ok(RequestType::Control) => self.handle_control(mapper, catalog, req),
            Ok(RequestType::Int) => self.handle_interrupt(req),
            Ok(RequestType::Cancel) => self.handle_cancel(req),
            Ok(RequestType::Reset) => {
                debug!("Port reset for device {}/{}", self.domid, self.devid);
                self.respond(UrbResponse::new(req.id, 0, 0, UrbStatus::Okay))
            }
            Ok(RequestType::AbortPipe) => {
                self.respond(UrbResponse::new(req.id, 0, 0, UrbStatus::Okay))
            }
            Ok(RequestType::GetSpeed) => self.respond(UrbResponse::new(
                req.id,
                0,
                UsbSpeed::High as u32,
                UrbStatus::Okay,
            )),
            Ok(other) => {
                debug!("Unsupported transfer type {other:?} from domain {}", self.domid);
                self.respond(UrbResponse::new(req.id, -1, 0, UrbStatus::NotSupported))
            }
            Err(_) => {
                debug!("Unknown transfer type {} from domain {}", req.typ, self.domid);
                self.respond(UrbResponse::new(req.id, -1, 0, UrbStatus::NotSupported))
            }
        }
    }

    fn handle_control(
        &mut self,
        mapper: &dyn GrantMapper,
        catalog: &DescriptorCatalog,
        req: &UrbRequest,
    ) -> Result<(), DeviceError> {
        if req.nr_segments != 1 {
            debug!(
                "Control request {} carries {} segments",
                req.id, req.nr_segments
            );
            return self.respond(UrbResponse::new(req.id, -1, 0, UrbStatus::Error));
        }
        let setup = SetupPacket::from_wire(req.setup);
        let mapped = match mapper.map(self.domid, &req.gref[..1], true) {
            Ok(mapped) => Some(mapped),
            Err(e) => {
                warn!("Control data map failed for request {}: {e}", req.id);
                None
            }
        };
        let result = match &mapped {
            Some(mapped) => {
                let pages = mapped.pages();
                let offset = usize::from(req.offset);
                match pages.len().checked_sub(offset) {
                    Some(room) => {
                        let mut buf = vec![0u8; room];
                        match handle_setup(setup, Some(&mut buf), self.typ, catalog) {
                            Ok(len) => {
                                let written = usize::from(len);
                                match pages.write_slice(&buf[..written], offset) {
                                    Ok(()) => Ok(len),
                                    Err(e) => {
                                        warn!(
                                            "Control data write failed for request {}: {e}",
                                            req.id
                                        );
                                        return self.respond(UrbResponse::new(
                                            req.id,
                                            -1,
                                            0,
                                            UrbStatus::Error,
                                        ));
                                    }
                                }
                            }
                            Err(stall) => Err(stall),
                        }
                    }
                    // Data stage points past the end of the granted page.
                    None => handle_setup(setup, None, self.typ, catalog),
                }
            }
            None => handle_setup(setup, None, self.typ, catalog),
        };
        match result {
            Ok(len) => self.respond(UrbResponse::new(req.id, i32::from(len), 0, UrbStatus::Okay)),
            Err(_) => self.respond(UrbResponse::new(req.id, -1, 0, UrbStatus::NotSupported)),
        }
    }

    fn handle_interrupt(&mut self, req: &UrbRequest) -> Result<(), DeviceError> {
        let entry = PendingEntry {
            id: req.id,
            gref: req.gref[0],
            offset: req.offset,
        };
        if let Err(e) = self.pending.enqueue(entry) {
            // No response: the guest retries once earlier transfers drain.
            error!(
                "Dropping interrupt request {} from domain {}: {e}",
                req.id, self.domid
            );
        }
        Ok(())
    }

    fn handle_cancel(&mut self, req: &UrbRequest) -> Result<(), DeviceError> {
        let target = req.setup;
        if self.pending.cancel(target) {
            self.respond(UrbResponse::new(target, 0, 0, UrbStatus::Canceled))?;
            self.respond(UrbResponse::new(req.id, 0, 0, UrbStatus::Okay))
        } else {
            debug!("Cancel for unknown request {target}");
            self.respond(UrbResponse::new(req.id, -1, 0, UrbStatus::Error))
        }
    }

    fn respond(&mut self, rsp: UrbResponse) -> Result<(), DeviceError> {
        let pages = self.ring_page.as_ref().ok_or(DeviceError::NotConnected)?;
        self.ring.push_response(&pages.pages(), &rsp)?;
        self.notifier
            .as_ref()
            .ok_or(DeviceError::NotConnected)?
            .notify()
            .map_err(DeviceError::Notify)?;
        Ok(())
    }
}
