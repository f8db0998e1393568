// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The daemon's event loop.
//!
//! One epoll instance multiplexes every descriptor the daemon cares
//! about and a dispatch token says which flow owns the wakeup:
//!
//! ```text
//!   store socket ----> guest discovery, frontend handshakes, teardown
//!   input sockets ---> report pumping, one backend per fd
//!   event channels --> ring request processing
//!   rearm eventfd ---> continuation of rate-limited pumping
//! ```
//!
//! Everything runs on one thread, so flows never race each other; a
//! backend seen by one handler cannot disappear under it.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use epoll::{ControlOptions, Event, Events};
use log::{debug, error, info, warn};
use thiserror::Error;
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

use hid::{DescriptorCatalog, DeviceType};
use usbback::{DeviceState, GrantMapper, RingNotifier, VusbDevice};

use crate::config::DaemonConfig;
use crate::input::InputGrabber;
use crate::registry::{Backend, PumpOutcome, Registry, RegistryError};
use crate::store::nodes::{
    BUS_NAME, GuestCandidate, VM_ROOT, XenBusState, create_device, destroy_device,
    init_backend_keys, read_frontend_state, ring_info, running_guests, write_backend_state,
};
use crate::store::{Store, StoreError};

/// Watch token for the guest discovery tree.
const TOKEN_VM: &str = "vm";
/// Watch token prefix for a guest's frontend device tree.
const FRONTEND_TOKEN_PREFIX: &str = "fe-";

/// Epoll wakeups fetched per wait.
const EVENT_CAPACITY: usize = 32;
/// A signal can land between flag checks, so the wait never blocks for
/// longer than this.
const POLL_TIMEOUT_MS: i32 = 1000;

pub type Result<T> = std::result::Result<T, ReactorError>;

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),
    #[error("Backend bookkeeping failure: {0}")]
    Registry(#[from] RegistryError),
    #[error("Event loop I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("The configured store cannot deliver watch events")]
    StoreNotPollable,
}

// ============================================================================
// Dispatch tokens
// ============================================================================

// The epoll payload encodes the flow kind in the top bits and the
// owning domain and device below it.

const KIND_SHIFT: u32 = 40;
const DEVID_BITS: u32 = 8;
const DOMID_MASK: u64 = 0xFFFF_FFFF;
const DEVID_MASK: u64 = 0xFF;

const KIND_STORE: u64 = 1;
const KIND_REARM: u64 = 2;
const KIND_INPUT: u64 = 3;
const KIND_EVTCHN: u64 = 4;

fn input_token(domid: u32) -> u64 {
    (KIND_INPUT << KIND_SHIFT) | u64::from(domid)
}

fn evtchn_token(domid: u32, devid: u32) -> u64 {
    (KIND_EVTCHN << KIND_SHIFT) | (u64::from(domid) << DEVID_BITS) | (u64::from(devid) & DEVID_MASK)
}

fn frontend_token(domid: u32) -> String {
    format!("{FRONTEND_TOKEN_PREFIX}{domid}")
}

fn frontend_bus_path(domain_path: &str) -> String {
    format!("{domain_path}/device/{BUS_NAME}")
}

fn frontend_domid(token: &str) -> Option<u32> {
    token.strip_prefix(FRONTEND_TOKEN_PREFIX)?.parse().ok()
}

// ============================================================================
// Event channel seam
// ============================================================================

/// A bound guest event channel, as the loop sees it.
///
/// The real thing wraps the hypervisor's event channel device; tests
/// plug in loopback channels with nothing to poll.
pub trait GuestChannel {
    /// Descriptor to poll for fired notifications, when there is one.
    fn poll_fd(&self) -> Option<RawFd>;
    /// Consume one fired notification and report its local port.
    fn pending(&self) -> io::Result<Option<u32>>;
    /// Re-enable delivery after a fired notification was handled.
    fn unmask(&self, port: u32) -> io::Result<()>;
    /// Handle the device engine kicks after publishing responses.
    fn notifier(&self) -> Box<dyn RingNotifier>;
}

/// Binds the event channel a connecting frontend has published.
pub trait ChannelBinder {
    fn bind(&self, domid: u32, port: u32) -> io::Result<Arc<dyn GuestChannel>>;
}

// ============================================================================
// Reactor
// ============================================================================

/// Single-threaded driver for every backend the daemon serves.
pub struct Reactor<S: Store> {
    store: S,
    mapper: Box<dyn GrantMapper>,
    binder: Box<dyn ChannelBinder>,
    catalog: DescriptorCatalog,
    registry: Registry,
    grabber: InputGrabber,
    /// Bound event channels by (domid, devid).
    channels: HashMap<(u32, u32), Arc<dyn GuestChannel>>,
    /// Backends with input left over after an exhausted send budget.
    rearm_queue: VecDeque<u32>,
    rearm_evt: EventFd,
    epoll_file: File,
    exit: Arc<AtomicBool>,
    input_socket: PathBuf,
    settle: Duration,
    dom0_path: String,
}

impl<S: Store> Reactor<S> {
    pub fn new(
        mut store: S,
        mapper: Box<dyn GrantMapper>,
        binder: Box<dyn ChannelBinder>,
        config: &DaemonConfig,
        exit: Arc<AtomicBool>,
    ) -> Result<Reactor<S>> {
        let dom0_path = store.get_domain_path(0)?;
        let epoll_fd = epoll::create(true)?;
        // SAFETY: the descriptor was just created and nothing else owns it.
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };
        Ok(Reactor {
            store,
            mapper,
            binder,
            catalog: DescriptorCatalog::new(),
            registry: Registry::new(),
            grabber: InputGrabber::default(),
            channels: HashMap::new(),
            rearm_queue: VecDeque::new(),
            rearm_evt: EventFd::new(EFD_NONBLOCK)?,
            epoll_file,
            exit,
            input_socket: config.input_socket.clone(),
            settle: config.settle(),
            dom0_path,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn grabber(&self) -> InputGrabber {
        self.grabber
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Register the discovery watch and serve whatever guests are
    /// already up. The registration itself queues the first event.
    pub fn bootstrap(&mut self) -> Result<()> {
        self.store.watch(VM_ROOT, TOKEN_VM)?;
        self.process_store_events()
    }

    /// Run until the exit flag is raised, then take every backend down.
    pub fn run(&mut self) -> Result<()> {
        let store_fd = self.store.poll_fd().ok_or(ReactorError::StoreNotPollable)?;
        self.epoll_add(store_fd, KIND_STORE << KIND_SHIFT)?;
        self.epoll_add(self.rearm_evt.as_raw_fd(), KIND_REARM << KIND_SHIFT)?;
        self.bootstrap()?;

        let mut events = vec![Event::new(Events::empty(), 0); EVENT_CAPACITY];
        while !self.exit.load(Ordering::SeqCst) {
            let count = match epoll::wait(self.epoll_file.as_raw_fd(), POLL_TIMEOUT_MS, &mut events)
            {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Io(e)),
            };
            for event in &events[..count] {
                let token = event.data;
                self.dispatch(token)?;
            }
            // Replies read while handling events may have stashed watch
            // events that will never wake the store socket again.
            self.process_store_events()?;
        }
        info!("Shutting down");
        self.shutdown();
        Ok(())
    }

    fn dispatch(&mut self, token: u64) -> Result<()> {
        match token >> KIND_SHIFT {
            KIND_STORE => self.process_store_events(),
            KIND_REARM => self.service_rearms(),
            KIND_INPUT => self.pump_input((token & DOMID_MASK) as u32),
            KIND_EVTCHN => self.device_event(
                ((token >> DEVID_BITS) & DOMID_MASK) as u32,
                (token & DEVID_MASK) as u32,
            ),
            other => {
                debug!("Wakeup with unknown token kind {other}");
                Ok(())
            }
        }
    }

    fn epoll_add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        epoll::ctl(
            self.epoll_file.as_raw_fd(),
            ControlOptions::EPOLL_CTL_ADD,
            fd,
            Event::new(Events::EPOLLIN, token),
        )
    }

    fn epoll_del(&self, fd: RawFd) -> io::Result<()> {
        epoll::ctl(
            self.epoll_file.as_raw_fd(),
            ControlOptions::EPOLL_CTL_DEL,
            fd,
            Event::new(Events::empty(), 0),
        )
    }

    // ========================================================================
    // Store flows
    // ========================================================================

    /// Drain queued watch events and run the flow each one belongs to.
    pub fn process_store_events(&mut self) -> Result<()> {
        while let Some(event) = self.store.next_event()? {
            if event.token == TOKEN_VM {
                self.sweep_guests()?;
            } else if let Some(domid) = frontend_domid(&event.token) {
                self.handle_frontend(domid)?;
            } else {
                debug!("Watch fired with unknown token {:?}", event.token);
            }
        }
        Ok(())
    }

    /// Reconcile the backend table with the set of running guests.
    fn sweep_guests(&mut self) -> Result<()> {
        let guests = running_guests(&mut self.store)?;
        for domid in self.registry.domids() {
            if !guests.iter().any(|g| g.domid == domid) {
                info!("Domain {domid} is gone, dropping its backend");
                self.teardown_backend(domid);
            }
        }
        // A stale input subscription is only safe to recycle once its
        // domain has been observed gone.
        if let InputGrabber::Released(prev) = self.grabber {
            if !guests.iter().any(|g| g.domid == prev) {
                self.grabber.reap(prev);
            }
        }
        for guest in &guests {
            if !self.registry.contains(guest.domid) {
                self.spawn_guest(guest);
            }
        }
        Ok(())
    }

    fn spawn_guest(&mut self, guest: &GuestCandidate) {
        let domid = guest.domid;
        if let Err(e) = self.try_spawn(guest) {
            match e {
                ReactorError::Registry(_) => error!("Could not back domain {domid}: {e}"),
                _ => warn!("Could not back domain {domid}: {e}"),
            }
            self.teardown_backend(domid);
            // Covers failures from before the backend was registered.
            self.grabber.release(domid);
        }
    }

    fn try_spawn(&mut self, guest: &GuestCandidate) -> Result<()> {
        let domid = guest.domid;
        if !self.grabber.try_grab(domid) {
            debug!("Input is claimed elsewhere, domain {domid} gets no devices");
            return Ok(());
        }
        let devid = DeviceType::Multi.virtid();
        let domain_path = self.store.get_domain_path(domid)?;
        let input = Backend::open_input(&self.input_socket, domid)?;
        let mut backend = Backend::new(domid, guest.uuid, domain_path.clone(), input);
        backend.add_device(devid, DeviceType::Multi)?;
        let input_fd = backend.input().as_raw_fd();
        self.registry.insert(backend)?;

        create_device(&mut self.store, &self.dom0_path, &domain_path, domid, devid)?;
        init_backend_keys(&mut self.store, &self.dom0_path, domid, devid)?;
        write_backend_state(
            &mut self.store,
            &self.dom0_path,
            domid,
            devid,
            XenBusState::InitWait,
        )?;
        self.store
            .watch(&frontend_bus_path(&domain_path), &frontend_token(domid))?;
        self.epoll_add(input_fd, input_token(domid))?;
        info!("Domain {domid} ({}) gets emulated input devices", guest.uuid);
        Ok(())
    }

    /// React to a change somewhere under a guest's frontend tree.
    fn handle_frontend(&mut self, domid: u32) -> Result<()> {
        let Some(backend) = self.registry.get(domid) else {
            return Ok(());
        };
        let domain_path = backend.domain_path().to_string();
        let devids = backend.device_ids();
        for devid in devids {
            let fe_state = read_frontend_state(&mut self.store, &domain_path, devid)?;
            let dev_state = self
                .registry
                .get(domid)
                .and_then(|b| b.device(devid))
                .map(VusbDevice::state);
            let Some(dev_state) = dev_state else {
                continue;
            };
            match fe_state {
                XenBusState::Initialised if dev_state == DeviceState::Unbound => {
                    self.try_connect(domid, devid, &domain_path)?;
                }
                XenBusState::Closing | XenBusState::Closed => {
                    self.close_device(domid, devid)?;
                }
                XenBusState::Unknown if dev_state == DeviceState::Connected => {
                    // The whole frontend tree vanished under a live device.
                    self.close_device(domid, devid)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Map the published ring, bind the event channel and put the device
    /// into service. Transient failures leave the device unbound; the
    /// next frontend event retries.
    fn try_connect(&mut self, domid: u32, devid: u32, domain_path: &str) -> Result<()> {
        let Some(ring) = ring_info(&mut self.store, domain_path, devid)? else {
            debug!("Device {devid} of domain {domid} has not published its ring yet");
            return Ok(());
        };
        let page = match self.mapper.map(domid, &[ring.ring_ref], true) {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    "Cannot map ring grant {} of domain {domid}: {e}",
                    ring.ring_ref
                );
                return Ok(());
            }
        };
        let chan = match self.binder.bind(domid, ring.event_channel) {
            Ok(chan) => chan,
            Err(e) => {
                warn!(
                    "Cannot bind event channel {} of domain {domid}: {e}",
                    ring.event_channel
                );
                return Ok(());
            }
        };
        let Some(dev) = self
            .registry
            .get_mut(domid)
            .and_then(|b| b.device_mut(devid))
        else {
            return Ok(());
        };
        if let Err(e) = dev.connect(page, chan.notifier()) {
            warn!("Device {devid} of domain {domid} rejected the ring: {e}");
            return Ok(());
        }
        if let Some(fd) = chan.poll_fd() {
            self.epoll_add(fd, evtchn_token(domid, devid))?;
        }
        self.channels.insert((domid, devid), chan);
        write_backend_state(
            &mut self.store,
            &self.dom0_path,
            domid,
            devid,
            XenBusState::Connected,
        )?;
        Ok(())
    }

    /// Take one device out of service and remove its store trees. The
    /// backend goes with it when this was its last device.
    fn close_device(&mut self, domid: u32, devid: u32) -> Result<()> {
        if let Some(chan) = self.channels.remove(&(domid, devid)) {
            if let Some(fd) = chan.poll_fd() {
                let _ = self.epoll_del(fd);
            }
        }
        let Some(backend) = self.registry.get_mut(domid) else {
            return Ok(());
        };
        let Some(dev) = backend.device_mut(devid) else {
            return Ok(());
        };
        dev.disconnect();
        backend.remove_device(devid);
        let domain_path = backend.domain_path().to_string();
        let empty = backend.device_count() == 0;
        destroy_device(
            &mut self.store,
            &self.dom0_path,
            &domain_path,
            domid,
            devid,
            self.settle,
        )?;
        if empty {
            info!("Domain {domid} has no devices left");
            self.teardown_backend(domid);
        }
        Ok(())
    }

    /// Drop a whole backend: devices, store trees, watches and the
    /// input subscription.
    fn teardown_backend(&mut self, domid: u32) {
        let Some(mut backend) = self.registry.remove(domid) else {
            return;
        };
        let _ = self
            .store
            .unwatch(&frontend_bus_path(backend.domain_path()), &frontend_token(domid));
        let _ = self.epoll_del(backend.input().as_raw_fd());
        for devid in backend.device_ids() {
            if let Some(chan) = self.channels.remove(&(domid, devid)) {
                if let Some(fd) = chan.poll_fd() {
                    let _ = self.epoll_del(fd);
                }
            }
            if let Some(dev) = backend.device_mut(devid) {
                dev.disconnect();
            }
            if let Err(e) = destroy_device(
                &mut self.store,
                &self.dom0_path,
                backend.domain_path(),
                domid,
                devid,
                self.settle,
            ) {
                warn!("Could not remove device {devid} of domain {domid}: {e}");
            }
        }
        // Closing the input socket is what gives the subscription up.
        drop(backend);
        self.grabber.release(domid);
        info!("Backend for domain {domid} destroyed");
    }

    fn shutdown(&mut self) {
        for domid in self.registry.domids() {
            self.teardown_backend(domid);
        }
        let _ = self.store.unwatch(VM_ROOT, TOKEN_VM);
    }

    // ========================================================================
    // Input and ring flows
    // ========================================================================

    /// Push buffered input at a backend. A hung-up input server takes
    /// the backend down; an exhausted send budget queues a rearm.
    pub fn pump_input(&mut self, domid: u32) -> Result<()> {
        let Some(backend) = self.registry.get_mut(domid) else {
            return Ok(());
        };
        match backend.pump(&*self.mapper) {
            Ok(PumpOutcome::Idle) => {}
            Ok(PumpOutcome::Rearm) => {
                self.rearm_queue.push_back(domid);
                self.rearm_evt.write(1)?;
            }
            Ok(PumpOutcome::Disconnected) => {
                warn!("Input server hung up on domain {domid}");
                self.teardown_backend(domid);
            }
            Err(e) => {
                warn!("Input stream of domain {domid} failed: {e}");
                self.teardown_backend(domid);
            }
        }
        Ok(())
    }

    /// Resume pumping for backends that ran out of budget last time.
    /// Only the backends queued so far get a turn; re-queues wait for
    /// the next wakeup.
    pub fn service_rearms(&mut self) -> Result<()> {
        let _ = self.rearm_evt.read();
        let batch: Vec<u32> = self.rearm_queue.drain(..).collect();
        for domid in batch {
            self.pump_input(domid)?;
        }
        Ok(())
    }

    /// A guest kicked an event channel: serve its ring, then see if the
    /// freshly parked transfers unblock input delivery.
    pub fn device_event(&mut self, domid: u32, devid: u32) -> Result<()> {
        let Some(chan) = self.channels.get(&(domid, devid)).map(Arc::clone) else {
            return Ok(());
        };
        let fired = match chan.pending() {
            Ok(fired) => fired,
            Err(e) => {
                warn!("Event channel of device {devid} of domain {domid} failed: {e}");
                return Ok(());
            }
        };
        if let Some(backend) = self.registry.get_mut(domid) {
            backend.process_requests(&*self.mapper, &self.catalog);
        }
        if let Some(port) = fired {
            if let Err(e) = chan.unmask(port) {
                warn!("Cannot unmask event channel port {port}: {e}");
            }
        }
        self.pump_input(domid)
    }
}
