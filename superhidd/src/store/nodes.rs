// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device node lifecycle and guest discovery.
//!
//! Backend and frontend trees for a virtual device are created together
//! in one transaction so the guest never sees a half-built device.
//! Teardown follows the bus convention: flag the device offline, wait for
//! both ends to settle, then remove both trees.

use std::time::{Duration, Instant};

use log::{debug, error, warn};
use uuid::Uuid;

use super::{Perm, PermEntry, Result, Store, StoreError};

/// Root node the toolstack keeps per-guest state under.
pub const VM_ROOT: &str = "/vm";
/// Root node the VM manager keeps guest records under.
pub const VMS_ROOT: &str = "/xenmgr/vms";
/// Bus name of the virtual devices this daemon backs.
pub const BUS_NAME: &str = "vusb";

/// Reported bus number of every emulated device.
const USB_BUS: u32 = 1;

const SETTLE_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Bus states
// ============================================================================

/// Device handshake states, as published in the `state` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum XenBusState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
}

impl TryFrom<u32> for XenBusState {
    type Error = &'static str;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(XenBusState::Unknown),
            1 => Ok(XenBusState::Initialising),
            2 => Ok(XenBusState::InitWait),
            3 => Ok(XenBusState::Initialised),
            4 => Ok(XenBusState::Connected),
            5 => Ok(XenBusState::Closing),
            6 => Ok(XenBusState::Closed),
            _ => Err("Unknown bus state"),
        }
    }
}

impl XenBusState {
    /// Parse a `state` node. Anything unreadable counts as [`Unknown`],
    /// which is also what a missing node reports.
    ///
    /// [`Unknown`]: XenBusState::Unknown
    pub fn parse(text: &str) -> XenBusState {
        text.trim()
            .parse::<u32>()
            .ok()
            .and_then(|v| XenBusState::try_from(v).ok())
            .unwrap_or(XenBusState::Unknown)
    }

    fn node_value(self) -> String {
        (self as u32).to_string()
    }
}

// ============================================================================
// Paths
// ============================================================================

pub fn backend_path(dom0_path: &str, domid: u32, devid: u32) -> String {
    format!("{dom0_path}/backend/{BUS_NAME}/{domid}/{devid}")
}

pub fn frontend_path(domain_path: &str, devid: u32) -> String {
    format!("{domain_path}/device/{BUS_NAME}/{devid}")
}

/// Read a node that may legitimately be absent.
pub fn read_optional<S: Store + ?Sized>(store: &mut S, path: &str) -> Result<Option<String>> {
    match store.read(path) {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Device nodes
// ============================================================================

/// Create the backend and frontend trees for one virtual device.
///
/// Both trees and all their keys land in a single transaction, replayed
/// until it commits. The guest owns its frontend tree; each side can read
/// the other's.
pub fn create_device<S: Store + ?Sized>(
    store: &mut S,
    dom0_path: &str,
    domain_path: &str,
    domid: u32,
    devid: u32,
) -> Result<()> {
    let bepath = backend_path(dom0_path, domid, devid);
    let fepath = frontend_path(domain_path, devid);
    debug!("Creating {BUS_NAME} nodes for device {devid} of domain {domid}");

    super::retry_transaction(store, |store| {
        store.mkdir(&bepath)?;
        store.set_perms(
            &bepath,
            &[
                PermEntry::new(0, Perm::empty()),
                PermEntry::new(domid, Perm::READ),
            ],
        )?;
        store.mkdir(&fepath)?;
        store.set_perms(
            &fepath,
            &[
                PermEntry::new(domid, Perm::empty()),
                PermEntry::new(0, Perm::READ),
            ],
        )?;

        store.write(&format!("{fepath}/backend-id"), "0")?;
        store.write(&format!("{fepath}/virtual-device"), &devid.to_string())?;
        store.write(&format!("{fepath}/backend"), &bepath)?;
        store.write(
            &format!("{fepath}/state"),
            &XenBusState::Initialising.node_value(),
        )?;

        store.write(&format!("{bepath}/domain"), &format!("Domain-{domid}"))?;
        store.write(&format!("{bepath}/frontend"), &fepath)?;
        store.write(
            &format!("{bepath}/state"),
            &XenBusState::Initialising.node_value(),
        )?;
        store.write(&format!("{bepath}/online"), "1")?;
        store.write(&format!("{bepath}/frontend-id"), &domid.to_string())?;
        store.write(
            &format!("{bepath}/physical-device"),
            &format!("{USB_BUS:x}.{devid:x}"),
        )?;
        Ok(())
    })
}

/// Write the protocol keys the frontend checks before connecting.
pub fn init_backend_keys<S: Store + ?Sized>(
    store: &mut S,
    dom0_path: &str,
    domid: u32,
    devid: u32,
) -> Result<()> {
    let bepath = backend_path(dom0_path, domid, devid);
    store.write(&format!("{bepath}/version"), "3")?;
    store.write(&format!("{bepath}/feature-barrier"), "1")?;
    Ok(())
}

pub fn write_backend_state<S: Store + ?Sized>(
    store: &mut S,
    dom0_path: &str,
    domid: u32,
    devid: u32,
    state: XenBusState,
) -> Result<()> {
    let bepath = backend_path(dom0_path, domid, devid);
    store.write(&format!("{bepath}/state"), &state.node_value())
}

pub fn read_frontend_state<S: Store + ?Sized>(
    store: &mut S,
    domain_path: &str,
    devid: u32,
) -> Result<XenBusState> {
    let fepath = frontend_path(domain_path, devid);
    Ok(read_optional(store, &format!("{fepath}/state"))?
        .map_or(XenBusState::Unknown, |s| XenBusState::parse(&s)))
}

/// Ring geometry the frontend publishes once it is ready to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingInfo {
    pub ring_ref: u32,
    pub event_channel: u32,
}

/// The frontend's `ring-ref` and `event-channel` nodes, once both are
/// present and well formed.
pub fn ring_info<S: Store + ?Sized>(
    store: &mut S,
    domain_path: &str,
    devid: u32,
) -> Result<Option<RingInfo>> {
    let fepath = frontend_path(domain_path, devid);
    let Some(ring_ref) = read_optional(store, &format!("{fepath}/ring-ref"))? else {
        return Ok(None);
    };
    let Some(event_channel) = read_optional(store, &format!("{fepath}/event-channel"))? else {
        return Ok(None);
    };
    let (Ok(ring_ref), Ok(event_channel)) =
        (ring_ref.trim().parse(), event_channel.trim().parse())
    else {
        warn!(
            "Device {devid}: unparseable ring-ref {ring_ref:?} or event-channel {event_channel:?}"
        );
        return Ok(None);
    };
    Ok(Some(RingInfo {
        ring_ref,
        event_channel,
    }))
}

fn side_settled<S: Store + ?Sized>(store: &mut S, path: &str) -> Result<bool> {
    // A missing tree means the toolstack already cleaned up after the
    // guest; that counts as settled.
    let state = read_optional(store, &format!("{path}/state"))?
        .map_or(XenBusState::Unknown, |s| XenBusState::parse(&s));
    Ok(matches!(state, XenBusState::Unknown | XenBusState::Closed))
}

/// Take one device offline and remove its trees.
///
/// The frontend gets `settle` time to acknowledge the close; the trees
/// are removed either way, a guest that never reacted just gets them
/// pulled out from under it.
pub fn destroy_device<S: Store + ?Sized>(
    store: &mut S,
    dom0_path: &str,
    domain_path: &str,
    domid: u32,
    devid: u32,
    settle: Duration,
) -> Result<()> {
    let bepath = backend_path(dom0_path, domid, devid);
    let fepath = frontend_path(domain_path, devid);
    debug!("Deleting {BUS_NAME} nodes for device {devid} of domain {domid}");

    store.write(&format!("{bepath}/online"), "0")?;
    store.write(&format!("{bepath}/physical-device"), "0.0")?;
    store.write(&format!("{bepath}/state"), &XenBusState::Closing.node_value())?;

    let deadline = Instant::now() + settle;
    loop {
        if side_settled(store, &bepath)? && side_settled(store, &fepath)? {
            break;
        }
        if Instant::now() >= deadline {
            error!(
                "Device {devid} of domain {domid} never went offline, removing its nodes anyway"
            );
            break;
        }
        std::thread::sleep(SETTLE_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }

    for path in [&bepath, &fepath] {
        match store.rm(path) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => debug!("Tree {path} was already gone"),
            Err(e) => warn!("Removing {path} failed: {e}"),
        }
    }
    Ok(())
}

// ============================================================================
// Guest discovery
// ============================================================================

/// A running guest that should be offered emulated input devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCandidate {
    pub uuid: Uuid,
    pub domid: u32,
}

/// Scan the VM tree for running guests of the served flavor.
///
/// Entries that are not guest records, guests of other flavors and
/// guests that are not up yet are all skipped quietly; the scan runs on
/// every watch firing and most entries are not for us.
pub fn running_guests<S: Store + ?Sized>(store: &mut S) -> Result<Vec<GuestCandidate>> {
    let entries = match store.directory(VM_ROOT) {
        Ok(entries) => entries,
        Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut guests = Vec::new();
    for entry in entries {
        let Ok(uuid) = Uuid::parse_str(&entry) else {
            debug!("Skipping non-guest node {VM_ROOT}/{entry}");
            continue;
        };
        let Some(flavor) = read_optional(store, &format!("{VMS_ROOT}/{uuid}/type"))? else {
            continue;
        };
        if flavor != "svm" {
            continue;
        }
        let Some(domid_node) = read_optional(store, &format!("{VMS_ROOT}/{uuid}/domid"))? else {
            continue;
        };
        let Ok(domid) = domid_node.trim().parse::<u32>() else {
            warn!("Guest {uuid} has unparseable domid {domid_node:?}");
            continue;
        };
        let Some(state) = read_optional(store, &format!("{VM_ROOT}/{uuid}/state"))? else {
            continue;
        };
        if !state.starts_with("running") {
            continue;
        }
        guests.push(GuestCandidate { uuid, domid });
    }
    Ok(guests)
}

#[cfg(test)]
mod tests {
    use super::super::MemStore;
    use super::*;

    const UUID_A: &str = "c0ffee00-0000-4000-8000-000000000001";
    const UUID_B: &str = "c0ffee00-0000-4000-8000-000000000002";

    fn store_with_guest(uuid: &str, domid: u32, flavor: &str, state: &str) -> MemStore {
        let mut store = MemStore::new();
        store.write(&format!("/vm/{uuid}/state"), state).unwrap();
        store
            .write(&format!("/xenmgr/vms/{uuid}/type"), flavor)
            .unwrap();
        store
            .write(&format!("/xenmgr/vms/{uuid}/domid"), &domid.to_string())
            .unwrap();
        store
    }

    #[test]
    fn test_create_writes_both_trees() {
        let mut store = MemStore::new();
        create_device(&mut store, "/local/domain/0", "/local/domain/7", 7, 1).unwrap();

        let be = "/local/domain/0/backend/vusb/7/1";
        let fe = "/local/domain/7/device/vusb/1";
        assert_eq!(store.node(&format!("{fe}/backend-id")), Some("0"));
        assert_eq!(store.node(&format!("{fe}/virtual-device")), Some("1"));
        assert_eq!(store.node(&format!("{fe}/backend")), Some(be));
        assert_eq!(store.node(&format!("{fe}/state")), Some("1"));
        assert_eq!(store.node(&format!("{be}/domain")), Some("Domain-7"));
        assert_eq!(store.node(&format!("{be}/frontend")), Some(fe));
        assert_eq!(store.node(&format!("{be}/state")), Some("1"));
        assert_eq!(store.node(&format!("{be}/online")), Some("1"));
        assert_eq!(store.node(&format!("{be}/frontend-id")), Some("7"));
        assert_eq!(store.node(&format!("{be}/physical-device")), Some("1.1"));

        let be_perms = store.node_perms(be).unwrap();
        assert_eq!(be_perms[0], PermEntry::new(0, Perm::empty()));
        assert_eq!(be_perms[1], PermEntry::new(7, Perm::READ));
        let fe_perms = store.node_perms(fe).unwrap();
        assert_eq!(fe_perms[0], PermEntry::new(7, Perm::empty()));
        assert_eq!(fe_perms[1], PermEntry::new(0, Perm::READ));
    }

    #[test]
    fn test_create_survives_raced_commits() {
        let mut store = MemStore::new();
        store.fail_commits(1);
        create_device(&mut store, "/local/domain/0", "/local/domain/3", 3, 2).unwrap();
        assert_eq!(
            store.node("/local/domain/0/backend/vusb/3/2/online"),
            Some("1")
        );
    }

    #[test]
    fn test_destroy_flags_offline_and_removes_trees() {
        let mut store = MemStore::new();
        create_device(&mut store, "/local/domain/0", "/local/domain/7", 7, 1).unwrap();
        // Frontend acknowledged the close.
        store
            .write("/local/domain/7/device/vusb/1/state", "6")
            .unwrap();
        store
            .write("/local/domain/0/backend/vusb/7/1/state", "6")
            .unwrap();

        destroy_device(
            &mut store,
            "/local/domain/0",
            "/local/domain/7",
            7,
            1,
            Duration::ZERO,
        )
        .unwrap();
        assert!(store.node("/local/domain/0/backend/vusb/7/1/online").is_none());
        assert!(store.node("/local/domain/7/device/vusb/1/state").is_none());
    }

    #[test]
    fn test_destroy_removes_trees_even_without_acknowledgement() {
        let mut store = MemStore::new();
        create_device(&mut store, "/local/domain/0", "/local/domain/7", 7, 1).unwrap();
        store
            .write("/local/domain/7/device/vusb/1/state", "4")
            .unwrap();

        destroy_device(
            &mut store,
            "/local/domain/0",
            "/local/domain/7",
            7,
            1,
            Duration::ZERO,
        )
        .unwrap();
        assert!(store.node("/local/domain/7/device/vusb/1/state").is_none());
        assert!(store.node("/local/domain/0/backend/vusb/7/1/domain").is_none());
    }

    #[test]
    fn test_destroy_of_missing_trees_is_quiet() {
        let mut store = MemStore::new();
        destroy_device(
            &mut store,
            "/local/domain/0",
            "/local/domain/9",
            9,
            1,
            Duration::ZERO,
        )
        .unwrap();
    }

    #[test]
    fn test_discovery_lists_running_served_guests() {
        let mut store = store_with_guest(UUID_A, 7, "svm", "running");
        store.write(&format!("/vm/{UUID_B}/state"), "running").unwrap();
        store
            .write(&format!("/xenmgr/vms/{UUID_B}/type"), "pvm")
            .unwrap();
        store
            .write(&format!("/xenmgr/vms/{UUID_B}/domid"), "8")
            .unwrap();
        store.write("/vm/not-a-uuid/state", "running").unwrap();

        let guests = running_guests(&mut store).unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].domid, 7);
        assert_eq!(guests[0].uuid, Uuid::parse_str(UUID_A).unwrap());
    }

    #[test]
    fn test_discovery_skips_stopped_and_partial_guests() {
        let store = &mut store_with_guest(UUID_A, 7, "svm", "stopped");
        assert!(running_guests(store).unwrap().is_empty());

        // State value carries trailing detail in practice.
        let store = &mut store_with_guest(UUID_A, 7, "svm", "running (started)");
        assert_eq!(running_guests(store).unwrap().len(), 1);

        // No domid node yet.
        let mut store = MemStore::new();
        store.write(&format!("/vm/{UUID_A}/state"), "running").unwrap();
        store
            .write(&format!("/xenmgr/vms/{UUID_A}/type"), "svm")
            .unwrap();
        assert!(running_guests(&mut store).unwrap().is_empty());
    }

    #[test]
    fn test_discovery_with_no_vm_tree_is_empty() {
        let mut store = MemStore::new();
        assert!(running_guests(&mut store).unwrap().is_empty());
    }

    #[test]
    fn test_ring_info_needs_both_nodes() {
        let mut store = MemStore::new();
        assert_eq!(ring_info(&mut store, "/local/domain/7", 1).unwrap(), None);
        store
            .write("/local/domain/7/device/vusb/1/ring-ref", "42")
            .unwrap();
        assert_eq!(ring_info(&mut store, "/local/domain/7", 1).unwrap(), None);
        store
            .write("/local/domain/7/device/vusb/1/event-channel", "9")
            .unwrap();
        assert_eq!(
            ring_info(&mut store, "/local/domain/7", 1).unwrap(),
            Some(RingInfo {
                ring_ref: 42,
                event_channel: 9
            })
        );
    }

    #[test]
    fn test_bus_state_parsing() {
        assert_eq!(XenBusState::parse("4"), XenBusState::Connected);
        assert_eq!(XenBusState::parse(" 6\n"), XenBusState::Closed);
        assert_eq!(XenBusState::parse("junk"), XenBusState::Unknown);
        assert_eq!(XenBusState::parse("9"), XenBusState::Unknown);
        assert_eq!(XenBusState::try_from(3), Ok(XenBusState::Initialised));
        assert!(XenBusState::try_from(7).is_err());
    }

    #[test]
    fn test_frontend_state_reads_through() {
        let mut store = MemStore::new();
        assert_eq!(
            read_frontend_state(&mut store, "/local/domain/7", 1).unwrap(),
            XenBusState::Unknown
        );
        store
            .write("/local/domain/7/device/vusb/1/state", "3")
            .unwrap();
        assert_eq!(
            read_frontend_state(&mut store, "/local/domain/7", 1).unwrap(),
            XenBusState::Initialised
        );
    }
}
