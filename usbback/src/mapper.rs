// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Grant mapping seam between the transport engine and the hypervisor.
//!
//! The engine only ever sees [`GrantPages`] views of guest memory, so the
//! actual mapping mechanism stays pluggable: the daemon maps grant
//! references through the gntdev character device, while [`HeapMapper`]
//! backs grants with process-local pages for tests and loopback use.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use vm_memory::VolatileSlice;

use crate::protocol::RING_PAGE_SIZE;

/// A mapped run of granted guest pages.
pub trait GrantPages {
    /// Volatile view of the mapped bytes. Valid for the life of the mapping.
    fn pages(&self) -> VolatileSlice<'_>;
}

impl std::fmt::Debug for dyn GrantPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GrantPages")
    }
}

/// Maps grant references published by a frontend domain.
pub trait GrantMapper {
    fn map(&self, domid: u32, refs: &[u32], writable: bool) -> io::Result<Box<dyn GrantPages>>;
}

// ==========================================================================
// Heap-backed mapper
// ==========================================================================

/// One page of memory shared between a simulated frontend and the engine.
pub struct SharedPage(UnsafeCell<[u8; RING_PAGE_SIZE]>);

// SAFETY: all access to the page bytes goes through VolatileSlice, whose
// volatile, tearing-tolerant accesses are meant for memory shared with
// another party.
unsafe impl Sync for SharedPage {}

impl Default for SharedPage {
    fn default() -> Self {
        SharedPage::new()
    }
}

impl SharedPage {
    pub fn new() -> SharedPage {
        SharedPage(UnsafeCell::new([0u8; RING_PAGE_SIZE]))
    }

    pub fn slice(&self) -> VolatileSlice<'_> {
        // SAFETY: the pointer covers RING_PAGE_SIZE bytes owned by self, and
        // the returned slice borrows self, keeping the allocation alive.
        unsafe { VolatileSlice::new(self.0.get().cast::<u8>(), RING_PAGE_SIZE) }
    }
}

/// Grant mapper backed by process-local pages. Grants are created on the
/// frontend side with [`HeapMapper::grant`] and resolved here by reference.
#[derive(Default)]
pub struct HeapMapper {
    pages: Mutex<HashMap<(u32, u32), Arc<SharedPage>>>,
}

impl HeapMapper {
    pub fn new() -> Self {
        HeapMapper::default()
    }

    /// Creates the page for a grant reference, or returns the existing one.
    /// This is the frontend half of the simulated grant table.
    pub fn grant(&self, domid: u32, gref: u32) -> Arc<SharedPage> {
        self.pages
            .lock()
            .unwrap()
            .entry((domid, gref))
            .or_default()
            .clone()
    }
}

impl GrantMapper for HeapMapper {
    fn map(&self, domid: u32, refs: &[u32], _writable: bool) -> io::Result<Box<dyn GrantPages>> {
        // The transport only ever maps single-page runs.
        if refs.len() != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Cannot map {} segments", refs.len()),
            ));
        }
        let page = self
            .pages
            .lock()
            .unwrap()
            .get(&(domid, refs[0]))
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Grant {domid}/{} not present", refs[0]),
                )
            })?;
        Ok(Box::new(HeapPages { page }))
    }
}

struct HeapPages {
    page: Arc<SharedPage>,
}

impl GrantPages for HeapPages {
    fn pages(&self) -> VolatileSlice<'_> {
        self.page.slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::Bytes;

    #[test]
    fn test_map_resolves_granted_page() {
        let mapper = HeapMapper::new();
        let guest = mapper.grant(3, 17);
        guest.slice().write_obj(0xABCD1234u32, 0).unwrap();

        let mapped = mapper.map(3, &[17], true).unwrap();
        assert_eq!(mapped.pages().len(), RING_PAGE_SIZE);
        let value: u32 = mapped.pages().read_obj(0).unwrap();
        assert_eq!(value, 0xABCD1234);

        // Writes through the mapping land on the shared page.
        mapped.pages().write_obj(0x55u8, 100).unwrap();
        let byte: u8 = guest.slice().read_obj(100).unwrap();
        assert_eq!(byte, 0x55);
    }

    #[test]
    fn test_grant_is_idempotent() {
        let mapper = HeapMapper::new();
        let first = mapper.grant(1, 9);
        first.slice().write_obj(7u8, 0).unwrap();
        let second = mapper.grant(1, 9);
        let byte: u8 = second.slice().read_obj(0).unwrap();
        assert_eq!(byte, 7);
    }

    #[test]
    fn test_unknown_grant_fails() {
        let mapper = HeapMapper::new();
        mapper.grant(1, 9);
        assert!(mapper.map(1, &[10], true).is_err());
        assert!(mapper.map(2, &[9], true).is_err());
    }

    #[test]
    fn test_multi_segment_rejected() {
        let mapper = HeapMapper::new();
        mapper.grant(1, 1);
        mapper.grant(1, 2);
        let err = mapper.map(1, &[1, 2], true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
