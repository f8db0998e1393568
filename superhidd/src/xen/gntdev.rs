// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest page access through the gntdev character device.
//!
//! A frontend publishes grant references; turning them into local
//! memory takes two steps. An ioctl trades the refs for an offset
//! token, then an mmap of the device at that offset yields the pages.
//! Dropping a mapping unmaps the pages and hands the token back.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::{ManuallyDrop, size_of};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use memmap2::{MmapMut, MmapOptions};
use vm_memory::VolatileSlice;
use vmm_sys_util::ioctl::{_IOC_NONE, ioctl_with_mut_ref, ioctl_with_ref};
use vmm_sys_util::ioctl_ioc_nr;

use usbback::{GrantMapper, GrantPages, MAX_SEGMENTS, RING_PAGE_SIZE};

/// ioctl type of the gntdev device.
const GNTDEV_MAGIC: u32 = b'G' as u32;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct GrantRefSpec {
    domid: u32,
    reference: u32,
}

/// Map request: a fixed header followed by one ref slot per page. The
/// kernel reads `count` slots from the buffer, while the request
/// number only covers the header and the first slot.
#[repr(C)]
struct MapGrantRefs {
    count: u32,
    pad: u32,
    index: u64,
    refs: [GrantRefSpec; MAX_SEGMENTS],
}

#[repr(C)]
struct UnmapGrantRefs {
    index: u64,
    count: u32,
    pad: u32,
}

const MAP_REQUEST_SIZE: u32 =
    (2 * size_of::<u32>() + size_of::<u64>() + size_of::<GrantRefSpec>()) as u32;

ioctl_ioc_nr!(GNTDEV_MAP_GRANT_REF, _IOC_NONE, GNTDEV_MAGIC, 0, MAP_REQUEST_SIZE);
ioctl_ioc_nr!(
    GNTDEV_UNMAP_GRANT_REF,
    _IOC_NONE,
    GNTDEV_MAGIC,
    1,
    size_of::<UnmapGrantRefs>() as u32
);

/// Handle on the grant device. Mappings keep a clone of the fd so they
/// can give their token back when dropped.
pub struct GrantDevice {
    file: Arc<File>,
}

impl GrantDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<GrantDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(GrantDevice {
            file: Arc::new(file),
        })
    }
}

impl GrantMapper for GrantDevice {
    fn map(&self, domid: u32, refs: &[u32], _writable: bool) -> io::Result<Box<dyn GrantPages>> {
        if refs.is_empty() || refs.len() > MAX_SEGMENTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Cannot map {} segments", refs.len()),
            ));
        }
        let mut request = MapGrantRefs {
            count: refs.len() as u32,
            pad: 0,
            index: 0,
            refs: [GrantRefSpec::default(); MAX_SEGMENTS],
        };
        for (slot, &gref) in request.refs.iter_mut().zip(refs) {
            *slot = GrantRefSpec {
                domid,
                reference: gref,
            };
        }
        // SAFETY: the fd is the open grant device and the argument is
        // the map structure with count valid ref slots.
        let ret = unsafe { ioctl_with_mut_ref(&*self.file, GNTDEV_MAP_GRANT_REF(), &mut request) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = refs.len() * RING_PAGE_SIZE;
        let mut options = MmapOptions::new();
        options.offset(request.index).len(len);
        // SAFETY: the device just issued this offset token for a
        // mapping of exactly len bytes.
        let mmap = match unsafe { options.map_mut(&*self.file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                release_token(&self.file, request.index, request.count);
                return Err(e);
            }
        };
        Ok(Box::new(MappedGrants {
            file: Arc::clone(&self.file),
            mmap: ManuallyDrop::new(mmap),
            index: request.index,
            count: request.count,
        }))
    }
}

fn release_token(file: &File, index: u64, count: u32) {
    let request = UnmapGrantRefs {
        index,
        count,
        pad: 0,
    };
    // SAFETY: the fd is the open grant device and the argument is the
    // unmap structure for a token it issued.
    let ret = unsafe { ioctl_with_ref(file, GNTDEV_UNMAP_GRANT_REF(), &request) };
    if ret < 0 {
        warn!(
            "Failed to release grant token {index}: {}",
            io::Error::last_os_error()
        );
    }
}

struct MappedGrants {
    file: Arc<File>,
    mmap: ManuallyDrop<MmapMut>,
    index: u64,
    count: u32,
}

impl GrantPages for MappedGrants {
    fn pages(&self) -> VolatileSlice<'_> {
        // SAFETY: the mmap covers len writable bytes for the life of
        // self, and the slice borrows self.
        unsafe { VolatileSlice::new(self.mmap.as_ptr().cast_mut(), self.mmap.len()) }
    }
}

impl Drop for MappedGrants {
    fn drop(&mut self) {
        // The device refuses to take the token back while the pages
        // are still mapped, so the munmap has to come first.
        // SAFETY: the mmap is dropped exactly once, here, and not
        // touched again.
        unsafe { ManuallyDrop::drop(&mut self.mmap) };
        release_token(&self.file, self.index, self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Request numbers as the kernel header defines them. A drift here
    // means a struct or magic changed shape.
    #[test]
    fn test_ioctl_numbers_match_kernel_abi() {
        assert_eq!(GNTDEV_MAP_GRANT_REF(), 0x0018_4700);
        assert_eq!(GNTDEV_UNMAP_GRANT_REF(), 0x0010_4701);
    }

    #[test]
    fn test_argument_layouts() {
        assert_eq!(size_of::<GrantRefSpec>(), 8);
        assert_eq!(MAP_REQUEST_SIZE, 24);
        assert_eq!(size_of::<UnmapGrantRefs>(), 16);
        // Room for every segment a transfer can carry.
        assert_eq!(size_of::<MapGrantRefs>(), 16 + MAX_SEGMENTS * 8);
    }
}
