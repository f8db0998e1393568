// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend half of the paravirtualized USB transport.
//!
//! This crate owns everything between a frontend's shared ring page and
//! the HID device model: the wire format, the backend ring cursors, the
//! queue of parked interrupt transfers and the per-device engine that
//! turns ring requests into control responses and report deliveries.

pub mod device;
pub mod mapper;
pub mod pending;
pub mod protocol;
pub mod ring;

pub use device::{CountingNotifier, DeviceError, DeviceState, RingNotifier, VusbDevice};
pub use mapper::{GrantMapper, GrantPages, HeapMapper, SharedPage};
pub use pending::{PendingEntry, PendingQueue, QueueFull};
pub use protocol::{
    MAX_SEGMENTS, RING_PAGE_SIZE, RING_SIZE, RequestType, UrbRequest, UrbResponse, UrbStatus,
    UsbSpeed,
};
pub use ring::{BackRing, RingError};
