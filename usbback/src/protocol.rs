// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the paravirtualized USB ring.
//!
//! The frontend grants the backend a single 4096-byte page holding a
//! free-running producer/consumer ring. All fields are little-endian and
//! naturally aligned, so the `#[repr(C)]` structs below match the shared
//! page byte for byte.
//!
//! ```text
//! offset 0               64                                        4096
//!        +---------------+---------+---------+-----+---------+------+
//!        | ring header   | slot 0  | slot 1  | ... | slot 31 | free |
//!        +---------------+---------+---------+-----+---------+------+
//! ```
//!
//! Requests and responses share the 32 slots: a response is written into
//! the slot of an already-consumed request. Indices are free running; the
//! slot for index `i` is `i & 31`.

use vm_memory::ByteValued;

/// Size of the shared ring page.
pub const RING_PAGE_SIZE: usize = 4096;
/// Bytes reserved for the ring header at the start of the page.
pub const RING_HEADER_SIZE: usize = 64;
/// Size of one ring slot. Responses reuse request slots, so the slot size
/// is the larger of the two entry formats.
pub const RING_SLOT_SIZE: usize = 64;
/// Number of slots shared between requests and responses.
pub const RING_SIZE: u32 = 32;
/// Maximum number of grant segments a single request can carry.
pub const MAX_SEGMENTS: usize = 8;

/// Byte offset of `req_prod` within the ring page.
pub const REQ_PROD_OFFSET: usize = 0;
/// Byte offset of `rsp_prod` within the ring page.
pub const RSP_PROD_OFFSET: usize = 8;

// ==========================================================================
// Request and response entries
// ==========================================================================

/// One transfer request, as the frontend writes it into a ring slot.
///
/// `setup` carries the raw 8-byte USB setup packet for control transfers
/// and the target request id for cancel requests.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct UrbRequest {
    pub id: u64,
    pub setup: u64,
    pub typ: u8,
    pub endpoint: u8,
    pub offset: u16,
    pub length: u32,
    pub nr_segments: u8,
    pub flags: u8,
    pub nr_packets: u16,
    pub startframe: u16,
    _reserved: u16,
    pub gref: [u32; MAX_SEGMENTS],
}

// SAFETY: UrbRequest is POD and has no implicit padding.
unsafe impl ByteValued for UrbRequest {}

impl UrbRequest {
    /// Builds a control request carrying one data segment.
    pub fn control(id: u64, setup: u64, gref: u32, offset: u16, length: u32) -> Self {
        UrbRequest {
            id,
            setup,
            typ: RequestType::Control as u8,
            offset,
            length,
            nr_segments: 1,
            gref: [gref, 0, 0, 0, 0, 0, 0, 0],
            ..Default::default()
        }
    }

    /// Builds an interrupt IN request for one granted page.
    pub fn interrupt(id: u64, gref: u32, offset: u16, length: u32) -> Self {
        UrbRequest {
            id,
            typ: RequestType::Int as u8,
            endpoint: 0x81,
            offset,
            length,
            nr_segments: 1,
            gref: [gref, 0, 0, 0, 0, 0, 0, 0],
            ..Default::default()
        }
    }

    /// Builds a request that carries no data stage, such as a reset.
    pub fn simple(id: u64, typ: RequestType) -> Self {
        UrbRequest {
            id,
            typ: typ as u8,
            ..Default::default()
        }
    }

    /// Builds a cancel request targeting a previously queued request id.
    pub fn cancel(id: u64, target: u64) -> Self {
        UrbRequest {
            id,
            setup: target,
            typ: RequestType::Cancel as u8,
            ..Default::default()
        }
    }
}

/// One completed transfer, as the backend writes it back into a slot.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct UrbResponse {
    pub id: u64,
    pub actual_length: i32,
    pub data: u32,
    pub status: i32,
    _reserved: u32,
}

// SAFETY: UrbResponse is POD and has no implicit padding.
unsafe impl ByteValued for UrbResponse {}

impl UrbResponse {
    pub fn new(id: u64, actual_length: i32, data: u32, status: UrbStatus) -> Self {
        UrbResponse {
            id,
            actual_length,
            data,
            status: status as i32,
            _reserved: 0,
        }
    }
}

// ==========================================================================
// Request types and completion codes
// ==========================================================================

/// Transfer types the frontend can place on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Control = 0,
    Isoc = 1,
    Bulk = 2,
    Int = 3,
    Reset = 4,
    AbortPipe = 5,
    GetFrame = 6,
    GetSpeed = 7,
    Cancel = 8,
}

impl TryFrom<u8> for RequestType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestType::Control),
            1 => Ok(RequestType::Isoc),
            2 => Ok(RequestType::Bulk),
            3 => Ok(RequestType::Int),
            4 => Ok(RequestType::Reset),
            5 => Ok(RequestType::AbortPipe),
            6 => Ok(RequestType::GetFrame),
            7 => Ok(RequestType::GetSpeed),
            8 => Ok(RequestType::Cancel),
            _ => Err("Unknown ring request type"),
        }
    }
}

/// Completion status carried in a response. Negative values follow the
/// usual errno convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum UrbStatus {
    Okay = 0,
    Error = -1,
    NotSupported = -95,
    Canceled = -125,
}

/// Port speeds reported by a `GetSpeed` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum UsbSpeed {
    None = 0,
    Low = 1,
    Full = 2,
    High = 3,
}

/// Returns the byte offset of the slot holding ring index `idx`.
pub fn slot_offset(idx: u32) -> usize {
    RING_HEADER_SIZE + (idx & (RING_SIZE - 1)) as usize * RING_SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_sizes() {
        assert_eq!(size_of::<UrbRequest>(), 64);
        assert_eq!(size_of::<UrbResponse>(), 24);
        assert!(size_of::<UrbRequest>() <= RING_SLOT_SIZE);
        assert!(size_of::<UrbResponse>() <= RING_SLOT_SIZE);
    }

    #[test]
    fn test_ring_geometry() {
        assert_eq!(slot_offset(0), 64);
        assert_eq!(slot_offset(1), 128);
        assert_eq!(slot_offset(31), 64 + 31 * 64);
        // Free-running indices wrap onto the same slots.
        assert_eq!(slot_offset(32), slot_offset(0));
        assert_eq!(slot_offset(u32::MAX), slot_offset(31));
        assert!(RING_HEADER_SIZE + RING_SIZE as usize * RING_SLOT_SIZE <= RING_PAGE_SIZE);
    }

    #[test]
    fn test_request_layout() {
        let mut req = UrbRequest::control(0x1122334455667788, 0xAABB, 7, 64, 12);
        req.endpoint = 0x81;
        req.nr_packets = 3;
        req.startframe = 9;
        let bytes = req.as_slice();
        assert_eq!(&bytes[0..8], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0xAABBu64.to_le_bytes());
        assert_eq!(bytes[16], RequestType::Control as u8);
        assert_eq!(bytes[17], 0x81);
        assert_eq!(&bytes[18..20], &64u16.to_le_bytes());
        assert_eq!(&bytes[20..24], &12u32.to_le_bytes());
        assert_eq!(bytes[24], 1);
        assert_eq!(&bytes[26..28], &3u16.to_le_bytes());
        assert_eq!(&bytes[28..30], &9u16.to_le_bytes());
        assert_eq!(&bytes[32..36], &7u32.to_le_bytes());
    }

    #[test]
    fn test_response_layout() {
        let rsp = UrbResponse::new(0xDEAD, 12, 2, UrbStatus::NotSupported);
        let bytes = rsp.as_slice();
        assert_eq!(&bytes[0..8], &0xDEADu64.to_le_bytes());
        assert_eq!(&bytes[8..12], &12i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &(-95i32).to_le_bytes());
    }

    #[test]
    fn test_request_type_roundtrip() {
        for typ in [
            RequestType::Control,
            RequestType::Isoc,
            RequestType::Bulk,
            RequestType::Int,
            RequestType::Reset,
            RequestType::AbortPipe,
            RequestType::GetFrame,
            RequestType::GetSpeed,
            RequestType::Cancel,
        ] {
            assert_eq!(RequestType::try_from(typ as u8), Ok(typ));
        }
        assert!(RequestType::try_from(9).is_err());
        assert!(RequestType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_cancel_carries_target_in_setup() {
        let req = UrbRequest::cancel(10, 42);
        assert_eq!(req.typ, RequestType::Cancel as u8);
        let setup = req.setup;
        assert_eq!(setup, 42);
        assert_eq!(req.nr_segments, 0);
    }
}
