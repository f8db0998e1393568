// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-transfer responder.
//!
//! `handle_setup` is a pure function from a parsed setup packet to either
//! the number of bytes written into the caller's buffer or a stall. The
//! transport maps the guest buffer, calls in and turns the result into a
//! ring response; nothing here touches rings or grants.

use log::debug;
use thiserror::Error;
use vm_memory::ByteValued;

use crate::DeviceType;
use crate::descriptors::{DescriptorCatalog, PRODUCT_NAME, USB_DIR_IN, descriptor_type};
use crate::reports::{FEATURE_MAX_CONTACT_COUNT, FeatureReport, MAX_CONTACTS};

// ============================================================================
// Request constants
// ============================================================================

pub const USB_TYPE_STANDARD: u8 = 0x00;
pub const USB_TYPE_CLASS: u8 = 0x20;
pub const USB_RECIP_DEVICE: u8 = 0x00;
pub const USB_RECIP_INTERFACE: u8 = 0x01;

/// Standard USB request codes.
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// HID class request codes.
pub mod hid_request {
    pub const GET_REPORT: u8 = 0x01;
    pub const GET_PROTOCOL: u8 = 0x03;
    pub const SET_REPORT: u8 = 0x09;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

/// Report type selector in the high byte of wValue.
pub const HID_REPORT_TYPE_FEATURE: u8 = 0x03;

/// Combined `(bmRequestType << 8) | bRequest` dispatch keys.
mod dispatch {
    use super::hid_request;
    use super::request;
    use super::{
        USB_DIR_IN, USB_RECIP_DEVICE, USB_RECIP_INTERFACE, USB_TYPE_CLASS, USB_TYPE_STANDARD,
    };

    pub const fn key(request_type: u8, request: u8) -> u16 {
        ((request_type as u16) << 8) | request as u16
    }

    pub const GET_REPORT: u16 =
        key(USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE, hid_request::GET_REPORT);
    pub const GET_PROTOCOL: u16 =
        key(USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE, hid_request::GET_PROTOCOL);
    pub const SET_REPORT: u16 =
        key(USB_TYPE_CLASS | USB_RECIP_INTERFACE, hid_request::SET_REPORT);
    pub const SET_PROTOCOL: u16 =
        key(USB_TYPE_CLASS | USB_RECIP_INTERFACE, hid_request::SET_PROTOCOL);
    pub const DEVICE_GET_STATUS: u16 =
        key(USB_TYPE_STANDARD | USB_RECIP_DEVICE, request::GET_STATUS);
    pub const DEVICE_GET_STATUS_IN: u16 =
        key(USB_DIR_IN | USB_TYPE_STANDARD | USB_RECIP_DEVICE, request::GET_STATUS);
    pub const DEVICE_GET_DESCRIPTOR: u16 =
        key(USB_DIR_IN | USB_TYPE_STANDARD | USB_RECIP_DEVICE, request::GET_DESCRIPTOR);
    pub const SET_CONFIGURATION: u16 =
        key(USB_TYPE_STANDARD | USB_RECIP_DEVICE, request::SET_CONFIGURATION);
    pub const GET_CONFIGURATION: u16 =
        key(USB_DIR_IN | USB_TYPE_STANDARD | USB_RECIP_DEVICE, request::GET_CONFIGURATION);
    pub const SET_INTERFACE: u16 =
        key(USB_TYPE_STANDARD | USB_RECIP_INTERFACE, request::SET_INTERFACE);
    pub const GET_INTERFACE: u16 =
        key(USB_DIR_IN | USB_TYPE_STANDARD | USB_RECIP_INTERFACE, request::GET_INTERFACE);
    pub const INTERFACE_GET_DESCRIPTOR: u16 =
        key(USB_DIR_IN | USB_TYPE_STANDARD | USB_RECIP_INTERFACE, request::GET_DESCRIPTOR);
}

// ============================================================================
// Setup packet
// ============================================================================

/// The 8-byte USB setup packet, as carried little-endian on the ring.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SetupPacket {
    pub b_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

// SAFETY: SetupPacket is POD and has no implicit padding
unsafe impl ByteValued for SetupPacket {}

impl SetupPacket {
    /// Parse the packed form used by ring requests.
    pub fn from_wire(setup: u64) -> Self {
        let mut packet = SetupPacket::default();
        packet.as_mut_slice().copy_from_slice(&setup.to_le_bytes());
        packet
    }

    /// The packed form used by ring requests.
    pub fn to_wire(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.as_slice());
        u64::from_le_bytes(bytes)
    }

    fn dispatch_key(&self) -> u16 {
        dispatch::key(self.b_request_type, self.b_request)
    }
}

// ============================================================================
// Responder
// ============================================================================

/// The endpoint refuses the request; the transport reports a protocol error.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("control transfer stalled")]
pub struct Stall;

pub type ControlResult = Result<u16, Stall>;

/// Answer a control transfer for a device of the given flavour.
///
/// `data` is the mapped request buffer, or `None` when mapping failed; a
/// request that needs to transfer bytes then stalls, while status-only
/// requests still succeed.
pub fn handle_setup(
    setup: SetupPacket,
    data: Option<&mut [u8]>,
    typ: DeviceType,
    catalog: &DescriptorCatalog,
) -> ControlResult {
    let value = setup.w_value;
    let w_length = setup.w_length;

    match setup.dispatch_key() {
        dispatch::GET_REPORT => {
            if (value >> 8) as u8 == HID_REPORT_TYPE_FEATURE {
                if (value & 0xFF) as u8 == FEATURE_MAX_CONTACT_COUNT {
                    debug!("interface get report: max contact count");
                    let feature = FeatureReport {
                        feature: FEATURE_MAX_CONTACT_COUNT,
                        value: MAX_CONTACTS as u8,
                    };
                    respond_bytes(data, feature.as_slice())
                } else {
                    debug!("unknown feature request 0x{:x}", value & 0xFF);
                    Err(Stall)
                }
            } else {
                debug!("unknown feature request type 0x{:x}", value >> 8);
                Err(Stall)
            }
        }
        dispatch::GET_PROTOCOL => {
            debug!("interface get protocol");
            Err(Stall)
        }
        dispatch::SET_REPORT => {
            debug!("interface set report");
            Err(Stall)
        }
        dispatch::SET_PROTOCOL => {
            debug!("interface set protocol");
            Err(Stall)
        }
        dispatch::DEVICE_GET_STATUS | dispatch::DEVICE_GET_STATUS_IN => {
            debug!("device get status");
            Ok(0)
        }
        dispatch::DEVICE_GET_DESCRIPTOR => {
            let set = catalog.for_type(typ);
            match (value >> 8) as u8 {
                descriptor_type::DEVICE => respond_prefix(data, set.device.as_slice(), w_length),
                descriptor_type::QUALIFIER => {
                    respond_prefix(data, set.qualifier.as_slice(), w_length)
                }
                descriptor_type::CONFIG => {
                    respond_prefix(data, &set.configuration_bytes(), w_length)
                }
                descriptor_type::STRING => respond_prefix(data, PRODUCT_NAME.as_bytes(), w_length),
                descriptor_type::BOS => respond_prefix(data, catalog.bos().as_slice(), w_length),
                other => {
                    debug!("unknown device descriptor request 0x{other:x}");
                    Err(Stall)
                }
            }
        }
        dispatch::SET_CONFIGURATION => {
            debug!("device set configuration");
            Ok(0)
        }
        dispatch::GET_CONFIGURATION => respond_bytes(data, b"1"),
        dispatch::SET_INTERFACE => {
            debug!("device set interface");
            Ok(0)
        }
        dispatch::GET_INTERFACE => respond_bytes(data, b"0"),
        dispatch::INTERFACE_GET_DESCRIPTOR => {
            let set = catalog.for_type(typ);
            match (value >> 8) as u8 {
                descriptor_type::HID => respond_prefix(data, set.hid.as_slice(), w_length),
                descriptor_type::REPORT => respond_prefix(data, &set.report_desc, w_length),
                other => {
                    debug!("unknown interface descriptor request 0x{other:x}");
                    Err(Stall)
                }
            }
        }
        other => {
            debug!("unknown control request 0x{other:04x}");
            Err(Stall)
        }
    }
}

/// Write `bytes` truncated to the request's wLength.
fn respond_prefix(data: Option<&mut [u8]>, bytes: &[u8], w_length: u16) -> ControlResult {
    let len = bytes.len().min(usize::from(w_length));
    respond_bytes(data, &bytes[..len])
}

/// Write `bytes` in full, regardless of wLength.
fn respond_bytes(data: Option<&mut [u8]>, bytes: &[u8]) -> ControlResult {
    if bytes.is_empty() {
        return Ok(0);
    }
    let Some(buf) = data else {
        return Err(Stall);
    };
    let Some(dst) = buf.get_mut(..bytes.len()) else {
        return Err(Stall);
    };
    dst.copy_from_slice(bytes);
    Ok(bytes.len() as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::REPORT_LENGTH;

    fn setup(request_type: u8, request: u8, value: u16, length: u16) -> SetupPacket {
        SetupPacket {
            b_request_type: request_type,
            b_request: request,
            w_value: value,
            w_index: 0,
            w_length: length,
        }
    }

    fn run(packet: SetupPacket, typ: DeviceType, buf: &mut [u8]) -> ControlResult {
        let catalog = DescriptorCatalog::new();
        handle_setup(packet, Some(buf), typ, &catalog)
    }

    #[test]
    fn test_setup_wire_roundtrip() {
        let packet = SetupPacket::from_wire(0x0012_0000_0100_0680);
        assert_eq!(packet.b_request_type, 0x80);
        assert_eq!(packet.b_request, request::GET_DESCRIPTOR);
        let value = packet.w_value;
        let length = packet.w_length;
        assert_eq!(value, 0x0100);
        assert_eq!(length, 18);
        assert_eq!(packet.to_wire(), 0x0012_0000_0100_0680);
    }

    #[test]
    fn test_get_report_feature() {
        let mut buf = [0u8; 64];
        let packet = setup(0xA1, hid_request::GET_REPORT, 0x0304, 2);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(2));
        assert_eq!(&buf[..2], &[0x04, 10]);
    }

    #[test]
    fn test_get_report_unknown_feature_stalls() {
        let mut buf = [0u8; 64];
        let packet = setup(0xA1, hid_request::GET_REPORT, 0x0305, 2);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Err(Stall));
        // Input report type instead of feature.
        let packet = setup(0xA1, hid_request::GET_REPORT, 0x0104, 2);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Err(Stall));
    }

    #[test]
    fn test_class_requests_stall() {
        let mut buf = [0u8; 64];
        for (request_type, request) in [
            (0xA1, hid_request::GET_PROTOCOL),
            (0x21, hid_request::SET_REPORT),
            (0x21, hid_request::SET_PROTOCOL),
        ] {
            let packet = setup(request_type, request, 0, 0);
            assert_eq!(run(packet, DeviceType::Multi, &mut buf), Err(Stall));
        }
    }

    #[test]
    fn test_get_status_succeeds_empty() {
        let packet = setup(0x00, request::GET_STATUS, 0, 2);
        let catalog = DescriptorCatalog::new();
        assert_eq!(handle_setup(packet, None, DeviceType::Multi, &catalog), Ok(0));
        let packet = setup(0x80, request::GET_STATUS, 0, 2);
        assert_eq!(handle_setup(packet, None, DeviceType::Multi, &catalog), Ok(0));
    }

    #[test]
    fn test_device_descriptor_truncation() {
        let mut buf = [0u8; 64];
        for (w_length, expected) in [(0u16, 0u16), (9, 9), (18, 18), (255, 18)] {
            let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0100, w_length);
            assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(expected));
        }
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0100, 255);
        run(packet, DeviceType::Multi, &mut buf).unwrap();
        assert_eq!(buf[0], 18);
        assert_eq!(buf[1], descriptor_type::DEVICE);
        assert_eq!(&buf[8..12], &[0x42, 0x42, 0x42, 0x42]);
    }

    #[test]
    fn test_qualifier_descriptor() {
        let mut buf = [0u8; 64];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0600, 255);
        assert_eq!(run(packet, DeviceType::Mouse, &mut buf), Ok(10));
        assert_eq!(buf[0], 10);
        assert_eq!(buf[1], descriptor_type::QUALIFIER);
    }

    #[test]
    fn test_configuration_descriptor_full() {
        let mut buf = [0u8; 64];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0200, 255);
        assert_eq!(run(packet, DeviceType::Keyboard, &mut buf), Ok(34));
        // wTotalLength announces the whole concatenation.
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 34);
        // The embedded HID descriptor carries the keyboard report length.
        assert_eq!(buf[18], 9);
        assert_eq!(buf[19], descriptor_type::HID);
        assert_eq!(u16::from_le_bytes([buf[25], buf[26]]), 49);
    }

    #[test]
    fn test_configuration_descriptor_truncated() {
        // A 9-byte first read, as real enumeration does it.
        let mut buf = [0u8; 64];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0200, 9);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(9));
        // A cut in the middle of a nested descriptor still returns exactly
        // the requested prefix.
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0200, 20);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(20));
    }

    #[test]
    fn test_string_descriptor() {
        let mut buf = [0u8; 64];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0300, 255);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(8));
        assert_eq!(&buf[..8], b"SuperHID");
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0300, 4);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"Supe");
    }

    #[test]
    fn test_bos_descriptor() {
        let mut buf = [0u8; 64];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0F00, 255);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(5));
        assert_eq!(buf[0], 5);
        assert_eq!(buf[1], descriptor_type::BOS);
        assert_eq!(buf[4], 0);
    }

    #[test]
    fn test_unknown_descriptor_stalls() {
        let mut buf = [0u8; 64];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x2300, 255);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Err(Stall));
    }

    #[test]
    fn test_configuration_and_interface_state() {
        let mut buf = [0u8; 64];
        let packet = setup(0x00, request::SET_CONFIGURATION, 1, 0);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(0));
        let packet = setup(0x80, request::GET_CONFIGURATION, 0, 1);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(1));
        assert_eq!(buf[0], b'1');
        let packet = setup(0x01, request::SET_INTERFACE, 0, 0);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(0));
        let packet = setup(0x81, request::GET_INTERFACE, 0, 1);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(1));
        assert_eq!(buf[0], b'0');
    }

    #[test]
    fn test_interface_hid_descriptor_is_type_specific() {
        let mut buf = [0u8; 64];
        let packet = setup(0x81, request::GET_DESCRIPTOR, 0x2100, 255);
        assert_eq!(run(packet, DeviceType::Mouse, &mut buf), Ok(9));
        assert_eq!(u16::from_le_bytes([buf[7], buf[8]]), 60);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(9));
        assert_eq!(u16::from_le_bytes([buf[7], buf[8]]), 327);
    }

    #[test]
    fn test_interface_report_descriptor() {
        let mut buf = [0u8; 512];
        let packet = setup(0x81, request::GET_DESCRIPTOR, 0x2200, 512);
        assert_eq!(run(packet, DeviceType::Tablet, &mut buf), Ok(57));
        assert_eq!(
            &buf[..57],
            crate::report_desc::tablet_report_descriptor().as_slice()
        );
        // Truncated read of the multi descriptor.
        let packet = setup(0x81, request::GET_DESCRIPTOR, 0x2200, 64);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Ok(64));
        // Unknown interface descriptor type.
        let packet = setup(0x81, request::GET_DESCRIPTOR, 0x4200, 64);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Err(Stall));
    }

    #[test]
    fn test_unknown_request_stalls() {
        let mut buf = [0u8; 64];
        let packet = setup(0x80, 0x42, 0, 0);
        assert_eq!(run(packet, DeviceType::Multi, &mut buf), Err(Stall));
    }

    #[test]
    fn test_missing_buffer_stalls_data_phase() {
        let catalog = DescriptorCatalog::new();
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0100, 18);
        assert_eq!(
            handle_setup(packet, None, DeviceType::Multi, &catalog),
            Err(Stall)
        );
        // Zero-length requests succeed without a buffer.
        let packet = setup(0x00, request::SET_CONFIGURATION, 1, 0);
        assert_eq!(handle_setup(packet, None, DeviceType::Multi, &catalog), Ok(0));
    }

    #[test]
    fn test_short_buffer_stalls() {
        let catalog = DescriptorCatalog::new();
        let mut buf = [0u8; 4];
        let packet = setup(0x80, request::GET_DESCRIPTOR, 0x0100, 18);
        assert_eq!(
            handle_setup(packet, Some(&mut buf), DeviceType::Multi, &catalog),
            Err(Stall)
        );
    }

    #[test]
    fn test_report_fits_interrupt_pipe() {
        // The endpoint advertises the report size; both sides agree on 12.
        let catalog = DescriptorCatalog::new();
        let max = catalog.for_type(DeviceType::Multi).endpoint.w_max_packet_size;
        assert_eq!(usize::from(max), REPORT_LENGTH);
    }
}
