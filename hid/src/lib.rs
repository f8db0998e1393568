// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! SuperHID USB device model
//!
//! This crate fabricates a USB 2.0 HID device entirely in software:
//! descriptors, report layouts and the control-transfer responder. It is
//! transport independent; the paravirtualized backend lives elsewhere and
//! calls into this crate with parsed setup packets and mapped buffers.

pub mod control;
pub mod descriptors;
pub mod report_desc;
pub mod reports;

pub use control::{ControlResult, SetupPacket, Stall, handle_setup};
pub use descriptors::{
    DescriptorCatalog, DescriptorSet, PRODUCT_NAME, USB_PRODUCT_ID, USB_VENDOR_ID,
};
pub use report_desc::report_descriptor;
pub use reports::REPORT_LENGTH;

/// The SuperHID device flavours, in bus order.
///
/// The ordinal doubles as the virtual device id on the PV bus, so Multi
/// is device 1, Mouse device 2 and so on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    /// One device exposing every report collection at once.
    Multi = 1,
    /// Relative mouse with 5 buttons and a wheel.
    Mouse = 2,
    /// Two-finger multitouch digitizer.
    Digitizer = 3,
    /// Absolute pointer with 3 buttons.
    Tablet = 4,
    /// Boot keyboard.
    Keyboard = 5,
}

impl DeviceType {
    /// Virtual device id on the PV bus.
    pub fn virtid(self) -> u32 {
        self as u32
    }

    /// Whether a device of this type can carry a report with the given id.
    pub fn accepts_report(self, report_id: u8) -> bool {
        match self {
            DeviceType::Multi => true,
            DeviceType::Mouse => report_id == reports::REPORT_ID_MOUSE,
            DeviceType::Digitizer => report_id == reports::REPORT_ID_MULTITOUCH,
            DeviceType::Tablet => report_id == reports::REPORT_ID_TABLET,
            DeviceType::Keyboard => report_id == reports::REPORT_ID_KEYBOARD,
        }
    }
}

impl TryFrom<u32> for DeviceType {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeviceType::Multi),
            2 => Ok(DeviceType::Mouse),
            3 => Ok(DeviceType::Digitizer),
            4 => Ok(DeviceType::Tablet),
            5 => Ok(DeviceType::Keyboard),
            _ => Err("Invalid device type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_roundtrip() {
        for typ in [
            DeviceType::Multi,
            DeviceType::Mouse,
            DeviceType::Digitizer,
            DeviceType::Tablet,
            DeviceType::Keyboard,
        ] {
            assert_eq!(DeviceType::try_from(typ.virtid()), Ok(typ));
        }
        assert!(DeviceType::try_from(0).is_err());
        assert!(DeviceType::try_from(6).is_err());
    }

    #[test]
    fn test_report_routing() {
        assert!(DeviceType::Multi.accepts_report(reports::REPORT_ID_KEYBOARD));
        assert!(DeviceType::Multi.accepts_report(reports::REPORT_ID_MULTITOUCH));
        assert!(DeviceType::Mouse.accepts_report(reports::REPORT_ID_MOUSE));
        assert!(!DeviceType::Mouse.accepts_report(reports::REPORT_ID_TABLET));
        assert!(DeviceType::Digitizer.accepts_report(reports::REPORT_ID_MULTITOUCH));
        assert!(DeviceType::Tablet.accepts_report(reports::REPORT_ID_TABLET));
        assert!(DeviceType::Keyboard.accepts_report(reports::REPORT_ID_KEYBOARD));
        assert!(!DeviceType::Keyboard.accepts_report(reports::REPORT_ID_MOUSE));
    }
}
