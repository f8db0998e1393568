// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HID report descriptors for the SuperHID device flavours.
//!
//! The Multi device exposes all four collections in one descriptor; the
//! single-purpose flavours expose exactly one. Report ids keep the
//! collections apart inside the shared 12-byte report pipe.

use crate::DeviceType;
use crate::reports::{
    FINGERS_PER_REPORT, REPORT_ID_KEYBOARD, REPORT_ID_MOUSE, REPORT_ID_MULTITOUCH,
    REPORT_ID_TABLET,
};

/// Relative mouse with 5 buttons and a vertical wheel.
pub fn mouse_report_descriptor() -> Vec<u8> {
    vec![
        0x05, 0x01, // USAGE_PAGE (Generic Desktop)
        0x09, 0x02, // USAGE (Mouse)
        0xA1, 0x01, // COLLECTION (Application)
        0x85, REPORT_ID_MOUSE, //   REPORT_ID (2)
        0x09, 0x01, //   USAGE (Pointer)
        0xA1, 0x00, //   COLLECTION (Physical)
        0x05, 0x09, //     USAGE_PAGE (Button)
        0x19, 0x01, //     USAGE_MINIMUM (Button 1)
        0x29, 0x05, //     USAGE_MAXIMUM (Button 5)
        0x15, 0x00, //     LOGICAL_MINIMUM (0)
        0x25, 0x01, //     LOGICAL_MAXIMUM (1)
        0x95, 0x05, //     REPORT_COUNT (5)
        0x75, 0x01, //     REPORT_SIZE (1)
        0x81, 0x02, //     INPUT (Data,Var,Abs)
        0x95, 0x01, //     REPORT_COUNT (1)
        0x75, 0x03, //     REPORT_SIZE (3)
        0x81, 0x03, //     INPUT (Cnst,Var,Abs)
        0x05, 0x01, //     USAGE_PAGE (Generic Desktop)
        0x09, 0x30, //     USAGE (X)
        0x09, 0x31, //     USAGE (Y)
        0x09, 0x38, //     USAGE (Wheel)
        0x15, 0x81, //     LOGICAL_MINIMUM (-127)
        0x25, 0x7F, //     LOGICAL_MAXIMUM (127)
        0x75, 0x08, //     REPORT_SIZE (8)
        0x95, 0x03, //     REPORT_COUNT (3)
        0x81, 0x06, //     INPUT (Data,Var,Rel)
        0x95, 0x07, //     REPORT_COUNT (7)
        0x75, 0x08, //     REPORT_SIZE (8)
        0x81, 0x03, //     INPUT (Cnst,Var,Abs)
        0xC0, //   END_COLLECTION
        0xC0, // END_COLLECTION
    ]
}

/// Absolute "mouse" with 3 buttons, 16-bit coordinates.
pub fn tablet_report_descriptor() -> Vec<u8> {
    vec![
        0x05, 0x01, // USAGE_PAGE (Generic Desktop)
        0x09, 0x02, // USAGE (Mouse)
        0xA1, 0x01, // COLLECTION (Application)
        0x85, REPORT_ID_TABLET, //   REPORT_ID (3)
        0x09, 0x01, //   USAGE (Pointer)
        0xA1, 0x00, //   COLLECTION (Physical)
        0x05, 0x09, //     USAGE_PAGE (Button)
        0x19, 0x01, //     USAGE_MINIMUM (1)
        0x29, 0x03, //     USAGE_MAXIMUM (3)
        0x15, 0x00, //     LOGICAL_MINIMUM (0)
        0x25, 0x01, //     LOGICAL_MAXIMUM (1)
        0x75, 0x01, //     REPORT_SIZE (1)
        0x95, 0x03, //     REPORT_COUNT (3)
        0x81, 0x02, //     INPUT (Data,Var,Abs)
        0x95, 0x05, //     REPORT_COUNT (5)
        0x81, 0x03, //     INPUT (Cnst,Var,Abs)
        0x26, 0xFF, 0x7F, //     LOGICAL_MAXIMUM (32767)
        0x05, 0x01, //     USAGE_PAGE (Generic Desktop)
        0x75, 0x10, //     REPORT_SIZE (16)
        0x95, 0x01, //     REPORT_COUNT (1)
        0x09, 0x30, //     USAGE (X)
        0x81, 0x02, //     INPUT (Data,Var,Abs)
        0x09, 0x31, //     USAGE (Y)
        0x81, 0x02, //     INPUT (Data,Var,Abs)
        0x75, 0x08, //     REPORT_SIZE (8)
        0x95, 0x06, //     REPORT_COUNT (6)
        0x81, 0x03, //     INPUT (Cnst,Var,Abs)
        0xC0, //   END_COLLECTION
        0xC0, // END_COLLECTION
    ]
}

/// Boot keyboard: one modifier byte, six keycodes.
pub fn keyboard_report_descriptor() -> Vec<u8> {
    vec![
        0x05, 0x01, // Usage Page (Desktop)
        0x09, 0x06, // Usage (Keyboard)
        0xA1, 0x01, // Collection (Application)
        0x85, REPORT_ID_KEYBOARD, //   REPORT_ID (1)
        0x05, 0x07, //   Usage Page (Keyboard)
        0x19, 0xE0, //   Usage Minimum (KB Leftcontrol)
        0x29, 0xE7, //   Usage Maximum (KB Right GUI)
        0x15, 0x00, //   Logical Minimum (0)
        0x25, 0x01, //   Logical Maximum (1)
        0x75, 0x01, //   Report Size (1)
        0x95, 0x08, //   Report Count (8)
        0x81, 0x02, //   Input (Variable)
        0x81, 0x01, //   Input (Constant)
        0x95, 0x06, //   Report Count (6)
        0x75, 0x08, //   Report Size (8)
        0x15, 0x00, //   Logical Minimum (0)
        0x26, 0xFF, 0x00, //   Logical Maximum (255)
        0x05, 0x07, //   Usage Page (Keyboard)
        0x19, 0x00, //   Usage Minimum (None)
        0x2A, 0xFF, 0x00, //   Usage Maximum (FFh)
        0x81, 0x00, //   Input
        0x95, 0x03, //   REPORT_COUNT (3)
        0x81, 0x03, //   INPUT (Cnst,Var,Abs)
        0xC0, // End Collection
    ]
}

/// One finger of the multitouch digitizer: tip switch, contact id, 12-bit
/// coordinates.
fn finger_collection() -> Vec<u8> {
    vec![
        0x05, 0x0D, //   Usage Page (Digitizer)
        0x09, 0x22, //   Usage (Finger)
        0xA1, 0x02, //   Collection (Logical)
        0x09, 0x42, //     Usage (Tip Switch)
        0x15, 0x00, //     Logical Minimum (0)
        0x25, 0x01, //     Logical Maximum (1)
        0x75, 0x01, //     Report Size (1)
        0x95, 0x01, //     Report Count (1)
        0x81, 0x02, //     Input (Variable)
        0x95, 0x03, //     Report Count (3)
        0x81, 0x03, //     Input (Constant,Variable)
        0x09, 0x51, //     Usage (Contact Identifier)
        0x75, 0x04, //     Report Size (4)
        0x95, 0x01, //     Report Count (1)
        0x15, 0x00, //     Logical Minimum (0)
        0x25, 0x20, //     Logical Maximum (32)
        0x81, 0x02, //     Input (Variable)
        0x05, 0x01, //     Usage Page (Desktop)
        0x26, 0xFF, 0x0F, //     Logical Maximum (4095)
        0x75, 0x10, //     Report Size (16)
        0x55, 0x0E, //     Unit Exponent (14)
        0x65, 0x11, //     Unit (Centimeter)
        0x09, 0x30, //     Usage (X)
        0x35, 0x00, //     Physical Minimum (0)
        0x46, 0x7E, 0x08, //     Physical Maximum (2174)
        0x81, 0x02, //     Input (Variable)
        0x46, 0x4F, 0x05, //     Physical Maximum (1359)
        0x09, 0x31, //     Usage (Y)
        0x81, 0x02, //     Input (Variable)
        0xC0, //   End Collection
    ]
}

/// Two-finger touchscreen digitizer with a contact-count-maximum feature.
pub fn digitizer_report_descriptor() -> Vec<u8> {
    let mut desc = vec![
        0x05, 0x0D, // Usage Page (Digitizer)
        0x09, 0x04, // Usage (Touchscreen)
        0xA1, 0x01, // Collection (Application)
        0x85, REPORT_ID_MULTITOUCH, //   Report ID (4)
        0x05, 0x0D, //   Usage Page (Digitizer)
        0x09, 0x54, //   Usage (Contact Count)
        0x75, 0x08, //   Report Size (8)
        0x15, 0x00, //   Logical Minimum (0)
        0x25, 0x0C, //   Logical Maximum (12)
        0x95, 0x01, //   Report Count (1)
        0x81, 0x02, //   Input (Variable)
    ];
    for _ in 0..FINGERS_PER_REPORT {
        desc.extend_from_slice(&finger_collection());
    }
    desc.extend_from_slice(&[
        0x05, 0x0D, //   Usage Page (Digitizer)
        0x09, 0x55, //   Usage (Contact Count Max)
        0x15, 0x00, //   Logical Minimum (0)
        0x25, 0x7F, //   Logical Maximum (127)
        0x75, 0x08, //   Report Size (8)
        0x95, 0x01, //   Report Count (1)
        0xB1, 0x02, //   Feature (Variable)
        0xC0, // End Collection
    ]);
    desc
}

/// The Multi flavour: every collection in one descriptor.
pub fn multi_report_descriptor() -> Vec<u8> {
    let mut desc = mouse_report_descriptor();
    desc.extend_from_slice(&digitizer_report_descriptor());
    desc.extend_from_slice(&tablet_report_descriptor());
    desc.extend_from_slice(&keyboard_report_descriptor());
    desc
}

/// Report descriptor of one device flavour.
pub fn report_descriptor(typ: DeviceType) -> Vec<u8> {
    match typ {
        DeviceType::Multi => multi_report_descriptor(),
        DeviceType::Mouse => mouse_report_descriptor(),
        DeviceType::Digitizer => digitizer_report_descriptor(),
        DeviceType::Tablet => tablet_report_descriptor(),
        DeviceType::Keyboard => keyboard_report_descriptor(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lengths() {
        assert_eq!(mouse_report_descriptor().len(), 60);
        assert_eq!(tablet_report_descriptor().len(), 57);
        assert_eq!(keyboard_report_descriptor().len(), 49);
        assert_eq!(finger_collection().len(), 62);
        assert_eq!(digitizer_report_descriptor().len(), 161);
        assert_eq!(multi_report_descriptor().len(), 60 + 161 + 57 + 49);
    }

    #[test]
    fn test_multi_is_concatenation() {
        let multi = multi_report_descriptor();
        let mut expected = Vec::new();
        expected.extend_from_slice(&mouse_report_descriptor());
        expected.extend_from_slice(&digitizer_report_descriptor());
        expected.extend_from_slice(&tablet_report_descriptor());
        expected.extend_from_slice(&keyboard_report_descriptor());
        assert_eq!(multi, expected);
    }

    #[test]
    fn test_report_ids_in_place() {
        // Byte after the 0x85 tag is the report id of the collection.
        assert_eq!(mouse_report_descriptor()[7], REPORT_ID_MOUSE);
        assert_eq!(tablet_report_descriptor()[7], REPORT_ID_TABLET);
        assert_eq!(keyboard_report_descriptor()[7], REPORT_ID_KEYBOARD);
        assert_eq!(digitizer_report_descriptor()[7], REPORT_ID_MULTITOUCH);
    }

    #[test]
    fn test_digitizer_embeds_two_fingers() {
        let digitizer = digitizer_report_descriptor();
        let finger = finger_collection();
        assert_eq!(&digitizer[22..22 + 62], finger.as_slice());
        assert_eq!(&digitizer[22 + 62..22 + 124], finger.as_slice());
    }

    #[test]
    fn test_selection_by_type() {
        assert_eq!(report_descriptor(DeviceType::Mouse), mouse_report_descriptor());
        assert_eq!(report_descriptor(DeviceType::Multi), multi_report_descriptor());
    }
}
