// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Input report layouts.
//!
//! Every input report is exactly [`REPORT_LENGTH`] bytes on the wire; the
//! first byte is the report id, which tells the flavours apart inside the
//! Multi device's single interrupt pipe.

use vm_memory::ByteValued;

/// Size of every input report on the wire.
pub const REPORT_LENGTH: usize = 12;

/// Contacts the digitizer tracks (also the max-contact-count feature value).
pub const MAX_CONTACTS: usize = 10;

/// Fingers carried per multitouch report.
pub const FINGERS_PER_REPORT: usize = 2;

/// Contact id marking a finger slot that has not been filled yet.
pub const FINGER_ID_UNSET: u8 = 0x0F;

pub const REPORT_ID_KEYBOARD: u8 = 0x01;
pub const REPORT_ID_MOUSE: u8 = 0x02;
pub const REPORT_ID_TABLET: u8 = 0x03;
pub const REPORT_ID_MULTITOUCH: u8 = 0x04;
pub const REPORT_ID_STYLUS: u8 = 0x05;
pub const REPORT_ID_PUCK: u8 = 0x06;
pub const REPORT_ID_FINGER: u8 = 0x07;

/// Feature report ids.
pub const FEATURE_MAX_CONTACT_COUNT: u8 = 0x04;
pub const FEATURE_CONFIG: u8 = 0x11;
pub const FEATURE_INVALID: u8 = 0xFF;

// ============================================================================
// Report layouts
// ============================================================================

/// Type-erased 12-byte report as written into guest buffers.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Report {
    pub report_id: u8,
    pub data: [u8; REPORT_LENGTH - 1],
}

// SAFETY: Report is POD and has no implicit padding
unsafe impl ByteValued for Report {}

impl Report {
    /// Copy a specific report's bytes into the erased carrier. The payload
    /// must be exactly [`REPORT_LENGTH`] bytes.
    pub fn from_payload(bytes: &[u8]) -> Self {
        let mut report = Report::default();
        report.as_mut_slice().copy_from_slice(bytes);
        report
    }
}

/// One finger inside a multitouch report: tip switch in bit 0, contact id
/// in the high nibble, then 12-bit coordinates.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FingerSlot {
    flags: u8,
    pub x: u16,
    pub y: u16,
}

// SAFETY: FingerSlot is POD and has no implicit padding
unsafe impl ByteValued for FingerSlot {}

impl FingerSlot {
    pub fn tip_switch(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn set_tip_switch(&mut self, down: bool) {
        if down {
            self.flags |= 0x01;
        } else {
            self.flags &= !0x01;
        }
    }

    pub fn finger_id(&self) -> u8 {
        self.flags >> 4
    }

    pub fn set_finger_id(&mut self, id: u8) {
        self.flags = (self.flags & 0x0F) | ((id & 0x0F) << 4);
    }
}

/// Multitouch digitizer report: contact count plus two finger slots.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct MultitouchReport {
    pub report_id: u8,
    pub count: u8,
    pub fingers: [FingerSlot; FINGERS_PER_REPORT],
}

// SAFETY: MultitouchReport is POD and has no implicit padding
unsafe impl ByteValued for MultitouchReport {}

/// Absolute pointer report.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct TabletReport {
    pub report_id: u8,
    buttons: u8,
    pub x: u16,
    pub y: u16,
    pad: [u8; 6],
}

// SAFETY: TabletReport is POD and has no implicit padding
unsafe impl ByteValued for TabletReport {}

impl TabletReport {
    pub fn left_click(&self) -> bool {
        self.buttons & 0x01 != 0
    }

    pub fn set_left_click(&mut self, down: bool) {
        self.set_button(0x01, down);
    }

    pub fn right_click(&self) -> bool {
        self.buttons & 0x02 != 0
    }

    pub fn set_right_click(&mut self, down: bool) {
        self.set_button(0x02, down);
    }

    pub fn middle_click(&self) -> bool {
        self.buttons & 0x04 != 0
    }

    pub fn set_middle_click(&mut self, down: bool) {
        self.set_button(0x04, down);
    }

    fn set_button(&mut self, bit: u8, down: bool) {
        if down {
            self.buttons |= bit;
        } else {
            self.buttons &= !bit;
        }
    }
}

/// Boot keyboard report.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct KeyboardReport {
    pub report_id: u8,
    pub modifier: u8,
    pub reserved: u8,
    pub keycode: [u8; 6],
    pad: [u8; 3],
}

// SAFETY: KeyboardReport is POD and has no implicit padding
unsafe impl ByteValued for KeyboardReport {}

/// Relative mouse report. X/Y/wheel carry two's-complement deltas.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct MouseReport {
    pub report_id: u8,
    buttons: u8,
    pub x: u8,
    pub y: u8,
    pub wheel: u8,
    pad: [u8; 7],
}

// SAFETY: MouseReport is POD and has no implicit padding
unsafe impl ByteValued for MouseReport {}

impl MouseReport {
    pub fn left_click(&self) -> bool {
        self.buttons & 0x01 != 0
    }

    pub fn set_left_click(&mut self, down: bool) {
        self.set_button(0x01, down);
    }

    pub fn right_click(&self) -> bool {
        self.buttons & 0x02 != 0
    }

    pub fn set_right_click(&mut self, down: bool) {
        self.set_button(0x02, down);
    }

    pub fn middle_click(&self) -> bool {
        self.buttons & 0x04 != 0
    }

    pub fn set_middle_click(&mut self, down: bool) {
        self.set_button(0x04, down);
    }

    fn set_button(&mut self, bit: u8, down: bool) {
        if down {
            self.buttons |= bit;
        } else {
            self.buttons &= !bit;
        }
    }
}

/// Two-byte feature report answered to GET_REPORT(Feature).
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct FeatureReport {
    pub feature: u8,
    pub value: u8,
}

// SAFETY: FeatureReport is POD and has no implicit padding
unsafe impl ByteValued for FeatureReport {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_sizes() {
        assert_eq!(size_of::<Report>(), REPORT_LENGTH);
        assert_eq!(size_of::<FingerSlot>(), 5);
        assert_eq!(size_of::<MultitouchReport>(), REPORT_LENGTH);
        assert_eq!(size_of::<TabletReport>(), REPORT_LENGTH);
        assert_eq!(size_of::<KeyboardReport>(), REPORT_LENGTH);
        assert_eq!(size_of::<MouseReport>(), REPORT_LENGTH);
        assert_eq!(size_of::<FeatureReport>(), 2);
    }

    #[test]
    fn test_finger_flags() {
        let mut finger = FingerSlot::default();
        assert!(!finger.tip_switch());
        finger.set_tip_switch(true);
        assert!(finger.tip_switch());
        finger.set_finger_id(7);
        assert_eq!(finger.finger_id(), 7);
        assert!(finger.tip_switch());
        finger.set_tip_switch(false);
        assert_eq!(finger.finger_id(), 7);
        // Ids are four bits wide.
        finger.set_finger_id(0x1F);
        assert_eq!(finger.finger_id(), 0x0F);
    }

    #[test]
    fn test_tablet_buttons() {
        let mut tablet = TabletReport::default();
        tablet.set_left_click(true);
        tablet.set_middle_click(true);
        assert!(tablet.left_click());
        assert!(!tablet.right_click());
        assert!(tablet.middle_click());
        tablet.set_left_click(false);
        assert!(!tablet.left_click());
        assert!(tablet.middle_click());
    }

    #[test]
    fn test_report_from_payload() {
        let mut kbd = KeyboardReport {
            report_id: REPORT_ID_KEYBOARD,
            modifier: 0x02,
            ..Default::default()
        };
        kbd.keycode[0] = 0x04;
        let report = Report::from_payload(kbd.as_slice());
        assert_eq!(report.report_id, REPORT_ID_KEYBOARD);
        assert_eq!(report.as_slice(), kbd.as_slice());
    }

    #[test]
    fn test_multitouch_layout() {
        let mut mt = MultitouchReport {
            report_id: REPORT_ID_MULTITOUCH,
            count: 2,
            ..Default::default()
        };
        mt.fingers[0].set_tip_switch(true);
        mt.fingers[0].set_finger_id(1);
        mt.fingers[0].x = 0x0123;
        mt.fingers[1].set_finger_id(2);
        let bytes = mt.as_slice();
        assert_eq!(bytes[0], REPORT_ID_MULTITOUCH);
        assert_eq!(bytes[1], 2);
        // First finger starts at offset 2: flags then little-endian x.
        assert_eq!(bytes[2], 0x11);
        assert_eq!(bytes[3], 0x23);
        assert_eq!(bytes[4], 0x01);
        // Second finger at offset 7.
        assert_eq!(bytes[7], 0x20);
    }

    #[test]
    fn test_feature_report_bytes() {
        let feature = FeatureReport {
            feature: FEATURE_MAX_CONTACT_COUNT,
            value: MAX_CONTACTS as u8,
        };
        assert_eq!(feature.as_slice(), &[0x04, 10]);
    }
}
