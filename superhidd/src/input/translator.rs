// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Translation from kernel-style input events to HID reports.
//!
//! The input server forwards raw evdev events. This module folds them
//! into report state and emits a finished report on each sync: absolute
//! axes and clicks build a tablet report, plain keys a boot keyboard
//! report, relative axes a mouse report, and per-contact events fill
//! finger slots for the multitouch digitizer. Which report a sync
//! flushes follows a fixed priority, tablet first, then keyboard, then
//! mouse, then the current finger.

use hid::reports::{
    FingerSlot, KeyboardReport, MAX_CONTACTS, MouseReport, REPORT_ID_KEYBOARD, REPORT_ID_MOUSE,
    REPORT_ID_TABLET, Report, TabletReport,
};
use log::{debug, warn};
use vm_memory::ByteValued;

use super::socket::InputRecord;

// Event types and codes of the kernel input model, plus the input
// server's out-of-band device-switch type.
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const EV_ABS: u16 = 0x03;
const EV_MSC: u16 = 0x04;
const EV_DEV: u16 = 0x06;

const SYN_REPORT: u16 = 0x00;
const DEV_SET: u16 = 0x01;
const MSC_SCAN: u16 = 0x04;

const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;

const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;
const ABS_WHEEL: u16 = 0x08;
const ABS_MT_SLOT: u16 = 0x2F;
const ABS_MT_POSITION_X: u16 = 0x35;
const ABS_MT_POSITION_Y: u16 = 0x36;
const ABS_MT_TRACKING_ID: u16 = 0x39;
const ABS_MAX: u16 = 0x3F;

const KEY_RESERVED: u16 = 0x00;
const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;
const BTN_TOUCH: u16 = 0x14A;

/// Tracking id value that marks a lifted contact.
const TRACKING_ID_NONE: u32 = 0xFFFF_FFFF;

/// Kernel keycode for each HID keyboard usage, indexed by usage.
/// Translation runs the other way, scanning for the first entry that
/// matches a keycode.
#[rustfmt::skip]
const USAGE_TO_KEYCODE: [u8; 256] = [
      0,   0,   0,   0,  30,  48,  46,  32,  18,  33,  34,  35,  23,  36,  37,  38,
     50,  49,  24,  25,  16,  19,  31,  20,  22,  47,  17,  45,  21,  44,   2,   3,
      4,   5,   6,   7,   8,   9,  10,  11,  28,   1,  14,  15,  57,  12,  13,  26,
     27,  43,  43,  39,  40,  41,  51,  52,  53,  58,  59,  60,  61,  62,  63,  64,
     65,  66,  67,  68,  87,  88,  99,  70, 119, 110, 102, 104, 111, 107, 109, 106,
    105, 108, 103,  69,  98,  55,  74,  78,  96,  79,  80,  81,  75,  76,  77,  71,
     72,  73,  82,  83,  86, 127, 116, 117, 183, 184, 185, 186, 187, 188, 189, 190,
    191, 192, 193, 194, 134, 138, 130, 132, 128, 129, 131, 137, 133, 135, 136, 113,
    115, 114,   0,   0,   0, 121,   0,  89,  93, 124,  92,  94,  95,   0,   0,   0,
    122, 123,  90,  91,  85,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,
      0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,
      0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,
      0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,
      0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,
     29,  42,  56, 125,  97,  54, 100, 126, 164, 166, 165, 163, 161, 115, 114, 113,
    150, 158, 159, 128, 136, 177, 178, 176, 142, 152, 173, 140,   0,   0,   0,   0,
];

/// Kernel keycodes of the eight modifier keys, in HID modifier bit order
/// (left ctrl, shift, alt, meta, then the right-hand four).
const MODIFIER_KEYCODES: [u8; 8] = [29, 42, 56, 125, 97, 54, 100, 126];

/// HID usage for a kernel keycode, 0 when the key has no usage.
fn hid_usage(keycode: u8) -> u8 {
    USAGE_TO_KEYCODE
        .iter()
        .position(|&entry| entry == keycode)
        .map_or(0, |usage| usage as u8)
}

/// HID modifier bit for a kernel keycode, 0 for ordinary keys.
fn modifier_bit(keycode: u8) -> u8 {
    MODIFIER_KEYCODES
        .iter()
        .position(|&entry| entry == keycode)
        .map_or(0, |index| 1 << index)
}

/// What one input record turned into.
#[derive(Debug, Clone, Copy)]
pub enum Translated {
    /// State was folded in, nothing to send yet.
    Nothing,
    /// A finger slot to accumulate into a multitouch report.
    Finger(FingerSlot),
    /// A finished non-touch report.
    Report(Report),
}

/// Event-to-report state machine for one guest's input stream.
pub struct Translator {
    fingers: [FingerSlot; MAX_CONTACTS],
    current_finger: usize,
    tablet: TabletReport,
    keyboard: KeyboardReport,
    mouse: MouseReport,
    /// Device the current events come from, per the last switch record.
    dev_set: u32,
    /// Device latched as the multitouch digitizer.
    multitouch_dev: Option<u32>,
    just_synced: bool,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    pub fn new() -> Self {
        let mut fingers = [FingerSlot::default(); MAX_CONTACTS];
        for (id, finger) in fingers.iter_mut().enumerate() {
            finger.set_finger_id(id as u8);
        }
        Translator {
            fingers,
            current_finger: 0,
            tablet: TabletReport::default(),
            keyboard: KeyboardReport::default(),
            mouse: MouseReport::default(),
            dev_set: 0,
            multitouch_dev: None,
            just_synced: false,
        }
    }

    /// Fold one record into the state machine.
    pub fn push(&mut self, record: InputRecord) -> Translated {
        let InputRecord {
            itype,
            icode,
            ivalue,
        } = record;

        if itype == EV_DEV {
            if icode == DEV_SET {
                self.dev_set = ivalue;
                debug!("Input now comes from device {ivalue}");
            } else {
                debug!("Unhandled device event {icode} {ivalue}");
            }
            return Translated::Nothing;
        }

        // The first device that reports per-contact axes is the
        // digitizer; its plain ABS_X/ABS_Y noise must not move the
        // tablet.
        if self.multitouch_dev.is_none()
            && itype == EV_ABS
            && (ABS_MT_SLOT..=ABS_MAX).contains(&icode)
        {
            self.multitouch_dev = Some(self.dev_set);
        }

        if itype == EV_SYN && icode == SYN_REPORT {
            return self.sync();
        }

        let emitted = match itype {
            EV_REL => self.relative(icode, ivalue),
            EV_ABS => self.absolute(icode, ivalue),
            EV_KEY => self.key(icode, ivalue),
            EV_SYN => {
                debug!("Unhandled sync code {icode}");
                Translated::Nothing
            }
            EV_MSC => {
                if icode != MSC_SCAN {
                    debug!("Unhandled misc event {icode}");
                }
                Translated::Nothing
            }
            _ => {
                debug!("Unhandled event {itype} {icode}");
                Translated::Nothing
            }
        };
        self.just_synced = false;
        emitted
    }

    /// Flush the highest-priority pending report.
    ///
    /// Tablet and keyboard keep their positional and pressed state
    /// across reports and only drop the pending flag; the mouse resets
    /// fully so its deltas are sent once. With nothing else pending the
    /// sync closes a touch sequence, so the current finger goes out.
    fn sync(&mut self) -> Translated {
        self.just_synced = true;
        if self.tablet.report_id == REPORT_ID_TABLET {
            let report = Report::from_payload(self.tablet.as_slice());
            self.tablet.report_id = 0;
            Translated::Report(report)
        } else if self.keyboard.report_id == REPORT_ID_KEYBOARD {
            let report = Report::from_payload(self.keyboard.as_slice());
            self.keyboard.report_id = 0;
            Translated::Report(report)
        } else if self.mouse.report_id == REPORT_ID_MOUSE {
            let report = Report::from_payload(self.mouse.as_slice());
            self.mouse = MouseReport::default();
            Translated::Report(report)
        } else {
            Translated::Finger(self.fingers[self.current_finger])
        }
    }

    fn relative(&mut self, icode: u16, ivalue: u32) -> Translated {
        match icode {
            REL_X => {
                self.mouse.report_id = REPORT_ID_MOUSE;
                self.mouse.x = ivalue as u8;
            }
            REL_Y => {
                self.mouse.report_id = REPORT_ID_MOUSE;
                self.mouse.y = ivalue as u8;
            }
            REL_WHEEL => {
                self.mouse.report_id = REPORT_ID_MOUSE;
                self.mouse.wheel = ivalue as u8;
            }
            _ => debug!("Unhandled relative axis {icode:#x}"),
        }
        Translated::Nothing
    }

    fn absolute(&mut self, icode: u16, ivalue: u32) -> Translated {
        match icode {
            // Digitizers also emit plain ABS_X/ABS_Y for their contacts.
            ABS_X if !self.from_multitouch_dev() => {
                self.tablet.report_id = REPORT_ID_TABLET;
                self.tablet.x = ivalue as u16;
            }
            ABS_Y if !self.from_multitouch_dev() => {
                self.tablet.report_id = REPORT_ID_TABLET;
                self.tablet.y = ivalue as u16;
            }
            ABS_X | ABS_Y | ABS_WHEEL => {}
            ABS_MT_POSITION_X => {
                // 15-bit coordinates scale down to the 12-bit report axes.
                self.fingers[self.current_finger].x = (ivalue >> 3) as u16;
            }
            ABS_MT_POSITION_Y => {
                self.fingers[self.current_finger].y = (ivalue >> 3) as u16;
            }
            ABS_MT_SLOT => {
                // Contacts arrive serialized, so a slot switch closes the
                // current finger unless a sync just did.
                let emitted = if self.just_synced {
                    Translated::Nothing
                } else {
                    Translated::Finger(self.fingers[self.current_finger])
                };
                if (ivalue as usize) < MAX_CONTACTS {
                    self.current_finger = ivalue as usize;
                } else {
                    warn!("Ignoring contact slot {ivalue} beyond the tracked range");
                }
                return emitted;
            }
            ABS_MT_TRACKING_ID => {
                let finger = &mut self.fingers[self.current_finger];
                let was_down = finger.tip_switch();
                let down = ivalue != TRACKING_ID_NONE;
                finger.set_tip_switch(down);
                if was_down && !down {
                    // A lifted finger may see no further events; report
                    // the release right away.
                    return Translated::Finger(*finger);
                }
            }
            _ => debug!("Unhandled absolute axis {icode:#x}"),
        }
        Translated::Nothing
    }

    fn key(&mut self, icode: u16, ivalue: u32) -> Translated {
        match icode {
            BTN_LEFT => {
                self.tablet.report_id = REPORT_ID_TABLET;
                self.tablet.set_left_click(ivalue != 0);
            }
            BTN_RIGHT => {
                self.tablet.report_id = REPORT_ID_TABLET;
                self.tablet.set_right_click(ivalue != 0);
            }
            BTN_MIDDLE => {
                self.tablet.report_id = REPORT_ID_TABLET;
                self.tablet.set_middle_click(ivalue != 0);
            }
            // The tip switch already travels with the finger slots.
            BTN_TOUCH => {}
            // Touchscreens emit keycode 0 noise.
            KEY_RESERVED => {}
            code if code < 0x100 => {
                self.keyboard.report_id = REPORT_ID_KEYBOARD;
                let modifier = modifier_bit(code as u8);
                if ivalue != 0 {
                    if modifier != 0 {
                        self.keyboard.modifier |= modifier;
                    } else {
                        self.keyboard.keycode[0] = hid_usage(code as u8);
                    }
                } else if modifier != 0 {
                    self.keyboard.modifier &= !modifier;
                } else {
                    self.keyboard.keycode[0] = 0;
                }
            }
            _ => debug!("Unhandled key {icode:#x}"),
        }
        Translated::Nothing
    }

    fn from_multitouch_dev(&self) -> bool {
        self.multitouch_dev == Some(self.dev_set)
    }
}
