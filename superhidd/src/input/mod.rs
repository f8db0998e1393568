// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Input acquisition and translation.
//!
//! Events flow from the input server's socket through three stages:
//!
//! ```text
//!  socket bytes -> RecordStream -> Translator -> ReportAssembler -> ring
//!                  (framing)       (evdev to     (2 fingers per
//!                                   reports)      touch report)
//! ```
//!
//! The input server only feeds one subscriber, so a single guest holds
//! the input at a time; [`InputGrabber`] tracks who.

pub mod socket;
pub mod translator;

use hid::reports::{
    FINGERS_PER_REPORT, FingerSlot, MultitouchReport, REPORT_ID_MULTITOUCH, Report,
};
use vm_memory::ByteValued;

/// Ownership of the input server's single event subscription.
///
/// A released slot stays poisoned for the releasing domain until the
/// domain is observed gone, because the server still counts the old
/// subscription against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputGrabber {
    #[default]
    Free,
    Held(u32),
    Released(u32),
}

impl InputGrabber {
    /// Claim the subscription for `domid`. Fails while another claim is
    /// live or the same domain's old subscription has not been reaped.
    pub fn try_grab(&mut self, domid: u32) -> bool {
        match *self {
            InputGrabber::Held(_) => false,
            InputGrabber::Released(prev) if prev == domid => false,
            _ => {
                *self = InputGrabber::Held(domid);
                true
            }
        }
    }

    /// Give the subscription up on behalf of a dying backend.
    pub fn release(&mut self, domid: u32) {
        if *self == InputGrabber::Held(domid) {
            *self = InputGrabber::Released(domid);
        }
    }

    /// The domain is fully gone; its released slot can be reused.
    pub fn reap(&mut self, domid: u32) {
        if *self == InputGrabber::Released(domid) {
            *self = InputGrabber::Free;
        }
    }

    pub fn holder(&self) -> Option<u32> {
        match *self {
            InputGrabber::Held(domid) => Some(domid),
            _ => None,
        }
    }
}

/// Collects finger slots into multitouch reports, two per report.
#[derive(Default)]
pub struct ReportAssembler {
    report: MultitouchReport,
}

impl ReportAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one finger; returns the finished report when it fills up.
    pub fn push(&mut self, finger: FingerSlot) -> Option<Report> {
        let index = self.report.count as usize;
        self.report.report_id = REPORT_ID_MULTITOUCH;
        self.report.fingers[index] = finger;
        self.report.count += 1;
        if self.report.count as usize == FINGERS_PER_REPORT {
            let full = Report::from_payload(self.report.as_slice());
            self.report = MultitouchReport::default();
            Some(full)
        } else {
            None
        }
    }

    /// Hand out a half-filled report, leaving the assembler empty.
    pub fn take_partial(&mut self) -> Option<Report> {
        if self.report.count == 0 {
            return None;
        }
        let partial = Report::from_payload(self.report.as_slice());
        self.report = MultitouchReport::default();
        Some(partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grabber_serves_one_domain_at_a_time() {
        let mut grabber = InputGrabber::default();
        assert!(grabber.try_grab(7));
        assert_eq!(grabber.holder(), Some(7));
        assert!(!grabber.try_grab(8));

        grabber.release(7);
        assert_eq!(grabber.holder(), None);
        // The stale subscription blocks the same domain only.
        assert!(!grabber.try_grab(7));
        assert!(grabber.try_grab(8));
    }

    #[test]
    fn test_reaping_frees_a_released_slot() {
        let mut grabber = InputGrabber::default();
        assert!(grabber.try_grab(7));
        grabber.release(7);
        grabber.reap(7);
        assert!(grabber.try_grab(7));
        // Reaping the active holder does nothing.
        grabber.reap(7);
        assert_eq!(grabber.holder(), Some(7));
    }

    #[test]
    fn test_release_by_non_holder_is_ignored() {
        let mut grabber = InputGrabber::default();
        assert!(grabber.try_grab(7));
        grabber.release(9);
        assert_eq!(grabber.holder(), Some(7));
    }

    #[test]
    fn test_assembler_emits_pairs() {
        let mut assembler = ReportAssembler::new();
        let mut first = FingerSlot::default();
        first.set_finger_id(0);
        first.set_tip_switch(true);
        first.x = 100;
        let mut second = FingerSlot::default();
        second.set_finger_id(1);
        second.x = 200;

        assert!(assembler.push(first).is_none());
        let report = assembler.push(second).unwrap();
        assert_eq!(report.report_id, REPORT_ID_MULTITOUCH);
        assert_eq!(report.data[0], 2);
        // First finger flags at offset 2 of the report.
        assert_eq!(report.data[1], 0x01);

        // The assembler starts over afterwards.
        assert!(assembler.take_partial().is_none());
    }

    #[test]
    fn test_partial_reports_carry_their_count() {
        let mut assembler = ReportAssembler::new();
        let mut finger = FingerSlot::default();
        finger.set_finger_id(3);
        finger.set_tip_switch(true);
        assert!(assembler.push(finger).is_none());

        let report = assembler.take_partial().unwrap();
        assert_eq!(report.report_id, REPORT_ID_MULTITOUCH);
        assert_eq!(report.data[0], 1);
        assert_eq!(report.data[1], 0x31);
        assert!(assembler.take_partial().is_none());
    }
}
