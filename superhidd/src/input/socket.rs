// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Record framing for the input server socket.
//!
//! The input server streams fixed 12 byte records over a local socket.
//! Records are only delimited by their leading magic, so after a torn
//! read the stream is recovered by scanning byte for byte until the
//! magic lines up again.

use std::io::{self, Read};

use byteorder::{ByteOrder, NativeEndian};
use log::warn;

/// Leading marker of every record.
pub const RECORD_MAGIC: u32 = 0xAD9C_BCE9;
/// Wire size of one record.
pub const RECORD_SIZE: usize = 12;
/// The rolling receive buffer holds a small burst of records.
const BUFFER_CAPACITY: usize = RECORD_SIZE * 20;

/// Event type of control messages addressed to the input server itself.
const CONTROL_TYPE: u16 = 0x07;
/// Control code asking the server to direct a domain's events here.
const CONTROL_GRAB: u16 = 0x02;

/// One input event as carried on the socket, in host byte order.
///
/// `itype`, `icode` and `ivalue` follow the kernel input event model,
/// plus the out-of-band device-switch and control types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRecord {
    pub itype: u16,
    pub icode: u16,
    pub ivalue: u32,
}

impl InputRecord {
    /// Control record subscribing this connection to a domain's input.
    pub fn grab(domid: u32) -> InputRecord {
        InputRecord {
            itype: CONTROL_TYPE,
            icode: CONTROL_GRAB,
            ivalue: domid,
        }
    }

    pub fn to_wire(self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        NativeEndian::write_u32(&mut bytes[0..4], RECORD_MAGIC);
        NativeEndian::write_u16(&mut bytes[4..6], self.itype);
        NativeEndian::write_u16(&mut bytes[6..8], self.icode);
        NativeEndian::write_u32(&mut bytes[8..12], self.ivalue);
        bytes
    }

    fn from_wire(bytes: &[u8]) -> InputRecord {
        InputRecord {
            itype: NativeEndian::read_u16(&bytes[4..6]),
            icode: NativeEndian::read_u16(&bytes[6..8]),
            ivalue: NativeEndian::read_u32(&bytes[8..12]),
        }
    }
}

/// Rolling buffer turning the byte stream into records.
pub struct RecordStream {
    buffer: [u8; BUFFER_CAPACITY],
    position: usize,
    remaining: usize,
}

impl Default for RecordStream {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStream {
    pub fn new() -> Self {
        RecordStream {
            buffer: [0; BUFFER_CAPACITY],
            position: 0,
            remaining: 0,
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.remaining
    }

    /// Top the buffer up from `reader` if it holds less than one record.
    ///
    /// Returns `false` when the reader reported end of stream, which
    /// means the input server hung up. A reader that would block counts
    /// as alive with nothing new.
    pub fn fill(&mut self, reader: &mut impl Read) -> io::Result<bool> {
        if self.position != 0 && self.remaining != 0 {
            self.buffer
                .copy_within(self.position..self.position + self.remaining, 0);
        }
        self.position = 0;
        if self.remaining >= RECORD_SIZE {
            return Ok(true);
        }
        match reader.read(&mut self.buffer[self.remaining..]) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.remaining += n;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Pop the next well-formed record, scanning past any junk.
    pub fn next_record(&mut self) -> Option<InputRecord> {
        let start = self.position;
        let record = loop {
            if self.remaining < RECORD_SIZE {
                break None;
            }
            let bytes = &self.buffer[self.position..self.position + RECORD_SIZE];
            if NativeEndian::read_u32(&bytes[0..4]) == RECORD_MAGIC {
                let record = InputRecord::from_wire(bytes);
                self.position += RECORD_SIZE;
                self.remaining -= RECORD_SIZE;
                break Some(record);
            }
            self.position += 1;
            self.remaining -= 1;
        };
        let skipped = match record {
            Some(_) => self.position - start - RECORD_SIZE,
            None => self.position - start,
        };
        if skipped > 0 {
            warn!("Skipped {skipped} bytes of junk on the input stream");
        }
        record
    }
}
