// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire-protocol client for the store daemon's unix socket.
//!
//! Every message starts with a 16 byte little-endian header:
//!
//! ```text
//!  0       4       8       12      16
//!  +-------+-------+-------+-------+----------------------+
//!  | type  | req id| tx id | len   | payload (len bytes)  |
//!  +-------+-------+-------+-------+----------------------+
//! ```
//!
//! Requests and replies pair up in order; watch events arrive unsolicited
//! with the same framing and are stashed aside until [`Store::next_event`]
//! asks for them. String payload fields are NUL-terminated.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use super::{PermEntry, Result, Store, StoreError, WatchEvent};

const HEADER_SIZE: usize = 16;
/// Upper bound the store daemon places on a message body.
const PAYLOAD_MAX: usize = 4096;

mod msg {
    pub const DIRECTORY: u32 = 1;
    pub const READ: u32 = 2;
    pub const WATCH: u32 = 4;
    pub const UNWATCH: u32 = 5;
    pub const TRANSACTION_START: u32 = 6;
    pub const TRANSACTION_END: u32 = 7;
    pub const GET_DOMAIN_PATH: u32 = 10;
    pub const WRITE: u32 = 11;
    pub const MKDIR: u32 = 12;
    pub const RM: u32 = 13;
    pub const SET_PERMS: u32 = 14;
    pub const WATCH_EVENT: u32 = 15;
    pub const ERROR: u32 = 16;
}

/// Store client speaking the socket protocol.
pub struct SocketStore {
    stream: UnixStream,
    /// Watch events read while waiting for a reply.
    stashed: VecDeque<WatchEvent>,
    next_req_id: u32,
    tx_id: u32,
}

impl SocketStore {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(SocketStore {
            stream,
            stashed: VecDeque::new(),
            next_req_id: 1,
            tx_id: 0,
        })
    }

    fn read_message(&mut self) -> Result<(u32, u32, Vec<u8>)> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header)?;
        let typ = LittleEndian::read_u32(&header[0..4]);
        let req_id = LittleEndian::read_u32(&header[4..8]);
        let len = LittleEndian::read_u32(&header[12..16]) as usize;
        if len > PAYLOAD_MAX {
            return Err(StoreError::Protocol(format!(
                "Reply body of {len} bytes exceeds the protocol limit"
            )));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok((typ, req_id, payload))
    }

    /// Send one request and wait for its reply, stashing any watch events
    /// that arrive in between. `context` names the node for error reports.
    fn request(&mut self, typ: u32, context: &str, parts: &[&[u8]]) -> Result<Vec<u8>> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > PAYLOAD_MAX {
            return Err(StoreError::Protocol(format!(
                "Request body of {len} bytes exceeds the protocol limit"
            )));
        }
        let req_id = self.next_req_id;
        self.next_req_id = self.next_req_id.wrapping_add(1);

        let mut message = Vec::with_capacity(HEADER_SIZE + len);
        message.resize(HEADER_SIZE, 0);
        LittleEndian::write_u32(&mut message[0..4], typ);
        LittleEndian::write_u32(&mut message[4..8], req_id);
        LittleEndian::write_u32(&mut message[8..12], self.tx_id);
        LittleEndian::write_u32(&mut message[12..16], len as u32);
        for part in parts {
            message.extend_from_slice(part);
        }
        self.stream.write_all(&message)?;

        loop {
            let (rtyp, rid, payload) = self.read_message()?;
            if rtyp == msg::WATCH_EVENT {
                match parse_event(&payload) {
                    Ok(event) => self.stashed.push_back(event),
                    Err(e) => warn!("Dropping malformed watch event: {e}"),
                }
                continue;
            }
            if rid != req_id {
                return Err(StoreError::Protocol(format!(
                    "Reply id {rid} does not match request id {req_id}"
                )));
            }
            if rtyp == msg::ERROR {
                return Err(decode_error(&payload, context));
            }
            if rtyp != typ {
                return Err(StoreError::Protocol(format!(
                    "Reply type {rtyp} does not match request type {typ}"
                )));
            }
            return Ok(payload);
        }
    }

    fn readable(&self) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd points to one valid pollfd for the duration of the
        // call and the timeout of zero makes it non-blocking.
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(StoreError::Io(err));
        }
        Ok(ret > 0 && (pfd.revents & libc::POLLIN) != 0)
    }
}

impl Store for SocketStore {
    fn read(&mut self, path: &str) -> Result<String> {
        let payload = self.request(msg::READ, path, &[path.as_bytes(), b"\0"])?;
        text(&payload)
    }

    fn write(&mut self, path: &str, value: &str) -> Result<()> {
        self.request(
            msg::WRITE,
            path,
            &[path.as_bytes(), b"\0", value.as_bytes()],
        )?;
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.request(msg::MKDIR, path, &[path.as_bytes(), b"\0"])?;
        Ok(())
    }

    fn rm(&mut self, path: &str) -> Result<()> {
        self.request(msg::RM, path, &[path.as_bytes(), b"\0"])?;
        Ok(())
    }

    fn directory(&mut self, path: &str) -> Result<Vec<String>> {
        let payload = self.request(msg::DIRECTORY, path, &[path.as_bytes(), b"\0"])?;
        payload
            .split(|&b| b == 0)
            .filter(|entry| !entry.is_empty())
            .map(text)
            .collect()
    }

    fn set_perms(&mut self, path: &str, perms: &[PermEntry]) -> Result<()> {
        let mut parts: Vec<Vec<u8>> = vec![path.as_bytes().to_vec(), b"\0".to_vec()];
        for entry in perms {
            let mut encoded = encode_perm(entry).into_bytes();
            encoded.push(0);
            parts.push(encoded);
        }
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        self.request(msg::SET_PERMS, path, &refs)?;
        Ok(())
    }

    fn get_domain_path(&mut self, domid: u32) -> Result<String> {
        let decimal = domid.to_string();
        let payload = self.request(
            msg::GET_DOMAIN_PATH,
            &decimal,
            &[decimal.as_bytes(), b"\0"],
        )?;
        text(strip_nul(&payload))
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<()> {
        self.request(
            msg::WATCH,
            path,
            &[path.as_bytes(), b"\0", token.as_bytes(), b"\0"],
        )?;
        Ok(())
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<()> {
        self.request(
            msg::UNWATCH,
            path,
            &[path.as_bytes(), b"\0", token.as_bytes(), b"\0"],
        )?;
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<WatchEvent>> {
        if let Some(event) = self.stashed.pop_front() {
            return Ok(Some(event));
        }
        if !self.readable()? {
            return Ok(None);
        }
        let (typ, _, payload) = self.read_message()?;
        if typ != msg::WATCH_EVENT {
            return Err(StoreError::Protocol(format!(
                "Unsolicited message of type {typ}"
            )));
        }
        parse_event(&payload).map(Some)
    }

    fn transaction_start(&mut self) -> Result<()> {
        if self.tx_id != 0 {
            return Err(StoreError::Backend("transaction already open".to_string()));
        }
        let payload = self.request(msg::TRANSACTION_START, "transaction", &[b"\0"])?;
        let id = text(strip_nul(&payload))?;
        self.tx_id = id
            .parse()
            .map_err(|_| StoreError::Protocol(format!("Bad transaction id {id:?}")))?;
        if self.tx_id == 0 {
            return Err(StoreError::Protocol("Transaction id zero".to_string()));
        }
        Ok(())
    }

    fn transaction_end(&mut self, commit: bool) -> Result<()> {
        if self.tx_id == 0 {
            return Err(StoreError::Backend("no transaction open".to_string()));
        }
        let flag: &[u8] = if commit { b"T\0" } else { b"F\0" };
        let outcome = self.request(msg::TRANSACTION_END, "transaction", &[flag]);
        // Raced or not, the transaction is gone after this reply.
        self.tx_id = 0;
        outcome.map(|_| ())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

fn text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StoreError::Protocol("Reply is not valid UTF-8".to_string()))
}

fn strip_nul(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((&0, rest)) => rest,
        _ => payload,
    }
}

fn parse_event(payload: &[u8]) -> Result<WatchEvent> {
    let mut fields = payload.split(|&b| b == 0);
    let path = fields
        .next()
        .ok_or_else(|| StoreError::Protocol("Watch event without a path".to_string()))?;
    let token = fields
        .next()
        .ok_or_else(|| StoreError::Protocol("Watch event without a token".to_string()))?;
    Ok(WatchEvent {
        path: text(path)?,
        token: text(token)?,
    })
}

fn encode_perm(entry: &PermEntry) -> String {
    let letter = match (
        entry.perm.contains(super::Perm::READ),
        entry.perm.contains(super::Perm::WRITE),
    ) {
        (true, true) => 'b',
        (true, false) => 'r',
        (false, true) => 'w',
        (false, false) => 'n',
    };
    format!("{letter}{}", entry.id)
}

fn decode_error(payload: &[u8], context: &str) -> StoreError {
    let name = String::from_utf8_lossy(strip_nul(payload)).into_owned();
    match name.as_str() {
        "ENOENT" => StoreError::NotFound(context.to_string()),
        "EAGAIN" => StoreError::Again,
        _ => StoreError::Backend(format!("{name} on {context}")),
    }
}
