// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Access to the shared configuration store.
//!
//! The daemon publishes backend device nodes and discovers guests through
//! a hierarchical key/value store shared with the toolstack. Everything
//! above this module talks to the [`Store`] trait; [`wire::SocketStore`]
//! speaks the real wire protocol over a unix socket and [`MemStore`] backs
//! the tests with a plain in-memory tree.
//!
//! Node layout managed by the daemon, for a guest `domid` and a virtual
//! device `devid`:
//!
//! ```text
//! /local/domain/0/backend/vusb/<domid>/<devid>/   backend nodes (this side)
//!     frontend, frontend-id, domain, state, online, physical-device, ...
//! /local/domain/<domid>/device/vusb/<devid>/      frontend nodes (guest side)
//!     backend, backend-id, virtual-device, state, ring-ref, event-channel
//! ```

pub mod nodes;
pub mod wire;

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed store reply: {0}")]
    Protocol(String),
    #[error("Store rejected the request: {0}")]
    Backend(String),
    #[error("Node not present: {0}")]
    NotFound(String),
    #[error("Transaction raced with another writer")]
    Again,
}

bitflags::bitflags! {
    /// Access bits granted on a store node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

/// One access-control entry. The first entry on a node names the owner
/// domain and the default access for everyone else; later entries grant
/// specific domains more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermEntry {
    pub id: u32,
    pub perm: Perm,
}

impl PermEntry {
    pub fn new(id: u32, perm: Perm) -> Self {
        PermEntry { id, perm }
    }
}

/// A fired watch: the path that changed and the token the watch was
/// registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub token: String,
}

/// Operations the daemon needs from the store.
///
/// At most one transaction is open at a time; operations issued between
/// [`Store::transaction_start`] and [`Store::transaction_end`] are part of
/// it. Registering a watch immediately queues one synthetic event for the
/// watched path, which is what seeds the initial guest enumeration.
pub trait Store {
    fn read(&mut self, path: &str) -> Result<String>;
    fn write(&mut self, path: &str, value: &str) -> Result<()>;
    fn mkdir(&mut self, path: &str) -> Result<()>;
    fn rm(&mut self, path: &str) -> Result<()>;
    fn directory(&mut self, path: &str) -> Result<Vec<String>>;
    fn set_perms(&mut self, path: &str, perms: &[PermEntry]) -> Result<()>;
    fn get_domain_path(&mut self, domid: u32) -> Result<String>;
    fn watch(&mut self, path: &str, token: &str) -> Result<()>;
    fn unwatch(&mut self, path: &str, token: &str) -> Result<()>;
    /// Next queued watch event, or `None` when nothing is pending.
    fn next_event(&mut self) -> Result<Option<WatchEvent>>;
    fn transaction_start(&mut self) -> Result<()>;
    /// Close the open transaction. `Err(StoreError::Again)` means the
    /// commit raced with another writer and the whole transaction must be
    /// replayed from `transaction_start`.
    fn transaction_end(&mut self, commit: bool) -> Result<()>;
    /// File descriptor to poll for watch events, if the store has one.
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Retry a transactional block until it commits.
///
/// `body` is run inside a fresh transaction; when the commit loses a race
/// it is replayed. Any other error aborts the open transaction and is
/// passed through.
pub fn retry_transaction<S, F>(store: &mut S, mut body: F) -> Result<()>
where
    S: Store + ?Sized,
    F: FnMut(&mut S) -> Result<()>,
{
    loop {
        store.transaction_start()?;
        match body(store) {
            Ok(()) => match store.transaction_end(true) {
                Ok(()) => return Ok(()),
                Err(StoreError::Again) => continue,
                Err(e) => return Err(e),
            },
            Err(e) => {
                // Abort failures are unreported; the original error wins.
                let _ = store.transaction_end(false);
                return Err(e);
            }
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store backed by a sorted map, for tests and bring-up.
///
/// Writes apply immediately even inside a transaction; a commit can be
/// forced to fail with [`MemStore::fail_commits`] to exercise replay
/// paths (replays are idempotent over a plain map).
#[derive(Default)]
pub struct MemStore {
    nodes: BTreeMap<String, String>,
    perms: BTreeMap<String, Vec<PermEntry>>,
    watches: Vec<(String, String)>,
    events: VecDeque<WatchEvent>,
    tx_open: bool,
    failing_commits: u32,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`StoreError::Again`].
    pub fn fail_commits(&mut self, n: u32) {
        self.failing_commits = n;
    }

    pub fn node(&self, path: &str) -> Option<&str> {
        self.nodes.get(path).map(String::as_str)
    }

    pub fn node_perms(&self, path: &str) -> Option<&[PermEntry]> {
        self.perms.get(path).map(Vec::as_slice)
    }

    fn exists(&self, path: &str) -> bool {
        let child_prefix = format!("{path}/");
        self.nodes.contains_key(path) || self.nodes.keys().any(|k| k.starts_with(&child_prefix))
    }

    fn fire_watches(&mut self, path: &str) {
        for (watched, token) in &self.watches {
            if path == watched || path.starts_with(&format!("{watched}/")) {
                self.events.push_back(WatchEvent {
                    path: path.to_string(),
                    token: token.clone(),
                });
            }
        }
    }
}

impl Store for MemStore {
    fn read(&mut self, path: &str) -> Result<String> {
        self.nodes
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn write(&mut self, path: &str, value: &str) -> Result<()> {
        self.nodes.insert(path.to_string(), value.to_string());
        self.fire_watches(path);
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.nodes.entry(path.to_string()).or_default();
        self.fire_watches(path);
        Ok(())
    }

    fn rm(&mut self, path: &str) -> Result<()> {
        if !self.exists(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let child_prefix = format!("{path}/");
        self.nodes
            .retain(|k, _| k != path && !k.starts_with(&child_prefix));
        self.perms
            .retain(|k, _| k != path && !k.starts_with(&child_prefix));
        self.fire_watches(path);
        Ok(())
    }

    fn directory(&mut self, path: &str) -> Result<Vec<String>> {
        if !self.exists(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let prefix = format!("{path}/");
        let mut children: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(cut) => rest[..cut].to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.dedup();
        Ok(children)
    }

    fn set_perms(&mut self, path: &str, perms: &[PermEntry]) -> Result<()> {
        if !self.exists(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        self.perms.insert(path.to_string(), perms.to_vec());
        Ok(())
    }

    fn get_domain_path(&mut self, domid: u32) -> Result<String> {
        Ok(format!("/local/domain/{domid}"))
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<()> {
        self.watches.push((path.to_string(), token.to_string()));
        // The store fires once on registration so the watcher sees the
        // current state without a separate initial scan.
        self.events.push_back(WatchEvent {
            path: path.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<()> {
        self.watches.retain(|(p, t)| p != path || t != token);
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<WatchEvent>> {
        Ok(self.events.pop_front())
    }

    fn transaction_start(&mut self) -> Result<()> {
        if self.tx_open {
            return Err(StoreError::Backend("transaction already open".to_string()));
        }
        self.tx_open = true;
        Ok(())
    }

    fn transaction_end(&mut self, commit: bool) -> Result<()> {
        if !self.tx_open {
            return Err(StoreError::Backend("no transaction open".to_string()));
        }
        self.tx_open = false;
        if commit && self.failing_commits > 0 {
            self.failing_commits -= 1;
            return Err(StoreError::Again);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_back_what_was_written() {
        let mut store = MemStore::new();
        store.write("/a/b", "1").unwrap();
        assert_eq!(store.read("/a/b").unwrap(), "1");
        assert!(matches!(store.read("/a/c"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_directory_lists_immediate_children() {
        let mut store = MemStore::new();
        store.write("/vm/uuid-1/state", "running").unwrap();
        store.write("/vm/uuid-2/state", "stopped").unwrap();
        store.write("/vm/uuid-2/name", "guest").unwrap();
        assert_eq!(store.directory("/vm").unwrap(), vec!["uuid-1", "uuid-2"]);
        assert!(matches!(
            store.directory("/nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_rm_removes_subtree() {
        let mut store = MemStore::new();
        store.write("/a/b/c", "1").unwrap();
        store.write("/a/b/d", "2").unwrap();
        store.write("/a/e", "3").unwrap();
        store.rm("/a/b").unwrap();
        assert!(store.node("/a/b/c").is_none());
        assert!(store.node("/a/b/d").is_none());
        assert_eq!(store.node("/a/e"), Some("3"));
        assert!(matches!(store.rm("/a/b"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_watch_fires_on_registration_and_on_writes_below() {
        let mut store = MemStore::new();
        store.watch("/vm", "/vm").unwrap();
        let initial = store.next_event().unwrap().unwrap();
        assert_eq!(initial.path, "/vm");
        assert_eq!(initial.token, "/vm");

        store.write("/vm/uuid-1/state", "running").unwrap();
        let fired = store.next_event().unwrap().unwrap();
        assert_eq!(fired.path, "/vm/uuid-1/state");
        assert_eq!(fired.token, "/vm");

        store.write("/other", "x").unwrap();
        assert!(store.next_event().unwrap().is_none());

        store.unwatch("/vm", "/vm").unwrap();
        store.write("/vm/uuid-1/state", "stopped").unwrap();
        assert!(store.next_event().unwrap().is_none());
    }

    #[test]
    fn test_retry_replays_raced_commits() {
        let mut store = MemStore::new();
        store.fail_commits(2);
        let mut runs = 0;
        retry_transaction(&mut store, |s| {
            runs += 1;
            s.write("/a", "1")
        })
        .unwrap();
        assert_eq!(runs, 3);
        assert_eq!(store.node("/a"), Some("1"));
    }

    #[test]
    fn test_retry_aborts_on_real_errors() {
        let mut store = MemStore::new();
        let err = retry_transaction(&mut store, |s| s.read("/missing").map(|_| ()));
        assert!(matches!(err, Err(StoreError::NotFound(_))));
        // The transaction was closed; a new one can open.
        store.transaction_start().unwrap();
        store.transaction_end(false).unwrap();
    }

    #[test]
    fn test_perms_are_recorded() {
        let mut store = MemStore::new();
        store.write("/a", "1").unwrap();
        store
            .set_perms(
                "/a",
                &[PermEntry::new(0, Perm::empty()), PermEntry::new(5, Perm::READ)],
            )
            .unwrap();
        let perms = store.node_perms("/a").unwrap();
        assert_eq!(perms.len(), 2);
        assert_eq!(perms[1].id, 5);
        assert_eq!(perms[1].perm, Perm::READ);
    }
}
