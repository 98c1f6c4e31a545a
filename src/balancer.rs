//! Choosing a connection for each task of a multi-connection session
//!
//! A balancer only tracks connection ids; the initiator session owns the
//! connections themselves. Every `get_connection` should be paired with a
//! `release_connection` once the task is done.

use crate::error::{IscsiError, ScsiResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Connection selection policy
pub trait TaskBalancer: Send + Sync {
    /// Make a logged-in connection available
    fn add_connection(&self, cid: u16);

    /// Forget a connection, e.g. after it logged out or failed
    fn remove_connection(&self, cid: u16) -> ScsiResult<()>;

    /// Connection to use for the next task
    fn get_connection(&self) -> ScsiResult<u16>;

    /// Hand back a connection taken with `get_connection`
    fn release_connection(&self, cid: u16) -> ScsiResult<()>;

    /// All known connection ids, in the order they were added
    fn connections(&self) -> Vec<u16>;
}

fn no_connection() -> IscsiError {
    IscsiError::NoSuchConnection("session has no connections".to_string())
}

fn unknown(cid: u16) -> IscsiError {
    IscsiError::NoSuchConnection(format!("CID {}", cid))
}

/// Sends everything down the first connection
#[derive(Debug, Default)]
pub struct SingleConnectionBalancer {
    cids: Mutex<Vec<u16>>,
}

impl SingleConnectionBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn cids(&self) -> std::sync::MutexGuard<'_, Vec<u16>> {
        match self.cids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TaskBalancer for SingleConnectionBalancer {
    fn add_connection(&self, cid: u16) {
        let mut cids = self.cids();
        if !cids.contains(&cid) {
            cids.push(cid);
        }
    }

    fn remove_connection(&self, cid: u16) -> ScsiResult<()> {
        let mut cids = self.cids();
        let pos = cids.iter().position(|&c| c == cid).ok_or_else(|| unknown(cid))?;
        cids.remove(pos);
        Ok(())
    }

    fn get_connection(&self) -> ScsiResult<u16> {
        self.cids().first().copied().ok_or_else(no_connection)
    }

    fn release_connection(&self, cid: u16) -> ScsiResult<()> {
        if self.cids().contains(&cid) {
            Ok(())
        } else {
            Err(unknown(cid))
        }
    }

    fn connections(&self) -> Vec<u16> {
        self.cids().clone()
    }
}

#[derive(Debug, Default)]
struct Rotation {
    cids: Vec<u16>,
    next: usize,
    // tasks currently running per connection
    busy: HashMap<u16, usize>,
}

/// Rotates through the connections, preferring idle ones
///
/// Starting at the rotation point, the first connection with no task in
/// flight is chosen. When every connection is busy the rotation point itself
/// is shared.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    inner: Mutex<Rotation>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Rotation> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Tasks in flight on a connection
    pub fn in_flight(&self, cid: u16) -> usize {
        self.inner().busy.get(&cid).copied().unwrap_or(0)
    }
}

impl TaskBalancer for RoundRobinBalancer {
    fn add_connection(&self, cid: u16) {
        let mut inner = self.inner();
        if !inner.cids.contains(&cid) {
            inner.cids.push(cid);
            inner.busy.insert(cid, 0);
        }
    }

    fn remove_connection(&self, cid: u16) -> ScsiResult<()> {
        let mut inner = self.inner();
        let pos = inner.cids.iter().position(|&c| c == cid).ok_or_else(|| unknown(cid))?;
        inner.cids.remove(pos);
        inner.busy.remove(&cid);
        if inner.next > pos {
            inner.next -= 1;
        }
        Ok(())
    }

    fn get_connection(&self) -> ScsiResult<u16> {
        let mut inner = self.inner();
        let count = inner.cids.len();
        if count == 0 {
            return Err(no_connection());
        }
        let start = inner.next % count;
        let slot = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| inner.busy.get(&inner.cids[i]).copied().unwrap_or(0) == 0)
            .unwrap_or(start);
        let cid = inner.cids[slot];
        inner.next = slot + 1;
        *inner.busy.entry(cid).or_insert(0) += 1;
        log::trace!("Balancer picked CID {}", cid);
        Ok(cid)
    }

    fn release_connection(&self, cid: u16) -> ScsiResult<()> {
        let mut inner = self.inner();
        let busy = inner.busy.get_mut(&cid).ok_or_else(|| unknown(cid))?;
        *busy = busy.saturating_sub(1);
        Ok(())
    }

    fn connections(&self) -> Vec<u16> {
        self.inner().cids.clone()
    }
}
