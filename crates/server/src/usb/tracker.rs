//! In-flight URB tracking
//!
//! One tracker per imported session, keyed by seqnum and bounded at 64
//! concurrent entries. All operations run under a single mutex, which is
//! what makes SUBMIT and UNLINK linearizable for the same seqnum: either
//! the unlink marks the entry cancelled before the submit path removes it,
//! or the removal wins and the unlink observes nothing.

use crate::usb::urb::{RequestError, Urb, UrbStatus};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Maximum concurrent in-flight URBs per session
pub const MAX_IN_FLIGHT: usize = 64;

/// Seqnum-indexed set of in-flight URBs
#[derive(Debug, Default)]
pub struct UrbTracker {
    inner: Mutex<HashMap<u32, Urb>>,
}

impl UrbTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<u32, Urb>> {
        self.inner.lock().expect("urb tracker lock poisoned")
    }

    /// Admit a URB
    ///
    /// Fails with `DuplicateRequest` when the seqnum is already in flight
    /// and `ConcurrentRequestLimit` when the session is at capacity; in the
    /// limit case no entry is inserted.
    pub fn insert(&self, urb: Urb) -> Result<(), RequestError> {
        let mut map = self.locked();
        if map.contains_key(&urb.seqnum) {
            return Err(RequestError::DuplicateRequest);
        }
        if map.len() >= MAX_IN_FLIGHT {
            return Err(RequestError::ConcurrentRequestLimit);
        }
        map.insert(urb.seqnum, urb);
        Ok(())
    }

    /// Status of an in-flight URB, if present
    pub fn get_status(&self, seqnum: u32) -> Option<UrbStatus> {
        self.locked().get(&seqnum).map(|urb| urb.status)
    }

    /// Update the status of an in-flight URB
    pub fn set_status(&self, seqnum: u32, status: UrbStatus) -> bool {
        match self.locked().get_mut(&seqnum) {
            Some(urb) => {
                urb.status = status;
                true
            }
            None => false,
        }
    }

    /// Atomically mark a URB cancelled; false when the seqnum is not in
    /// flight (it may have already completed)
    pub fn cancel(&self, seqnum: u32) -> bool {
        self.set_status(seqnum, UrbStatus::Cancelled)
    }

    /// Remove a URB, returning it with its final observed status
    pub fn remove(&self, seqnum: u32) -> Option<Urb> {
        self.locked().remove(&seqnum)
    }

    /// Remove and return every in-flight URB; used on teardown to issue
    /// cancellations
    pub fn drain(&self) -> Vec<Urb> {
        self.locked().drain().map(|(_, urb)| urb).collect()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }
}
