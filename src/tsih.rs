//! Target Session Identifying Handle allocation
//!
//! One allocator is created when the target starts and shared by every
//! connection thread through an `Arc`. TSIH 0 is reserved for "no session
//! yet" in leading login requests and is never issued.

use crate::error::{IscsiError, ScsiResult};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Highest TSIH handed out
pub const MAX_TSIH: u16 = i16::MAX as u16;

#[derive(Debug)]
struct TsihState {
    /// Next never-issued value; everything below is either held or released
    next: u32,
    /// Released values below `next`, reused smallest first
    released: BTreeSet<u16>,
}

/// Thread-safe TSIH allocator
#[derive(Debug)]
pub struct TsihAllocator {
    state: Mutex<TsihState>,
}

impl Default for TsihAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TsihAllocator {
    pub fn new() -> Self {
        TsihAllocator {
            state: Mutex::new(TsihState {
                next: 1,
                released: BTreeSet::new(),
            }),
        }
    }

    /// Issue a TSIH that no other caller currently holds
    pub fn allocate(&self) -> ScsiResult<u16> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IscsiError::Session("TSIH allocator lock poisoned".into()))?;

        if let Some(tsih) = state.released.pop_first() {
            log::debug!("Reusing TSIH {}", tsih);
            return Ok(tsih);
        }

        if state.next > MAX_TSIH as u32 {
            return Err(IscsiError::ResourcesExhausted(format!(
                "all {} TSIH values are in use",
                MAX_TSIH
            )));
        }

        let tsih = state.next as u16;
        state.next += 1;
        log::debug!("Allocated TSIH {}", tsih);
        Ok(tsih)
    }

    /// Give a TSIH back. Releasing 0, an unissued value, or a value twice is ignored.
    pub fn release(&self, tsih: u16) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if tsih == 0 || tsih as u32 >= state.next || !state.released.insert(tsih) {
            log::warn!("Ignoring release of TSIH {} that is not allocated", tsih);
            return;
        }

        while let Some(&last) = state.released.last() {
            if last as u32 != state.next - 1 {
                break;
            }
            state.released.remove(&last);
            state.next -= 1;
        }
        log::debug!("Released TSIH {}", tsih);
    }

    /// Number of TSIHs currently held
    pub fn in_use(&self) -> usize {
        match self.state.lock() {
            Ok(state) => (state.next as usize - 1) - state.released.len(),
            Err(poisoned) => {
                let state = poisoned.into_inner();
                (state.next as usize - 1) - state.released.len()
            }
        }
    }
}
