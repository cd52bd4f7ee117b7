//! Range-bounded TCP port reservation for instances.
//!
//! Every instance gets exactly one port out of
//! `[instance_port_base, instance_port_max]`. Allocation is a deterministic
//! ascending scan, so the expected handful of live instances clusters at the
//! bottom of the range and exhaustion is easy to reason about.
//!
//! A port is in exactly one of three states: free, allocated to an instance,
//! or permanently unavailable. The last state exists because a bind can fail
//! on a port the allocator considers free (TIME_WAIT, another process); the
//! caller marks such ports unavailable and retries with the next candidate.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{bail, Result};

/// Thread-safe allocator of TCP ports within a fixed inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    max: u16,
    state: Mutex<AllocState>,
}

#[derive(Debug, Default)]
struct AllocState {
    /// port → owning instance id.
    allocated: HashMap<u16, String>,
    /// Ports excluded from allocation for the process lifetime.
    unavailable: HashSet<u16>,
}

impl PortAllocator {
    /// Create an allocator over the inclusive range `[base, max]`.
    ///
    /// # Panics
    ///
    /// Panics if `max < base`.
    #[must_use]
    pub fn new(base: u16, max: u16) -> Self {
        assert!(max >= base, "port range max must be >= base");
        Self {
            base,
            max,
            state: Mutex::new(AllocState::default()),
        }
    }

    /// Number of ports in the range, usable as a retry bound.
    #[must_use]
    pub fn range_len(&self) -> usize {
        usize::from(self.max - self.base) + 1
    }

    /// Reserve the lowest free port for `instance_id`.
    ///
    /// # Errors
    ///
    /// Fails when every port in the range is allocated or unavailable; the
    /// message is part of the contract surfaced to callers at capacity.
    pub fn allocate(&self, instance_id: &str) -> Result<u16> {
        let mut state = self.state.lock().expect("port allocator lock poisoned");
        for port in self.base..=self.max {
            if state.allocated.contains_key(&port) || state.unavailable.contains(&port) {
                continue;
            }
            state.allocated.insert(port, instance_id.to_string());
            log::debug!("[ports] allocated {port} to {instance_id}");
            return Ok(port);
        }
        bail!("no available ports in range [{}, {}]", self.base, self.max)
    }

    /// Return a port to the free pool. Idempotent; unknown ports are ignored.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().expect("port allocator lock poisoned");
        if state.allocated.remove(&port).is_some() {
            log::debug!("[ports] released {port}");
        }
    }

    /// Exclude `port` from all future allocation and drop any current
    /// reservation. Used after a bind failure on a supposedly-free port.
    pub fn mark_unavailable(&self, port: u16) {
        let mut state = self.state.lock().expect("port allocator lock poisoned");
        state.allocated.remove(&port);
        state.unavailable.insert(port);
        log::warn!("[ports] marked {port} unavailable");
    }

    /// Instance id currently holding `port`, if any.
    #[must_use]
    pub fn owner(&self, port: u16) -> Option<String> {
        self.state
            .lock()
            .expect("port allocator lock poisoned")
            .allocated
            .get(&port)
            .cloned()
    }

    /// Count of currently allocated ports.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.state
            .lock()
            .expect("port allocator lock poisoned")
            .allocated
            .len()
    }
}
