//! Blue/green port-pair allocation.
//!
//! Every service owns one (even, odd) pair of adjacent host ports for its
//! lifetime on the agent: blue is the even port, green is `blue + 1`.
//! Allocations are in-memory and rebuilt after a restart via [`PortAllocator::reserve`]
//! from the persisted service rows.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::TcpListener;

/// An (even, odd) pair of adjacent ports assigned to one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub blue_port: u16,
    pub green_port: u16,
}

impl PortPair {
    pub fn new(blue_port: u16) -> Self {
        Self {
            blue_port,
            green_port: blue_port + 1,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port == self.blue_port || port == self.green_port
    }

    fn overlaps(&self, other: &PortPair) -> bool {
        self.contains(other.blue_port) || self.contains(other.green_port)
    }
}

/// Mutex-protected port-pair table with liveness probing.
///
/// A port is considered free when it is absent from the table *and* a TCP
/// listener can be bound on it (bound and closed immediately). On systems
/// that deny `bind` outright (EPERM), only the table is authoritative.
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<HashMap<String, PortPair>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: Mutex::new(HashMap::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Assign a pair to the service, reusing an existing assignment if one
    /// exists.
    pub fn allocate(&self, service_id: &str) -> Result<PortPair> {
        let mut allocated = self.allocated.lock();
        if let Some(pair) = allocated.get(service_id) {
            return Ok(*pair);
        }

        let mut blue = first_even_at_or_after(self.start);
        while blue < self.end {
            let pair = PortPair::new(blue);
            if Self::is_available(&allocated, pair.blue_port)
                && Self::is_available(&allocated, pair.green_port)
            {
                allocated.insert(service_id.to_string(), pair);
                return Ok(pair);
            }
            blue += 2;
        }

        Err(Error::PortAllocation(format!(
            "no available port pairs in range {}-{}",
            self.start, self.end
        )))
    }

    pub fn get(&self, service_id: &str) -> Option<PortPair> {
        self.allocated.lock().get(service_id).copied()
    }

    pub fn release(&self, service_id: &str) {
        self.allocated.lock().remove(service_id);
    }

    /// Pin a specific pair for a service (restart recovery). Refuses when the
    /// pair collides with another service's pair.
    pub fn reserve(&self, service_id: &str, pair: PortPair) -> Result<()> {
        let mut allocated = self.allocated.lock();
        for (existing_id, existing_pair) in allocated.iter() {
            if existing_id == service_id {
                continue;
            }
            if existing_pair.overlaps(&pair) {
                return Err(Error::PortReservationConflict {
                    service: service_id.to_string(),
                    other: existing_id.clone(),
                });
            }
        }
        allocated.insert(service_id.to_string(), pair);
        Ok(())
    }

    /// Scan up to 1000 ports beyond the configured range for a free pair.
    /// The pair is not recorded; callers reserve it explicitly if used.
    pub fn find_alternative_pair(&self) -> Result<PortPair> {
        let allocated = self.allocated.lock();
        let scan_end = self.end.saturating_add(1000);
        let mut blue = first_even_at_or_after(self.end.saturating_add(1));
        while blue < scan_end {
            let pair = PortPair::new(blue);
            if Self::is_available(&allocated, pair.blue_port)
                && Self::is_available(&allocated, pair.green_port)
            {
                return Ok(pair);
            }
            blue += 2;
        }
        Err(Error::PortAllocation(
            "no available port pairs found beyond the configured range".to_string(),
        ))
    }

    fn is_available(allocated: &HashMap<String, PortPair>, port: u16) -> bool {
        if allocated.values().any(|pair| pair.contains(port)) {
            return false;
        }

        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            // Sandboxes that forbid bind entirely can't be probed; fall back
            // to the allocation table.
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => true,
            Err(_) => false,
        }
    }
}

fn first_even_at_or_after(port: u16) -> u16 {
    if port % 2 == 0 {
        port
    } else {
        port + 1
    }
}
