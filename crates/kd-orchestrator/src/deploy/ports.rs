//! Process-wide local port allocation

use dashmap::DashSet;
use rand::Rng;

/// Lowest port handed out
pub const MIN_PORT: u16 = 1024;

/// Hands out random local ports, never the same one twice while assigned
#[derive(Debug, Default)]
pub struct PortAllocator {
    assigned: DashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a random unassigned port in `1024..=65535`
    ///
    /// Returns `None` once the whole range is taken.
    pub fn allocate(&self) -> Option<u16> {
        let capacity = usize::from(u16::MAX - MIN_PORT) + 1;
        if self.assigned.len() >= capacity {
            return None;
        }

        let mut rng = rand::thread_rng();
        loop {
            let port = rng.gen_range(MIN_PORT..=u16::MAX);
            if self.assigned.insert(port) {
                return Some(port);
            }
        }
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) {
        self.assigned.remove(&port);
    }

    pub fn is_assigned(&self, port: u16) -> bool {
        self.assigned.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}
