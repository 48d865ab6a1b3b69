//! Host port allocation for VM port forwarding.
//!
//! Draws host ports from the configured ephemeral range and keeps both
//! directions indexed: host-port -> VM and VM -> mappings. Releasing a VM
//! frees every port it holds in one step.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::network::types::{PortMapping, Protocol};

struct PortAllocatorInner {
    next_candidate: u16,
    port_owners: HashMap<u16, String>,
    vm_mappings: HashMap<String, Vec<PortMapping>>,
}

/// Allocator over a configured host port range.
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    inner: Mutex<PortAllocatorInner>,
}

impl PortAllocator {
    /// Create an allocator over `[range_start, range_end]`.
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start,
            range_end,
            inner: Mutex::new(PortAllocatorInner {
                next_candidate: range_start,
                port_owners: HashMap::new(),
                vm_mappings: HashMap::new(),
            }),
        }
    }

    /// Allocate a host port for `vm_id` forwarding to `container_port`.
    pub fn allocate(
        &self,
        vm_id: &str,
        container_port: u16,
        protocol: Protocol,
    ) -> Result<PortMapping> {
        if container_port == 0 {
            return Err(Error::InvalidArgument {
                what: "container port".to_string(),
                reason: "port 0 is not forwardable".to_string(),
            });
        }

        let mut inner = self.inner.lock().expect("port allocator lock poisoned");

        let span = usize::from(self.range_end - self.range_start) + 1;
        let mut candidate = inner.next_candidate;
        for _ in 0..span {
            if !inner.port_owners.contains_key(&candidate) {
                inner.port_owners.insert(candidate, vm_id.to_string());
                let mapping = PortMapping {
                    vm_id: vm_id.to_string(),
                    container_port,
                    host_port: candidate,
                    protocol,
                };
                inner
                    .vm_mappings
                    .entry(vm_id.to_string())
                    .or_default()
                    .push(mapping.clone());
                inner.next_candidate = if candidate == self.range_end {
                    self.range_start
                } else {
                    candidate + 1
                };
                tracing::debug!(
                    vm_id = %vm_id,
                    host_port = candidate,
                    container_port,
                    protocol = %protocol,
                    "allocated host port"
                );
                return Ok(mapping);
            }
            candidate = if candidate == self.range_end {
                self.range_start
            } else {
                candidate + 1
            };
        }

        Err(Error::PortRangeExhausted {
            start: self.range_start,
            end: self.range_end,
        })
    }

    /// Release every port held by `vm_id`, returning the removed mappings.
    pub fn release_vm_ports(&self, vm_id: &str) -> Vec<PortMapping> {
        let mut inner = self.inner.lock().expect("port allocator lock poisoned");
        let mappings = inner.vm_mappings.remove(vm_id).unwrap_or_default();
        for mapping in &mappings {
            inner.port_owners.remove(&mapping.host_port);
        }
        if !mappings.is_empty() {
            tracing::debug!(vm_id = %vm_id, count = mappings.len(), "released VM ports");
        }
        mappings
    }

    /// All mappings currently held by `vm_id`.
    pub fn get_vm_ports(&self, vm_id: &str) -> Vec<PortMapping> {
        let inner = self.inner.lock().expect("port allocator lock poisoned");
        inner.vm_mappings.get(vm_id).cloned().unwrap_or_default()
    }

    /// Which VM holds `host_port`, if any.
    pub fn get_port_vm(&self, host_port: u16) -> Option<String> {
        let inner = self.inner.lock().expect("port allocator lock poisoned");
        inner.port_owners.get(&host_port).cloned()
    }

    /// Whether `host_port` is currently allocated.
    pub fn is_port_allocated(&self, host_port: u16) -> bool {
        let inner = self.inner.lock().expect("port allocator lock poisoned");
        inner.port_owners.contains_key(&host_port)
    }

    /// Number of allocated ports.
    pub fn allocated_count(&self) -> usize {
        let inner = self.inner.lock().expect("port allocator lock poisoned");
        inner.port_owners.len()
    }

    /// Number of free ports remaining in the range.
    pub fn available_count(&self) -> usize {
        let span = usize::from(self.range_end - self.range_start) + 1;
        span - self.allocated_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_range() {
        let allocator = PortAllocator::new(40000, 40010);
        let mapping = allocator
            .allocate("ud-0011223344556677", 80, Protocol::Tcp)
            .unwrap();
        assert!(mapping.host_port >= 40000 && mapping.host_port <= 40010);
        assert!(allocator.is_port_allocated(mapping.host_port));
        assert_eq!(
            allocator.get_port_vm(mapping.host_port).as_deref(),
            Some("ud-0011223344556677")
        );
    }

    #[test]
    fn exhaustion_is_resource_exhausted() {
        let allocator = PortAllocator::new(40000, 40001);
        allocator.allocate("vm-a", 80, Protocol::Tcp).unwrap();
        allocator.allocate("vm-a", 81, Protocol::Tcp).unwrap();
        let err = allocator.allocate("vm-b", 82, Protocol::Tcp).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn release_frees_all_ports_atomically() {
        let allocator = PortAllocator::new(40000, 40010);
        allocator.allocate("vm-a", 80, Protocol::Tcp).unwrap();
        allocator.allocate("vm-a", 443, Protocol::Tcp).unwrap();
        allocator.allocate("vm-b", 53, Protocol::Udp).unwrap();

        let released = allocator.release_vm_ports("vm-a");
        assert_eq!(released.len(), 2);
        assert_eq!(allocator.allocated_count(), 1);
        assert!(allocator.get_vm_ports("vm-a").is_empty());
        assert_eq!(allocator.get_vm_ports("vm-b").len(), 1);

        // releasing again is a no-op
        assert!(allocator.release_vm_ports("vm-a").is_empty());
    }

    #[test]
    fn rejects_port_zero() {
        let allocator = PortAllocator::new(40000, 40010);
        assert!(allocator.allocate("vm-a", 0, Protocol::Tcp).is_err());
    }

    #[test]
    fn counts_track_allocations() {
        let allocator = PortAllocator::new(40000, 40003);
        assert_eq!(allocator.available_count(), 4);
        allocator.allocate("vm-a", 80, Protocol::Tcp).unwrap();
        assert_eq!(allocator.allocated_count(), 1);
        assert_eq!(allocator.available_count(), 3);
    }
}
