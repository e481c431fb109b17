//! Host resource pools for VM networking.
//!
//! Long-lived objects passed by reference to the VM supervisor; they do not
//! interact with the build pipeline. Both pools hand out any free slot under
//! a mutex and validate the owning VM on release.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

pub use crate::constants::{HOST_PORT_POOL_END, HOST_PORT_POOL_START};

/// Allocates guest IPv4 addresses from an inclusive range.
pub struct IpPool {
    /// IP -> owning VM id; `None` means unallocated.
    pool: Mutex<HashMap<Ipv4Addr, Option<String>>>,
}

impl IpPool {
    /// Creates a pool covering `[start..=end]`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end {
            return Err(Error::InvalidOptions(format!(
                "IP pool start {} is greater than end {}",
                Ipv4Addr::from(start),
                Ipv4Addr::from(end)
            )));
        }

        let pool = (start..=end).map(|n| (Ipv4Addr::from(n), None)).collect();
        Ok(Self {
            pool: Mutex::new(pool),
        })
    }

    /// Atomically assigns any free address to a VM.
    pub fn allocate(&self, vm_id: &str) -> Result<Ipv4Addr> {
        let mut pool = self.pool.lock().unwrap();
        let free = pool
            .iter()
            .find(|(_, owner)| owner.is_none())
            .map(|(ip, _)| *ip);

        match free {
            Some(ip) => {
                pool.insert(ip, Some(vm_id.to_string()));
                Ok(ip)
            }
            None => Err(Error::PoolExhausted { resource: "IP" }),
        }
    }

    /// Returns an address to the pool; the caller must be the owner.
    pub fn release(&self, ip: Ipv4Addr, vm_id: &str) -> Result<()> {
        let mut pool = self.pool.lock().unwrap();
        match pool.get(&ip) {
            None => Err(Error::PoolRelease {
                resource: "IP",
                reason: format!("{} is not in the pool", ip),
            }),
            Some(Some(owner)) if owner != vm_id => Err(Error::PoolRelease {
                resource: "IP",
                reason: format!("{} is allocated to VM {}, not {}", ip, owner, vm_id),
            }),
            Some(_) => {
                pool.insert(ip, None);
                Ok(())
            }
        }
    }

    /// Checks whether an address is currently allocated.
    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.pool
            .lock()
            .unwrap()
            .get(&ip)
            .is_some_and(|owner| owner.is_some())
    }
}

/// Allocates host TCP ports for VM port mappings.
pub struct HostPortPool {
    /// Port -> owning VM id; `None` means unallocated.
    pool: Mutex<HashMap<u16, Option<String>>>,
}

impl HostPortPool {
    /// Creates a pool covering `[start..=end]`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidOptions(format!(
                "port pool start {} is not below end {}",
                start, end
            )));
        }

        let pool = (start..=end).map(|p| (p, None)).collect();
        Ok(Self {
            pool: Mutex::new(pool),
        })
    }

    /// Atomically assigns `count` free ports to a VM.
    pub fn allocate(&self, vm_id: &str, count: usize) -> Result<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut pool = self.pool.lock().unwrap();
        let ports: Vec<u16> = pool
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(port, _)| *port)
            .take(count)
            .collect();

        if ports.len() < count {
            return Err(Error::PoolExhausted {
                resource: "host port",
            });
        }

        for port in &ports {
            pool.insert(*port, Some(vm_id.to_string()));
        }
        Ok(ports)
    }

    /// Returns ports to the pool; every port must belong to the VM.
    pub fn release(&self, ports: &[u16], vm_id: &str) -> Result<()> {
        let mut pool = self.pool.lock().unwrap();
        for port in ports {
            match pool.get(port) {
                None => {
                    return Err(Error::PoolRelease {
                        resource: "host port",
                        reason: format!("port {} is not in the pool", port),
                    });
                }
                Some(Some(owner)) if owner != vm_id => {
                    return Err(Error::PoolRelease {
                        resource: "host port",
                        reason: format!("port {} is allocated to VM {}, not {}", port, owner, vm_id),
                    });
                }
                Some(_) => {
                    pool.insert(*port, None);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_allocate_and_release() {
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3)).unwrap();

        let ip = pool.allocate("vm-1").unwrap();
        assert!(pool.is_allocated(ip));

        pool.release(ip, "vm-1").unwrap();
        assert!(!pool.is_allocated(ip));
    }

    #[test]
    fn ip_pool_exhaustion() {
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        pool.allocate("vm-1").unwrap();
        pool.allocate("vm-2").unwrap();
        assert!(matches!(
            pool.allocate("vm-3"),
            Err(Error::PoolExhausted { .. })
        ));
    }

    #[test]
    fn ip_release_validates_owner() {
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        let ip = pool.allocate("vm-1").unwrap();
        assert!(pool.release(ip, "vm-2").is_err());
        assert!(pool.release(ip, "vm-1").is_ok());
    }

    #[test]
    fn ip_pool_rejects_inverted_range() {
        assert!(IpPool::new(Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1)).is_err());
    }

    #[test]
    fn port_allocate_count_and_release() {
        let pool = HostPortPool::new(40000, 40010).unwrap();

        let ports = pool.allocate("vm-1", 3).unwrap();
        assert_eq!(ports.len(), 3);

        pool.release(&ports, "vm-1").unwrap();
        let again = pool.allocate("vm-2", 11).unwrap();
        assert_eq!(again.len(), 11);
    }

    #[test]
    fn port_pool_exhaustion_allocates_nothing() {
        let pool = HostPortPool::new(40000, 40002).unwrap();

        assert!(pool.allocate("vm-1", 4).is_err());
        // The failed oversubscription must not leak partial allocations.
        assert_eq!(pool.allocate("vm-2", 3).unwrap().len(), 3);
    }

    #[test]
    fn port_release_validates_owner() {
        let pool = HostPortPool::new(40000, 40002).unwrap();

        let ports = pool.allocate("vm-1", 1).unwrap();
        assert!(pool.release(&ports, "vm-2").is_err());
    }
}
