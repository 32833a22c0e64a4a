//! Exclusive serial endpoint leases

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use prov_core::{DeliveryErrorKind, ProvisionError, ProvisionResult};

/// Registry of serial endpoints currently in use
#[derive(Debug, Clone, Default)]
pub struct PortLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive use of `port`
    ///
    /// Fails with a port-busy delivery error while another lease on the
    /// same port is alive.
    pub fn acquire(&self, port: &str) -> ProvisionResult<PortLease> {
        if !self.held.lock().insert(port.to_string()) {
            return Err(ProvisionError::delivery(
                DeliveryErrorKind::PortBusy,
                port,
                "serial endpoint is in use by another flash operation",
            ));
        }
        Ok(PortLease {
            port: port.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, port: &str) -> bool {
        self.held.lock().contains(port)
    }
}

/// Exclusive use of one serial endpoint, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortLease {
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.held.lock().remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let leases = PortLeases::new();
        let lease = leases.acquire("/dev/ttyUSB0").unwrap();
        assert!(leases.is_held("/dev/ttyUSB0"));

        let busy = leases.acquire("/dev/ttyUSB0").unwrap_err();
        assert!(busy.to_string().contains("port-busy"));
        assert!(leases.acquire("/dev/ttyUSB1").is_ok());

        drop(lease);
        assert!(!leases.is_held("/dev/ttyUSB0"));
        assert!(leases.acquire("/dev/ttyUSB0").is_ok());
    }
}
