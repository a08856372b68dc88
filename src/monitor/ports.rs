use crate::{error::PublisherError, Lazy};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError},
};

static PROCESS_PORTS: Lazy<PortRegistry> = Lazy::new(PortRegistry::new);

/// Ports claimed by publishers, so that a second publisher on the same port
/// fails with a clear error instead of fighting over the socket.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    used: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every publisher of this process that was not given its own.
    pub fn process() -> &'static PortRegistry {
        &PROCESS_PORTS
    }

    pub fn claim(&self, port: u16) -> Result<PortClaim, PublisherError> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if !used.insert(port) {
            return Err(PublisherError::PortInUse(port));
        }
        Ok(PortClaim {
            port,
            registry: self.clone(),
        })
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }
}

/// Releases the port when dropped.
#[derive(Debug)]
pub struct PortClaim {
    port: u16,
    registry: PortRegistry,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        self.registry
            .used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_claim_release() {
        let ports = PortRegistry::new();
        let claim = ports.claim(1667).unwrap();
        assert!(matches!(ports.claim(1667), Err(PublisherError::PortInUse(1667))));
        assert!(ports.is_claimed(1667));
        drop(claim);
        assert!(!ports.is_claimed(1667));
        assert!(ports.claim(1667).is_ok());
    }
}
