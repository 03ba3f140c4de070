//! Which outduct owns a connection.
//!
//! Shared by every outduct of a node; cheap to clone.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuctRef {
    pub protocol: String,
    pub duct: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{addr} already belongs to {protocol}/{duct}")]
    AlreadyRegistered {
        addr: SocketAddr,
        protocol: String,
        duct: String,
    },
}

/// Peer address → owning duct.
#[derive(Clone, Default)]
pub struct OutductRegistry {
    inner: Arc<DashMap<SocketAddr, DuctRef>>,
}

impl OutductRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, addr: SocketAddr, protocol: &str, duct: &str) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;
        match self.inner.entry(addr) {
            Entry::Occupied(existing) => Err(RegistryError::AlreadyRegistered {
                addr,
                protocol: existing.get().protocol.clone(),
                duct: existing.get().duct.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(DuctRef {
                    protocol: protocol.to_string(),
                    duct: duct.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn lookup(&self, addr: &SocketAddr) -> Option<DuctRef> {
        self.inner.get(addr).map(|entry| entry.value().clone())
    }

    pub fn forget(&self, addr: &SocketAddr) -> Option<DuctRef> {
        self.inner.remove(addr).map(|(_, duct)| duct)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
