//! Adapter enumeration and recovery collaborators.

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::{Address, Result};

/// Address reported for an adapter that failed to initialize.
pub const FAILED_ADAPTER_MAC: Address = Address::new([0, 0, 0, 0, 0, 0]);

/// Details of one Bluetooth adapter.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdapterDetails {
    /// Adapter address.
    pub address: Address,
    /// Whether the adapter supports passive scanning.
    pub passive_scan: bool,
    /// Connection slots the adapter offers, if limited.
    pub connection_slots: Option<usize>,
}

/// Source of adapter records.
///
/// The manager refreshes on demand only and treats the returned map as
/// authoritative.
pub trait AdapterOracle: Send + Sync {
    /// Re-enumerate adapters.
    fn refresh(&self) -> BoxFuture<'_, Result<()>>;
    /// Currently known adapters by name.
    fn adapters(&self) -> HashMap<String, AdapterDetails>;
}

/// Hardware recovery hook for misbehaving adapters.
pub trait AdapterRecovery: Send + Sync {
    /// Reset the adapter. Returns whether a reset was performed.
    fn reset_adapter(&self, adapter: &str, address: Address) -> BoxFuture<'_, Result<bool>>;
}
