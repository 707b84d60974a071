//! Process-wide manager handle.
//!
//! The handle is written once at startup and read by the connection wrappers.
//! Initialize it before use; reinitialization is not supported.

use std::sync::RwLock;

use crate::Manager;

lazy_static::lazy_static! {
    static ref CENTRAL_MANAGER: RwLock<Option<Manager>> = RwLock::new(None);
}

/// Set the process-wide manager.
///
/// A manager that is already set is kept; reinitialization is not supported.
pub fn set_manager(manager: Manager) {
    let mut central = CENTRAL_MANAGER.write().unwrap();
    if central.is_some() {
        log::warn!("Central manager is already set; keeping the existing one");
        return;
    }
    *central = Some(manager);
}

pub(crate) fn set_manager_if_unset(manager: Manager) {
    let mut central = CENTRAL_MANAGER.write().unwrap();
    if central.is_none() {
        *central = Some(manager);
    }
}

/// The process-wide manager.
///
/// Panics when no manager has been set up yet.
pub fn get_manager() -> Manager {
    CENTRAL_MANAGER
        .read()
        .unwrap()
        .clone()
        .expect("central manager is not set; call set_manager or Manager::setup first")
}

/// Whether a process-wide manager has been set.
pub fn manager_is_set() -> bool {
    CENTRAL_MANAGER.read().unwrap().is_some()
}
