//! Per-adapter connection slot accounting.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use crate::{Address, CallbackHandle};

/// Connection slot state of one adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Allocations {
    /// Adapter name.
    pub adapter: String,
    /// Total connection slots.
    pub slots: usize,
    /// Free connection slots.
    pub free: usize,
    /// Addresses currently holding a slot.
    pub allocated: Vec<Address>,
}

/// Notification that the slot state of an adapter changed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocationChangeEvent {
    /// Adapter whose slot state changed.
    pub adapter: String,
}

type AllocationCallback = Arc<dyn Fn(AllocationChangeEvent) + Send + Sync>;

#[derive(Default)]
struct SlotState {
    adapters: HashMap<String, AdapterSlots>,
    callbacks: HashMap<u64, AllocationCallback>,
    next_callback_id: u64,
}

struct AdapterSlots {
    slots: usize,
    allocated: Vec<Address>,
}

/// Counted per-adapter connection semaphore.
///
/// The slot manager is the sole arbiter of per-adapter connection
/// concurrency. Allocation is non-blocking and returns whether a slot was
/// obtained; release is infallible.
#[derive(Clone, Default)]
pub struct SlotManager {
    inner: Arc<SlotManagerInner>,
}

#[derive(Default)]
struct SlotManagerInner {
    state: Mutex<SlotState>,
}

impl SlotManager {
    /// Creates an empty slot manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter with the given number of connection slots.
    pub fn register_adapter(&self, adapter: &str, slots: usize) {
        log::debug!("Registering adapter {adapter} with {slots} connection slots");
        let mut state = self.inner.state.lock().unwrap();
        state.adapters.insert(adapter.to_string(), AdapterSlots { slots, allocated: Vec::new() });
        drop(state);
        self.notify(adapter);
    }

    /// Remove an adapter and all of its allocations.
    pub fn remove_adapter(&self, adapter: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.adapters.remove(adapter);
    }

    /// Try to allocate a connection slot on the adapter for the address.
    ///
    /// Returns whether a slot was obtained.
    pub fn allocate_slot(&self, adapter: &str, address: Address) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(adapter_slots) = state.adapters.get_mut(adapter) else {
            // Unmanaged adapters are not slot limited.
            return true;
        };
        if adapter_slots.allocated.contains(&address) {
            return true;
        }
        if adapter_slots.allocated.len() >= adapter_slots.slots {
            log::debug!("{adapter}: no connection slot free for {address}");
            return false;
        }
        adapter_slots.allocated.push(address);
        drop(state);
        self.notify(adapter);
        true
    }

    /// Release the connection slot held on the adapter for the address.
    pub fn release_slot(&self, adapter: &str, address: Address) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(adapter_slots) = state.adapters.get_mut(adapter) else { return };
        let Some(pos) = adapter_slots.allocated.iter().position(|a| *a == address) else { return };
        adapter_slots.allocated.remove(pos);
        drop(state);
        self.notify(adapter);
    }

    /// Current slot state of the adapter.
    pub fn get_allocations(&self, adapter: &str) -> Option<Allocations> {
        let state = self.inner.state.lock().unwrap();
        state.adapters.get(adapter).map(|adapter_slots| Allocations {
            adapter: adapter.to_string(),
            slots: adapter_slots.slots,
            free: adapter_slots.slots - adapter_slots.allocated.len(),
            allocated: adapter_slots.allocated.clone(),
        })
    }

    /// Register a callback invoked whenever the slot state of any adapter
    /// changes.
    pub fn register_allocation_callback(
        &self, callback: impl Fn(AllocationChangeEvent) + Send + Sync + 'static,
    ) -> CallbackHandle {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_callback_id;
        state.next_callback_id += 1;
        state.callbacks.insert(id, Arc::new(callback));
        let inner: Weak<SlotManagerInner> = Arc::downgrade(&self.inner);
        CallbackHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.lock().unwrap().callbacks.remove(&id);
            }
        })
    }

    /// Slot state of all registered adapters.
    pub fn diagnostics(&self) -> Vec<Allocations> {
        let state = self.inner.state.lock().unwrap();
        state
            .adapters
            .iter()
            .map(|(adapter, adapter_slots)| Allocations {
                adapter: adapter.clone(),
                slots: adapter_slots.slots,
                free: adapter_slots.slots - adapter_slots.allocated.len(),
                allocated: adapter_slots.allocated.clone(),
            })
            .collect()
    }

    fn notify(&self, adapter: &str) {
        let callbacks: Vec<AllocationCallback> = {
            let state = self.inner.state.lock().unwrap();
            state.callbacks.values().cloned().collect()
        };
        let event = AllocationChangeEvent { adapter: adapter.to_string() };
        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(n: u8) -> Address {
        Address::new([0, 0, 0, 0, 0, n])
    }

    #[test]
    fn slots_are_counted() {
        let manager = SlotManager::new();
        manager.register_adapter("hci0", 2);

        assert!(manager.allocate_slot("hci0", addr(1)));
        assert!(manager.allocate_slot("hci0", addr(2)));
        assert!(!manager.allocate_slot("hci0", addr(3)));

        let allocations = manager.get_allocations("hci0").unwrap();
        assert_eq!(allocations.slots, 2);
        assert_eq!(allocations.free, 0);
        assert_eq!(allocations.allocated, vec![addr(1), addr(2)]);

        manager.release_slot("hci0", addr(1));
        assert!(manager.allocate_slot("hci0", addr(3)));
    }

    #[test]
    fn double_allocate_same_address_holds_one_slot() {
        let manager = SlotManager::new();
        manager.register_adapter("hci0", 1);
        assert!(manager.allocate_slot("hci0", addr(1)));
        assert!(manager.allocate_slot("hci0", addr(1)));
        assert_eq!(manager.get_allocations("hci0").unwrap().free, 0);
    }

    #[test]
    fn release_is_infallible() {
        let manager = SlotManager::new();
        manager.release_slot("hci0", addr(1));
        manager.register_adapter("hci0", 1);
        manager.release_slot("hci0", addr(9));
        assert_eq!(manager.get_allocations("hci0").unwrap().free, 1);
    }

    #[test]
    fn unmanaged_adapter_is_unlimited() {
        let manager = SlotManager::new();
        for n in 0..10 {
            assert!(manager.allocate_slot("hci9", addr(n)));
        }
        assert!(manager.get_allocations("hci9").is_none());
    }

    #[test]
    fn change_callbacks_fire_until_handle_dropped() {
        let manager = SlotManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = fired.clone();
        let handle = manager.register_allocation_callback(move |event| {
            assert_eq!(event.adapter, "hci0");
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        manager.register_adapter("hci0", 1);
        assert!(manager.allocate_slot("hci0", addr(1)));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        drop(handle);
        manager.release_slot("hci0", addr(1));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
